use incident_ledger::core::logging;

fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    incident_ledger::run()?;
    Ok(())
}
