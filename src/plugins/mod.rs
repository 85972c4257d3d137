//! Ledger subsystems: the record store, its remote mirror, aggregation and
//! sanction evaluation.

pub mod incidents;
pub mod mirror;
pub mod sanctions;
pub mod tally;
