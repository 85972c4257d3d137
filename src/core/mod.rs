//! Core modules: store layout, configuration, persistence primitives and
//! the mutation broker shared by every plugin.

pub mod broker;
pub mod config;
pub mod error;
pub mod fsio;
pub mod logging;
pub mod migration;
pub mod output;
pub mod schemas;
pub mod store;
pub mod time;
