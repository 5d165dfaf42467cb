//! Runtime wiring: CLI parsing and configuration loading.

pub mod cli;
pub mod conf;
