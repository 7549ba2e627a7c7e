pub mod log;

pub mod config;
pub mod decider;
pub mod decision;
pub mod error;
pub mod fleet;
pub mod history;
pub mod process;
pub mod replay;
pub mod scheduler;
pub mod transport;
pub mod types;
