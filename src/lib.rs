pub mod compensation;
pub mod config;
pub mod counter;
pub mod gate;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod wal;
pub mod wire;
pub mod worker;
