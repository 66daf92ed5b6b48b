//! Library crate for portwatch-rs: scoped target validation, engine
//! selection, masscan/nmap adapters, deduplicated result storage and live
//! progress for a single-flight scan orchestrator.
pub mod banner;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod hub;
pub mod netdetect;
pub mod notify;
pub mod orchestrator;
pub mod ports;
pub mod server;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{Result, ScanError};
