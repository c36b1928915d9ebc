pub mod audit;
pub mod config;
pub mod dnssec;
pub mod engine;
pub mod error;
pub mod graceful_shutdown;
pub mod http_server;
pub mod keystore;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod queue;
pub mod records;
pub mod storage;
pub mod worker;

pub use engine::SigningEngine;
pub use error::{Result, SignerError};
