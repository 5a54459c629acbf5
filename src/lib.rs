pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{Result, TabloadError};
pub use ingest::{Orchestrator, ProcessRequest};
pub use registry::Registry;
