//! Replica server: configuration, logging setup and the client-facing
//! JSON-lines service for `replicad`

pub mod config;
pub mod service;
pub mod telemetry;

pub use config::ServerConfig;
pub use service::{execute, ClientRequest, ClientResponse, JsonLineService};
