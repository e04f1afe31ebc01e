//! HTTP API Module
//!
//! Provides the REST API other replicas clone tablets through.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer, SnapshotRequest};
