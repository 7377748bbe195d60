//! Operator surface: health probe, job catalog edits, ingest settings and
//! the subscriber WebSocket.

pub mod routes;

pub use routes::{router, AppState, HealthFlag, HealthStatus};
