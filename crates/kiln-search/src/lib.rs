//! Search index control plane and query dispatcher.
//!
//! Talks HTTP to the search endpoint: mapping render and apply, versioned
//! index creation, atomic alias switches, NDJSON bulk ingest with optional
//! legacy-schema translation, and text/vector/hybrid query composition.

pub mod client;
pub mod config;
pub mod index;
pub mod search;
pub mod tasks;
pub mod vector;

pub use client::{EsClient, EsResponse};
pub use index::IndexControl;
pub use search::SearchDispatcher;
pub use vector::VectorWorker;
