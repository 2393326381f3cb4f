//! HTTP networking layer for the catalogue coordinator.
//!
//! Provides:
//! - `HttpNodeClient`: implements `NodeClient` over reqwest (probe, push, query)
//! - `HttpRegistryFeed`: implements `RegistryFeed` against the upstream registry
//! - `serve_api`: the public hyper API (`/health`, `/nodes`, `/offerings`, `/sparql`)

pub mod client;
pub mod feed;
pub mod server;

pub use client::HttpNodeClient;
pub use feed::HttpRegistryFeed;
pub use server::{route, serve_api, ApiResponse};
