//! Client for the hosted backend: password auth, PostgREST-style tables,
//! object storage and the realtime change feed.

pub mod client;
pub mod config;
pub mod realtime;
pub mod rest;

pub use client::RemoteBackend;
pub use config::RemoteConfig;
