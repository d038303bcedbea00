//! Upstream service access: the `eapi` client, the error taxonomy, and
//! the per-credential session pool.

pub mod client;
pub mod error;
pub mod pool;

pub use client::{
    DEFAULT_BASE_URL, DEFAULT_TIMEOUT, Profile, RemoteBook, RemoteFile, SearchFilters, SortOrder,
    UpstreamClient, UpstreamConfig, UpstreamSession,
};
pub use error::UpstreamError;
pub use pool::{SessionError, SessionPool};
