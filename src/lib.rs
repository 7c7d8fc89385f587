//! Per-connection query execution cache.
//!
//! Tracks every query a client has submitted but not yet fully consumed,
//! keyed by the client's token. Requests against a token are serialized
//! through [`QueryHandle`]s and streamed results are served batch by batch.
//! A query ends when it is exhausted, stopped, killed through
//! [`ServerContext::kill_job`], or interrupted with its connection.

pub mod cache;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod interrupt;
pub mod ordering;
pub mod params;
pub mod profile;
pub mod query;
pub mod response;

pub use cache::{CacheMetrics, EntryState, QueryCache, QueryHandle, QueryJob};
pub use config::CacheConfig;
pub use context::{CacheRegistry, ServerContext};
pub use error::{CacheError, CacheErrorCode};
pub use interrupt::{CombinedInterruptor, Interrupted};
pub use params::{QueryParams, QueryType};
pub use response::{Response, ResponseNote, ResponseType};
