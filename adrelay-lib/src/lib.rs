/// adrelay - token resolution and stale-while-revalidate caching
///
/// This library picks a working upstream access token per ad account or
/// page from all the credentials a user can reach, and caches expensive
/// upstream reads so they can be served stale while refreshing. It is
/// shared by the `adrelay` CLI and the `adrelay-server` daemon.
pub mod candidates;
pub mod clock;
pub mod config;
pub mod error;
pub mod graph;
pub mod probe;
pub mod service;
pub mod storage;
pub mod swr;
pub mod token_resolver;
pub mod types;

pub use error::{RelayError, Result};
pub use types::{CandidateToken, ResourceKind, SwrResponse, SwrState};
