#![forbid(unsafe_code)]

//! YouTube ingestion by polling the InnerTube live chat endpoint.

pub mod extract;
pub mod json;
pub mod live;
pub mod poller;
pub mod resolver;


pub use live::{DEFAULT_RESOLVE_INTERVAL, YouTubeLiveWatcher};
pub use poller::{PollerConfig, YouTubePoller};
pub use resolver::{Resolution, ResolveError, Resolver};
