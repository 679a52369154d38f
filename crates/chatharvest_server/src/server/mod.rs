#![forbid(unsafe_code)]

pub mod buffered;
pub mod filters;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod middleware;
pub mod store;
pub mod stream;
pub mod supervisor;
