//! Remote slide access over HTTP range requests.

mod http;

pub use http::{HttpRangeClient, RangeFetch, RemoteSlide, RemoteTile};
