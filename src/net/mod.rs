//! Network seam: request/response snapshots, the `Fetch` trait and its
//! `reqwest` implementation, and the connectivity flag.

mod client;
mod connectivity;
mod types;

pub use client::{Fetch, HttpFetcher};
pub use connectivity::Connectivity;
pub use types::{Destination, Request, Response};
