//! HTTP request/response types and the body event boundary.
//!
//! This layer owns the in-memory representation of a request being
//! assembled from incremental body events, and the response that middleware
//! and responders mutate in place. Wire-level parsing and framing belong to
//! the host server; requests arrive here already parsed, with only the body
//! outstanding.
//!
//! - **`request`**: HTTP request representation and builder
//! - **`response`**: HTTP response representation with builder pattern
//! - **`events`**: the host receive boundary (`EventSource`), body events,
//!   and the pull-based chunk stream adapter

pub mod events;
pub mod request;
pub mod response;
