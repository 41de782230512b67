//! Slipstream - Event-Driven Request Lifecycle Core
//!
//! Core library for processing HTTP requests delivered as incremental body
//! events: the per-request connection state machine, buffered vs. streaming
//! body delivery, middleware dispatch, and error handler resolution.

pub mod app;
pub mod config;
pub mod errors;
pub mod http;
pub mod routing;
