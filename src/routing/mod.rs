//! Route resolution boundary and resource registration.
//!
//! Route *matching* is deliberately narrow here: the bundled [`RouteTable`]
//! is an exact-path map, and anything smarter (templated segments, tries)
//! plugs in behind the [`Router`] trait. What this module does own is the
//! registration-time validation that a resource's streaming data/finalize
//! responders are paired.

pub mod resource;
pub mod table;

pub use resource::{PathParams, Resource};
pub use table::{Route, RouteTable, Router};
