//! Request-lifecycle core: dispatch pipeline, error handler resolution,
//! and the per-request connection state machine.
//!
//! - **`dispatch`**: the [`App`] itself, its builder, the middleware
//!   pipeline, and error handler resolution
//! - **`middleware`**: the three-stage [`Middleware`] trait and the two
//!   composition modes
//! - **`connection`**: the per-request state machine driving buffered or
//!   streaming body delivery from host events

pub mod connection;
pub mod dispatch;
pub mod middleware;

pub use connection::{Connection, ConnectionMode, ConnectionState};
pub use dispatch::{App, AppBuilder, ErrorHandler};
pub use middleware::{Composition, Middleware};
