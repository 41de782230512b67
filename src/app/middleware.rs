use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Fault;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::routing::resource::{PathParams, Resource};

/// How request-stage and response-stage middleware are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Composition {
    /// Response-stage middleware run unconditionally from the registered
    /// list, regardless of the request-stage outcome.
    Independent,
    /// Each middleware's response stage is scheduled only if its own
    /// request stage ran without fault, in reverse registration order.
    #[default]
    Dependent,
}

/// A middleware component. All three stages default to no-ops, so an
/// implementation only overrides the stages it participates in.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs before routing-dependent work, once per request.
    async fn process_request(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
    ) -> Result<(), Fault> {
        Ok(())
    }

    /// Runs after a route with a resource matched, before the responder.
    async fn process_resource(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        _resource: &dyn Resource,
        _params: &PathParams,
    ) -> Result<(), Fault> {
        Ok(())
    }

    /// Runs after the responder phase, even when an earlier stage faulted.
    /// `req_succeeded` is true only if the responder completed without
    /// fault and no response-stage middleware has faulted since.
    async fn process_response(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        _resource: Option<&dyn Resource>,
        _req_succeeded: bool,
    ) -> Result<(), Fault> {
        Ok(())
    }
}

/// The three per-stage middleware stacks, built once at startup and
/// read-only afterwards.
pub(crate) struct MiddlewareStacks {
    pub request: Vec<Arc<dyn Middleware>>,
    pub resource: Vec<Arc<dyn Middleware>>,
    pub response: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStacks {
    pub fn prepare(middleware: &[Arc<dyn Middleware>]) -> Self {
        Self {
            request: middleware.to_vec(),
            resource: middleware.to_vec(),
            response: middleware.to_vec(),
        }
    }
}
