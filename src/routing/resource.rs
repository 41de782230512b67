use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Fault;
use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Path parameters captured by the router for a matched route.
pub type PathParams = HashMap<String, String>;

/// A resource attached to a route.
///
/// A resource responds to the methods it reports via [`supports`]. Per
/// supported method it may additionally expose a streaming responder pair:
/// a data responder invoked once per body chunk and a finalize responder
/// invoked once after the last chunk. The pair must be present together or
/// absent together; route registration enforces this, so at request time
/// `has_data_responder` alone decides buffered vs. streaming delivery.
///
/// [`supports`]: Resource::supports
#[async_trait]
pub trait Resource: Send + Sync {
    /// Whether this resource has a responder for the given method.
    fn supports(&self, method: &Method) -> bool;

    /// The responder: runs once per request, after resource-stage
    /// middleware. In streaming mode it runs before any body data exists
    /// and should arrange for the data/finalize responders to consume the
    /// body instead of reading `req.body`.
    async fn respond(
        &self,
        req: &mut Request,
        resp: &mut Response,
        params: &PathParams,
    ) -> Result<(), Fault>;

    /// Whether a streaming data responder exists for the given method.
    fn has_data_responder(&self, _method: &Method) -> bool {
        false
    }

    /// Whether a streaming finalize responder exists for the given method.
    fn has_finalize_responder(&self, _method: &Method) -> bool {
        false
    }

    /// Streaming data responder: receives each body chunk in arrival
    /// order, including empty non-terminal chunks.
    async fn on_data(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        _chunk: Bytes,
    ) -> Result<(), Fault> {
        Ok(())
    }

    /// Streaming finalize responder: runs once after the last chunk,
    /// unless the terminal chunk's data delivery faulted.
    async fn on_finalize(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
    ) -> Result<(), Fault> {
        Ok(())
    }
}
