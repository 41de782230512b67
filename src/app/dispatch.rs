//! The application core: middleware dispatch and error handler resolution.
//!
//! Dispatch runs exactly once per request, regardless of how the body is
//! delivered. Every stage is individually wrapped: a fault is offered to
//! the error handler registry, and only an unclaimed fault aborts the rest
//! of the pipeline. Response-stage middleware always run, even with a
//! fault pending, mirroring try/finally semantics.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, DEFAULT_MAX_BUFFERED_BODY_SIZE};
use crate::errors::{ConfigError, Fault, FaultKind, HttpError, HttpStatus};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::app::middleware::{Composition, Middleware, MiddlewareStacks};
use crate::routing::resource::{PathParams, Resource};
use crate::routing::table::{Route, RouteTable, Router};

/// A registered fault handler.
///
/// Returning `Ok(())` means the handler mutated the response directly.
/// Returning `Err(Fault::Status(..))` or `Err(Fault::Error(..))` signals
/// the framework to compose the response from that payload instead. Any
/// other `Err` fails resolution itself and propagates uncaught.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        req: &mut Request,
        resp: &mut Response,
        fault: &Fault,
        params: &PathParams,
    ) -> Result<(), Fault>;
}

struct ErrorHandlerEntry {
    kind: FaultKind,
    handler: Arc<dyn ErrorHandler>,
}

/// The request-processing application.
///
/// All of its state (route table, middleware stacks, error handler
/// registry) is built once by [`AppBuilder`] and read-only afterwards, so
/// an `Arc<App>` is freely shared across connection tasks.
pub struct App {
    router: Arc<dyn Router>,
    stacks: MiddlewareStacks,
    error_handlers: Vec<ErrorHandlerEntry>,
    composition: Composition,
    max_buffered_body_size: usize,
}

/// Builder for [`App`].
pub struct AppBuilder {
    routes: RouteTable,
    router: Option<Arc<dyn Router>>,
    middleware: Vec<Arc<dyn Middleware>>,
    error_handlers: Vec<ErrorHandlerEntry>,
    composition: Composition,
    max_buffered_body_size: usize,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            routes: RouteTable::new(),
            router: None,
            middleware: Vec::new(),
            error_handlers: Vec::new(),
            composition: Composition::default(),
            max_buffered_body_size: DEFAULT_MAX_BUFFERED_BODY_SIZE,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let composition = if cfg.independent_middleware {
            Composition::Independent
        } else {
            Composition::Dependent
        };

        Self {
            composition,
            max_buffered_body_size: cfg.max_buffered_body_size,
            ..Self::new()
        }
    }

    /// Attaches a resource to a path, validating its streaming responder
    /// pairing. Fails fast at registration time, never at request time.
    pub fn route(
        mut self,
        uri_template: impl Into<String>,
        resource: Arc<dyn Resource>,
    ) -> Result<Self, ConfigError> {
        self.routes.add_route(uri_template, resource)?;
        Ok(self)
    }

    /// Replaces the bundled exact-path table with a custom resolver.
    /// Resources reached through it must be registered via a path that
    /// validates their streaming pairing, or validated by the resolver
    /// itself.
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    /// Appends an error handler for the given fault kind. Lookup is
    /// first-match in registration order, so register specific kinds
    /// before broad ones.
    pub fn error_handler(mut self, kind: FaultKind, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.push(ErrorHandlerEntry { kind, handler });
        self
    }

    pub fn independent_middleware(mut self, independent: bool) -> Self {
        self.composition = if independent {
            Composition::Independent
        } else {
            Composition::Dependent
        };
        self
    }

    pub fn max_buffered_body_size(mut self, bytes: usize) -> Self {
        self.max_buffered_body_size = bytes;
        self
    }

    pub fn build(self) -> App {
        let router = match self.router {
            Some(router) => router,
            None => Arc::new(self.routes),
        };

        App {
            router,
            stacks: MiddlewareStacks::prepare(&self.middleware),
            error_handlers: self.error_handlers,
            composition: self.composition,
            max_buffered_body_size: self.max_buffered_body_size,
        }
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn composition(&self) -> Composition {
        self.composition
    }

    pub(crate) fn max_buffered_body_size(&self) -> usize {
        self.max_buffered_body_size
    }

    pub(crate) fn resolve_route(&self, req: &Request) -> Result<Route, Fault> {
        self.router.resolve(req)
    }

    /// Resolves a fault against the handler registry.
    ///
    /// Linear first-match scan over registration order; an entry matches
    /// when its kind subsumes the fault's kind. Returns `Ok(true)` if a
    /// handler claimed the fault, `Ok(false)` if none matched (the caller
    /// re-raises), and `Err` if the matched handler itself faulted with
    /// something other than a status/error signal.
    pub async fn handle_fault(
        &self,
        req: &mut Request,
        resp: &mut Response,
        fault: &Fault,
        params: &PathParams,
    ) -> Result<bool, Fault> {
        for entry in &self.error_handlers {
            if !entry.kind.subsumes(fault.kind()) {
                continue;
            }

            match entry.handler.handle(req, resp, fault, params).await {
                Ok(()) => {}
                Err(Fault::Status(status)) => compose_status_response(resp, status),
                Err(Fault::Error(error)) => compose_error_response(resp, &error),
                Err(other) => {
                    tracing::warn!(
                        kind = ?fault.kind(),
                        error = %other,
                        "Error handler faulted while resolving"
                    );
                    return Err(other);
                }
            }

            return Ok(true);
        }

        tracing::debug!(kind = ?fault.kind(), "No handler claimed fault");
        Ok(false)
    }

    /// Runs the middleware pipeline and the responder for one request.
    ///
    /// Called exactly once per request: after the body is fully buffered
    /// in buffered mode, before any body data exists in streaming mode.
    pub async fn dispatch(
        &self,
        req: &mut Request,
        resp: &mut Response,
        route: &Route,
    ) -> Result<(), Fault> {
        req.uri_template = route.uri_template.clone();

        let params = &route.params;
        let mut dependent_resp_stack: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut pending: Option<Fault> = None;
        let mut request_stage_ok = true;
        let mut req_succeeded = false;

        // Request stage. Each call is wrapped individually: a claimed
        // fault lets the remaining request middleware run, but any fault
        // at all skips the resource/responder phase. In dependent mode a
        // middleware's response stage is scheduled (front of the list,
        // reverse registration order) only if its request stage was clean.
        for mw in &self.stacks.request {
            if let Err(fault) = mw.process_request(req, resp).await {
                request_stage_ok = false;
                match self.handle_fault(req, resp, &fault, params).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        pending = Some(fault);
                        break;
                    }
                    Err(other) => {
                        pending = Some(other);
                        break;
                    }
                }
            }

            if self.composition == Composition::Dependent {
                dependent_resp_stack.insert(0, mw.clone());
            }
        }

        if request_stage_ok {
            match &route.resource {
                Some(resource) => {
                    let mut resource_stage_ok = true;

                    for mw in &self.stacks.resource {
                        if let Err(fault) =
                            mw.process_resource(req, resp, resource.as_ref(), params).await
                        {
                            resource_stage_ok = false;
                            match self.handle_fault(req, resp, &fault, params).await {
                                Ok(true) => {}
                                Ok(false) => pending = Some(fault),
                                Err(other) => pending = Some(other),
                            }
                            break;
                        }
                    }

                    if resource_stage_ok {
                        match resource.respond(req, resp, params).await {
                            Ok(()) => req_succeeded = true,
                            Err(fault) => match self.handle_fault(req, resp, &fault, params).await {
                                Ok(true) => {}
                                Ok(false) => pending = Some(fault),
                                Err(other) => pending = Some(other),
                            },
                        }
                    }
                }
                None => {
                    // No route matched: the default not-found responder
                    // runs and resource-stage middleware is skipped.
                    compose_error_response(resp, &HttpError::not_found());
                    req_succeeded = true;
                }
            }
        }

        // Response stage always runs, even with a fault pending. Each call
        // is wrapped individually: a claimed fault forces req_succeeded to
        // false and execution continues; an unclaimed one replaces any
        // pending fault and skips the rest of the stage.
        let response_stack: &[Arc<dyn Middleware>] = match self.composition {
            Composition::Independent => &self.stacks.response,
            Composition::Dependent => &dependent_resp_stack,
        };

        for mw in response_stack {
            if let Err(fault) = mw
                .process_response(req, resp, route.resource.as_deref(), req_succeeded)
                .await
            {
                req_succeeded = false;
                match self.handle_fault(req, resp, &fault, params).await {
                    Ok(true) => {}
                    Ok(false) => {
                        pending = Some(fault);
                        break;
                    }
                    Err(other) => {
                        pending = Some(other);
                        break;
                    }
                }
            }
        }

        match pending {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn compose_status_response(resp: &mut Response, status: HttpStatus) {
    resp.status = status.status;
    for (key, value) in status.headers {
        resp.headers.insert(key, value);
    }
    resp.body.clear();
}

fn compose_error_response(resp: &mut Response, error: &HttpError) {
    resp.status = error.status;
    resp.headers
        .insert("Content-Type".to_string(), "application/json".to_string());
    // Serializing a struct of plain strings cannot fail.
    resp.body = serde_json::to_vec(error).unwrap_or_default();
    resp.headers
        .insert("Content-Length".to_string(), resp.body.len().to_string());
}
