//! Per-request connection state machine.
//!
//! Each logical request's body arrives as a sequence of [`BodyEvent`]s.
//! The state machine drives exactly one of two mutually exclusive delivery
//! strategies, decided on the first event from the matched resource:
//!
//! ```text
//!        ┌─────────┐
//!        │  Start  │ ← First body event: resolve route, pick strategy
//!        └────┬────┘
//!             │
//!     ┌───────┴────────────┐
//!     ▼                    ▼
//! ┌───────────────┐  ┌───────────────┐
//! │ BufferingBody │  │ StreamingBody │
//! └───────┬───────┘  └───────┬───────┘
//!  chunks accumulate   dispatch ran up front; each chunk
//!  up to the size      flows through the resource's data
//!  limit; dispatch     responder, finalize after the last
//!  runs once the
//!  body is complete
//!     │                    │
//!     ▼                    ▼
//!        ┌───────────┐
//!        │ Finalized │ ← Terminal; later events are dropped
//!        └───────────┘
//! ```
//!
//! Dispatch (middleware + responder) happens exactly once per request in
//! either mode. In streaming mode it happens before any body bytes exist:
//! the responder is expected to arrange for the data/finalize responders
//! to consume the body incrementally.

use bytes::BytesMut;
use std::sync::Arc;

use crate::app::dispatch::App;
use crate::errors::{Fault, HttpError};
use crate::http::events::{BodyEvent, BodyStream, EventSource};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::routing::resource::PathParams;
use crate::routing::table::Route;

/// The lifecycle phase of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Start,
    BufferingBody,
    StreamingBody,
    Finalized,
}

/// Per-request mutable state, exclusively owned by the request's
/// processing task and never shared across requests.
///
/// The mode determines which fields are meaningful: `buffered` only while
/// `BufferingBody`, `route` always present once `Start` is left.
pub struct ConnectionState {
    mode: ConnectionMode,
    route: Option<Route>,
    buffered: Vec<bytes::Bytes>,
    buffered_len: usize,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            mode: ConnectionMode::Start,
            route: None,
            buffered: Vec::new(),
            buffered_len: 0,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn is_finalized(&self) -> bool {
        self.mode == ConnectionMode::Finalized
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Feeds one body event through the state machine.
    ///
    /// Events for one request must be delivered in order; each call either
    /// advances the state or, once finalized, drops the event. An `Err`
    /// means an unclaimed fault surfaced and the request is aborted; the
    /// state should be abandoned, not reused.
    pub async fn handle_event(
        &self,
        state: &mut ConnectionState,
        req: &mut Request,
        resp: &mut Response,
        event: BodyEvent,
    ) -> Result<(), Fault> {
        match state.mode {
            ConnectionMode::Start => self.on_first_event(state, req, resp, event).await,
            ConnectionMode::BufferingBody => {
                self.on_buffering_event(state, req, resp, event).await
            }
            ConnectionMode::StreamingBody => {
                self.on_streaming_event(state, req, resp, event).await
            }
            ConnectionMode::Finalized => {
                // Hosts may deliver a trailing event after end-of-body;
                // drop it without fault and without dispatching again.
                tracing::trace!(path = %req.path, "Dropping body event after finalization");
                Ok(())
            }
        }
    }

    async fn on_first_event(
        &self,
        state: &mut ConnectionState,
        req: &mut Request,
        resp: &mut Response,
        event: BodyEvent,
    ) -> Result<(), Fault> {
        let route = match self.resolve_route(req) {
            Ok(route) => route,
            Err(fault) => {
                let params = PathParams::new();
                if !self.handle_fault(req, resp, &fault, &params).await? {
                    return Err(fault);
                }
                // The handler composed a response; there is no route to
                // deliver body data to, so the request is done.
                state.mode = ConnectionMode::Finalized;
                return Ok(());
            }
        };

        let streaming = route
            .resource
            .as_ref()
            .is_some_and(|r| r.has_data_responder(&req.method));

        tracing::debug!(
            method = req.method.as_str(),
            path = %req.path,
            streaming,
            more_body = event.more_body,
            "First body event received"
        );

        if streaming {
            state.mode = ConnectionMode::StreamingBody;
            self.dispatch(req, resp, &route).await?;
            state.mode = self.stream_chunk(req, resp, &route, event).await?;
            state.route = Some(route);
            return Ok(());
        }

        if event.more_body {
            // More chunks are coming: a declared Content-Length over the
            // limit fails the request before any further chunks are pulled.
            let received = event.chunk.len().max(req.content_length());
            self.enforce_body_limit(req, resp, &route.params, received).await?;
            state.buffered_len = event.chunk.len();
            state.buffered.push(event.chunk);
            state.route = Some(route);
            state.mode = ConnectionMode::BufferingBody;
            return Ok(());
        }

        // The whole body arrived in one event: single-shot dispatch. Only
        // the bytes actually received count against the limit here; a
        // stale declared length does not fault a complete small body.
        self.enforce_body_limit(req, resp, &route.params, event.chunk.len())
            .await?;
        req.body = Some(event.chunk);
        self.dispatch(req, resp, &route).await?;
        state.route = Some(route);
        state.mode = ConnectionMode::Finalized;
        Ok(())
    }

    async fn on_buffering_event(
        &self,
        state: &mut ConnectionState,
        req: &mut Request,
        resp: &mut Response,
        event: BodyEvent,
    ) -> Result<(), Fault> {
        let Some(route) = state.route.take() else {
            return Ok(());
        };

        let more_body = event.more_body;
        state.buffered_len += event.chunk.len();
        state.buffered.push(event.chunk);

        if let Err(fault) = self
            .enforce_body_limit(req, resp, &route.params, state.buffered_len)
            .await
        {
            // Aborted: discard what was received.
            state.buffered.clear();
            state.buffered_len = 0;
            return Err(fault);
        }

        if more_body {
            state.route = Some(route);
            return Ok(());
        }

        // Terminal event: assemble the body in chunk-arrival order and
        // dispatch once.
        let mut body = BytesMut::with_capacity(state.buffered_len);
        for chunk in state.buffered.drain(..) {
            body.extend_from_slice(&chunk);
        }
        state.buffered_len = 0;
        req.body = Some(body.freeze());

        self.dispatch(req, resp, &route).await?;

        state.route = Some(route);
        state.mode = ConnectionMode::Finalized;
        Ok(())
    }

    async fn on_streaming_event(
        &self,
        state: &mut ConnectionState,
        req: &mut Request,
        resp: &mut Response,
        event: BodyEvent,
    ) -> Result<(), Fault> {
        let Some(route) = state.route.take() else {
            return Ok(());
        };

        let result = self.stream_chunk(req, resp, &route, event).await;
        state.route = Some(route);
        state.mode = result?;
        Ok(())
    }

    /// Delivers one chunk to the resource's data responder and, on the
    /// terminal event, the finalize responder. Returns the next mode.
    async fn stream_chunk(
        &self,
        req: &mut Request,
        resp: &mut Response,
        route: &Route,
        event: BodyEvent,
    ) -> Result<ConnectionMode, Fault> {
        let next_mode = if event.more_body {
            ConnectionMode::StreamingBody
        } else {
            ConnectionMode::Finalized
        };

        let Some(resource) = &route.resource else {
            return Ok(next_mode);
        };

        let terminal = !event.more_body;
        let mut data_ok = true;

        if let Err(fault) = resource.on_data(req, resp, event.chunk).await {
            data_ok = false;
            if !self.handle_fault(req, resp, &fault, &route.params).await? {
                return Err(fault);
            }
        }

        // Finalize runs once, after the last chunk, and is suppressed when
        // the terminal chunk's data delivery faulted, claimed or not.
        if terminal && data_ok {
            if let Err(fault) = resource.on_finalize(req, resp).await {
                if !self.handle_fault(req, resp, &fault, &route.params).await? {
                    return Err(fault);
                }
            }
        }

        Ok(next_mode)
    }

    /// Enforces the buffered-body size bound.
    ///
    /// When exceeded, a 413 fault is synthesized and offered to the
    /// handler registry; unclaimed, it propagates and the request is
    /// aborted. A claimed fault lets buffering continue with the response
    /// already composed by the handler.
    async fn enforce_body_limit(
        &self,
        req: &mut Request,
        resp: &mut Response,
        params: &PathParams,
        received: usize,
    ) -> Result<(), Fault> {
        let limit = self.max_buffered_body_size();
        if received <= limit {
            return Ok(());
        }

        tracing::warn!(
            path = %req.path,
            received,
            limit,
            "Buffered request body exceeds the configured maximum"
        );

        let fault = Fault::Error(HttpError::payload_too_large());
        if !self.handle_fault(req, resp, &fault, params).await? {
            return Err(fault);
        }

        Ok(())
    }
}

/// Drives one logical request from an event source to completion, in the
/// style of a host connection task.
pub struct Connection<S> {
    app: Arc<App>,
    stream: BodyStream<S>,
    state: ConnectionState,
}

impl<S: EventSource> Connection<S> {
    pub fn new(app: Arc<App>, source: S) -> Self {
        Self {
            app,
            stream: BodyStream::new(source),
            state: ConnectionState::new(),
        }
    }

    /// Pulls body events and feeds them through the state machine until
    /// the request finalizes.
    ///
    /// A host-level abort surfaces as a fault from the next receive and
    /// ends the run; the state is abandoned with whatever was already
    /// written to the response left standing.
    pub async fn run(&mut self, req: &mut Request, resp: &mut Response) -> Result<(), Fault> {
        while !self.state.is_finalized() {
            let Some(chunk) = self.stream.next_chunk().await? else {
                break;
            };

            let event = BodyEvent {
                chunk,
                more_body: !self.stream.is_exhausted(),
            };

            self.app.handle_event(&mut self.state, req, resp, event).await?;
        }

        Ok(())
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }
}
