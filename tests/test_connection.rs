//! Tests for the per-request connection state machine: buffered and
//! streaming body delivery, the size bound, and terminal-state behavior.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use slipstream::app::{App, AppBuilder, Connection, ConnectionMode, ConnectionState, ErrorHandler};
use slipstream::errors::{Fault, FaultKind};
use slipstream::http::events::{BodyEvent, ChannelEvents};
use slipstream::http::request::{Method, Request, RequestBuilder};
use slipstream::http::response::{Response, StatusCode};
use slipstream::routing::{PathParams, Resource};

/// Buffered resource: echoes the assembled request body.
struct EchoResource {
    dispatched: Mutex<u32>,
}

impl EchoResource {
    fn new() -> Self {
        Self {
            dispatched: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Resource for EchoResource {
    fn supports(&self, method: &Method) -> bool {
        matches!(method, Method::POST)
    }

    async fn respond(
        &self,
        req: &mut Request,
        resp: &mut Response,
        _params: &PathParams,
    ) -> Result<(), Fault> {
        *self.dispatched.lock().unwrap() += 1;
        let body = req.body.clone().unwrap_or_default();
        resp.body = body.to_vec();
        Ok(())
    }
}

/// Streaming resource: records every chunk and finalize call.
struct CollectingResource {
    chunks: Mutex<Vec<Bytes>>,
    finalized: Mutex<u32>,
    dispatched: Mutex<u32>,
    buffered_body_seen: Mutex<bool>,
    fail_on_chunk: Option<usize>,
}

impl CollectingResource {
    fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            finalized: Mutex::new(0),
            dispatched: Mutex::new(0),
            buffered_body_seen: Mutex::new(false),
            fail_on_chunk: None,
        }
    }

    fn failing_on_chunk(index: usize) -> Self {
        Self {
            fail_on_chunk: Some(index),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Resource for CollectingResource {
    fn supports(&self, method: &Method) -> bool {
        matches!(method, Method::POST)
    }

    async fn respond(
        &self,
        req: &mut Request,
        _resp: &mut Response,
        _params: &PathParams,
    ) -> Result<(), Fault> {
        *self.dispatched.lock().unwrap() += 1;
        if req.body.is_some() {
            *self.buffered_body_seen.lock().unwrap() = true;
        }
        Ok(())
    }

    fn has_data_responder(&self, _method: &Method) -> bool {
        true
    }

    fn has_finalize_responder(&self, _method: &Method) -> bool {
        true
    }

    async fn on_data(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        chunk: Bytes,
    ) -> Result<(), Fault> {
        let index = self.chunks.lock().unwrap().len();
        if self.fail_on_chunk == Some(index) {
            return Err(Fault::app(anyhow::anyhow!("data responder failed")));
        }
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn on_finalize(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
    ) -> Result<(), Fault> {
        *self.finalized.lock().unwrap() += 1;
        Ok(())
    }
}

/// Claims every fault it sees without touching the response.
struct SwallowAll {
    claimed: Mutex<Vec<FaultKind>>,
}

impl SwallowAll {
    fn new() -> Self {
        Self {
            claimed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ErrorHandler for SwallowAll {
    async fn handle(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        fault: &Fault,
        _params: &PathParams,
    ) -> Result<(), Fault> {
        self.claimed.lock().unwrap().push(fault.kind());
        Ok(())
    }
}

/// Re-signals structured errors so the framework composes the response.
struct ComposeErrors;

#[async_trait]
impl ErrorHandler for ComposeErrors {
    async fn handle(
        &self,
        _req: &mut Request,
        _resp: &mut Response,
        fault: &Fault,
        _params: &PathParams,
    ) -> Result<(), Fault> {
        match fault {
            Fault::Error(error) => Err(Fault::Error(error.clone())),
            _ => Ok(()),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

fn post(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::POST)
        .path(path)
        .build()
        .unwrap()
}

fn echo_app(resource: Arc<EchoResource>) -> App {
    AppBuilder::new().route("/echo", resource).unwrap().build()
}

async fn feed(
    app: &App,
    state: &mut ConnectionState,
    req: &mut Request,
    resp: &mut Response,
    chunks: &[&[u8]],
) -> Result<(), Fault> {
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let chunk = Bytes::copy_from_slice(chunk);
        let event = if i == last {
            BodyEvent::terminal(chunk)
        } else {
            BodyEvent::partial(chunk)
        };
        app.handle_event(state, req, resp, event).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_buffered_body_reconstructed_for_any_chunk_partition() {
    init_tracing();
    let partitions: Vec<Vec<&[u8]>> = vec![
        vec![b"hello world"],
        vec![b"hello ", b"world"],
        vec![b"h", b"ello", b" wor", b"ld"],
        vec![b"", b"hello world", b""],
        vec![b"hello", b"", b" ", b"world"],
    ];

    for chunks in partitions {
        let resource = Arc::new(EchoResource::new());
        let app = echo_app(resource.clone());
        let mut state = ConnectionState::new();
        let mut req = post("/echo");
        let mut resp = Response::new();

        feed(&app, &mut state, &mut req, &mut resp, &chunks)
            .await
            .unwrap();

        assert!(state.is_finalized());
        assert_eq!(resp.body, b"hello world".to_vec());
        assert_eq!(*resource.dispatched.lock().unwrap(), 1);
    }
}

#[tokio::test]
async fn test_single_terminal_event_dispatches_immediately() {
    let resource = Arc::new(EchoResource::new());
    let app = echo_app(resource.clone());
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    app.handle_event(
        &mut state,
        &mut req,
        &mut resp,
        BodyEvent::terminal(Bytes::from_static(b"all at once")),
    )
    .await
    .unwrap();

    assert_eq!(state.mode(), ConnectionMode::Finalized);
    assert_eq!(resp.body, b"all at once".to_vec());
}

#[tokio::test]
async fn test_empty_chunk_with_more_body_does_not_terminate() {
    let resource = Arc::new(EchoResource::new());
    let app = echo_app(resource.clone());
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    app.handle_event(&mut state, &mut req, &mut resp, BodyEvent::partial(""))
        .await
        .unwrap();

    assert_eq!(state.mode(), ConnectionMode::BufferingBody);
    assert_eq!(*resource.dispatched.lock().unwrap(), 0);

    app.handle_event(
        &mut state,
        &mut req,
        &mut resp,
        BodyEvent::terminal(Bytes::from_static(b"tail")),
    )
    .await
    .unwrap();

    assert!(state.is_finalized());
    assert_eq!(resp.body, b"tail".to_vec());
}

#[tokio::test]
async fn test_events_after_finalization_are_dropped_without_dispatch() {
    let resource = Arc::new(EchoResource::new());
    let app = echo_app(resource.clone());
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    feed(&app, &mut state, &mut req, &mut resp, &[b"body"])
        .await
        .unwrap();
    assert!(state.is_finalized());

    // A trailing empty terminal event and even a data-bearing one must be
    // absorbed silently.
    app.handle_event(&mut state, &mut req, &mut resp, BodyEvent::idle())
        .await
        .unwrap();
    app.handle_event(
        &mut state,
        &mut req,
        &mut resp,
        BodyEvent::terminal(Bytes::from_static(b"late")),
    )
    .await
    .unwrap();

    assert!(state.is_finalized());
    assert_eq!(*resource.dispatched.lock().unwrap(), 1);
    assert_eq!(resp.body, b"body".to_vec());
}

#[tokio::test]
async fn test_streaming_delivers_every_chunk_in_order_then_finalizes() {
    init_tracing();
    let resource = Arc::new(CollectingResource::new());
    let app = AppBuilder::new()
        .route("/upload", resource.clone())
        .unwrap()
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/upload");
    let mut resp = Response::new();

    feed(
        &app,
        &mut state,
        &mut req,
        &mut resp,
        &[b"first", b"", b"second", b"last"],
    )
    .await
    .unwrap();

    assert!(state.is_finalized());
    let chunks = resource.chunks.lock().unwrap();
    let collected: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
    assert_eq!(collected, vec![b"first".as_ref(), b"", b"second", b"last"]);
    assert_eq!(*resource.finalized.lock().unwrap(), 1);
    assert_eq!(*resource.dispatched.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_streaming_dispatches_before_body_and_never_buffers() {
    let resource = Arc::new(CollectingResource::new());
    let app = AppBuilder::new()
        .route("/upload", resource.clone())
        .unwrap()
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/upload");
    let mut resp = Response::new();

    app.handle_event(
        &mut state,
        &mut req,
        &mut resp,
        BodyEvent::partial("early"),
    )
    .await
    .unwrap();

    // Dispatch already ran even though the body is incomplete.
    assert_eq!(state.mode(), ConnectionMode::StreamingBody);
    assert_eq!(*resource.dispatched.lock().unwrap(), 1);
    assert_eq!(*resource.finalized.lock().unwrap(), 0);

    app.handle_event(
        &mut state,
        &mut req,
        &mut resp,
        BodyEvent::terminal(Bytes::from_static(b"late")),
    )
    .await
    .unwrap();

    assert!(state.is_finalized());
    // The responder never saw a buffered body; chunks went through the
    // data responder instead.
    assert!(!*resource.buffered_body_seen.lock().unwrap());
    assert!(req.body.is_none());
    assert_eq!(*resource.finalized.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_streaming_single_terminal_event_feeds_data_then_finalize() {
    let resource = Arc::new(CollectingResource::new());
    let app = AppBuilder::new()
        .route("/upload", resource.clone())
        .unwrap()
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/upload");
    let mut resp = Response::new();

    feed(&app, &mut state, &mut req, &mut resp, &[b"only"])
        .await
        .unwrap();

    assert!(state.is_finalized());
    assert_eq!(resource.chunks.lock().unwrap().len(), 1);
    assert_eq!(*resource.finalized.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_unhandled_data_fault_aborts_and_suppresses_finalize() {
    let resource = Arc::new(CollectingResource::failing_on_chunk(1));
    let app = AppBuilder::new()
        .route("/upload", resource.clone())
        .unwrap()
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/upload");
    let mut resp = Response::new();

    let result = feed(&app, &mut state, &mut req, &mut resp, &[b"ok", b"boom"]).await;

    let fault = result.unwrap_err();
    assert_eq!(fault.kind(), FaultKind::App);
    assert_eq!(*resource.finalized.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_handled_terminal_data_fault_still_suppresses_finalize() {
    let resource = Arc::new(CollectingResource::failing_on_chunk(1));
    let handler = Arc::new(SwallowAll::new());
    let app = AppBuilder::new()
        .route("/upload", resource.clone())
        .unwrap()
        .error_handler(FaultKind::Any, handler.clone())
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/upload");
    let mut resp = Response::new();

    feed(&app, &mut state, &mut req, &mut resp, &[b"ok", b"boom"])
        .await
        .unwrap();

    assert!(state.is_finalized());
    assert_eq!(*resource.finalized.lock().unwrap(), 0);
    assert_eq!(handler.claimed.lock().unwrap().as_slice(), &[FaultKind::App]);
}

#[tokio::test]
async fn test_body_over_limit_in_one_chunk_aborts_with_size_fault() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .max_buffered_body_size(8)
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    let result = feed(
        &app,
        &mut state,
        &mut req,
        &mut resp,
        &[b"way more than eight bytes"],
    )
    .await;

    let fault = result.unwrap_err();
    assert_eq!(fault.kind(), FaultKind::PayloadTooLarge);
    assert_eq!(*resource.dispatched.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_body_over_limit_across_many_chunks_aborts_with_size_fault() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .max_buffered_body_size(8)
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    let result = feed(
        &app,
        &mut state,
        &mut req,
        &mut resp,
        &[b"four", b"four", b"over"],
    )
    .await;

    let fault = result.unwrap_err();
    assert_eq!(fault.kind(), FaultKind::PayloadTooLarge);
    assert_eq!(*resource.dispatched.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_declared_content_length_over_limit_aborts_on_first_event() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .max_buffered_body_size(8)
        .build();
    let mut state = ConnectionState::new();
    let mut req = RequestBuilder::new()
        .method(Method::POST)
        .path("/echo")
        .header("Content-Length", "4096")
        .build()
        .unwrap();
    let mut resp = Response::new();

    let result = app
        .handle_event(&mut state, &mut req, &mut resp, BodyEvent::partial("hi"))
        .await;

    assert_eq!(result.unwrap_err().kind(), FaultKind::PayloadTooLarge);
}

#[tokio::test]
async fn test_inflated_content_length_does_not_fault_complete_small_body() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .max_buffered_body_size(64)
        .build();
    let mut state = ConnectionState::new();
    let mut req = RequestBuilder::new()
        .method(Method::POST)
        .path("/echo")
        .header("Content-Length", "1000000")
        .build()
        .unwrap();
    let mut resp = Response::new();

    // The body fit in one terminal event; only the bytes received count.
    app.handle_event(&mut state, &mut req, &mut resp, BodyEvent::terminal("tiny"))
        .await
        .unwrap();

    assert!(state.is_finalized());
    assert_eq!(*resource.dispatched.lock().unwrap(), 1);
    assert_eq!(resp.body, b"tiny".to_vec());
}

#[tokio::test]
async fn test_claimed_size_fault_composes_413_via_resignal() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .max_buffered_body_size(8)
        .error_handler(FaultKind::PayloadTooLarge, Arc::new(ComposeErrors))
        .build();
    let mut state = ConnectionState::new();
    let mut req = post("/echo");
    let mut resp = Response::new();

    // Claimed: the handler composes the 413 and processing continues.
    feed(
        &app,
        &mut state,
        &mut req,
        &mut resp,
        &[b"way more", b" than eight bytes"],
    )
    .await
    .unwrap();

    assert!(state.is_finalized());
    assert_eq!(resp.status, StatusCode::PayloadTooLarge);
}

#[tokio::test]
async fn test_route_resolution_fault_finalizes_when_claimed() {
    // GET against a POST-only route faults at resolution time.
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new()
        .route("/echo", resource.clone())
        .unwrap()
        .error_handler(FaultKind::MethodNotAllowed, Arc::new(ComposeErrors))
        .build();
    let mut state = ConnectionState::new();
    let mut req = RequestBuilder::new()
        .method(Method::GET)
        .path("/echo")
        .build()
        .unwrap();
    let mut resp = Response::new();

    app.handle_event(&mut state, &mut req, &mut resp, BodyEvent::idle())
        .await
        .unwrap();

    assert!(state.is_finalized());
    assert_eq!(resp.status, StatusCode::MethodNotAllowed);
    assert_eq!(*resource.dispatched.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_route_resolution_fault_propagates_when_unclaimed() {
    let resource = Arc::new(EchoResource::new());
    let app = AppBuilder::new().route("/echo", resource).unwrap().build();
    let mut state = ConnectionState::new();
    let mut req = RequestBuilder::new()
        .method(Method::GET)
        .path("/echo")
        .build()
        .unwrap();
    let mut resp = Response::new();

    let result = app
        .handle_event(&mut state, &mut req, &mut resp, BodyEvent::idle())
        .await;

    assert_eq!(result.unwrap_err().kind(), FaultKind::MethodNotAllowed);
}

#[tokio::test]
async fn test_unmatched_route_composes_default_not_found() {
    let app = AppBuilder::new().build();
    let mut state = ConnectionState::new();
    let mut req = post("/nowhere");
    let mut resp = Response::new();

    app.handle_event(&mut state, &mut req, &mut resp, BodyEvent::idle())
        .await
        .unwrap();

    assert!(state.is_finalized());
    assert_eq!(resp.status, StatusCode::NotFound);
}

#[tokio::test]
async fn test_connection_run_drives_request_from_channel_source() {
    let resource = Arc::new(EchoResource::new());
    let app = Arc::new(echo_app(resource.clone()));

    let (tx, events) = ChannelEvents::channel(8);
    let mut conn = Connection::new(app, events);
    let mut req = post("/echo");
    let mut resp = Response::new();

    let feeder = tokio::spawn(async move {
        tx.send(BodyEvent::partial("hello ")).await.unwrap();
        tx.send(BodyEvent::partial("from the ")).await.unwrap();
        tx.send(BodyEvent::terminal(Bytes::from_static(b"host")))
            .await
            .unwrap();
    });

    conn.run(&mut req, &mut resp).await.unwrap();
    feeder.await.unwrap();

    assert!(conn.state().is_finalized());
    assert_eq!(resp.body, b"hello from the host".to_vec());
}

#[tokio::test]
async fn test_connection_run_surfaces_host_abort_as_fault() {
    let resource = Arc::new(EchoResource::new());
    let app = Arc::new(echo_app(resource));

    let (tx, events) = ChannelEvents::channel(8);
    let mut conn = Connection::new(app, events);
    let mut req = post("/echo");
    let mut resp = Response::new();

    tx.send(BodyEvent::partial("partial")).await.unwrap();
    drop(tx); // host disconnect before end-of-body

    let result = conn.run(&mut req, &mut resp).await;
    assert_eq!(result.unwrap_err().kind(), FaultKind::App);
}
