//! The host receive boundary and the pull-based body stream adapter.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::errors::Fault;

/// One incremental delivery of request body data.
///
/// `more_body == false` marks the end of the body. An empty chunk with
/// `more_body == true` is valid and does not terminate the body.
#[derive(Debug, Clone, Default)]
pub struct BodyEvent {
    pub chunk: Bytes,
    pub more_body: bool,
}

impl BodyEvent {
    /// A non-terminal event: more body data follows.
    pub fn partial(chunk: impl Into<Bytes>) -> Self {
        Self {
            chunk: chunk.into(),
            more_body: true,
        }
    }

    /// The final event for a request body.
    pub fn terminal(chunk: impl Into<Bytes>) -> Self {
        Self {
            chunk: chunk.into(),
            more_body: false,
        }
    }

    /// An empty terminal event, safe to return from a source that is
    /// called again after end-of-body.
    pub fn idle() -> Self {
        Self::default()
    }
}

/// The host's incremental receive primitive.
///
/// Contract: once an event with `more_body == false` has been returned, no
/// further meaningful body data exists for the request, but `receive` may
/// still be called and must resolve (an idle event is fine). A host-level
/// disconnect or timeout surfaces as `Err` from the next `receive` call.
#[async_trait]
pub trait EventSource: Send {
    async fn receive(&mut self) -> Result<BodyEvent, Fault>;
}

/// Pull-based chunk sequence over an [`EventSource`], with an explicit
/// end-of-body marker.
///
/// `next_chunk` yields `Some(chunk)` for every event up to and including
/// the terminal one, then `None` forever, without calling the underlying
/// source again.
pub struct BodyStream<S> {
    source: S,
    exhausted: bool,
}

impl<S: EventSource> BodyStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            exhausted: false,
        }
    }

    /// True once the terminal event has been pulled.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Fault> {
        if self.exhausted {
            return Ok(None);
        }

        let event = self.source.receive().await?;

        if !event.more_body {
            self.exhausted = true;
        }

        Ok(Some(event.chunk))
    }

    /// Drains the remaining chunks and joins them in arrival order.
    pub async fn read_all(&mut self) -> Result<Bytes, Fault> {
        let mut body = BytesMut::new();

        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

/// Channel-backed event source, the bridge a host task uses to feed body
/// events into a request's processing task.
pub struct ChannelEvents {
    rx: mpsc::Receiver<BodyEvent>,
    seen_terminal: bool,
}

impl ChannelEvents {
    pub fn channel(capacity: usize) -> (mpsc::Sender<BodyEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);

        let events = Self {
            rx,
            seen_terminal: false,
        };

        (tx, events)
    }
}

#[async_trait]
impl EventSource for ChannelEvents {
    async fn receive(&mut self) -> Result<BodyEvent, Fault> {
        match self.rx.recv().await {
            Some(event) => {
                if !event.more_body {
                    self.seen_terminal = true;
                }
                Ok(event)
            }
            // A sender dropped after end-of-body is normal teardown; before
            // end-of-body it means the host aborted the request.
            None if self.seen_terminal => Ok(BodyEvent::idle()),
            None => Err(Fault::app(anyhow::anyhow!(
                "event source closed before end of body"
            ))),
        }
    }
}
