//! Stream controller.
//!
//! Owns one negotiation stream end to end: opens the transport, runs
//! decoder -> classifier -> reducer, publishes a snapshot after every fold, and turns a
//! user abort into exactly one `Cancelled` event.

use crate::classifier::classify_frame;
use crate::constants::PREMATURE_END_MESSAGE;
use crate::decoder::frames;
use crate::logging::StreamMetric;
use crate::session::NegotiationSession;
use crate::transport::Transport;
use crate::types::{EventKind, NegotiationEvent, NegotiationRequest, ParleyError, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;
use uuid::Uuid;

pub struct NegotiationClient<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> Clone for NegotiationClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> NegotiationClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Submits a request and starts following its stream on a new task.
    ///
    /// Every call gets its own decoder and session state.
    pub fn start(&self, request: NegotiationRequest) -> SessionHandle {
        let stream_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let controller = StreamController {
            transport: self.transport.clone(),
            request,
            cancel: cancel.clone(),
            updates: tx,
            session: NegotiationSession::submitted(),
            next_seq: 1,
            metrics: StreamMetric::new(),
        };

        let span = tracing::info_span!("negotiation", stream_id = %stream_id);
        let task = tokio::spawn(controller.run().instrument(span));

        SessionHandle {
            stream_id,
            cancel: CancelHandle {
                token: cancel.clone(),
            },
            guard: Some(cancel.drop_guard()),
            updates: Some(rx),
            task,
        }
    }
}

/// Cloneable way to cancel a running stream, e.g. from a signal handler.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Aborts the stream. Safe to call any number of times, including after the
    /// session has reached a terminal status.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Cancellation requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle to a running negotiation stream. Dropping it without `finish` cancels the stream.
pub struct SessionHandle {
    stream_id: Uuid,
    cancel: CancelHandle,
    guard: Option<DropGuard>,
    updates: Option<mpsc::UnboundedReceiver<NegotiationSession>>,
    task: JoinHandle<NegotiationSession>,
}

impl SessionHandle {
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Snapshot after every fold step, in order, starting from the submitted state.
    /// Available once; later calls return `None`.
    pub fn updates(&mut self) -> Option<UnboundedReceiverStream<NegotiationSession>> {
        self.updates.take().map(UnboundedReceiverStream::new)
    }

    /// Runs `callback` for every snapshot on a separate task. The final snapshot is always
    /// delivered before the returned task completes. Returns `None` if the updates were
    /// already taken.
    pub fn on_update<F>(&mut self, mut callback: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(&NegotiationSession) + Send + 'static,
    {
        let mut rx = match self.updates.take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Update subscription already taken for this stream");
                return None;
            }
        };
        Some(tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                callback(&snapshot);
            }
        }))
    }

    /// Waits for the stream to finish and returns the final session.
    pub async fn finish(mut self) -> Result<NegotiationSession> {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        match (&mut self.task).await {
            Ok(session) => Ok(session),
            Err(e) => Err(ParleyError::Internal(
                format!("stream controller task failed: {}", e),
                tracing_error::SpanTrace::capture(),
            )
            .into()),
        }
    }
}

/// Why the read loop stopped.
enum StopReason {
    Cancelled,
    Terminal,
    StreamComplete,
    EndOfStream,
    TransportFault(String),
}

struct StreamController<T: Transport> {
    transport: Arc<T>,
    request: NegotiationRequest,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<NegotiationSession>,
    session: NegotiationSession,
    next_seq: u64,
    metrics: StreamMetric,
}

impl<T: Transport> StreamController<T> {
    async fn run(mut self) -> NegotiationSession {
        tracing::info!(
            "Submitting negotiation: {} x{} for {} ({} urgency)",
            self.request.resource_type,
            self.request.quantity,
            self.request.initiator,
            self.request.urgency
        );
        self.publish();

        if let Err(e) = self.request.validate() {
            tracing::warn!("Rejected negotiation request: {}", e.inner);
            let event = NegotiationEvent::errored(self.seq(), e.inner.to_string(), None);
            self.fold(event);
            return self.into_final();
        }

        let reason = self.drive().await;
        match reason {
            StopReason::Cancelled => {
                let event = NegotiationEvent::cancelled(self.seq());
                self.fold(event);
            }
            StopReason::TransportFault(message) => {
                let event = NegotiationEvent::errored(self.seq(), message, None);
                self.fold(event);
            }
            StopReason::StreamComplete | StopReason::EndOfStream
                if !self.session.is_terminal() =>
            {
                tracing::warn!("Stream closed while status was {}", self.session.status);
                let event = NegotiationEvent::errored(self.seq(), PREMATURE_END_MESSAGE, None);
                self.fold(event);
            }
            StopReason::Terminal | StopReason::StreamComplete | StopReason::EndOfStream => {}
        }

        self.into_final()
    }

    async fn drive(&mut self) -> StopReason {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StopReason::Cancelled,
            opened = self.transport.open(&self.request) => opened,
        };

        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(e) => {
                if self.cancel.is_cancelled() {
                    tracing::debug!("[☁️  -> ⚙️ ] Open failed after cancellation: {}", e.inner);
                    return StopReason::Cancelled;
                }
                if let ParleyError::Upstream(status, body) = &e.inner {
                    let message = if body.trim().is_empty() {
                        status.to_string()
                    } else {
                        body.clone()
                    };
                    let event =
                        NegotiationEvent::errored(self.seq(), message, Some(status.as_u16()));
                    self.fold(event);
                    return StopReason::Terminal;
                }
                tracing::error!("[☁️  -> ⚙️ ] Failed to open negotiation stream: {}", e.inner);
                return StopReason::TransportFault(e.inner.to_string());
            }
        };

        let mut frame_stream = frames(chunks);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                next = frame_stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if self.cancel.is_cancelled() {
                        return StopReason::Cancelled;
                    }
                    tracing::error!("[☁️  -> ⚙️ ] Transport fault mid-stream: {}", e);
                    return StopReason::TransportFault(format!("transport fault: {}", e));
                }
                None => {
                    tracing::debug!("[☁️  -> ⚙️ ] End of stream");
                    return StopReason::EndOfStream;
                }
            };

            if self.cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            let event = classify_frame(&frame, self.seq());
            let is_stream_complete = matches!(event.kind, EventKind::StreamComplete);
            self.metrics.record_event(&event);
            self.fold(event);

            if self.session.is_terminal() {
                return StopReason::Terminal;
            }
            if is_stream_complete {
                tracing::debug!("[☁️  -> ⚙️ ] Stream terminator received");
                return StopReason::StreamComplete;
            }
        }
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn fold(&mut self, event: NegotiationEvent) {
        tracing::debug!("[FOLD] #{} {}", event.seq, event.kind.name());
        self.session.apply(event);
        self.publish();
    }

    fn publish(&self) {
        if self.updates.send(self.session.clone()).is_err() {
            tracing::trace!("No subscriber for session updates");
        }
    }

    fn into_final(self) -> NegotiationSession {
        self.metrics.log_summary(&self.session.status.to_string());
        self.session
    }
}
