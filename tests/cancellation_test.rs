use bytes::Bytes;
use futures_util::StreamExt;
use parley::controller::{CancelHandle, NegotiationClient, SessionHandle};
use parley::session::NegotiationSession;
use parley::transport::{ChunkStream, Transport};
use parley::types::*;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

type ChunkSender = mpsc::UnboundedSender<std::io::Result<Bytes>>;

/// Transport whose body is fed by the test, one chunk at a time.
struct ChannelTransport {
    rx: Mutex<Option<mpsc::UnboundedReceiver<std::io::Result<Bytes>>>>,
}

impl ChannelTransport {
    fn new() -> (Self, ChunkSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl Transport for ChannelTransport {
    async fn open(&self, _request: &NegotiationRequest) -> Result<ChunkStream> {
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match rx {
            Some(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(ParleyError::Protocol("transport already opened".into()).into()),
        }
    }
}

/// Transport that never finishes connecting.
struct StalledTransport;

impl Transport for StalledTransport {
    async fn open(&self, _request: &NegotiationRequest) -> Result<ChunkStream> {
        std::future::pending::<Result<ChunkStream>>().await
    }
}

/// Transport whose connect attempt fails just as the caller cancels.
struct CancelDuringOpen {
    handle: Mutex<Option<oneshot::Receiver<CancelHandle>>>,
    upstream: bool,
}

impl CancelDuringOpen {
    fn new(upstream: bool) -> (Self, oneshot::Sender<CancelHandle>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                handle: Mutex::new(Some(rx)),
                upstream,
            },
            tx,
        )
    }
}

impl Transport for CancelDuringOpen {
    async fn open(&self, _request: &NegotiationRequest) -> Result<ChunkStream> {
        let rx = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(rx) = rx {
            if let Ok(handle) = rx.await {
                handle.cancel();
            }
        }
        if self.upstream {
            Err(ParleyError::Upstream(
                reqwest::StatusCode::SERVICE_UNAVAILABLE,
                "busy".into(),
            )
            .into())
        } else {
            Err(ParleyError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
            .into())
        }
    }
}

async fn run_cancel_during_open(upstream: bool) -> NegotiationSession {
    let (transport, tx) = CancelDuringOpen::new(upstream);
    let client = NegotiationClient::new(transport);
    let handle = client.start(NegotiationRequest::default());
    if tx.send(handle.cancel_handle()).is_err() {
        panic!("transport dropped before the cancel handle arrived");
    }
    handle.finish().await.unwrap()
}

fn frame(json: &str) -> std::io::Result<Bytes> {
    Ok(Bytes::from(format!("data: {}\n", json)))
}

async fn wait_for_log_len(
    updates: &mut UnboundedReceiverStream<NegotiationSession>,
    len: usize,
) -> NegotiationSession {
    let wait = async {
        while let Some(snapshot) = updates.next().await {
            if snapshot.log.len() >= len {
                return snapshot;
            }
        }
        panic!("updates ended before {} events were logged", len);
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("timed out waiting for {} events", len),
    }
}

fn start_with_channel() -> (
    SessionHandle,
    ChunkSender,
    UnboundedReceiverStream<NegotiationSession>,
) {
    let (transport, tx) = ChannelTransport::new();
    let client = NegotiationClient::new(transport);
    let mut handle = client.start(NegotiationRequest::default());
    let updates = match handle.updates() {
        Some(u) => u,
        None => panic!("updates already taken"),
    };
    (handle, tx, updates)
}

#[tokio::test]
async fn cancel_mid_stream_appends_single_cancelled_entry() {
    let (handle, tx, mut updates) = start_with_channel();

    tx.send(frame(r#"{"event":"negotiation_initiated","session_id":"abc123"}"#))
        .unwrap();
    // Second frame arrives split across two chunks.
    tx.send(Ok(Bytes::from_static(b"data: {\"event\":\"broadcasting_")))
        .unwrap();
    tx.send(Ok(Bytes::from_static(
        b"request\",\"participants\":[\"H2\",\"H3\"]}\n",
    )))
    .unwrap();

    let snapshot = wait_for_log_len(&mut updates, 2).await;
    assert_eq!(snapshot.status, SessionStatus::Negotiating);

    handle.cancel();
    handle.cancel();
    let session = handle.finish().await.unwrap();

    assert_eq!(session.status, SessionStatus::Cancelled);
    let kinds: Vec<&str> = session.log.iter().map(|e| e.kind.name()).collect();
    assert_eq!(kinds, vec!["initiated", "broadcast", "cancelled"]);
    assert!(session.error.is_none());
    assert!(tx.is_closed());
}

#[tokio::test]
async fn cancel_after_terminal_is_noop() {
    let (handle, tx, mut updates) = start_with_channel();
    let cancel = handle.cancel_handle();

    tx.send(frame(r#"{"event":"negotiation_initiated","session_id":"s1"}"#))
        .unwrap();
    tx.send(frame(
        r#"{"event":"negotiation_completed","decision":{"success":true,"selected_offers":[],"total_cost":0}}"#,
    ))
    .unwrap();
    let snapshot = wait_for_log_len(&mut updates, 2).await;
    assert_eq!(snapshot.status, SessionStatus::Completed);

    let session = handle.finish().await.unwrap();
    cancel.cancel();
    cancel.cancel();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.log.iter().all(|e| !e.is_cancelled()));
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn cancel_before_connect_completes() {
    let client = NegotiationClient::new(StalledTransport);
    let handle = client.start(NegotiationRequest::default());
    handle.cancel();
    let session = handle.finish().await.unwrap();

    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.log.len(), 1);
    assert!(session.log[0].is_cancelled());
}

#[tokio::test]
async fn network_fault_is_errored_not_cancelled() {
    let (handle, tx, mut updates) = start_with_channel();

    tx.send(frame(r#"{"event":"negotiation_initiated","session_id":"s2"}"#))
        .unwrap();
    wait_for_log_len(&mut updates, 1).await;
    tx.send(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    )))
    .unwrap();

    let session = handle.finish().await.unwrap();
    assert_eq!(session.status, SessionStatus::Errored);
    assert!(session.log.iter().all(|e| !e.is_cancelled()));
    match &session.log[1].kind {
        EventKind::Errored {
            message, status, ..
        } => {
            assert!(message.contains("connection reset"));
            assert_eq!(*status, None);
        }
        other => panic!("Expected Errored, got {:?}", other),
    }
}

#[tokio::test]
async fn dropping_handle_aborts_transport() {
    let (handle, tx, mut updates) = start_with_channel();
    tx.send(frame(r#"{"event":"negotiation_initiated","session_id":"s3"}"#))
        .unwrap();
    wait_for_log_len(&mut updates, 1).await;

    drop(handle);

    let last = match tokio::time::timeout(Duration::from_secs(5), updates.collect::<Vec<_>>()).await
    {
        Ok(rest) => rest.into_iter().last(),
        Err(_) => panic!("controller kept running after its handle was dropped"),
    };
    match last {
        Some(session) => assert_eq!(session.status, SessionStatus::Cancelled),
        None => panic!("Expected a final snapshot"),
    }
    assert!(
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .is_ok(),
        "transport body should be dropped"
    );
}

#[tokio::test]
async fn on_update_delivers_final_state() {
    let (transport, tx) = ChannelTransport::new();
    let client = NegotiationClient::new(transport);
    let mut handle = client.start(NegotiationRequest::default());

    let seen = std::sync::Arc::new(Mutex::new(Vec::<SessionStatus>::new()));
    let sink = seen.clone();
    let listener = handle.on_update(move |session| {
        if let Ok(mut statuses) = sink.lock() {
            statuses.push(session.status);
        }
    });
    assert!(handle.on_update(|_| {}).is_none());

    tx.send(frame(r#"{"event":"negotiation_initiated","session_id":"s4"}"#))
        .unwrap();
    handle.cancel();
    let session = handle.finish().await.unwrap();
    match listener {
        Some(listener) => listener.await.unwrap(),
        None => panic!("Expected a listener task"),
    }

    let statuses = seen.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&SessionStatus::Initiated));
    assert_eq!(statuses.last(), Some(&session.status));
    assert_eq!(session.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn cancel_racing_an_upstream_rejection_is_cancelled() {
    let session = run_cancel_during_open(true).await;
    assert_eq!(session.status, SessionStatus::Cancelled);
    let kinds: Vec<&str> = session.log.iter().map(|e| e.kind.name()).collect();
    assert_eq!(kinds, vec!["cancelled"]);
    assert!(session.error.is_none());
}

#[tokio::test]
async fn cancel_racing_a_connect_failure_is_cancelled() {
    let session = run_cancel_during_open(false).await;
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.log.len(), 1);
    assert!(session.log[0].is_cancelled());
}
