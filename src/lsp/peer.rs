// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A bidirectional LSP peer over a byte stream.
//!
//! Both sides of the bridge speak the same framed JSON-RPC: the IDE over
//! the process stdio and clangd over its child pipes. A peer owns the
//! write half, correlates outgoing requests with responses through a
//! pending map, and hands every inbound request/notification to the
//! router through a channel.

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::protocol::{
    self, NotificationMessage, RequestId, RequestMessage, ResponseError, ResponseMessage,
};

/// Default timeout for outgoing requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reader half of a peer connection.
pub type PeerReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writer half of a peer connection.
pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A request or notification received from the remote side.
#[derive(Debug)]
pub struct InboundMessage {
    /// Present for requests, absent for notifications.
    pub id: Option<RequestId>,
    /// The LSP method name.
    pub method: String,
    /// The raw parameters.
    pub params: serde_json::Value,
}

/// Errors from peer communication.
#[derive(Debug)]
pub enum PeerError {
    /// The request did not complete within its deadline.
    Timeout {
        /// The method that timed out.
        method: String,
    },
    /// The connection is closed or closed while waiting.
    Closed,
    /// The remote side answered with a JSON-RPC error.
    Rpc(ResponseError),
    /// Serialisation or transport failure.
    Transport(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { method } => write!(f, "request '{method}' timed out"),
            Self::Closed => write!(f, "peer connection closed"),
            Self::Rpc(e) => write!(f, "{} (code {})", e.message, e.code),
            Self::Transport(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for PeerError {}

/// One side of the bridge: a framed JSON-RPC endpoint.
pub struct LspPeer {
    label: &'static str,
    next_id: AtomicI64,
    writer: Mutex<PeerWriter>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>,
    alive: Arc<AtomicBool>,
}

impl LspPeer {
    /// Starts a peer on the given stream halves. The returned receiver
    /// yields every inbound request and notification in arrival order;
    /// it closes when the remote side does.
    pub fn spawn(
        reader: PeerReader,
        writer: PeerWriter,
        label: &'static str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            label,
            next_id: AtomicI64::new(1),
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            alive: Arc::new(AtomicBool::new(true)),
        });

        tokio::spawn(Self::reader_task(peer.clone(), reader, tx));

        (peer, rx)
    }

    /// Background task that parses frames and routes them: responses to
    /// their pending request, everything else to the inbound channel.
    async fn reader_task(
        self: Arc<Self>,
        mut reader: PeerReader,
        tx: mpsc::UnboundedSender<InboundMessage>,
    ) {
        let mut buffer = BytesMut::with_capacity(8192);
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("{}: stream closed", self.label);
                    break;
                }
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
                Err(e) => {
                    error!("{}: read error: {e}", self.label);
                    break;
                }
            }

            loop {
                let message = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(m)) => m,
                    Ok(None) => break,
                    Err(e) => {
                        error!("{}: unparsable frame: {e}", self.label);
                        buffer.clear();
                        break;
                    }
                };
                trace!("{} <-- {message}", self.label);

                let value: serde_json::Value = match serde_json::from_str(&message) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("{}: invalid JSON: {e}", self.label);
                        continue;
                    }
                };

                if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                    let id = value
                        .get("id")
                        .cloned()
                        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
                    let params = value
                        .get("params")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let inbound = InboundMessage {
                        id,
                        method: method.to_string(),
                        params,
                    };
                    if tx.send(inbound).is_err() {
                        debug!("{}: inbound channel dropped, stopping reader", self.label);
                        break;
                    }
                } else if value.get("id").is_some() {
                    match serde_json::from_value::<ResponseMessage>(value) {
                        Ok(response) => {
                            let Some(id) = response.id.clone() else {
                                continue;
                            };
                            let mut pending = self.pending.lock().await;
                            if let Some(sender) = pending.remove(&id) {
                                let _ = sender.send(response);
                            } else {
                                warn!("{}: response for unknown request id {id}", self.label);
                            }
                        }
                        Err(e) => warn!("{}: malformed response: {e}", self.label),
                    }
                } else {
                    warn!("{}: unrecognised message shape: {message}", self.label);
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        // Fail every in-flight request instead of letting it ride out its
        // full timeout against a dead connection.
        self.pending.lock().await.clear();
        debug!("{}: reader task exiting", self.label);
    }

    /// Sends a request and awaits its response within the given deadline.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rpc`] for remote errors, [`PeerError::Timeout`]
    /// when the deadline passes, and [`PeerError::Closed`] if the
    /// connection drops while waiting.
    pub async fn request<P: serde::Serialize>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<serde_json::Value, PeerError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = RequestMessage {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| PeerError::Transport(e.to_string()))?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.send(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(PeerError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(PeerError::Timeout {
                    method: method.to_string(),
                });
            }
        };

        if let Some(error) = response.error {
            return Err(PeerError::Rpc(error));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub async fn notify<P: serde::Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<(), PeerError> {
        let notification = NotificationMessage {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| PeerError::Transport(e.to_string()))?,
        };
        self.send(&notification).await
    }

    /// Answers an inbound request with a result.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn respond(&self, id: RequestId, result: serde_json::Value) -> Result<(), PeerError> {
        self.send(&ResponseMessage::success(id, result)).await
    }

    /// Answers an inbound request with an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn respond_error(
        &self,
        id: RequestId,
        code: i64,
        message: String,
    ) -> Result<(), PeerError> {
        self.send(&ResponseMessage::failure(id, code, message)).await
    }

    /// Frames and writes one message.
    async fn send<T: serde::Serialize>(&self, message: &T) -> Result<(), PeerError> {
        let framed =
            protocol::encode_message(message).map_err(|e| PeerError::Transport(e.to_string()))?;
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(body) = serde_json::to_string(message) {
                trace!("{} --> {body}", self.label);
            }
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| PeerError::Transport(format!("writing to {}: {e}", self.label)))?;
        writer
            .flush()
            .await
            .map_err(|e| PeerError::Transport(format!("flushing {}: {e}", self.label)))
    }

    /// True until the remote side closes its stream.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    fn split_boxed(stream: DuplexStream) -> (PeerReader, PeerWriter) {
        let (r, w) = tokio::io::split(stream);
        (Box::new(r), Box::new(w))
    }

    /// Builds two connected peers talking to each other in-memory.
    fn peer_pair() -> (
        Arc<LspPeer>,
        mpsc::UnboundedReceiver<InboundMessage>,
        Arc<LspPeer>,
        mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split_boxed(a);
        let (br, bw) = split_boxed(b);
        let (left, left_rx) = LspPeer::spawn(ar, aw, "left");
        let (right, right_rx) = LspPeer::spawn(br, bw, "right");
        (left, left_rx, right, right_rx)
    }

    #[tokio::test]
    async fn notification_is_delivered_in_order() -> anyhow::Result<()> {
        let (left, _left_rx, _right, mut right_rx) = peer_pair();

        left.notify("a/one", serde_json::json!({"n": 1})).await?;
        left.notify("a/two", serde_json::json!({"n": 2})).await?;

        let first = right_rx.recv().await.expect("first message");
        let second = right_rx.recv().await.expect("second message");
        assert_eq!(first.method, "a/one");
        assert!(first.id.is_none());
        assert_eq!(second.method, "a/two");
        assert_eq!(second.params["n"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn request_response_round_trip() -> anyhow::Result<()> {
        let (left, _left_rx, right, mut right_rx) = peer_pair();

        let responder = tokio::spawn(async move {
            let inbound = right_rx.recv().await.expect("request");
            let id = inbound.id.expect("request has id");
            right
                .respond(id, serde_json::json!({"echo": inbound.params}))
                .await
                .expect("respond");
        });

        let result = left
            .request("test/echo", serde_json::json!({"x": 7}), REQUEST_TIMEOUT)
            .await
            .expect("request succeeds");
        assert_eq!(result["echo"]["x"], 7);
        responder.await?;
        Ok(())
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() -> anyhow::Result<()> {
        let (left, _left_rx, right, mut right_rx) = peer_pair();

        tokio::spawn(async move {
            let inbound = right_rx.recv().await.expect("request");
            let id = inbound.id.expect("request has id");
            right
                .respond_error(id, protocol::METHOD_NOT_FOUND, "unsupported".to_string())
                .await
                .expect("respond");
        });

        let err = left
            .request("test/missing", serde_json::Value::Null, REQUEST_TIMEOUT)
            .await
            .expect_err("should fail");
        match err {
            PeerError::Rpc(e) => assert_eq!(e.code, protocol::METHOD_NOT_FOUND),
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn request_times_out() {
        let (left, _left_rx, _right, _right_rx) = peer_pair();

        let err = left
            .request(
                "test/slow",
                serde_json::Value::Null,
                Duration::from_millis(50),
            )
            .await
            .expect_err("should time out");
        assert!(matches!(err, PeerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn closed_peer_fails_pending_request() {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split_boxed(a);
        let (left, _left_rx) = LspPeer::spawn(ar, aw, "left");

        // Raw remote end: swallow the request frame, then hang up.
        let (mut remote_reader, remote_writer) = tokio::io::split(b);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut remote_reader, &mut buf).await;
            drop(remote_reader);
            drop(remote_writer);
        });

        let err = left
            .request("test/doomed", serde_json::Value::Null, REQUEST_TIMEOUT)
            .await
            .expect_err("should fail");
        assert!(matches!(err, PeerError::Closed));
    }
}
