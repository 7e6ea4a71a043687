//! Bidirectional JSON-RPC multiplexer.
//!
//! Runs exactly one reader task and one writer task per transport. The
//! reader is the only consumer of inbound bytes: it completes pending
//! request slots, spawns handler tasks for server-initiated requests, and
//! feeds notifications to the router. The writer is the only producer of
//! outbound bytes; everyone else hands it fully-framed messages through a
//! bounded queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{CopilotError, Result};
use crate::framing;
use crate::protocol::{
    classify_message, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseOut,
    MessageKind, RpcError,
};
use crate::transport::{Transport, TransportReader, TransportWriter};

type PendingRequests = Arc<RwLock<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Handler for server-initiated requests (`tool.call`, `permission.request`,
/// `userInput.request`, `hooks.invoke`). Runs on its own task per request;
/// the reader never blocks on it.
#[async_trait]
pub(crate) trait ServerRequestHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError>;
}

/// Multiplexed JSON-RPC connection to the CLI.
pub(crate) struct RpcClient {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: PendingRequests,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RpcClient {
    /// Take ownership of a transport and start the reader/writer tasks.
    pub(crate) fn spawn(
        transport: Transport,
        handler: Arc<dyn ServerRequestHandler>,
        notification_tx: mpsc::Sender<JsonRpcNotification>,
        writer_queue: usize,
    ) -> Arc<Self> {
        let Transport {
            reader,
            writer,
            cancel,
        } = transport;

        let pending: PendingRequests = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(writer_queue);

        tokio::spawn(writer_task(writer, writer_rx, cancel.clone()));
        tokio::spawn(reader_task(
            reader,
            Arc::clone(&pending),
            Arc::clone(&connected),
            handler,
            notification_tx,
            writer_tx.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            writer_tx,
            pending,
            connected,
            cancel,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send a request and return its id plus the single-shot result slot.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        if !self.is_connected() {
            return Err(CopilotError::ConnectionClosed);
        }

        let request = JsonRpcRequest::new(method, params);
        let id = request.id;
        let bytes = framing::encode(&request)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.write().await;
            pending.insert(id, tx);
        }

        trace!("rpc send: {method} (id={id})");
        if self.writer_tx.send(bytes).await.is_err() {
            let mut pending = self.pending.write().await;
            pending.remove(&id);
            return Err(CopilotError::ConnectionClosed);
        }

        Ok((id, rx))
    }

    /// Send a request and park on the result with a deadline. On timeout
    /// the pending entry is removed before the error is raised.
    pub(crate) async fn request_value(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (id, rx) = self.request(method, params).await?;
        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CopilotError::ConnectionClosed),
            Err(_) => {
                let mut pending = self.pending.write().await;
                pending.remove(&id);
                Err(CopilotError::Timeout(timeout))
            }
        }
    }

    /// Tear down the connection: unblocks the reader and writer, which
    /// completes every pending request with a connection-closed error.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the connection is gone, whether closed locally or
    /// lost to EOF / an I/O error.
    pub(crate) fn closed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.cancel.clone().cancelled_owned()
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn writer_task(
    mut writer: TransportWriter,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(error) = framing::write_frame(&mut writer, &message).await {
            debug!("Writer task: write failed: {error}");
            cancel.cancel();
            break;
        }
    }

    use tokio::io::AsyncWriteExt;
    let _ = writer.shutdown().await;
}

async fn reader_task(
    mut reader: TransportReader,
    pending: PendingRequests,
    connected: Arc<AtomicBool>,
    handler: Arc<dyn ServerRequestHandler>,
    notification_tx: mpsc::Sender<JsonRpcNotification>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = framing::read_frame(&mut reader) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Reader task: end of stream");
                break;
            }
            Err(error) => {
                warn!("Reader task: {error}");
                break;
            }
        };

        let json_value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    "Failed to parse JSON message: {error} — {}",
                    String::from_utf8_lossy(&body)
                );
                continue;
            }
        };

        match classify_message(&json_value) {
            MessageKind::Response => {
                handle_response(json_value, &pending).await;
            }
            MessageKind::IncomingRequest { id } => {
                let method = json_value
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let params = json_value.get("params").cloned().unwrap_or(Value::Null);
                let handler = Arc::clone(&handler);
                let writer_tx = writer_tx.clone();
                // Handlers run on their own task; the reader must stay
                // free to deliver the events the handler may be waiting on.
                tokio::spawn(async move {
                    dispatch_server_request(handler, writer_tx, id, method, params).await;
                });
            }
            MessageKind::Notification => {
                let notification: JsonRpcNotification =
                    match serde_json::from_value(json_value) {
                        Ok(notification) => notification,
                        Err(error) => {
                            warn!("Failed to parse notification: {error}");
                            continue;
                        }
                    };
                match notification_tx.try_send(notification) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        warn!(
                            "Notification queue full, dropping {}",
                            dropped.method
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("Notification consumer gone");
                    }
                }
            }
        }
    }

    // Connection is gone: fail every pending request and stop accepting
    // new ones. Cancel the token so a writer blocked on a dead pipe exits.
    connected.store(false, Ordering::Release);
    cancel.cancel();
    let mut pending = pending.write().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CopilotError::ConnectionClosed));
    }
}

async fn handle_response(json_value: Value, pending: &PendingRequests) {
    let response: JsonRpcResponse = match serde_json::from_value(json_value) {
        Ok(response) => response,
        Err(error) => {
            warn!("Failed to parse response: {error}");
            return;
        }
    };

    let Some(id) = response.id else {
        warn!("Received response without an id");
        return;
    };

    let sender = {
        let mut pending = pending.write().await;
        pending.remove(&id)
    };
    let Some(tx) = sender else {
        // Unknown id: a retransmitted or stale response is harmless.
        debug!("No pending receiver for response id={id}");
        return;
    };

    let outcome = if let Some(error) = response.error {
        Err(CopilotError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        })
    } else {
        Ok(response.result.unwrap_or(Value::Null))
    };
    let _ = tx.send(outcome);
}

async fn dispatch_server_request(
    handler: Arc<dyn ServerRequestHandler>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    id: u64,
    method: String,
    params: Value,
) {
    trace!("Incoming server request: {method} (id={id})");
    let reply = match handler.handle(&method, params).await {
        Ok(result) => JsonRpcResponseOut::result(id, result),
        Err(error) => JsonRpcResponseOut::error(id, error),
    };

    match framing::encode(&reply) {
        Ok(bytes) => {
            if writer_tx.send(bytes).await.is_err() {
                debug!("Could not reply to server request id={id}: writer gone");
            }
        }
        Err(error) => warn!("Failed to serialize reply to request id={id}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct NullHandler;

    #[async_trait]
    impl ServerRequestHandler for NullHandler {
        async fn handle(
            &self,
            _method: &str,
            _params: Value,
        ) -> std::result::Result<Value, RpcError> {
            Ok(Value::Null)
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ServerRequestHandler for EchoHandler {
        async fn handle(
            &self,
            method: &str,
            params: Value,
        ) -> std::result::Result<Value, RpcError> {
            Ok(json!({"echoedMethod": method, "echoedParams": params}))
        }
    }

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            let (read, write) = tokio::io::split(stream);
            Self {
                reader: BufReader::new(read),
                writer: write,
            }
        }

        async fn read_message(&mut self) -> Value {
            let body = framing::read_frame(&mut self.reader)
                .await
                .unwrap()
                .expect("peer stream closed");
            serde_json::from_slice(&body).unwrap()
        }

        async fn write_message(&mut self, message: &Value) {
            let bytes = serde_json::to_vec(message).unwrap();
            framing::write_frame(&mut self.writer, &bytes).await.unwrap();
        }
    }

    fn connect(
        handler: Arc<dyn ServerRequestHandler>,
        notification_capacity: usize,
    ) -> (Arc<RpcClient>, Peer, mpsc::Receiver<JsonRpcNotification>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (notification_tx, notification_rx) = mpsc::channel(notification_capacity);
        let rpc = RpcClient::spawn(
            Transport::duplex(client_side),
            handler,
            notification_tx,
            16,
        );
        (rpc, Peer::new(server_side), notification_rx)
    }

    #[tokio::test]
    async fn request_receives_exactly_one_reply() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        let (id, rx) = rpc.request("ping", None).await.unwrap();
        let message = peer.read_message().await;
        assert_eq!(message["method"], "ping");
        assert_eq!(message["id"], id);

        peer.write_message(&json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}))
            .await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
        // The pending table no longer contains the id.
        assert_eq!(rpc.pending_len().await, 0);
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced_and_pending_entry_removed() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        let (id, rx) = rpc.request("models.list", None).await.unwrap();
        let _ = peer.read_message().await;
        peer.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32600, "message": "bad request"}
        }))
        .await;

        match rx.await.unwrap() {
            Err(CopilotError::Rpc { code, message, .. }) => {
                assert_eq!(code, -32600);
                assert_eq!(message, "bad request");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
        assert_eq!(rpc.pending_len().await, 0);
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_entry() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        let result = rpc
            .request_value("ping", None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CopilotError::Timeout(_))));
        assert_eq!(rpc.pending_len().await, 0);

        // The connection stays healthy after a timeout.
        let (id, rx) = rpc.request("ping", None).await.unwrap();
        let _ = peer.read_message().await; // the timed-out request
        let _ = peer.read_message().await; // the follow-up
        peer.write_message(&json!({"jsonrpc": "2.0", "id": id, "result": {}}))
            .await;
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn connection_loss_fails_all_pending_requests() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        let (_, rx_a) = rpc.request("ping", None).await.unwrap();
        let (_, rx_b) = rpc.request("status.get", None).await.unwrap();
        let _ = peer.read_message().await;
        let _ = peer.read_message().await;

        drop(peer);

        assert!(matches!(
            rx_a.await.unwrap(),
            Err(CopilotError::ConnectionClosed)
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(CopilotError::ConnectionClosed)
        ));
        assert_eq!(rpc.pending_len().await, 0);

        // Subsequent sends fail immediately.
        assert!(matches!(
            rpc.request("ping", None).await,
            Err(CopilotError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_unblocks_reader_and_drains_pending() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        let (_, rx) = rpc.request("ping", None).await.unwrap();
        let _ = peer.read_message().await;

        rpc.close();
        assert!(matches!(
            rx.await.unwrap(),
            Err(CopilotError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unknown_response_ids_are_silently_dropped() {
        let (rpc, mut peer, _notifications) = connect(Arc::new(NullHandler), 8);

        peer.write_message(&json!({"jsonrpc": "2.0", "id": 999_999, "result": {}}))
            .await;

        // The connection still works afterwards.
        let (id, rx) = rpc.request("ping", None).await.unwrap();
        let _ = peer.read_message().await;
        peer.write_message(&json!({"jsonrpc": "2.0", "id": id, "result": {}}))
            .await;
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn server_request_is_answered_on_the_same_id() {
        let (_rpc, mut peer, _notifications) = connect(Arc::new(EchoHandler), 8);

        peer.write_message(&json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tool.call",
            "params": {"toolName": "echo"}
        }))
        .await;

        let reply = peer.read_message().await;
        assert_eq!(reply["id"], 42);
        assert_eq!(reply["result"]["echoedMethod"], "tool.call");
        assert_eq!(reply["result"]["echoedParams"]["toolName"], "echo");
    }

    #[tokio::test]
    async fn notifications_flow_to_the_consumer_and_overflow_drops() {
        let (_rpc, mut peer, mut notifications) = connect(Arc::new(NullHandler), 2);

        for index in 0..4 {
            peer.write_message(&json!({
                "jsonrpc": "2.0",
                "method": "session.event",
                "params": {"sessionId": "s-1", "index": index}
            }))
            .await;
        }

        // The reader processed all four; the queue held two. Give the
        // reader a moment to drain the pipe.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = notifications.recv().await.unwrap();
        assert_eq!(first.params.as_ref().unwrap()["index"], 0);
        let second = notifications.recv().await.unwrap();
        assert_eq!(second.params.as_ref().unwrap()["index"], 1);
        assert!(notifications.try_recv().is_err());
    }
}
