//! The transport (C3): one WebSocket, a monotonic request-id counter, and a
//! pending-completion table. A background reader task owns the socket
//! exclusively; [`TransportHandle`] is the cheap, cloneable front the rest
//! of the crate talks to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::CdpError;
use super::types::{CdpCommand, MessageKind, RawCdpMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One inbound CDP event, forwarded verbatim to the event reducer.
/// `(method, params, session_id)` — see spec §4.3 "forward to the event
/// reducer".
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Command sent from a [`TransportHandle`] to the background task.
pub enum TransportCommand {
    SendCommand {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<Value, CdpError>>,
        deadline: Instant,
    },
    Shutdown,
}

struct PendingRequest {
    response_tx: oneshot::Sender<Result<Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle for communicating with the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one CDP command and await its reply. No retry, no session
    /// recovery — pure wire-level request/response. Higher layers
    /// ([`crate::cdp::client::CdpClient`]) add those.
    ///
    /// # Errors
    /// `Connection` if the transport task is gone or the write failed;
    /// `Timeout` if no reply arrives before `deadline`; `Protocol` if Chrome
    /// replied with a CDP error object.
    pub async fn send(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<String>,
        deadline_after: Duration,
    ) -> Result<Value, CdpError> {
        let (response_tx, response_rx) = oneshot::channel();
        let id = self.next_message_id();
        let method = method.into();
        let command = CdpCommand {
            id,
            method: method.clone(),
            params,
            session_id,
        };
        let deadline = Instant::now() + deadline_after;
        self.command_tx
            .send(TransportCommand::SendCommand {
                command,
                response_tx,
                deadline,
            })
            .await
            .map_err(|_| CdpError::connection("transport task is not running"))?;

        response_rx
            .await
            .unwrap_or_else(|_| Err(CdpError::connection("transport task dropped the reply")))
    }

    /// # Errors
    /// Propagates a send failure if the task has already exited.
    pub async fn shutdown(&self) -> Result<(), CdpError> {
        self.command_tx
            .send(TransportCommand::Shutdown)
            .await
            .map_err(|_| CdpError::connection("transport task is not running"))
    }
}

/// Establish the WebSocket and spawn the background reader/writer task.
/// Returns the handle plus the receiving end of the firehose of parsed
/// events — the caller (typically [`crate::cdp::client::CdpClient`])
/// applies each to the registry via [`crate::events::apply_event`].
///
/// # Errors
/// `Connection` if the socket cannot be established within `connect_timeout`.
pub async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    connect_timeout: Duration,
) -> Result<(TransportHandle, mpsc::Receiver<RawEvent>), CdpError> {
    let ws_stream = connect_ws(url, connect_timeout).await?;
    let connected = Arc::new(AtomicBool::new(true));
    let next_id = Arc::new(AtomicU64::new(1));
    let (command_tx, command_rx) = mpsc::channel(channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(channel_capacity);

    let handle = TransportHandle {
        command_tx,
        connected: Arc::clone(&connected),
        next_id,
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            connected,
            event_tx,
        };
        task.run().await;
    });

    Ok((handle, event_rx))
}

async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CdpError::connection(e.to_string())),
        Err(_) => Err(CdpError::timeout()),
    }
}

struct TransportTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    pending: HashMap<u64, PendingRequest>,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<RawEvent>,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            let next_deadline = self.earliest_deadline();
            let timeout_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(&text).await;
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.handle_disconnect();
                            return;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::SendCommand { command, response_tx, deadline }) => {
                            self.handle_send_command(command, response_tx, deadline).await;
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            self.drain_pending();
                            let _ = self.ws_stream.close(None).await;
                            self.connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }

                () = timeout_sleep => {
                    self.sweep_timeouts();
                }
            }
        }
    }

    async fn handle_text_message(&mut self, text: &str) {
        let Ok(raw) = serde_json::from_str::<RawCdpMessage>(text) else {
            return;
        };
        let Some(kind) = raw.classify() else {
            return;
        };

        match kind {
            MessageKind::Response(response) => {
                // A reply whose id is absent from the pending table is
                // silently discarded (spec §8 boundary behavior) — this
                // includes late replies for requests that already timed out.
                if let Some(pending) = self.pending.remove(&response.id) {
                    let result = match response.result {
                        Ok(value) => Ok(value),
                        Err(proto_err) => {
                            Err(CdpError::protocol(proto_err.code, proto_err.message))
                        }
                    };
                    let _ = pending.response_tx.send(result);
                }
            }
            MessageKind::Event(event) => {
                let raw_event = RawEvent {
                    method: event.method,
                    params: event.params,
                    session_id: event.session_id,
                };
                // Non-blocking: a full event channel drops the oldest
                // intent is never to stall the reader on slow consumers.
                let _ = self.event_tx.try_send(raw_event);
            }
        }
    }

    async fn handle_send_command(
        &mut self,
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<Value, CdpError>>,
        deadline: Instant,
    ) {
        let id = command.id;
        let method = command.method.clone();

        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(CdpError::argument(format!(
                    "failed to serialize command: {e}"
                ))));
                return;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(CdpError::connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }

        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                method,
                deadline,
            },
        );
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                let ctx = super::error::ErrorContext::new().with_method(pending.method);
                let _ = pending
                    .response_tx
                    .send(Err(CdpError::timeout().with_context(ctx)));
            }
        }
    }

    fn drain_pending(&mut self) {
        self.connected.store(false, Ordering::Relaxed);
        let pending = std::mem::take(&mut self.pending);
        for (_, req) in pending {
            let _ = req
                .response_tx
                .send(Err(CdpError::connection("connection closed")));
        }
    }

    fn handle_disconnect(&mut self) {
        self.drain_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_message_id_is_monotonic() {
        let handle = TransportHandle {
            command_tx: mpsc::channel(1).0,
            connected: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let a = handle.next_message_id();
        let b = handle.next_message_id();
        let c = handle.next_message_id();
        assert!(b > a);
        assert!(c > b);
    }

    #[tokio::test]
    async fn send_after_task_exit_is_connection_error() {
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let handle = TransportHandle {
            command_tx,
            connected: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let err = handle
            .send("DOM.getDocument", None, None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Connection { .. }));
    }
}
