//! The upper half of the transport (C3): retry, session recovery, and
//! idempotent domain enablement layered on top of [`super::transport`]'s raw
//! request/reply plumbing. Owns the [`Registry`] that the event reducer
//! mutates — see spec §4.3 "Session recovery" and §7.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};

use crate::events::{CdpEventMessage, apply_event};
use crate::registry::{Registry, SessionStatus};

use super::error::{CdpError, ErrorContext};
use super::transport::{TransportHandle, spawn_transport};

/// Configuration for a CDP client connection.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket connection.
    pub connect_timeout: Duration,
    /// Timeout for individual CDP commands.
    pub command_timeout: Duration,
    /// Capacity of the internal command/event channels.
    pub channel_capacity: usize,
    /// Maximum send attempts (first attempt + retries) before giving up.
    pub max_attempts: u32,
    /// Initial retry backoff.
    pub retry_base: Duration,
    /// Retry backoff cap.
    pub retry_cap: Duration,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(2),
        }
    }
}

/// A CDP client connected to Chrome over a single WebSocket, plus the
/// registry the background reader task keeps in sync.
///
/// `CdpClient` is the sole owner of both the [`TransportHandle`] and the
/// [`Registry`]; higher layers (load sync, collector, façade) borrow it.
pub struct CdpClient {
    handle: TransportHandle,
    registry: Arc<Mutex<Registry>>,
    config: CdpConfig,
    url: String,
    reader_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for CdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpClient").field("url", &self.url).finish()
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint and start the background
    /// reader that applies inbound events to the registry.
    ///
    /// # Errors
    /// `Connection` if the WebSocket handshake fails or times out.
    pub async fn connect(url: &str, config: CdpConfig) -> Result<Self, CdpError> {
        let (handle, mut event_rx) =
            spawn_transport(url, config.channel_capacity, config.connect_timeout).await?;

        let registry = Arc::new(Mutex::new(Registry::new()));
        let reducer_registry = Arc::clone(&registry);
        let reader_task = tokio::spawn(async move {
            while let Some(raw) = event_rx.recv().await {
                let mut reg = reducer_registry.lock().await;
                apply_event(
                    &mut reg,
                    &CdpEventMessage {
                        method: &raw.method,
                        params: &raw.params,
                        session_id: raw.session_id.as_deref(),
                    },
                );
            }
        });

        Ok(Self {
            handle,
            registry,
            config,
            url: url.to_owned(),
            reader_task,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Mutex<Registry>> {
        &self.registry
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw send: no retry, no session recovery. Used for the bootstrap
    /// sequence (spec §4.3: "retry is disabled for the initial bootstrap
    /// sequence ... where reordering would corrupt session setup") and as
    /// the inner primitive the retrying [`Self::send`] builds on.
    ///
    /// # Errors
    /// `Connection`, `Timeout`, or `Protocol` as classified by the transport.
    pub async fn send_raw(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<Value, CdpError> {
        self.handle
            .send(method, params, session_id, self.config.command_timeout)
            .await
            .map_err(|e| e.with_context(ErrorContext::new().with_method(method)))
    }

    /// Send with the full contract: resolves the active session when none
    /// is given, attempts session recovery if the resolved session is
    /// disconnected, and retries `Connection`/`Timeout` failures with
    /// exponential backoff.
    ///
    /// # Errors
    /// `Session` if session recovery fails or no session can be resolved
    /// where one is required; otherwise whatever [`Self::send_raw`] yields.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<Value, CdpError> {
        let resolved = self.resolve_session(session_id).await;
        if let Some(sid) = &resolved {
            self.ensure_session_live(sid).await?;
        }

        let mut backoff = self.config.retry_base;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_raw(method, params.clone(), resolved.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable() && attempt < self.config.max_attempts => {
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.retry_cap);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ensure `domain` is enabled on `session_id`; idempotent, sends
    /// `{domain}.enable` at most once per (session, domain) pair.
    ///
    /// # Errors
    /// Whatever [`Self::send`] yields for the enable call.
    pub async fn ensure_domain_enabled(
        &self,
        session_id: &str,
        domain: &str,
    ) -> Result<(), CdpError> {
        {
            let reg = self.registry.lock().await;
            if reg.is_domain_enabled(session_id, domain) {
                return Ok(());
            }
        }
        self.send(
            &format!("{domain}.enable"),
            None,
            Some(session_id.to_owned()),
        )
        .await?;
        let mut reg = self.registry.lock().await;
        reg.mark_domain_enabled(session_id, domain);
        Ok(())
    }

    async fn resolve_session(&self, session_id: Option<String>) -> Option<String> {
        if session_id.is_some() {
            return session_id;
        }
        let reg = self.registry.lock().await;
        reg.active_session_id().map(str::to_owned)
    }

    async fn ensure_session_live(&self, session_id: &str) -> Result<(), CdpError> {
        let status = {
            let reg = self.registry.lock().await;
            reg.get_session(session_id).map(|s| s.status)
        };
        match status {
            Some(SessionStatus::Disconnected) => self.recover_session(session_id).await,
            Some(_) => Ok(()),
            None => Err(CdpError::session(format!("unknown session {session_id}"))
                .with_context(ErrorContext::new().with_session(session_id))),
        }
    }

    /// Single recovery attempt per spec §4.3: confirm the owning target is
    /// still alive, re-attach, promote the new session to active, and
    /// replay everything that had been enabled on the dead session.
    async fn recover_session(&self, old_session_id: &str) -> Result<(), CdpError> {
        let (target_id, enabled_domains, lifecycle_enabled) = {
            let reg = self.registry.lock().await;
            let session = reg.get_session(old_session_id).ok_or_else(|| {
                CdpError::session(format!("session {old_session_id} vanished during recovery"))
            })?;
            (
                session.target_id.clone(),
                session.domains_enabled.clone(),
                session.lifecycle_events_enabled,
            )
        };

        let targets_result = self.send_raw("Target.getTargets", None, None).await?;
        let still_exists = targets_result
            .get("targetInfos")
            .and_then(Value::as_array)
            .is_some_and(|infos| {
                infos
                    .iter()
                    .any(|t| t.get("targetId").and_then(Value::as_str) == Some(target_id.as_str()))
            });
        if !still_exists {
            return Err(
                CdpError::target(format!("target {target_id} no longer exists"))
                    .with_context(ErrorContext::new().with_target(&target_id)),
            );
        }

        let attach_params = serde_json::json!({"targetId": target_id, "flatten": true});
        let attach_result = self
            .send_raw("Target.attachToTarget", Some(attach_params), None)
            .await?;
        let new_session_id = attach_result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CdpError::protocol(0, "Target.attachToTarget response missing sessionId")
            })?
            .to_owned();

        {
            let mut reg = self.registry.lock().await;
            reg.add_session(&new_session_id, &target_id)?;
            reg.set_active_session(&new_session_id)?;
        }

        for domain in &enabled_domains {
            self.send_raw(
                &format!("{domain}.enable"),
                None,
                Some(new_session_id.clone()),
            )
            .await?;
            let mut reg = self.registry.lock().await;
            reg.mark_domain_enabled(&new_session_id, domain);
        }

        if lifecycle_enabled {
            self.send_raw(
                "Page.setLifecycleEventsEnabled",
                Some(serde_json::json!({"enabled": true})),
                Some(new_session_id.clone()),
            )
            .await?;
            let mut reg = self.registry.lock().await;
            reg.mark_lifecycle_events_enabled(&new_session_id);
        }

        Ok(())
    }

    /// Close the WebSocket; every outstanding completion fails with
    /// `Connection` (spec §4.3).
    ///
    /// # Errors
    /// `Connection` if the transport task had already exited.
    pub async fn close(&self) -> Result<(), CdpError> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    async fn mock_server() -> (std::net::SocketAddr, mpsc::Receiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(Message::Text(text))) = source.next().await {
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let _ = tx.send(cmd.clone()).await;
                    let mut resp = serde_json::json!({"id": cmd["id"], "result": {}});
                    if cmd["method"] == "Target.attachToTarget" {
                        resp["result"] = serde_json::json!({"sessionId": "S-new"});
                    }
                    let _ = sink.send(Message::Text(resp.to_string().into())).await;
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn send_without_session_uses_active() {
        let (addr, mut rx) = mock_server().await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        {
            let mut reg = client.registry().lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
            reg.set_active_session("S1").unwrap();
        }
        client.send("DOM.getDocument", None, None).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["sessionId"], "S1");
    }

    #[tokio::test]
    async fn ensure_domain_enabled_is_idempotent() {
        let (addr, mut rx) = mock_server().await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        {
            let mut reg = client.registry().lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
        }
        client.ensure_domain_enabled("S1", "Page").await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first["method"], "Page.enable");

        client.ensure_domain_enabled("S1", "Page").await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err(), "re-enabling an enabled domain must send nothing");
    }

    #[tokio::test]
    async fn unknown_session_is_session_error() {
        let (addr, _rx) = mock_server().await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let err = client
            .send("DOM.getDocument", None, Some("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Session { .. }));
    }
}
