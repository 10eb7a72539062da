//! The load synchronizer (C5): decides when a page has settled enough to
//! observe or act on, by polling the per-session [`crate::registry::LoadState`]
//! the event reducer maintains and the document's own `readyState`. One of
//! the three suspension points in the whole crate (spec §5): the poll sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;

use crate::cdp::CdpClient;
use crate::registry::Registry;

/// Tuning for [`wait_for_load`]. Defaults follow spec §4.5: a 500ms
/// network-idle window, checked every 100ms, bounded overall at 15s.
#[derive(Debug, Clone)]
pub struct LoadSyncConfig {
    pub idle_threshold: Duration,
    pub poll_interval: Duration,
    pub overall_timeout: Duration,
}

impl Default for LoadSyncConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            overall_timeout: Duration::from_secs(15),
        }
    }
}

/// Ask the page itself whether `document.readyState` has reached
/// `"complete"`. A failed evaluate (detached frame, closed session) is not
/// a convergence error — it just means this poll didn't observe "complete".
async fn document_ready(client: &CdpClient, session_id: &str) -> bool {
    let result = client
        .send(
            "Runtime.evaluate",
            Some(json!({"expression": "document.readyState", "returnByValue": true})),
            Some(session_id.to_string()),
        )
        .await;
    match result {
        Ok(v) => v
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(serde_json::Value::as_str)
            == Some("complete"),
        Err(_) => false,
    }
}

/// Result of a wait: either the page converged (all known frames loaded
/// and the network idle for `idle_threshold`), or the overall timeout was
/// hit — in which case the caller gets enough detail to report it (spec §7:
/// a timeout error carries pending frame ids and the in-flight count).
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub converged: bool,
    pub elapsed: Duration,
    pub pending_frames: Vec<String>,
    pub in_flight_count: usize,
}

/// Idempotent per-session setup: `Page`/`Network` enabled and lifecycle
/// events on (spec §4.5 step 1). Best-effort — a failed enable just means
/// the gates that depend on it stay ungated this round, it's not fatal.
async fn ensure_load_sync_ready(client: &CdpClient, registry: &Arc<Mutex<Registry>>, session_id: &str) {
    let _ = client.ensure_domain_enabled(session_id, "Page").await;
    let _ = client.ensure_domain_enabled(session_id, "Network").await;

    let already_enabled = {
        let reg = registry.lock().await;
        reg.lifecycle_events_enabled(session_id)
    };
    if !already_enabled {
        let sent = client
            .send(
                "Page.setLifecycleEventsEnabled",
                Some(json!({"enabled": true})),
                Some(session_id.to_string()),
            )
            .await;
        if sent.is_ok() {
            let mut reg = registry.lock().await;
            reg.mark_lifecycle_events_enabled(session_id);
        }
    }
}

/// Reset the session's in-flight set and last-activity timestamp, and mark
/// every frame already known to belong to this session as loading (spec
/// §4.5 step 2) — so a stale "loaded" from a previous navigation doesn't
/// let this wait converge immediately.
async fn reset_load_state(registry: &Arc<Mutex<Registry>>, session_id: &str, now: Instant) {
    let mut reg = registry.lock().await;
    let frame_ids: Vec<String> = reg
        .all_frames()
        .filter(|f| f.session_id.as_deref() == Some(session_id))
        .map(|f| f.frame_id.clone())
        .collect();
    let state = reg.load_state_mut(session_id);
    state.in_flight_requests.clear();
    state.last_activity = None;
    for frame_id in frame_ids {
        state.mark_loading(&frame_id, now);
    }
}

/// Poll `session_id`'s load state until it settles or `config.overall_timeout`
/// elapses. Never errors: a timed-out wait is a normal, inspectable outcome,
/// not a raised failure — observation must never raise (spec §7).
///
/// Three gates must all hold before this returns converged: every known
/// frame reports loaded, the network has been idle for `idle_threshold`,
/// and `document.readyState === "complete"` has been observed at least once
/// (latched, so it's only polled until seen — spec §4.5/§8).
pub async fn wait_for_load(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    session_id: &str,
    config: &LoadSyncConfig,
) -> WaitOutcome {
    let start = Instant::now();
    ensure_load_sync_ready(client, registry, session_id).await;
    reset_load_state(registry, session_id, start).await;
    let mut ready_state_complete = false;
    loop {
        if !ready_state_complete {
            ready_state_complete = document_ready(client, session_id).await;
        }

        let snapshot = {
            let reg = registry.lock().await;
            reg.load_state(session_id).cloned()
        };
        let now = Instant::now();
        if ready_state_complete {
            if let Some(state) = &snapshot {
                if state.all_frames_loaded() && state.is_idle(config.idle_threshold, now) {
                    return WaitOutcome {
                        converged: true,
                        elapsed: start.elapsed(),
                        pending_frames: Vec::new(),
                        in_flight_count: 0,
                    };
                }
            }
        }

        if start.elapsed() >= config.overall_timeout {
            let (pending_frames, in_flight_count) = snapshot.map_or_else(
                || (Vec::new(), 0),
                |state| {
                    let pending = state
                        .frame_loaded
                        .iter()
                        .filter(|(_, (loaded, _))| !loaded)
                        .map(|(id, _)| id.clone())
                        .collect();
                    (pending, state.in_flight_requests.len())
                },
            );
            return WaitOutcome {
                converged: false,
                elapsed: start.elapsed(),
                pending_frames,
                in_flight_count,
            };
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::CdpConfig;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// A mock CDP server that answers every `Runtime.evaluate` with
    /// `document.readyState` fixed to `ready_state`, and everything else
    /// with an empty result.
    async fn mock_ready_state_server(ready_state: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(Message::Text(text))) = source.next().await {
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let id = cmd["id"].clone();
                    let method = cmd["method"].as_str().unwrap_or_default();
                    let result = if method == "Runtime.evaluate" {
                        serde_json::json!({"result": {"value": ready_state}})
                    } else {
                        serde_json::json!({})
                    };
                    let resp = serde_json::json!({"id": id, "result": result});
                    let _ = sink.send(Message::Text(resp.to_string().into())).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn converges_immediately_when_idle_with_no_frames() {
        let addr = mock_ready_state_server("complete").await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let registry = Arc::clone(client.registry());
        {
            let mut reg = registry.lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
        }
        let config = LoadSyncConfig {
            idle_threshold: Duration::from_millis(0),
            poll_interval: Duration::from_millis(10),
            overall_timeout: Duration::from_secs(1),
        };
        let outcome = wait_for_load(&client, &registry, "S1", &config).await;
        assert!(outcome.converged);
    }

    #[tokio::test]
    async fn times_out_with_pending_frame_reported() {
        let addr = mock_ready_state_server("complete").await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let registry = Arc::clone(client.registry());
        {
            let mut reg = registry.lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
            reg.load_state_mut("S1").mark_loading("F1", Instant::now());
        }
        let config = LoadSyncConfig {
            idle_threshold: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            overall_timeout: Duration::from_millis(30),
        };
        let outcome = wait_for_load(&client, &registry, "S1", &config).await;
        assert!(!outcome.converged);
        assert_eq!(outcome.pending_frames, vec!["F1".to_string()]);
    }

    #[tokio::test]
    async fn in_flight_requests_block_convergence_until_idle_window_passes() {
        let addr = mock_ready_state_server("complete").await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let registry = Arc::clone(client.registry());
        {
            let mut reg = registry.lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
        }
        let config = LoadSyncConfig {
            idle_threshold: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            overall_timeout: Duration::from_millis(300),
        };

        // A request arrives shortly after the wait starts and stays
        // in-flight past the first few polls; convergence must wait for it
        // to clear *and* the idle window to pass afterward.
        let registry_bg = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry_bg
                .lock()
                .await
                .load_state_mut("S1")
                .in_flight_requests
                .insert("req-1".to_string());
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry_bg
                .lock()
                .await
                .load_state_mut("S1")
                .in_flight_requests
                .remove("req-1");
        });

        let outcome = wait_for_load(&client, &registry, "S1", &config).await;
        assert!(outcome.converged);
    }

    #[tokio::test]
    async fn reset_clears_stale_in_flight_from_before_this_wait() {
        let addr = mock_ready_state_server("complete").await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let registry = Arc::clone(client.registry());
        {
            let mut reg = registry.lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
            // Stale in-flight request left over from a previous load.
            reg.load_state_mut("S1")
                .in_flight_requests
                .insert("stale-req".to_string());
        }
        let config = LoadSyncConfig {
            idle_threshold: Duration::from_millis(0),
            poll_interval: Duration::from_millis(5),
            overall_timeout: Duration::from_millis(200),
        };
        let outcome = wait_for_load(&client, &registry, "S1", &config).await;
        assert!(outcome.converged, "stale in-flight state must not block a fresh wait");
    }

    #[tokio::test]
    async fn ready_state_gate_blocks_convergence_until_complete() {
        let addr = mock_ready_state_server("loading").await;
        let client = CdpClient::connect(&format!("ws://{addr}"), CdpConfig::default())
            .await
            .unwrap();
        let registry = Arc::clone(client.registry());
        {
            let mut reg = registry.lock().await;
            reg.add_target("T1", "page", "https://a.example/", "A", None);
            reg.add_session("S1", "T1").unwrap();
        }
        let config = LoadSyncConfig {
            idle_threshold: Duration::from_millis(0),
            poll_interval: Duration::from_millis(5),
            overall_timeout: Duration::from_millis(50),
        };
        let outcome = wait_for_load(&client, &registry, "S1", &config).await;
        assert!(!outcome.converged);
    }
}
