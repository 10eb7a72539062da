//! The high-level façade (C10): launches or attaches to Chrome, bootstraps
//! the browser-level session, and exposes the LLM-facing action surface
//! (observe/click/type/scroll/navigate/...) on top of C1-C9.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::action::{self, ActionResult};
use crate::cdp::{CdpClient, CdpConfig, CdpError};
use crate::chrome::{
    self, Channel, ChromeProcess, LaunchConfig as ChromeLaunchConfig, find_available_port,
};
use crate::collector;
use crate::fusion::fuse;
use crate::load_sync::{LoadSyncConfig, wait_for_load};
use crate::registry::Registry;
use crate::serializer::{DEFAULT_MAX_LINES, SelectorMap, SerializedPage, serialize};

/// How to obtain a Chrome instance: launch a fresh process, or attach to
/// one already listening.
pub enum Endpoint {
    Launch {
        headless: bool,
        executable: Option<PathBuf>,
        user_data_dir: Option<PathBuf>,
        extra_args: Vec<String>,
    },
    Attach { ws_url: String },
}

/// Top-level configuration for [`Browser::start`].
pub struct BrowserConfig {
    pub target: Endpoint,
    pub launch_timeout: Duration,
    pub teardown_grace: Duration,
    pub cdp: CdpConfig,
    pub load_sync: LoadSyncConfig,
    /// Maximum element lines rendered by [`Browser::observe`] before the
    /// text view is truncated with a sentinel (spec §4.9).
    pub max_lines: usize,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            target: Endpoint::Launch {
                headless: true,
                executable: None,
                user_data_dir: None,
                extra_args: Vec::new(),
            },
            launch_timeout: Duration::from_secs(20),
            teardown_grace: Duration::from_secs(5),
            cdp: CdpConfig::default(),
            load_sync: LoadSyncConfig::default(),
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

/// The browser automation façade: one Chrome instance, one attached page
/// session, driven over a single CDP WebSocket.
pub struct Browser {
    client: CdpClient,
    chrome_process: Option<ChromeProcess>,
    session_id: String,
    main_frame_id: String,
    load_sync: LoadSyncConfig,
    teardown_grace: Duration,
    max_lines: usize,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("session_id", &self.session_id)
            .field("main_frame_id", &self.main_frame_id)
            .finish()
    }
}

impl Browser {
    /// Launch or attach to Chrome per `config.target`, then bootstrap a
    /// page session: attach, enable the domains fusion/actions depend on,
    /// and promote the session active (spec §9 lifecycle).
    ///
    /// # Errors
    /// Whatever launching Chrome or the CDP bootstrap sequence fails with.
    pub async fn start(config: BrowserConfig) -> Result<Self, crate::error::AppError> {
        let (chrome_process, ws_url) = match config.target {
            Endpoint::Attach { ws_url } => (None, ws_url),
            Endpoint::Launch {
                headless,
                executable,
                user_data_dir,
                extra_args,
            } => {
                let executable = match executable {
                    Some(p) => p,
                    None => chrome::find_chrome_executable(Channel::Stable)?,
                };
                let port = find_available_port()?;
                let process = chrome::launch_chrome(
                    ChromeLaunchConfig {
                        executable,
                        port,
                        headless,
                        extra_args,
                        user_data_dir,
                    },
                    config.launch_timeout,
                )
                .await?;
                let version = chrome::query_version("127.0.0.1", port).await?;
                (Some(process), version.ws_debugger_url)
            }
        };

        let client = CdpClient::connect(&ws_url, config.cdp)
            .await
            .map_err(crate::error::AppError::from)?;
        let (session_id, main_frame_id) = bootstrap(&client).await.map_err(crate::error::AppError::from)?;

        Ok(Self {
            client,
            chrome_process,
            session_id,
            main_frame_id,
            load_sync: config.load_sync,
            teardown_grace: config.teardown_grace,
            max_lines: config.max_lines,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Mutex<Registry>> {
        self.client.registry()
    }

    /// Wait for the page to settle, collect the DOM/layout/AX snapshots,
    /// fuse them, and render the LLM-facing text plus its selector map.
    ///
    /// # Errors
    /// Only on a session-level failure (e.g. the session vanished);
    /// individual snapshot calls degrade via `warnings` instead.
    pub async fn observe(&self) -> Result<SerializedPage, CdpError> {
        wait_for_load(&self.client, self.client.registry(), &self.session_id, &self.load_sync).await;
        let raw = collector::collect(&self.client, &self.session_id).await?;
        let nodes = fuse(&raw, &self.main_frame_id);
        let (url, title) = self.current_url_and_title().await;
        Ok(serialize(&nodes, &url, &title, self.max_lines))
    }

    async fn current_url_and_title(&self) -> (String, String) {
        let reg = self.client.registry().lock().await;
        let target = reg
            .all_targets()
            .find(|t| t.session_id.as_deref() == Some(self.session_id.as_str()));
        target.map_or_else(
            || (String::new(), String::new()),
            |t| (t.url.clone(), t.title.clone()),
        )
    }

    pub async fn click(&self, selector_map: &SelectorMap, index: usize) -> ActionResult {
        action::click(&self.client, self.client.registry(), selector_map, &self.session_id, index)
            .await
    }

    pub async fn type_text(
        &self,
        selector_map: &SelectorMap,
        index: usize,
        text: &str,
    ) -> ActionResult {
        action::type_text(
            &self.client,
            self.client.registry(),
            selector_map,
            &self.session_id,
            index,
            text,
        )
        .await
    }

    pub async fn select(
        &self,
        selector_map: &SelectorMap,
        index: usize,
        value: &str,
    ) -> ActionResult {
        action::select(
            &self.client,
            self.client.registry(),
            selector_map,
            &self.session_id,
            index,
            value,
        )
        .await
    }

    pub async fn scroll(
        &self,
        selector_map: &SelectorMap,
        index: Option<usize>,
        direction: &str,
        amount: f64,
    ) -> ActionResult {
        action::scroll(
            &self.client,
            self.client.registry(),
            selector_map,
            &self.session_id,
            index,
            direction,
            amount,
        )
        .await
    }

    pub async fn press_key(&self, key: &str) -> ActionResult {
        action::press_key(&self.client, &self.session_id, key).await
    }

    /// Navigate to `url`, waiting for the page to settle before returning
    /// (spec §6: `navigate` "waits for load by default").
    pub async fn navigate(&self, url: &str) -> ActionResult {
        action::navigate(
            &self.client,
            self.client.registry(),
            &self.session_id,
            &self.load_sync,
            url,
        )
        .await
    }

    pub async fn go_back(&self) -> ActionResult {
        action::go_back(&self.client, &self.session_id).await
    }

    pub async fn go_forward(&self) -> ActionResult {
        action::go_forward(&self.client, &self.session_id).await
    }

    pub async fn refresh(&self) -> ActionResult {
        action::refresh(&self.client, &self.session_id).await
    }

    pub async fn screenshot(&self, full_page: bool) -> ActionResult {
        action::screenshot(&self.client, &self.session_id, full_page).await
    }

    #[must_use]
    pub fn done(summary: &str) -> ActionResult {
        action::done(summary)
    }

    /// Close the CDP connection and, if this façade launched its own
    /// Chrome process, terminate it (grace period then kill, spec §9).
    pub async fn close(mut self) {
        let _ = self.client.close().await;
        if let Some(mut process) = self.chrome_process.take() {
            process.terminate(self.teardown_grace).await;
        }
    }
}

/// Attach to the browser target, enable the domains every later component
/// relies on, and promote the new session active. Retry is bypassed
/// throughout (`send_raw`) since reordering here would corrupt setup
/// (spec §4.3).
async fn bootstrap(client: &CdpClient) -> Result<(String, String), CdpError> {
    client
        .send_raw(
            "Target.setDiscoverTargets",
            Some(json!({"discover": true})),
            None,
        )
        .await?;
    client
        .send_raw(
            "Target.setAutoAttach",
            Some(json!({
                "autoAttach": true,
                "flatten": true,
                "waitForDebuggerOnStart": false,
            })),
            None,
        )
        .await?;

    let targets = client.send_raw("Target.getTargets", None, None).await?;
    let target_info = targets
        .get("targetInfos")
        .and_then(Value::as_array)
        .and_then(|infos| {
            infos
                .iter()
                .find(|t| t.get("type").and_then(Value::as_str) == Some("page"))
        })
        .cloned()
        .ok_or_else(|| CdpError::target("no page target available"))?;
    let target_id = target_info
        .get("targetId")
        .and_then(Value::as_str)
        .ok_or_else(|| CdpError::protocol(0, "target info missing targetId"))?
        .to_string();
    let target_url = target_info
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let target_title = target_info
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let attach = client
        .send_raw(
            "Target.attachToTarget",
            Some(json!({"targetId": target_id, "flatten": true})),
            None,
        )
        .await?;
    let session_id = attach
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| CdpError::protocol(0, "attachToTarget response missing sessionId"))?
        .to_string();

    {
        let mut reg = client.registry().lock().await;
        reg.add_target(&target_id, "page", &target_url, &target_title, None);
        reg.add_session(&session_id, &target_id)?;
        reg.set_active_session(&session_id)?;
    }

    for domain in ["Page", "DOM", "Runtime", "Network", "DOMSnapshot", "Accessibility"] {
        client
            .send_raw(&format!("{domain}.enable"), None, Some(session_id.clone()))
            .await?;
        let mut reg = client.registry().lock().await;
        reg.mark_domain_enabled(&session_id, domain);
    }

    client
        .send_raw(
            "Page.setLifecycleEventsEnabled",
            Some(json!({"enabled": true})),
            Some(session_id.clone()),
        )
        .await?;
    {
        let mut reg = client.registry().lock().await;
        reg.mark_lifecycle_events_enabled(&session_id);
    }

    let frame_tree = client
        .send_raw("Page.getFrameTree", None, Some(session_id.clone()))
        .await?;
    let main_frame_id = frame_tree
        .get("frameTree")
        .and_then(|ft| ft.get("frame"))
        .and_then(|f| f.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    {
        let mut reg = client.registry().lock().await;
        reg.add_frame(&main_frame_id, None, &target_url, Some(target_id.clone()), Some(session_id.clone()));
        reg.load_state_mut(&session_id).main_frame_id = Some(main_frame_id.clone());
        reg.load_state_mut(&session_id).mark_loaded(&main_frame_id, std::time::Instant::now());
    }

    Ok((session_id, main_frame_id))
}
