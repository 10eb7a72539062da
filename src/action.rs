//! The action dispatcher (C8): turns the LLM-facing action surface (click,
//! type, scroll, navigate, ...) into CDP calls against the elements the
//! serializer (C9) indexed. Every action returns an [`ActionResult`]
//! instead of raising — user-visible actions never raise (spec §7).

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::cdp::{CdpClient, CdpError};
use crate::load_sync::{LoadSyncConfig, wait_for_load};
use crate::registry::Registry;
use crate::serializer::SelectorMap;

/// The outcome of a single dispatched action. `data` carries action-specific
/// payloads (e.g. a screenshot's base64 PNG) that don't fit a plain message.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub ok: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl ActionResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: None,
        }
    }

    fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: Some(data),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Resolve the session that owns `frame_id`, falling back to `fallback`
/// only when the frame exists but has no session of its own yet. Returns
/// `None` when the frame is gone entirely — a stale index from a page that
/// has since navigated away or dropped the frame (spec §6 scenario: a
/// removed frame must fail the action, not silently dispatch against the
/// default session).
async fn session_for_frame(
    registry: &Arc<Mutex<Registry>>,
    frame_id: &str,
    fallback: &str,
) -> Option<String> {
    let reg = registry.lock().await;
    reg.get_frame(frame_id)?;
    Some(
        reg.get_session_from_frame(frame_id)
            .map_or_else(|| fallback.to_string(), str::to_string),
    )
}

fn index_not_found(index: usize) -> ActionResult {
    ActionResult::fail(format!("no element at index {index}; the page may have changed since it was last observed"))
}

/// Click the element at `index`, scrolling it into view first.
pub async fn click(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    selector_map: &SelectorMap,
    default_session_id: &str,
    index: usize,
) -> ActionResult {
    let Some(entry) = selector_map.get(index) else {
        return index_not_found(index);
    };
    let Some(session_id) = session_for_frame(registry, &entry.frame_id, default_session_id).await
    else {
        return index_not_found(index);
    };

    if let Err(e) = scroll_into_view(client, &session_id, entry.backend_node_id).await {
        eprintln!("warning: scrollIntoViewIfNeeded failed for index {index}: {e}");
    }

    let (x, y) = entry.click_point;
    if let Err(e) = dispatch_click(client, &session_id, x, y).await {
        return ActionResult::fail(format!("click dispatch failed: {e}"));
    }

    ActionResult::ok(format!("clicked <{}> at index {index}", entry.tag_name))
}

async fn scroll_into_view(
    client: &CdpClient,
    session_id: &str,
    backend_node_id: i64,
) -> Result<Value, crate::cdp::CdpError> {
    client
        .send(
            "DOM.scrollIntoViewIfNeeded",
            Some(json!({"backendNodeId": backend_node_id})),
            Some(session_id.to_string()),
        )
        .await
}

async fn dispatch_click(
    client: &CdpClient,
    session_id: &str,
    x: f64,
    y: f64,
) -> Result<(), crate::cdp::CdpError> {
    client
        .send(
            "Input.dispatchMouseEvent",
            Some(json!({
                "type": "mousePressed",
                "x": x,
                "y": y,
                "button": "left",
                "clickCount": 1,
            })),
            Some(session_id.to_string()),
        )
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    client
        .send(
            "Input.dispatchMouseEvent",
            Some(json!({
                "type": "mouseReleased",
                "x": x,
                "y": y,
                "button": "left",
                "clickCount": 1,
            })),
            Some(session_id.to_string()),
        )
        .await?;
    Ok(())
}

const CLEAR_FUNCTION: &str = "function() { \
     if ('value' in this) { \
         this.value = ''; \
         this.dispatchEvent(new Event('input', {bubbles: true})); \
         this.dispatchEvent(new Event('change', {bubbles: true})); \
     } else { \
         this.textContent = ''; \
     } \
 }";

/// Focus the element at `index`, clear its existing value, and type `text`
/// into it. Clearing is best-effort: a resolve/call failure is reported as
/// a warning in the message but doesn't block the insert.
pub async fn type_text(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    selector_map: &SelectorMap,
    default_session_id: &str,
    index: usize,
    text: &str,
) -> ActionResult {
    let Some(entry) = selector_map.get(index) else {
        return index_not_found(index);
    };
    let Some(session_id) = session_for_frame(registry, &entry.frame_id, default_session_id).await
    else {
        return index_not_found(index);
    };

    if let Err(e) = client
        .send(
            "DOM.focus",
            Some(json!({"backendNodeId": entry.backend_node_id})),
            Some(session_id.clone()),
        )
        .await
    {
        eprintln!("warning: DOM.focus failed for index {index}: {e}");
    }

    let cleared = clear_value(client, &session_id, entry.backend_node_id).await;

    if let Err(e) = client
        .send(
            "Input.insertText",
            Some(json!({"text": text})),
            Some(session_id),
        )
        .await
    {
        return ActionResult::fail(format!("failed to type text: {e}"));
    }

    let chars = text.chars().count();
    if cleared {
        ActionResult::ok(format!("typed {chars} characters into index {index}"))
    } else {
        ActionResult::ok(format!(
            "typed {chars} characters into index {index} (existing value not cleared)"
        ))
    }
}

/// Best-effort clear of the element's current value before typing, so
/// repeated `type` calls don't append. Returns whether the clear succeeded.
async fn clear_value(client: &CdpClient, session_id: &str, backend_node_id: i64) -> bool {
    let Ok(resolved) = client
        .send(
            "DOM.resolveNode",
            Some(json!({"backendNodeId": backend_node_id})),
            Some(session_id.to_string()),
        )
        .await
    else {
        return false;
    };
    let Some(object_id) = resolved
        .get("object")
        .and_then(|o| o.get("objectId"))
        .and_then(Value::as_str)
    else {
        return false;
    };
    client
        .send(
            "Runtime.callFunctionOn",
            Some(json!({
                "objectId": object_id,
                "functionDeclaration": CLEAR_FUNCTION,
                "arguments": [],
            })),
            Some(session_id.to_string()),
        )
        .await
        .is_ok()
}

/// Toggle/select an option on a `<select>`/checkbox/radio element without
/// relying on synthetic clicks (spec §6 action surface: `select`).
pub async fn select(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    selector_map: &SelectorMap,
    default_session_id: &str,
    index: usize,
    value: &str,
) -> ActionResult {
    let Some(entry) = selector_map.get(index) else {
        return index_not_found(index);
    };
    let Some(session_id) = session_for_frame(registry, &entry.frame_id, default_session_id).await
    else {
        return index_not_found(index);
    };

    let resolved = match client
        .send(
            "DOM.resolveNode",
            Some(json!({"backendNodeId": entry.backend_node_id})),
            Some(session_id.clone()),
        )
        .await
    {
        Ok(v) => v,
        Err(e) => return ActionResult::fail(format!("failed to resolve element: {e}")),
    };
    let Some(object_id) = resolved
        .get("object")
        .and_then(|o| o.get("objectId"))
        .and_then(Value::as_str)
    else {
        return ActionResult::fail("resolved element had no objectId");
    };

    let function = "function(v) { \
         this.value = v; \
         this.dispatchEvent(new Event('input', {bubbles: true})); \
         this.dispatchEvent(new Event('change', {bubbles: true})); \
     }";
    let call = client
        .send(
            "Runtime.callFunctionOn",
            Some(json!({
                "objectId": object_id,
                "functionDeclaration": function,
                "arguments": [{"value": value}],
            })),
            Some(session_id),
        )
        .await;
    if let Err(e) = call {
        return ActionResult::fail(format!("failed to set value: {e}"));
    }

    ActionResult::ok(format!("set value {value:?} on index {index}"))
}

/// Scroll direction, as named on the action surface (spec §6: `direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(direction: &str) -> Result<Self, CdpError> {
        match direction {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(CdpError::argument(format!(
                "unknown scroll direction {other:?}"
            ))),
        }
    }

    /// CSS-pixel `(deltaX, deltaY)` for `amount` units in this direction.
    fn deltas(self, amount: f64) -> (f64, f64) {
        match self {
            Self::Up => (0.0, -amount),
            Self::Down => (0.0, amount),
            Self::Left => (-amount, 0.0),
            Self::Right => (amount, 0.0),
        }
    }
}

/// Scroll the page (or, when `index` is given, the element at that index)
/// `amount` CSS pixels toward `direction` (spec §6: `up`/`down`/`left`/`right`).
pub async fn scroll(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    selector_map: &SelectorMap,
    default_session_id: &str,
    index: Option<usize>,
    direction: &str,
    amount: f64,
) -> ActionResult {
    let direction = match ScrollDirection::parse(direction) {
        Ok(d) => d,
        Err(e) => return ActionResult::fail(e.to_string()),
    };
    let (dx, dy) = direction.deltas(amount);

    let (session_id, (x, y)) = if let Some(index) = index {
        let Some(entry) = selector_map.get(index) else {
            return index_not_found(index);
        };
        let Some(session_id) =
            session_for_frame(registry, &entry.frame_id, default_session_id).await
        else {
            return index_not_found(index);
        };
        (session_id, entry.click_point)
    } else {
        (default_session_id.to_string(), (0.0, 0.0))
    };

    let result = client
        .send(
            "Input.dispatchMouseEvent",
            Some(json!({
                "type": "mouseWheel",
                "x": x,
                "y": y,
                "deltaX": dx,
                "deltaY": dy,
            })),
            Some(session_id),
        )
        .await;

    match result {
        Ok(_) => ActionResult::ok(format!("scrolled by ({dx}, {dy})")),
        Err(e) => ActionResult::fail(format!("scroll failed: {e}")),
    }
}

/// Dispatch a single key press (spec §6: `press_key`).
pub async fn press_key(client: &CdpClient, session_id: &str, key: &str) -> ActionResult {
    let down = client
        .send(
            "Input.dispatchKeyEvent",
            Some(json!({"type": "keyDown", "key": key})),
            Some(session_id.to_string()),
        )
        .await;
    if let Err(e) = down {
        return ActionResult::fail(format!("key down failed: {e}"));
    }
    let up = client
        .send(
            "Input.dispatchKeyEvent",
            Some(json!({"type": "keyUp", "key": key})),
            Some(session_id.to_string()),
        )
        .await;
    if let Err(e) = up {
        return ActionResult::fail(format!("key up failed: {e}"));
    }
    ActionResult::ok(format!("pressed {key}"))
}

/// Navigate the frame owning `session_id` to `url`, then wait for the page
/// to settle (spec §6: `navigate` "waits for load by default").
pub async fn navigate(
    client: &CdpClient,
    registry: &Arc<Mutex<Registry>>,
    session_id: &str,
    load_sync: &LoadSyncConfig,
    url: &str,
) -> ActionResult {
    if let Err(e) = client
        .send(
            "Page.navigate",
            Some(json!({"url": url})),
            Some(session_id.to_string()),
        )
        .await
    {
        return ActionResult::fail(format!("navigate failed: {e}"));
    }

    let outcome = wait_for_load(client, registry, session_id, load_sync).await;
    if outcome.converged {
        ActionResult::ok(format!("navigated to {url}"))
    } else {
        ActionResult::ok(format!(
            "navigated to {url} (load did not settle within {:?}; {} frame(s) pending, {} request(s) in flight)",
            load_sync.overall_timeout, outcome.pending_frames.len(), outcome.in_flight_count
        ))
    }
}

pub async fn refresh(client: &CdpClient, session_id: &str) -> ActionResult {
    match client
        .send(
            "Page.reload",
            Some(json!({"ignoreCache": false})),
            Some(session_id.to_string()),
        )
        .await
    {
        Ok(_) => ActionResult::ok("reloading page"),
        Err(e) => ActionResult::fail(format!("reload failed: {e}")),
    }
}

async fn navigate_history(client: &CdpClient, session_id: &str, delta: i64) -> ActionResult {
    let history = match client
        .send("Page.getNavigationHistory", None, Some(session_id.to_string()))
        .await
    {
        Ok(v) => v,
        Err(e) => return ActionResult::fail(format!("failed to read history: {e}")),
    };
    let current_index = history.get("currentIndex").and_then(Value::as_i64).unwrap_or(0);
    let entries = history
        .get("entries")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let target_index = current_index + delta;
    let Ok(target_usize) = usize::try_from(target_index) else {
        return ActionResult::fail("no entry in that direction");
    };
    let Some(entry) = entries.get(target_usize) else {
        return ActionResult::fail("no entry in that direction");
    };
    let Some(entry_id) = entry.get("id").and_then(Value::as_i64) else {
        return ActionResult::fail("history entry missing id");
    };
    match client
        .send(
            "Page.navigateToHistoryEntry",
            Some(json!({"entryId": entry_id})),
            Some(session_id.to_string()),
        )
        .await
    {
        Ok(_) => ActionResult::ok("navigated history"),
        Err(e) => ActionResult::fail(format!("navigate history failed: {e}")),
    }
}

pub async fn go_back(client: &CdpClient, session_id: &str) -> ActionResult {
    navigate_history(client, session_id, -1).await
}

pub async fn go_forward(client: &CdpClient, session_id: &str) -> ActionResult {
    navigate_history(client, session_id, 1).await
}

/// Capture a PNG screenshot, returned as base64 in `data.screenshot_base64`.
/// `full_page` captures beyond the viewport (spec §6: `screenshot(full_page=false)`).
pub async fn screenshot(client: &CdpClient, session_id: &str, full_page: bool) -> ActionResult {
    match client
        .send(
            "Page.captureScreenshot",
            Some(json!({
                "format": "png",
                "captureBeyondViewport": full_page,
            })),
            Some(session_id.to_string()),
        )
        .await
    {
        Ok(v) => {
            let data = v.get("data").and_then(Value::as_str).unwrap_or_default();
            ActionResult::ok_with_data(
                "captured screenshot",
                json!({"screenshot_base64": data}),
            )
        }
        Err(e) => ActionResult::fail(format!("screenshot failed: {e}")),
    }
}

/// The agent's own signal that it considers the task finished. Dispatches
/// no CDP call; it terminates the action loop at the façade.
#[must_use]
pub fn done(summary: &str) -> ActionResult {
    ActionResult::ok_with_data("done", json!({"summary": summary}))
}
