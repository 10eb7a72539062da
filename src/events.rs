//! The event reducer (C4): a pure function from `(event, registry state)` to
//! an updated registry state. Runs on the transport's reader task and must
//! never block or perform I/O — see spec §4.4 and §5 "Suspension points".

use std::time::Instant;

use serde_json::Value;

use crate::registry::{Registry, normalize_origin};

/// One parsed CDP event: `(method, params, session_id)`.
pub struct CdpEventMessage<'a> {
    pub method: &'a str,
    pub params: &'a Value,
    pub session_id: Option<&'a str>,
}

/// Applies one inbound event to the registry. Unknown events are ignored.
pub fn apply_event(registry: &mut Registry, event: &CdpEventMessage<'_>) {
    let now = Instant::now();
    match event.method {
        "Target.attachedToTarget" => apply_attached_to_target(registry, event.params, now),
        "Target.detachedFromTarget" => apply_detached_from_target(registry, event.params),
        "Target.targetCreated" => apply_target_created(registry, event.params),
        "Target.targetDestroyed" => apply_target_destroyed(registry, event.params),
        "Page.frameAttached" => {
            apply_frame_attached(registry, event.params, event.session_id, now);
        }
        "Page.frameNavigated" => {
            apply_frame_navigated(registry, event.params, event.session_id, now);
        }
        "Page.frameDetached" => apply_frame_detached(registry, event.params),
        "Page.frameStartedLoading" => {
            apply_frame_loading(registry, event.params, event.session_id, now, false);
        }
        "Page.frameStoppedLoading" => {
            apply_frame_loading(registry, event.params, event.session_id, now, true);
        }
        "Page.loadEventFired" => apply_load_event_fired(registry, event.session_id, now),
        "Network.requestWillBeSent" => {
            apply_request_will_be_sent(registry, event.params, event.session_id, now);
        }
        "Network.loadingFinished" | "Network.loadingFailed" => {
            apply_request_finished(registry, event.params, event.session_id, now);
        }
        _ => {}
    }
}

fn apply_attached_to_target(registry: &mut Registry, params: &Value, now: Instant) {
    let Some(target_info) = params.get("targetInfo") else {
        return;
    };
    let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else {
        return;
    };
    let target_id = target_info
        .get("targetId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let target_type = target_info
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let url = target_info
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let title = target_info
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let browser_context_id = target_info
        .get("browserContextId")
        .and_then(Value::as_str)
        .map(str::to_string);

    registry.add_target(target_id, target_type, url, title, browser_context_id);
    if registry.add_session(session_id, target_id).is_err() {
        return;
    }

    // Bind any existing frames whose URL/origin matches the new target.
    let origin = normalize_origin(url);
    let matching_frames: Vec<String> = registry
        .all_frames()
        .filter(|f| !f.origin.is_empty() && (f.origin == origin || f.url == url))
        .map(|f| f.frame_id.clone())
        .collect();
    for frame_id in matching_frames {
        registry.update_frame_target_mapping(&frame_id, target_id, session_id);
    }
    let _ = now;
}

fn apply_detached_from_target(registry: &mut Registry, params: &Value) {
    if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
        registry.mark_session_disconnected(session_id);
    }
}

fn apply_target_created(registry: &mut Registry, params: &Value) {
    let Some(target_info) = params.get("targetInfo") else {
        return;
    };
    let Some(target_id) = target_info.get("targetId").and_then(Value::as_str) else {
        return;
    };
    let target_type = target_info
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let url = target_info
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let title = target_info
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let browser_context_id = target_info
        .get("browserContextId")
        .and_then(Value::as_str)
        .map(str::to_string);
    registry.add_target(target_id, target_type, url, title, browser_context_id);
}

fn apply_target_destroyed(registry: &mut Registry, params: &Value) {
    if let Some(target_id) = params.get("targetId").and_then(Value::as_str) {
        registry.remove_target(target_id);
    }
}

fn apply_frame_attached(
    registry: &mut Registry,
    params: &Value,
    session_id: Option<&str>,
    now: Instant,
) {
    let Some(frame_id) = params.get("frameId").and_then(Value::as_str) else {
        return;
    };
    let parent_id = params
        .get("parentFrameId")
        .and_then(Value::as_str)
        .map(str::to_string);
    registry.add_frame(frame_id, parent_id, String::new(), None, None);
    if let Some(session_id) = session_id
        .or_else(|| registry.active_session_id())
        .map(str::to_string)
    {
        registry.load_state_mut(&session_id).mark_loading(frame_id, now);
    }
}

fn apply_frame_navigated(registry: &mut Registry, params: &Value, session_id: Option<&str>, now: Instant) {
    let Some(frame) = params.get("frame") else {
        return;
    };
    let Some(frame_id) = frame.get("id").and_then(Value::as_str) else {
        return;
    };
    let url = frame
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let new_origin = normalize_origin(&url);
    let parent_id = frame
        .get("parentId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let parent_origin = parent_id
        .as_deref()
        .and_then(|pid| registry.get_frame(pid))
        .map(|f| f.origin.clone());

    let existing_session = registry.get_frame(frame_id).and_then(|f| f.session_id.clone());
    let existing_target = registry.get_frame(frame_id).and_then(|f| f.target_id.clone());

    registry.add_frame(
        frame_id,
        parent_id,
        url.clone(),
        existing_target,
        existing_session,
    );
    if let Some(f) = registry.get_frame_mut(frame_id) {
        f.url = url;
        f.origin = new_origin.clone();
    }

    if let Some(session_id) = session_id
        .or_else(|| registry.active_session_id())
        .map(str::to_string)
    {
        registry.load_state_mut(&session_id).mark_loading(frame_id, now);
    }

    // Cross-origin migration: if this frame's new origin differs from its
    // parent's and matches a known target's origin, re-bind to that target.
    let differs_from_parent = parent_origin.as_deref() != Some(new_origin.as_str());
    if !new_origin.is_empty() && differs_from_parent {
        if let Some(target) = registry.find_target_by_origin(&new_origin) {
            let target_id = target.target_id.clone();
            if let Some(session_id) = registry.get_session_for_target(&target_id).map(str::to_string) {
                registry.update_frame_target_mapping(frame_id, target_id, session_id);
            }
        }
    }
}

fn apply_frame_detached(registry: &mut Registry, params: &Value) {
    if let Some(frame_id) = params.get("frameId").and_then(Value::as_str) {
        registry.remove_frame(frame_id);
    }
}

fn apply_frame_loading(
    registry: &mut Registry,
    params: &Value,
    session_id: Option<&str>,
    now: Instant,
    loaded: bool,
) {
    let Some(frame_id) = params.get("frameId").and_then(Value::as_str) else {
        return;
    };
    if let Some(session_id) = session_id
        .or_else(|| registry.active_session_id())
        .map(str::to_string)
    {
        let ls = registry.load_state_mut(&session_id);
        if loaded {
            ls.mark_loaded(frame_id, now);
        } else {
            ls.mark_loading(frame_id, now);
        }
    }
}

fn apply_load_event_fired(registry: &mut Registry, session_id: Option<&str>, now: Instant) {
    let Some(session_id) = session_id else {
        return;
    };
    let main_frame = registry.load_state(session_id).and_then(|ls| ls.main_frame_id.clone());
    if let Some(frame_id) = main_frame {
        registry.load_state_mut(session_id).mark_loaded(&frame_id, now);
    }
}

fn apply_request_will_be_sent(
    registry: &mut Registry,
    params: &Value,
    session_id: Option<&str>,
    now: Instant,
) {
    let Some(session_id) = session_id.or_else(|| registry.active_session_id()) else {
        return;
    };
    let session_id = session_id.to_string();
    if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
        let ls = registry.load_state_mut(&session_id);
        ls.in_flight_requests.insert(request_id.to_string());
        ls.last_activity = Some(now);
    }
}

fn apply_request_finished(
    registry: &mut Registry,
    params: &Value,
    session_id: Option<&str>,
    now: Instant,
) {
    let Some(session_id) = session_id.or_else(|| registry.active_session_id()) else {
        return;
    };
    let session_id = session_id.to_string();
    if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
        let ls = registry.load_state_mut(&session_id);
        ls.in_flight_requests.remove(request_id);
        ls.last_activity = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with_active_session() -> Registry {
        let mut reg = Registry::new();
        reg.add_target("T1", "page", "https://a.example/", "A", None);
        reg.add_session("S1", "T1").unwrap();
        reg.set_active_session("S1").unwrap();
        reg
    }

    #[test]
    fn unknown_event_is_ignored() {
        let mut reg = registry_with_active_session();
        let params = json!({});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Totally.unknown",
                params: &params,
                session_id: Some("S1"),
            },
        );
        assert!(reg.get_target("T1").is_some());
    }

    #[test]
    fn target_destroyed_cascades() {
        let mut reg = registry_with_active_session();
        let params = json!({"targetId": "T1"});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Target.targetDestroyed",
                params: &params,
                session_id: None,
            },
        );
        assert!(reg.get_target("T1").is_none());
        assert!(reg.get_session("S1").is_none());
    }

    #[test]
    fn detached_from_target_marks_disconnected() {
        let mut reg = registry_with_active_session();
        let params = json!({"sessionId": "S1"});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Target.detachedFromTarget",
                params: &params,
                session_id: None,
            },
        );
        assert_eq!(
            reg.get_session("S1").unwrap().status,
            crate::registry::SessionStatus::Disconnected
        );
    }

    #[test]
    fn cross_origin_iframe_binds_to_new_session() {
        let mut reg = registry_with_active_session();
        // Parent frame at a.example
        reg.add_frame("F1", None, "https://a.example/", Some("T1".into()), Some("S1".into()));

        // Child frame navigates to b.example (still addressed by S1 initially)
        let nav_params = json!({"frame": {"id": "F2", "parentId": "F1", "url": "https://b.example/x"}});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Page.frameNavigated",
                params: &nav_params,
                session_id: Some("S1"),
            },
        );
        assert_eq!(reg.get_frame("F2").unwrap().session_id.as_deref(), Some("S1"));

        // A new target for b.example attaches with session S2.
        let attach_params = json!({
            "sessionId": "S2",
            "targetInfo": {"targetId": "T2", "type": "iframe", "url": "https://b.example/x", "title": ""}
        });
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Target.attachedToTarget",
                params: &attach_params,
                session_id: None,
            },
        );

        assert_eq!(reg.get_session_from_frame("F2"), Some("S2"));
        assert_eq!(reg.get_frame("F2").unwrap().target_id.as_deref(), Some("T2"));
    }

    #[test]
    fn empty_origin_frame_does_not_rebind() {
        let mut reg = registry_with_active_session();
        let nav_params = json!({"frame": {"id": "F1", "url": "about:blank"}});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Page.frameNavigated",
                params: &nav_params,
                session_id: Some("S1"),
            },
        );
        assert_eq!(reg.get_frame("F1").unwrap().origin, "");
        assert_eq!(reg.get_frame("F1").unwrap().target_id, None);
    }

    #[test]
    fn request_lifecycle_updates_in_flight_set() {
        let mut reg = registry_with_active_session();
        let start = json!({"requestId": "req1"});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Network.requestWillBeSent",
                params: &start,
                session_id: Some("S1"),
            },
        );
        assert!(reg.load_state("S1").unwrap().in_flight_requests.contains("req1"));

        let finished = json!({"requestId": "req1"});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Network.loadingFinished",
                params: &finished,
                session_id: Some("S1"),
            },
        );
        assert!(!reg.load_state("S1").unwrap().in_flight_requests.contains("req1"));
    }

    #[test]
    fn frame_started_and_stopped_loading_flip_flag() {
        let mut reg = registry_with_active_session();
        let params = json!({"frameId": "F1"});
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Page.frameStartedLoading",
                params: &params,
                session_id: Some("S1"),
            },
        );
        assert_eq!(reg.load_state("S1").unwrap().frame_loaded.get("F1").unwrap().0, false);
        apply_event(
            &mut reg,
            &CdpEventMessage {
                method: "Page.frameStoppedLoading",
                params: &params,
                session_id: Some("S1"),
            },
        );
        assert_eq!(reg.load_state("S1").unwrap().frame_loaded.get("F1").unwrap().0, true);
    }
}
