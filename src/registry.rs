//! The in-memory graph of browser objects: targets, sessions, and frames.
//!
//! Pure data structure, no I/O. [`Registry`] is owned by the façade and
//! mutated exclusively by the event reducer ([`crate::events`]) and by the
//! transport's session-recovery path; everything else only reads it.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use url::Url;

/// Failures produced by registry operations: a caller violated a
/// referential-integrity precondition (unknown id, missing foreign key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError(pub String);

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "registry error: {}", self.0)
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for crate::cdp::CdpError {
    fn from(e: RegistryError) -> Self {
        crate::cdp::CdpError::argument(e.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Inactive,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub target_id: String,
    pub target_type: String,
    pub url: String,
    pub title: String,
    pub browser_context_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub target_id: String,
    pub status: SessionStatus,
    pub domains_enabled: HashSet<String>,
    pub lifecycle_events_enabled: bool,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: String,
    pub parent_frame_id: Option<String>,
    pub url: String,
    pub origin: String,
    pub target_id: Option<String>,
    pub session_id: Option<String>,
}

/// Per-session network/lifecycle load-tracking state (spec §3 "Per-session
/// load state"), kept alongside the registry since it shares its lifetime
/// and is mutated by the same reducer.
#[derive(Debug, Clone, Default)]
pub struct LoadState {
    pub in_flight_requests: HashSet<String>,
    pub last_activity: Option<Instant>,
    /// frame id -> (loaded, last update)
    pub frame_loaded: HashMap<String, (bool, Instant)>,
    pub lifecycle_events_enabled: bool,
    pub main_frame_id: Option<String>,
}

impl LoadState {
    #[must_use]
    pub fn is_idle(&self, idle_threshold: Duration, now: Instant) -> bool {
        self.in_flight_requests.is_empty()
            && self
                .last_activity
                .is_none_or(|t| now.duration_since(t) >= idle_threshold)
    }

    #[must_use]
    pub fn all_frames_loaded(&self) -> bool {
        self.frame_loaded.values().all(|(loaded, _)| *loaded)
    }

    pub fn mark_loading(&mut self, frame_id: &str, now: Instant) {
        self.frame_loaded.insert(frame_id.to_string(), (false, now));
    }

    pub fn mark_loaded(&mut self, frame_id: &str, now: Instant) {
        self.frame_loaded.insert(frame_id.to_string(), (true, now));
    }
}

/// The arena of targets/sessions/frames, keyed by stable string ids.
/// Edges between tables are id fields, not pointers: no cycle can exist in
/// the representation, only in the logical graph they describe.
#[derive(Debug, Default)]
pub struct Registry {
    targets: HashMap<String, Target>,
    sessions: HashMap<String, Session>,
    frames: HashMap<String, Frame>,
    children: HashMap<String, Vec<String>>,
    active_session_id: Option<String>,
    load_state: HashMap<String, LoadState>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- targets ---------------------------------------------------------

    pub fn add_target(
        &mut self,
        target_id: impl Into<String>,
        target_type: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        browser_context_id: Option<String>,
    ) -> &Target {
        let target_id = target_id.into();
        let target = Target {
            target_id: target_id.clone(),
            target_type: target_type.into(),
            url: url.into(),
            title: title.into(),
            browser_context_id,
            session_id: None,
        };
        self.targets.insert(target_id.clone(), target);
        &self.targets[&target_id]
    }

    #[must_use]
    pub fn get_target(&self, target_id: &str) -> Option<&Target> {
        self.targets.get(target_id)
    }

    #[must_use]
    pub fn find_target_by_url(&self, url: &str) -> Option<&Target> {
        self.targets
            .values()
            .find(|t| t.url == url || url.starts_with(&t.url) || t.url.starts_with(url))
    }

    #[must_use]
    pub fn find_target_by_origin(&self, origin: &str) -> Option<&Target> {
        self.targets
            .values()
            .find(|t| normalize_origin(&t.url) == origin)
    }

    /// Cascade: removes the target's session and every frame it owns.
    pub fn remove_target(&mut self, target_id: &str) {
        if self.targets.remove(target_id).is_none() {
            return;
        }
        let dead_sessions: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.target_id == target_id)
            .map(|s| s.session_id.clone())
            .collect();
        for sid in dead_sessions {
            self.sessions.remove(&sid);
            self.load_state.remove(&sid);
            if self.active_session_id.as_deref() == Some(sid.as_str()) {
                self.active_session_id = None;
            }
        }
        let dead_frames: Vec<String> = self
            .frames
            .values()
            .filter(|f| f.target_id.as_deref() == Some(target_id))
            .map(|f| f.frame_id.clone())
            .collect();
        for fid in dead_frames {
            self.remove_frame(&fid);
        }
    }

    // -- sessions ----------------------------------------------------------

    /// # Errors
    /// `Argument` if `target_id` names no live target.
    pub fn add_session(
        &mut self,
        session_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Result<&Session, RegistryError> {
        let session_id = session_id.into();
        let target_id = target_id.into();
        if !self.targets.contains_key(&target_id) {
            return Err(RegistryError(format!(
                "add_session: unknown target {target_id}"
            )));
        }
        let session = Session {
            session_id: session_id.clone(),
            target_id: target_id.clone(),
            status: SessionStatus::Active,
            domains_enabled: HashSet::new(),
            lifecycle_events_enabled: false,
            created_at: Instant::now(),
        };
        self.sessions.insert(session_id.clone(), session);
        self.load_state
            .insert(session_id.clone(), LoadState::default());
        if let Some(target) = self.targets.get_mut(&target_id) {
            target.session_id = Some(session_id.clone());
        }
        Ok(&self.sessions[&session_id])
    }

    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    #[must_use]
    pub fn get_session_for_target(&self, target_id: &str) -> Option<&str> {
        self.targets
            .get(target_id)
            .and_then(|t| t.session_id.as_deref())
    }

    #[must_use]
    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id
            .as_deref()
            .and_then(|sid| self.sessions.get(sid))
    }

    /// # Errors
    /// `Argument` if `session_id` is unknown.
    pub fn set_active_session(&mut self, session_id: &str) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(session_id) {
            return Err(RegistryError(format!(
                "set_active_session: unknown session {session_id}"
            )));
        }
        if let Some(prev) = self.active_session_id.clone() {
            if let Some(s) = self.sessions.get_mut(&prev) {
                s.status = SessionStatus::Inactive;
            }
        }
        self.active_session_id = Some(session_id.to_string());
        if let Some(s) = self.sessions.get_mut(session_id) {
            s.status = SessionStatus::Active;
        }
        Ok(())
    }

    pub fn mark_domain_enabled(&mut self, session_id: &str, domain: &str) {
        if let Some(s) = self.sessions.get_mut(session_id) {
            s.domains_enabled.insert(domain.to_string());
        }
    }

    #[must_use]
    pub fn is_domain_enabled(&self, session_id: &str, domain: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.domains_enabled.contains(domain))
    }

    pub fn mark_lifecycle_events_enabled(&mut self, session_id: &str) {
        if let Some(s) = self.sessions.get_mut(session_id) {
            s.lifecycle_events_enabled = true;
        }
    }

    #[must_use]
    pub fn lifecycle_events_enabled(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.lifecycle_events_enabled)
    }

    pub fn mark_session_disconnected(&mut self, session_id: &str) {
        if let Some(s) = self.sessions.get_mut(session_id) {
            s.status = SessionStatus::Disconnected;
        }
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = None;
        }
    }

    /// Removes every session in `Disconnected` status and cascades to the
    /// targets/frames that referenced it. Returns the count removed.
    pub fn cleanup_disconnected_sessions(&mut self) -> usize {
        let dead: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.status == SessionStatus::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        let count = dead.len();
        for sid in dead {
            let target_id = self.sessions.remove(&sid).map(|s| s.target_id);
            self.load_state.remove(&sid);
            if let Some(tid) = target_id {
                self.remove_target(&tid);
            }
        }
        count
    }

    // -- frames --------------------------------------------------------

    pub fn add_frame(
        &mut self,
        frame_id: impl Into<String>,
        parent_frame_id: Option<String>,
        url: impl Into<String>,
        target_id: Option<String>,
        session_id: Option<String>,
    ) -> &Frame {
        let frame_id = frame_id.into();
        let url = url.into();
        let origin = normalize_origin(&url);
        if let Some(parent) = &parent_frame_id {
            let entry = self.children.entry(parent.clone()).or_default();
            if !entry.contains(&frame_id) {
                entry.push(frame_id.clone());
            }
        }
        let frame = Frame {
            frame_id: frame_id.clone(),
            parent_frame_id,
            url,
            origin,
            target_id,
            session_id,
        };
        self.frames.insert(frame_id.clone(), frame);
        &self.frames[&frame_id]
    }

    #[must_use]
    pub fn get_frame(&self, frame_id: &str) -> Option<&Frame> {
        self.frames.get(frame_id)
    }

    #[must_use]
    pub fn get_frame_mut(&mut self, frame_id: &str) -> Option<&mut Frame> {
        self.frames.get_mut(frame_id)
    }

    #[must_use]
    pub fn frame_children(&self, frame_id: &str) -> &[String] {
        self.children.get(frame_id).map_or(&[], Vec::as_slice)
    }

    /// Removes `frame_id` and, depth-first, every descendant.
    pub fn remove_frame(&mut self, frame_id: &str) {
        let children = self.children.remove(frame_id).unwrap_or_default();
        for child in children {
            self.remove_frame(&child);
        }
        if let Some(frame) = self.frames.remove(frame_id) {
            if let Some(parent) = frame.parent_frame_id {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|f| f != frame_id);
                }
            }
        }
    }

    pub fn update_frame_target_mapping(
        &mut self,
        frame_id: &str,
        target_id: impl Into<String>,
        session_id: impl Into<String>,
    ) {
        if let Some(frame) = self.frames.get_mut(frame_id) {
            frame.target_id = Some(target_id.into());
            frame.session_id = Some(session_id.into());
        }
    }

    #[must_use]
    pub fn get_session_from_frame(&self, frame_id: &str) -> Option<&str> {
        self.frames
            .get(frame_id)
            .and_then(|f| f.session_id.as_deref())
    }

    // -- load state ------------------------------------------------------

    #[must_use]
    pub fn load_state(&self, session_id: &str) -> Option<&LoadState> {
        self.load_state.get(session_id)
    }

    pub fn load_state_mut(&mut self, session_id: &str) -> &mut LoadState {
        self.load_state.entry(session_id.to_string()).or_default()
    }

    pub fn all_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn all_frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }
}

/// Normalized `scheme://host[:port]`, or empty string if `url` doesn't
/// parse or has no host (e.g. `about:blank`, `data:`).
#[must_use]
pub fn normalize_origin(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => {
                if let Some(port) = parsed.port() {
                    format!("{}://{host}:{port}", parsed.scheme())
                } else {
                    format!("{}://{host}", parsed.scheme())
                }
            }
            None => String::new(),
        },
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_target(target_id: &str) -> Registry {
        let mut reg = Registry::new();
        reg.add_target(target_id, "page", "https://a.example/", "A", None);
        reg
    }

    #[test]
    fn add_session_fails_on_unknown_target() {
        let mut reg = Registry::new();
        let err = reg.add_session("S1", "missing-target").unwrap_err();
        assert!(err.0.contains("missing-target"));
    }

    #[test]
    fn set_active_session_demotes_previous() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        reg.add_target("T2", "page", "https://b.example/", "B", None);
        reg.add_session("S2", "T2").unwrap();

        reg.set_active_session("S1").unwrap();
        assert_eq!(reg.active_session_id(), Some("S1"));
        reg.set_active_session("S2").unwrap();
        assert_eq!(reg.get_session("S1").unwrap().status, SessionStatus::Inactive);
        assert_eq!(reg.get_session("S2").unwrap().status, SessionStatus::Active);
        assert_eq!(reg.active_session_id(), Some("S2"));
    }

    #[test]
    fn set_active_session_unknown_is_argument_error() {
        let mut reg = Registry::new();
        assert!(reg.set_active_session("nope").is_err());
    }

    #[test]
    fn domain_enablement_is_idempotent() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        assert!(!reg.is_domain_enabled("S1", "DOM"));
        reg.mark_domain_enabled("S1", "DOM");
        assert!(reg.is_domain_enabled("S1", "DOM"));
        reg.mark_domain_enabled("S1", "DOM");
        assert!(reg.is_domain_enabled("S1", "DOM"));
    }

    #[test]
    fn mark_session_disconnected_clears_active() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        reg.set_active_session("S1").unwrap();
        reg.mark_session_disconnected("S1");
        assert_eq!(reg.active_session_id(), None);
        assert_eq!(
            reg.get_session("S1").unwrap().status,
            SessionStatus::Disconnected
        );
    }

    #[test]
    fn remove_frame_cascades_depth_first() {
        let mut reg = Registry::new();
        reg.add_frame("root", None, "https://a.example/", None, None);
        reg.add_frame("child", Some("root".into()), "https://a.example/c", None, None);
        reg.add_frame(
            "grandchild",
            Some("child".into()),
            "https://a.example/g",
            None,
            None,
        );
        reg.remove_frame("root");
        assert!(reg.get_frame("root").is_none());
        assert!(reg.get_frame("child").is_none());
        assert!(reg.get_frame("grandchild").is_none());
    }

    #[test]
    fn remove_target_cascades_session_and_frames() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        reg.add_frame(
            "F1",
            None,
            "https://a.example/",
            Some("T1".into()),
            Some("S1".into()),
        );
        reg.remove_target("T1");
        assert!(reg.get_target("T1").is_none());
        assert!(reg.get_session("S1").is_none());
        assert!(reg.get_frame("F1").is_none());
    }

    #[test]
    fn cleanup_disconnected_sessions_counts_and_cascades() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        reg.mark_session_disconnected("S1");
        let n = reg.cleanup_disconnected_sessions();
        assert_eq!(n, 1);
        assert!(reg.get_target("T1").is_none());
    }

    #[test]
    fn find_target_by_url_prefix_match() {
        let reg = registry_with_target("T1");
        assert!(reg.find_target_by_url("https://a.example/").is_some());
        assert!(reg.find_target_by_url("https://a.example/page").is_some());
        assert!(reg.find_target_by_url("https://other.example/").is_none());
    }

    #[test]
    fn find_target_by_origin_normalizes() {
        let reg = registry_with_target("T1");
        assert!(reg.find_target_by_origin("https://a.example").is_some());
        assert!(reg.find_target_by_origin("https://b.example").is_none());
    }

    #[test]
    fn empty_origin_does_not_match_any_target() {
        let reg = registry_with_target("T1");
        assert_eq!(normalize_origin(""), "");
        assert!(reg.find_target_by_origin("").is_none());
    }

    #[test]
    fn update_frame_target_mapping_sets_both() {
        let mut reg = Registry::new();
        reg.add_frame("F1", None, "https://a.example/", None, None);
        reg.update_frame_target_mapping("F1", "T2", "S2");
        assert_eq!(reg.get_session_from_frame("F1"), Some("S2"));
        assert_eq!(reg.get_frame("F1").unwrap().target_id.as_deref(), Some("T2"));
    }

    #[test]
    fn load_state_idle_gate() {
        let mut reg = registry_with_target("T1");
        reg.add_session("S1", "T1").unwrap();
        let now = Instant::now();
        {
            let ls = reg.load_state_mut("S1");
            ls.in_flight_requests.insert("req1".into());
            ls.last_activity = Some(now);
        }
        assert!(!reg.load_state("S1").unwrap().is_idle(Duration::from_millis(500), now));
        reg.load_state_mut("S1").in_flight_requests.clear();
        assert!(reg.load_state("S1").unwrap().is_idle(Duration::from_millis(500), now));
    }
}
