//! The serializer (C9): renders the ranked [`EnhancedNode`] list fusion
//! produces into the LLM-facing text view and the [`SelectorMap`] that
//! resolves a 1-based index back to a concrete element for the action
//! dispatcher (C8).

use std::collections::HashMap;

use crate::fusion::{ActionKind, Bounds, EnhancedNode};

const MAX_TEXT_LEN: usize = 80;

/// Attributes worth surfacing to the model; everything else on an element
/// is noise (spec §4.9).
const ATTRIBUTE_ALLOWLIST: &[&str] = &[
    "id",
    "name",
    "class",
    "type",
    "role",
    "aria-label",
    "title",
    "placeholder",
];

/// Sensible default when no config overrides it; large enough that most
/// pages render in full, small enough to bound the worst case.
pub const DEFAULT_MAX_LINES: usize = 500;

/// Everything the action dispatcher needs to act on index `n`: which
/// session/frame it belongs to, where to click, and what kind of action
/// applies. Keyed by the ephemeral 1-based index assigned at serialization
/// time — stable only within one observation, never across navigations
/// (spec §9 open question: indices are not stable identifiers).
#[derive(Debug, Clone)]
pub struct SelectorEntry {
    pub backend_node_id: i64,
    pub frame_id: String,
    pub tag_name: String,
    pub action_kind: ActionKind,
    pub click_point: (f64, f64),
    pub bounds: Bounds,
}

/// A map from the 1-based indices shown in the observed-page text to the
/// elements they refer to. Produced fresh on every observation.
#[derive(Debug, Clone, Default)]
pub struct SelectorMap {
    entries: HashMap<usize, SelectorEntry>,
}

impl SelectorMap {
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SelectorEntry> {
        self.entries.get(&index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &SelectorEntry)> {
        self.entries.iter()
    }

    /// Test-only constructor for exercising the action dispatcher against a
    /// hand-built map without running the full fusion/serialize pipeline.
    #[cfg(test)]
    #[must_use]
    pub fn from_entries(entries: HashMap<usize, SelectorEntry>) -> Self {
        Self { entries }
    }
}

/// The rendered observation: LLM-facing text plus the map that resolves
/// its indices.
#[derive(Debug, Clone)]
pub struct SerializedPage {
    pub text: String,
    pub selector_map: SelectorMap,
}

/// Render a ranked, already-filtered node list (the output of
/// [`crate::fusion::fuse`]) into text plus its selector map. Assigns
/// 1-based indices in the list's existing order — fusion owns ranking,
/// this just numbers it. Every node still gets an entry in the selector
/// map even if its line was dropped by the `max_lines` cutoff, so actions
/// on indices below the cutoff keep working; only the text view is capped.
#[must_use]
pub fn serialize(nodes: &[EnhancedNode], url: &str, title: &str, max_lines: usize) -> SerializedPage {
    let mut entries = HashMap::with_capacity(nodes.len());
    let mut lines = Vec::with_capacity(nodes.len().min(max_lines) + 2);
    lines.push(format!("URL: {url}"));
    lines.push(format!("Title: {title}"));

    let mut rendered = 0usize;
    for (i, node) in nodes.iter().enumerate() {
        let index = i + 1;
        if rendered < max_lines {
            lines.push(render_line(index, node));
            rendered += 1;
        }
        entries.insert(
            index,
            SelectorEntry {
                backend_node_id: node.backend_node_id,
                frame_id: node.frame_id.clone(),
                tag_name: node.tag_name.clone(),
                action_kind: node.action_kind,
                click_point: node.click_point,
                bounds: node.bounds_css,
            },
        );
    }

    if nodes.len() > max_lines {
        lines.push(format!(
            "… truncated {} additional elements",
            nodes.len() - max_lines
        ));
    }

    SerializedPage {
        text: lines.join("\n"),
        selector_map: SelectorMap { entries },
    }
}

fn render_line(index: usize, node: &EnhancedNode) -> String {
    let attrs = render_attributes(node);
    let mut line = format!("[{index}] <{}{attrs}>", node.tag_name);
    line.push_str(&format!(" | action={}", node.action_kind.as_str()));
    line.push_str(&format!(" | conf={:.2}", node.confidence.clamp(0.0, 1.0)));
    if let Some(name) = non_empty(node.ax_name.as_deref().unwrap_or_default()) {
        line.push_str(&format!(" | name=\"{}\"", truncate(name)));
    }
    if let Some(text) = non_empty(&node.text) {
        line.push_str(&format!(" | text=\"{}\"", truncate(text)));
    }
    if node.focusable {
        line.push_str(" | focusable?");
    }
    if !node.clickable {
        line.push_str(" | not-clickable?");
    }
    line
}

/// Render the allowlisted attributes present on `node`, in allowlist
/// order, as `key="value"` pairs with a leading space.
fn render_attributes(node: &EnhancedNode) -> String {
    let mut out = String::new();
    for key in ATTRIBUTE_ALLOWLIST {
        if let Some(value) = node.attributes.get(*key) {
            out.push_str(&format!(" {key}=\"{}\"", truncate(value)));
        }
    }
    out
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_TEXT_LEN {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_TEXT_LEN.saturating_sub(1)).collect();
    out.push('\u{2026}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn sample_node(id: i64, tag: &str, text: &str) -> EnhancedNode {
        EnhancedNode {
            backend_node_id: id,
            frame_id: "F1".to_string(),
            tag_name: tag.to_string(),
            attributes: StdHashMap::new(),
            text: text.to_string(),
            ax_role: None,
            ax_name: None,
            bounds_css: Bounds { x: 0.0, y: 0.0, w: 50.0, h: 20.0 },
            click_point: (25.0, 10.0),
            styles: crate::fusion::ComputedStyles::default(),
            paint_order: 1,
            visible: true,
            interactive: true,
            clickable: true,
            focusable: true,
            occluded: false,
            action_kind: ActionKind::Click,
            confidence: 0.9,
        }
    }

    #[test]
    fn assigns_sequential_one_based_indices() {
        let nodes = vec![
            sample_node(1, "button", "Submit"),
            sample_node(2, "a", "Home"),
        ];
        let page = serialize(&nodes, "https://a.example/", "Example", DEFAULT_MAX_LINES);
        assert!(page.text.contains("[1] <button>"));
        assert!(page.text.contains("[2] <a>"));
        assert_eq!(page.selector_map.len(), 2);
        assert_eq!(page.selector_map.get(1).unwrap().backend_node_id, 1);
        assert_eq!(page.selector_map.get(2).unwrap().backend_node_id, 2);
    }

    #[test]
    fn missing_index_resolves_to_none() {
        let nodes = vec![sample_node(1, "button", "Submit")];
        let page = serialize(&nodes, "https://a.example/", "Example", DEFAULT_MAX_LINES);
        assert!(page.selector_map.get(2).is_none());
    }

    #[test]
    fn truncates_long_text() {
        let long = "x".repeat(200);
        let nodes = vec![sample_node(1, "div", &long)];
        let page = serialize(&nodes, "https://a.example/", "Example", DEFAULT_MAX_LINES);
        let line = page.text.lines().last().unwrap();
        assert!(line.contains('\u{2026}'));
        assert!(line.len() < 300);
    }

    #[test]
    fn shows_both_ax_name_and_text_as_separate_fields() {
        let mut node = sample_node(1, "button", "fallback text");
        node.ax_name = Some("Accessible Name".to_string());
        let page = serialize(&[node], "https://a.example/", "Example", DEFAULT_MAX_LINES);
        assert!(page.text.contains("name=\"Accessible Name\""));
        assert!(page.text.contains("text=\"fallback text\""));
    }

    #[test]
    fn renders_action_confidence_and_flags() {
        let mut node = sample_node(1, "button", "Submit");
        node.confidence = 0.876;
        node.focusable = false;
        node.clickable = false;
        let page = serialize(&[node], "https://a.example/", "Example", DEFAULT_MAX_LINES);
        let line = page.text.lines().last().unwrap();
        assert!(line.contains("action=click"));
        assert!(line.contains("conf=0.88"));
        assert!(!line.contains("focusable?"));
        assert!(line.contains("not-clickable?"));
    }

    #[test]
    fn renders_allowlisted_attributes_only() {
        let mut node = sample_node(1, "input", "");
        node.attributes.insert("id".to_string(), "email".to_string());
        node.attributes
            .insert("placeholder".to_string(), "you@example.com".to_string());
        node.attributes
            .insert("data-testid".to_string(), "should-not-appear".to_string());
        let page = serialize(&[node], "https://a.example/", "Example", DEFAULT_MAX_LINES);
        assert!(page.text.contains("id=\"email\""));
        assert!(page.text.contains("placeholder=\"you@example.com\""));
        assert!(!page.text.contains("data-testid"));
    }

    #[test]
    fn truncates_line_count_with_sentinel() {
        let nodes: Vec<EnhancedNode> = (1..=5)
            .map(|i| sample_node(i, "div", "x"))
            .collect();
        let page = serialize(&nodes, "https://a.example/", "Example", 2);
        assert_eq!(page.text.lines().filter(|l| l.starts_with('[')).count(), 2);
        assert!(page.text.contains("… truncated 3 additional elements"));
        // indices beyond the cutoff still resolve for actions.
        assert_eq!(page.selector_map.len(), 5);
        assert!(page.selector_map.get(5).is_some());
    }
}
