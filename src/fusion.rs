//! The DOM fusion pipeline (C7): merges the four parallel snapshots the
//! collector (C6) gathers into a deduplicated, occlusion-filtered, ranked
//! list of [`EnhancedNode`]s. Pure, non-suspending — see spec §4.7 and
//! §5 "All reducer work and all fusion work are non-suspending".

use std::collections::HashMap;

use serde_json::Value;

use crate::collector::RawDomSnapshot;

/// The canonical computed-style set requested from `DOMSnapshot` (spec §6),
/// in request order — the order `layout.styles[i]` entries are positional
/// against.
pub const COMPUTED_STYLE_NAMES: &[&str] = &[
    "display",
    "visibility",
    "opacity",
    "overflow",
    "overflow-x",
    "overflow-y",
    "cursor",
    "pointer-events",
    "position",
];

const INTERACTIVE_TAGS: &[&str] = &[
    "button", "a", "input", "select", "textarea", "details", "summary",
];
const INLINE_EVENT_ATTRS: &[&str] = &[
    "onclick",
    "onmousedown",
    "onmouseup",
    "onkeydown",
    "onkeyup",
];
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "combobox",
    "checkbox",
    "radio",
    "tab",
    "menuitem",
    "option",
    "switch",
    "searchbox",
    "listbox",
];
const CLICKABLE_INPUT_TYPES: &[&str] = &["button", "submit", "reset", "checkbox", "radio"];
const TEXT_INPUT_TYPES: &[&str] = &[
    "text", "search", "email", "tel", "url", "password", "number", "date", "datetime-local",
    "month", "week", "time",
];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Bounds {
    #[must_use]
    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    #[must_use]
    pub fn intersect_area(&self, other: &Bounds) -> f64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }

    #[must_use]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.intersect_area(other) > 0.0
    }

    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

/// The computed-style subset carried per spec §3 `EnhancedNode.computed_style`.
#[derive(Debug, Clone, Default)]
pub struct ComputedStyles {
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
    pub overflow: String,
    pub overflow_x: String,
    pub overflow_y: String,
    pub cursor: String,
    pub pointer_events: String,
    pub position: String,
}

impl ComputedStyles {
    fn from_values(names: &[&str], values: &[String]) -> Self {
        let mut map: HashMap<&str, &str> = HashMap::new();
        for (name, value) in names.iter().zip(values.iter()) {
            map.insert(name, value.as_str());
        }
        Self {
            display: map.get("display").copied().unwrap_or_default().to_string(),
            visibility: map
                .get("visibility")
                .copied()
                .unwrap_or_default()
                .to_string(),
            opacity: map
                .get("opacity")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1.0),
            overflow: map
                .get("overflow")
                .copied()
                .unwrap_or_default()
                .to_string(),
            overflow_x: map
                .get("overflow-x")
                .copied()
                .unwrap_or_default()
                .to_string(),
            overflow_y: map
                .get("overflow-y")
                .copied()
                .unwrap_or_default()
                .to_string(),
            cursor: map.get("cursor").copied().unwrap_or_default().to_string(),
            pointer_events: map
                .get("pointer-events")
                .copied()
                .unwrap_or_default()
                .to_string(),
            position: map
                .get("position")
                .copied()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    Input,
    Select,
    Toggle,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Input => "input",
            Self::Select => "select",
            Self::Toggle => "toggle",
        }
    }
}

/// A fused element derived from a single DOM snapshot (spec §3 `EnhancedNode`).
#[derive(Debug, Clone)]
pub struct EnhancedNode {
    pub backend_node_id: i64,
    pub frame_id: String,
    pub tag_name: String,
    pub attributes: HashMap<String, String>,
    pub text: String,
    pub ax_role: Option<String>,
    pub ax_name: Option<String>,
    pub bounds_css: Bounds,
    pub click_point: (f64, f64),
    pub styles: ComputedStyles,
    pub paint_order: i64,
    pub visible: bool,
    pub interactive: bool,
    pub clickable: bool,
    pub focusable: bool,
    pub occluded: bool,
    pub action_kind: ActionKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
struct SnapshotEntry {
    bounds_css: Bounds,
    node_type: i64,
    node_name: String,
    styles: ComputedStyles,
    paint_order: i64,
}

#[derive(Debug, Clone, Default)]
struct AxEntry {
    role: String,
    name: String,
    focusable: bool,
}

/// Device-pixel ratio and CSS viewport extracted from `Page.getLayoutMetrics`.
struct Viewport {
    dpr: f64,
    width: f64,
    height: f64,
}

fn parse_viewport(layout_metrics: &Value) -> Viewport {
    let css_visual = layout_metrics.get("cssVisualViewport");
    let visual = layout_metrics.get("visualViewport");
    let css_w = css_visual
        .and_then(|v| v.get("clientWidth"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let css_h = css_visual
        .and_then(|v| v.get("clientHeight"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let device_w = visual
        .and_then(|v| v.get("clientWidth"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let dpr = if css_w > 0.0 && device_w > 0.0 {
        device_w / css_w
    } else {
        1.0
    };
    Viewport {
        dpr,
        width: css_w,
        height: css_h,
    }
}

/// Parse `DOMSnapshot.captureSnapshot`'s `documents[]` into a lookup keyed
/// by backend-node id. Spec §9 open question: walks *all* documents, not
/// just `documents[0]`.
fn build_snapshot_index(snapshot: &Value, dpr: f64) -> HashMap<i64, SnapshotEntry> {
    let mut index = HashMap::new();
    let strings: Vec<String> = snapshot
        .get("strings")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();
    let resolve = |idx: i64| -> String {
        usize::try_from(idx)
            .ok()
            .and_then(|i| strings.get(i))
            .cloned()
            .unwrap_or_default()
    };

    let documents = snapshot
        .get("documents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for doc in &documents {
        let backend_ids: Vec<i64> = doc
            .get("nodes")
            .and_then(|n| n.get("backendNodeId"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        let node_types: Vec<i64> = doc
            .get("nodes")
            .and_then(|n| n.get("nodeType"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        let node_names: Vec<i64> = doc
            .get("nodes")
            .and_then(|n| n.get("nodeName"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        let layout = doc.get("layout");
        let layout_node_index: Vec<i64> = layout
            .and_then(|l| l.get("nodeIndex"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        let bounds_raw: Vec<Vec<f64>> = layout
            .and_then(|l| l.get("bounds"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|b| {
                        b.as_array()
                            .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let styles_raw: Vec<Vec<i64>> = layout
            .and_then(|l| l.get("styles"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|s| {
                        s.as_array()
                            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let paint_orders: Vec<i64> = layout
            .and_then(|l| l.get("paintOrders"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        for (layout_pos, &node_idx) in layout_node_index.iter().enumerate() {
            let Ok(node_idx) = usize::try_from(node_idx) else {
                continue;
            };
            let Some(&backend_id) = backend_ids.get(node_idx) else {
                continue;
            };
            let bounds = bounds_raw.get(layout_pos).map_or(Bounds::default(), |b| {
                if b.len() == 4 {
                    Bounds {
                        x: b[0] / dpr,
                        y: b[1] / dpr,
                        w: b[2] / dpr,
                        h: b[3] / dpr,
                    }
                } else {
                    Bounds::default()
                }
            });
            let style_values: Vec<String> = styles_raw
                .get(layout_pos)
                .map(|idxs| idxs.iter().map(|&i| resolve(i)).collect())
                .unwrap_or_default();
            let styles = ComputedStyles::from_values(COMPUTED_STYLE_NAMES, &style_values);
            let paint_order = paint_orders.get(layout_pos).copied().unwrap_or(0);
            let node_type = node_types.get(node_idx).copied().unwrap_or(0);
            let node_name = node_names
                .get(node_idx)
                .map(|&i| resolve(i).to_lowercase())
                .unwrap_or_default();

            index.insert(
                backend_id,
                SnapshotEntry {
                    bounds_css: bounds,
                    node_type,
                    node_name,
                    styles,
                    paint_order,
                },
            );
        }
    }
    index
}

/// Parse `Accessibility.getFullAXTree`'s flat node list into a lookup keyed
/// by backend DOM node id.
fn build_ax_index(ax_tree: &Value) -> HashMap<i64, AxEntry> {
    let mut index = HashMap::new();
    let nodes = ax_tree
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for node in &nodes {
        let Some(backend_id) = node.get("backendDOMNodeId").and_then(Value::as_i64) else {
            continue;
        };
        let role = node
            .get("role")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = node
            .get("name")
            .and_then(|n| n.get("value"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let focusable = node
            .get("properties")
            .and_then(Value::as_array)
            .is_some_and(|props| {
                props.iter().any(|p| {
                    p.get("name").and_then(Value::as_str) == Some("focusable")
                        && p.get("value")
                            .and_then(|v| v.get("value"))
                            .and_then(Value::as_bool)
                            == Some(true)
                })
            });
        index.insert(
            backend_id,
            AxEntry {
                role,
                name,
                focusable,
            },
        );
    }
    index
}

fn extract_attributes(node: &Value) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    if let Some(flat) = node.get("attributes").and_then(Value::as_array) {
        let mut it = flat.iter().filter_map(Value::as_str);
        while let (Some(name), Some(value)) = (it.next(), it.next()) {
            attrs.insert(name.to_string(), value.to_string());
        }
    }
    attrs
}

fn extract_text(node: &Value) -> String {
    let mut out = String::new();
    collect_text(node, &mut out, 0);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(node: &Value, out: &mut String, depth: u32) {
    if depth > 6 {
        return;
    }
    if node.get("nodeType").and_then(Value::as_i64) == Some(3) {
        if let Some(v) = node.get("nodeValue").and_then(Value::as_str) {
            out.push(' ');
            out.push_str(v);
        }
        return;
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_text(child, out, depth + 1);
        }
    }
}

/// Merge the four collected snapshots into a ranked, filtered list of
/// actionable elements (spec §4.7 end to end).
#[must_use]
pub fn fuse(raw: &RawDomSnapshot, main_frame_id: &str) -> Vec<EnhancedNode> {
    let viewport = parse_viewport(&raw.layout_metrics);
    let snapshot_index = build_snapshot_index(&raw.snapshot, viewport.dpr);
    let ax_index = build_ax_index(&raw.ax_tree);

    let mut nodes = Vec::new();
    let root = raw.document.get("root").cloned().unwrap_or(Value::Null);

    // Explicit-stack DFS (spec: recursion would blow the language stack on
    // deep pages). Owned work-list of (node, frame_id) pairs rather than
    // borrowed `&Value`s, since children are cloned out of their parent.
    let mut work: Vec<(Value, String)> = vec![(root.clone(), main_frame_id.to_string())];

    while let Some((node, frame_id)) = work.pop() {
        let node_type = node.get("nodeType").and_then(Value::as_i64).unwrap_or(0);
        let backend_id = node.get("backendNodeId").and_then(Value::as_i64);

        if node_type == 1 {
            if let Some(backend_id) = backend_id {
                let tag_name = node
                    .get("nodeName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase();
                let attributes = extract_attributes(&node);
                let text = extract_text(&node);
                let snap = snapshot_index.get(&backend_id).cloned().unwrap_or_default();
                let ax = ax_index.get(&backend_id).cloned();

                let enhanced = build_enhanced_node(
                    backend_id,
                    &frame_id,
                    &tag_name,
                    attributes,
                    text,
                    ax,
                    &snap,
                    &viewport,
                );
                nodes.push(enhanced);
            }
        }

        // Descend into children, carrying the same frame id.
        if let Some(children) = node.get("children").and_then(Value::as_array) {
            for child in children {
                work.push((child.clone(), frame_id.clone()));
            }
        }
        // Descend into shadow roots, carrying the same frame id.
        if let Some(roots) = node.get("shadowRoots").and_then(Value::as_array) {
            for root in roots {
                work.push((root.clone(), frame_id.clone()));
            }
        }
        // Descend into an iframe's content document, switching frame id to
        // the nested document's own frame id when present.
        if let Some(content_doc) = node.get("contentDocument") {
            let nested_frame_id = content_doc
                .get("frameId")
                .and_then(Value::as_str)
                .map_or_else(|| frame_id.clone(), str::to_string);
            work.push((content_doc.clone(), nested_frame_id));
        }
    }

    apply_occlusion(&mut nodes);
    filter_and_rank(nodes, &viewport)
}

#[allow(clippy::too_many_arguments)]
fn build_enhanced_node(
    backend_node_id: i64,
    frame_id: &str,
    tag_name: &str,
    attributes: HashMap<String, String>,
    text: String,
    ax: Option<AxEntry>,
    snap: &SnapshotEntry,
    viewport: &Viewport,
) -> EnhancedNode {
    let bounds_css = snap.bounds_css;
    let styles = snap.styles.clone();
    let ax_role = ax.as_ref().map(|a| a.role.clone()).filter(|r| !r.is_empty());
    let ax_name = ax.as_ref().map(|a| a.name.clone()).filter(|n| !n.is_empty());
    let ax_focusable = ax.as_ref().is_some_and(|a| a.focusable);

    let visible = is_visible(bounds_css, &styles, viewport);
    let interactive = is_interactive(tag_name, &attributes, &styles, ax_role.as_deref(), ax_focusable);
    let disabled = attributes.contains_key("disabled")
        || attributes.get("aria-disabled").is_some_and(|v| v == "true");
    let clickable = is_clickable(interactive, disabled, &styles, tag_name, &attributes);
    let action_kind = infer_action_kind(tag_name, &attributes, ax_role.as_deref());
    let focusable = ax_focusable
        || attributes
            .get("tabindex")
            .is_some_and(|t| t != "-1");

    let confidence = compute_confidence(visible, interactive, ax_role.as_deref(), ax_name.as_deref(), ax_focusable, bounds_css);

    let click_point = bounds_css.center();

    EnhancedNode {
        backend_node_id,
        frame_id: frame_id.to_string(),
        tag_name: tag_name.to_string(),
        attributes,
        text,
        ax_role,
        ax_name,
        bounds_css,
        click_point,
        styles,
        paint_order: snap.paint_order,
        visible,
        interactive,
        clickable: clickable && !disabled,
        focusable,
        occluded: false,
        action_kind,
        confidence,
    }
}

fn is_visible(bounds: Bounds, styles: &ComputedStyles, viewport: &Viewport) -> bool {
    if bounds.w < 1.0 || bounds.h < 1.0 {
        return false;
    }
    let viewport_bounds = Bounds {
        x: 0.0,
        y: 0.0,
        w: viewport.width,
        h: viewport.height,
    };
    if viewport.width > 0.0 && viewport.height > 0.0 && !bounds.intersects(&viewport_bounds) {
        return false;
    }
    styles.display != "none" && styles.visibility != "hidden" && styles.opacity >= 0.1
}

fn is_interactive(
    tag_name: &str,
    attributes: &HashMap<String, String>,
    styles: &ComputedStyles,
    ax_role: Option<&str>,
    ax_focusable: bool,
) -> bool {
    if styles.pointer_events == "none" {
        return false;
    }
    if styles.cursor == "pointer" {
        return true;
    }
    if INTERACTIVE_TAGS.contains(&tag_name) {
        return true;
    }
    if INLINE_EVENT_ATTRS.iter().any(|a| attributes.contains_key(*a)) {
        return true;
    }
    let role_attr = attributes.get("role").map(String::as_str);
    if role_attr.is_some_and(|r| INTERACTIVE_ROLES.contains(&r))
        || ax_role.is_some_and(|r| INTERACTIVE_ROLES.contains(&r))
    {
        return true;
    }
    if ax_focusable {
        return true;
    }
    if let Some(tabindex) = attributes.get("tabindex") {
        if tabindex != "-1" {
            return true;
        }
    }
    false
}

fn is_clickable(
    interactive: bool,
    disabled: bool,
    styles: &ComputedStyles,
    tag_name: &str,
    attributes: &HashMap<String, String>,
) -> bool {
    if !interactive || disabled || styles.pointer_events == "none" {
        return false;
    }
    if matches!(tag_name, "button" | "a") {
        return true;
    }
    if tag_name == "input" {
        let input_type = attributes
            .get("type")
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "text".to_string());
        if CLICKABLE_INPUT_TYPES.contains(&input_type.as_str()) {
            return true;
        }
    }
    true
}

fn infer_action_kind(
    tag_name: &str,
    attributes: &HashMap<String, String>,
    ax_role: Option<&str>,
) -> ActionKind {
    if tag_name == "select" || matches!(ax_role, Some("combobox" | "listbox")) {
        return ActionKind::Select;
    }
    if tag_name == "textarea" || matches!(ax_role, Some("textbox" | "searchbox")) {
        return ActionKind::Input;
    }
    if tag_name == "input" {
        let input_type = attributes
            .get("type")
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "text".to_string());
        if input_type == "checkbox" || input_type == "radio" {
            return ActionKind::Toggle;
        }
        if TEXT_INPUT_TYPES.contains(&input_type.as_str()) {
            return ActionKind::Input;
        }
    }
    if matches!(ax_role, Some("checkbox" | "radio" | "switch")) {
        return ActionKind::Toggle;
    }
    ActionKind::Click
}

fn compute_confidence(
    visible: bool,
    interactive: bool,
    ax_role: Option<&str>,
    ax_name: Option<&str>,
    ax_focusable: bool,
    bounds: Bounds,
) -> f64 {
    let mut score = 0.0;
    if visible {
        score += 0.3;
    }
    if interactive {
        score += 0.3;
    }
    if ax_role.is_some() {
        score += 0.2;
    }
    if ax_name.is_some() {
        score += 0.1;
    }
    if ax_focusable {
        score += 0.1;
    }
    let min_dim = bounds.w.min(bounds.h);
    if min_dim >= 10.0 {
        score += 0.1;
    }
    if min_dim < 5.0 {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// Marks nodes occluded by higher-paint-order obstacles (spec §4.7
/// "Occlusion"), in place. Monotone in paint order by construction: the
/// obstacle/target roles swap whenever their paint orders swap, because
/// the comparison is driven solely by `paint_order` and geometry.
fn apply_occlusion(nodes: &mut [EnhancedNode]) {
    let visible_indices: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| is_visible_for_occlusion(n))
        .map(|(i, _)| i)
        .collect();

    let mut by_paint_order = visible_indices.clone();
    by_paint_order.sort_by(|&a, &b| nodes[b].paint_order.cmp(&nodes[a].paint_order));

    for &target_idx in &visible_indices {
        let target_paint_order = nodes[target_idx].paint_order;
        let target_bounds = nodes[target_idx].bounds_css;
        let target_area = target_bounds.area();
        if target_area <= 0.0 {
            continue;
        }

        for &obstacle_idx in &by_paint_order {
            if obstacle_idx == target_idx {
                continue;
            }
            let obstacle_paint_order = nodes[obstacle_idx].paint_order;
            if obstacle_paint_order <= target_paint_order {
                continue;
            }
            let obstacle_styles = nodes[obstacle_idx].styles.clone();
            if obstacle_styles.pointer_events == "none" || obstacle_styles.opacity < 0.1 {
                continue;
            }
            let overlap = nodes[obstacle_idx]
                .bounds_css
                .intersect_area(&target_bounds);
            let coverage = overlap / target_area;
            if coverage > 0.9 {
                let target = &mut nodes[target_idx];
                target.occluded = true;
                target.clickable = false;
                target.confidence *= 0.1;
                break;
            } else if coverage > 0.5 {
                let target = &mut nodes[target_idx];
                target.confidence *= 1.0 - coverage * 0.5;
            }
        }
    }
}

fn is_visible_for_occlusion(node: &EnhancedNode) -> bool {
    node.visible
}

/// Keeps visible, unoccluded, interactive, sufficiently confident and
/// sufficiently large nodes, ranked by confidence descending (spec §4.7
/// "Filter and rank"). Index assignment happens downstream in the
/// serializer, which is the sole owner of [`crate::serializer::SelectorMap`].
fn filter_and_rank(mut nodes: Vec<EnhancedNode>, _viewport: &Viewport) -> Vec<EnhancedNode> {
    nodes.retain(|n| {
        n.visible
            && !n.occluded
            && n.interactive
            && n.confidence >= 0.3
            && n.bounds_css.w.min(n.bounds_css.h) >= 3.0
    });
    nodes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    nodes
}
