//! The DOM collector (C6): gathers the four raw CDP payloads fusion (C7)
//! needs from a single session, concurrently and best-effort — a failed
//! sub-call degrades to an empty payload rather than failing the whole
//! collection, since observation must never raise (spec §7).

use serde_json::{Value, json};

use crate::cdp::{CdpClient, CdpError};
use crate::fusion::COMPUTED_STYLE_NAMES;

/// The raw material fusion needs: the DOM tree, the layout/style snapshot,
/// the accessibility tree, and viewport metrics, all for one session.
#[derive(Debug, Clone, Default)]
pub struct RawDomSnapshot {
    pub document: Value,
    pub snapshot: Value,
    pub ax_tree: Value,
    pub layout_metrics: Value,
    /// Sub-calls that failed and were substituted with an empty payload.
    pub warnings: Vec<String>,
}

/// Collect everything fusion needs for `session_id`'s current document.
///
/// # Errors
///
/// Returns `CdpError` only if domain enablement itself fails (a session-
/// level problem); individual snapshot calls degrade into `warnings`
/// instead of propagating.
pub async fn collect(client: &CdpClient, session_id: &str) -> Result<RawDomSnapshot, CdpError> {
    client.ensure_domain_enabled(session_id, "DOM").await?;
    client.ensure_domain_enabled(session_id, "Page").await?;
    client
        .ensure_domain_enabled(session_id, "DOMSnapshot")
        .await?;
    client
        .ensure_domain_enabled(session_id, "Accessibility")
        .await?;

    let document_fut = client.send(
        "DOM.getDocument",
        Some(json!({"depth": -1, "pierce": true})),
        Some(session_id.to_string()),
    );
    let snapshot_fut = client.send(
        "DOMSnapshot.captureSnapshot",
        Some(json!({
            "computedStyles": COMPUTED_STYLE_NAMES,
            "includePaintOrder": true,
            "includeDOMRects": true,
        })),
        Some(session_id.to_string()),
    );
    let ax_fut = client.send(
        "Accessibility.getFullAXTree",
        None,
        Some(session_id.to_string()),
    );
    let layout_fut = client.send(
        "Page.getLayoutMetrics",
        None,
        Some(session_id.to_string()),
    );

    let (document, snapshot, ax_tree, layout_metrics) =
        tokio::join!(document_fut, snapshot_fut, ax_fut, layout_fut);

    let mut warnings = Vec::new();
    let document = unwrap_or_warn(document, "DOM.getDocument", &mut warnings);
    let snapshot = unwrap_or_warn(snapshot, "DOMSnapshot.captureSnapshot", &mut warnings);
    let ax_tree = unwrap_or_warn(ax_tree, "Accessibility.getFullAXTree", &mut warnings);
    let layout_metrics = unwrap_or_warn(layout_metrics, "Page.getLayoutMetrics", &mut warnings);

    Ok(RawDomSnapshot {
        document,
        snapshot,
        ax_tree,
        layout_metrics,
        warnings,
    })
}

fn unwrap_or_warn(
    result: Result<Value, CdpError>,
    method: &str,
    warnings: &mut Vec<String>,
) -> Value {
    match result {
        Ok(v) => v,
        Err(e) => {
            warnings.push(format!("{method} failed: {e}"));
            Value::Null
        }
    }
}
