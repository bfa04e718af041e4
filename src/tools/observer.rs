//! `observer_*` tools: extractor statistics and control.

use serde_json::json;

use crate::ledger::markdown;
use crate::observer::LearningExtractor;

use super::{ok, ToolError};

/// `observer_stats`: counters since startup.
pub fn stats(extractor: &LearningExtractor) -> Result<serde_json::Value, ToolError> {
    let stats = extractor.stats();
    let by_kind: serde_json::Map<String, serde_json::Value> = stats
        .by_kind
        .iter()
        .map(|(kind, count)| (markdown::kind_str(*kind).to_owned(), json!(count)))
        .collect();
    Ok(ok(json!({
        "enabled": extractor.is_enabled(),
        "eventsSeen": stats.events_seen,
        "learningsExtracted": stats.learnings_extracted,
        "byKind": by_kind,
    })))
}

/// `observer_control` input: `{enabled}`.
pub fn control(
    extractor: &LearningExtractor,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let enabled = input
        .get("enabled")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| ToolError::InvalidInput("missing required field: enabled".to_owned()))?;
    extractor.set_enabled(enabled);
    Ok(ok(json!({ "enabled": enabled })))
}
