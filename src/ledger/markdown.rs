//! Canonical markdown rendering and parsing for the ledger index.
//!
//! `render` and `parse` are inverses on canonical indexes: anything
//! rendered here parses back to a structurally equal [`LedgerIndex`].
//! Parsing is lenient about content it does not recognize; malformed
//! bullet lines are skipped and counted rather than failing the load.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ledger::model::{
    ArchiveEntry, EpicRef, EpicStatus, Handoff, HandoffReason, LedgerIndex, LedgerMeta,
    RecentLearning,
};
use crate::types::{LearningKind, Outcome, Phase};

/// Ledger markdown errors.
#[derive(Debug, Error)]
pub enum MarkdownError {
    /// The index is missing a required meta field.
    #[error("ledger index missing meta field: {0}")]
    MissingMeta(&'static str),
    /// The meta block could not be found at all.
    #[error("ledger index has no meta section")]
    NoMetaSection,
}

/// Parse output: the index plus how many lines were skipped.
#[derive(Debug)]
pub struct ParsedIndex {
    /// The parsed index.
    pub index: LedgerIndex,
    /// Unrecognized bullet lines skipped during parse.
    pub warnings: u64,
}

/// Render the index to its canonical markdown form.
pub fn render(index: &LedgerIndex) -> String {
    let mut out = String::from("# LEDGER\n\n## Meta\n\n");
    let meta = &index.meta;
    out.push_str(&format!("- Version: {}\n", meta.version));
    out.push_str(&format!("- Session: {}\n", meta.session_id));
    out.push_str(&format!("- Phase: {}\n", meta.phase.as_str()));
    out.push_str(&format!("- Last Updated: {}\n", meta.last_updated.to_rfc3339()));
    if let Some(status) = &meta.status {
        out.push_str(&format!("- Status: {status}\n"));
    }
    if let Some(tasks_completed) = &meta.tasks_completed {
        out.push_str(&format!("- Tasks Completed: {tasks_completed}\n"));
    }
    if let Some(workflow) = &meta.active_workflow {
        out.push_str(&format!("- Active Workflow: {workflow}\n"));
    }

    if let Some(epic) = &index.active_epic {
        out.push_str("\n## Active Epic\n\n");
        out.push_str(&format!("- Id: {}\n", epic.id));
        out.push_str(&format!("- Title: {}\n", epic.title));
        out.push_str(&format!("- Status: {}\n", epic.status.as_str()));
    }

    if !index.recent_learnings.is_empty() {
        out.push_str("\n## Recent Learnings\n\n");
        for learning in &index.recent_learnings {
            out.push_str(&format!(
                "- [{}] {}\n",
                kind_str(learning.kind),
                learning.content
            ));
        }
    }

    if let Some(handoff) = &index.handoff {
        out.push_str("\n## Handoff\n\n");
        out.push_str(&format!("- Reason: {}\n", handoff.reason.as_str()));
        out.push_str(&format!("- Resume: {}\n", handoff.resume_command));
        out.push_str(&format!("- Summary: {}\n", handoff.summary));
        render_list(&mut out, "Done", &handoff.whats_done);
        render_list(&mut out, "Next", &handoff.whats_next);
        render_list(&mut out, "Key Context", &handoff.key_context);
        render_list(&mut out, "Files Modified", &handoff.files_modified);
    }

    if !index.archive.is_empty() {
        out.push_str("\n## Archive\n\n");
        for entry in &index.archive {
            out.push_str(&format!(
                "- {}: {} [{}] ({})\n",
                entry.epic_id,
                entry.title,
                entry.outcome.as_str(),
                entry.archived_at.to_rfc3339()
            ));
        }
    }

    out
}

fn render_list(out: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("- {label}:\n"));
    for item in items {
        out.push_str(&format!("  - {item}\n"));
    }
}

/// Parse a canonical index back into a [`LedgerIndex`].
pub fn parse(body: &str) -> Result<ParsedIndex, MarkdownError> {
    let mut warnings = 0u64;

    let mut version: Option<u32> = None;
    let mut session_id: Option<String> = None;
    let mut phase: Option<Phase> = None;
    let mut last_updated: Option<DateTime<Utc>> = None;
    let mut status: Option<String> = None;
    let mut tasks_completed: Option<String> = None;
    let mut active_workflow: Option<serde_json::Value> = None;

    let mut epic_id: Option<String> = None;
    let mut epic_title: Option<String> = None;
    let mut epic_status: Option<EpicStatus> = None;

    let mut recent_learnings = Vec::new();
    let mut archive = Vec::new();

    let mut handoff_reason: Option<HandoffReason> = None;
    let mut handoff_resume = String::new();
    let mut handoff_summary = String::new();
    let mut whats_done = Vec::new();
    let mut whats_next = Vec::new();
    let mut key_context = Vec::new();
    let mut files_modified = Vec::new();

    let mut section = "";
    let mut handoff_list: Option<&'static str> = None;
    let mut saw_meta = false;

    for line in body.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            section = match header.trim() {
                "Meta" => {
                    saw_meta = true;
                    "meta"
                }
                "Active Epic" => "epic",
                "Recent Learnings" => "learnings",
                "Handoff" => "handoff",
                "Archive" => "archive",
                _ => {
                    warnings = warnings.saturating_add(1);
                    ""
                }
            };
            handoff_list = None;
            continue;
        }

        // Indented items belong to the current handoff list.
        if let Some(item) = line.strip_prefix("  - ") {
            match handoff_list {
                Some("Done") => whats_done.push(item.to_owned()),
                Some("Next") => whats_next.push(item.to_owned()),
                Some("Key Context") => key_context.push(item.to_owned()),
                Some("Files Modified") => files_modified.push(item.to_owned()),
                _ => warnings = warnings.saturating_add(1),
            }
            continue;
        }

        let Some(bullet) = line.strip_prefix("- ") else {
            continue;
        };

        match section {
            "meta" => match split_kv(bullet) {
                Some(("Version", v)) => version = v.parse().ok(),
                Some(("Session", v)) => session_id = Some(v.to_owned()),
                Some(("Phase", v)) => phase = Phase::parse(v),
                Some(("Last Updated", v)) => last_updated = parse_time(v),
                Some(("Status", v)) => status = Some(v.to_owned()),
                Some(("Tasks Completed", v)) => tasks_completed = Some(v.to_owned()),
                Some(("Active Workflow", v)) => active_workflow = serde_json::from_str(v).ok(),
                _ => warnings = warnings.saturating_add(1),
            },
            "epic" => match split_kv(bullet) {
                Some(("Id", v)) => epic_id = Some(v.to_owned()),
                Some(("Title", v)) => epic_title = Some(v.to_owned()),
                Some(("Status", v)) => epic_status = EpicStatus::parse(v),
                _ => warnings = warnings.saturating_add(1),
            },
            "learnings" => match parse_learning(bullet) {
                Some(learning) => recent_learnings.push(learning),
                None => warnings = warnings.saturating_add(1),
            },
            "handoff" => {
                if let Some(label) = bullet.strip_suffix(':') {
                    handoff_list = match label {
                        "Done" => Some("Done"),
                        "Next" => Some("Next"),
                        "Key Context" => Some("Key Context"),
                        "Files Modified" => Some("Files Modified"),
                        _ => {
                            warnings = warnings.saturating_add(1);
                            None
                        }
                    };
                    continue;
                }
                match split_kv(bullet) {
                    Some(("Reason", v)) => handoff_reason = HandoffReason::parse(v),
                    Some(("Resume", v)) => handoff_resume = v.to_owned(),
                    Some(("Summary", v)) => handoff_summary = v.to_owned(),
                    _ => warnings = warnings.saturating_add(1),
                }
            }
            "archive" => match parse_archive_line(bullet) {
                Some(entry) => archive.push(entry),
                None => warnings = warnings.saturating_add(1),
            },
            _ => warnings = warnings.saturating_add(1),
        }
    }

    if !saw_meta {
        return Err(MarkdownError::NoMetaSection);
    }

    let meta = LedgerMeta {
        version: version.ok_or(MarkdownError::MissingMeta("Version"))?,
        session_id: session_id.ok_or(MarkdownError::MissingMeta("Session"))?,
        phase: phase.ok_or(MarkdownError::MissingMeta("Phase"))?,
        last_updated: last_updated.ok_or(MarkdownError::MissingMeta("Last Updated"))?,
        status,
        tasks_completed,
        active_workflow,
    };

    let active_epic = match (epic_id, epic_title, epic_status) {
        (Some(id), Some(title), Some(status)) => Some(EpicRef { id, title, status }),
        _ => None,
    };

    let handoff = handoff_reason.map(|reason| Handoff {
        reason,
        resume_command: handoff_resume,
        summary: handoff_summary,
        files_modified,
        whats_done,
        whats_next,
        key_context,
    });

    Ok(ParsedIndex {
        index: LedgerIndex {
            meta,
            active_epic,
            recent_learnings,
            handoff,
            archive,
        },
        warnings,
    })
}

fn split_kv(bullet: &str) -> Option<(&str, &str)> {
    bullet.split_once(": ").map(|(k, v)| (k, v.trim()))
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_learning(bullet: &str) -> Option<RecentLearning> {
    let rest = bullet.strip_prefix('[')?;
    let (kind, content) = rest.split_once("] ")?;
    Some(RecentLearning {
        kind: parse_kind(kind)?,
        content: content.to_owned(),
    })
}

/// `a11111: Old epic [SUCCEEDED] (2026-07-30T10:00:00+00:00)`
fn parse_archive_line(bullet: &str) -> Option<ArchiveEntry> {
    let (epic_id, rest) = bullet.split_once(": ")?;
    let (title, rest) = rest.rsplit_once(" [")?;
    let (outcome, rest) = rest.split_once("] (")?;
    let archived_at = parse_time(rest.strip_suffix(')')?)?;
    Some(ArchiveEntry {
        epic_id: epic_id.to_owned(),
        title: title.to_owned(),
        outcome: parse_outcome(outcome)?,
        archived_at,
    })
}

/// Wire name for a learning kind, matching the JSON rendering.
pub fn kind_str(kind: LearningKind) -> &'static str {
    match kind {
        LearningKind::Pattern => "pattern",
        LearningKind::AntiPattern => "antiPattern",
        LearningKind::Decision => "decision",
        LearningKind::Preference => "preference",
        LearningKind::Correction => "correction",
        LearningKind::Insight => "insight",
    }
}

/// Parse a learning kind wire name.
pub fn parse_kind(s: &str) -> Option<LearningKind> {
    match s {
        "pattern" => Some(LearningKind::Pattern),
        "antiPattern" => Some(LearningKind::AntiPattern),
        "decision" => Some(LearningKind::Decision),
        "preference" => Some(LearningKind::Preference),
        "correction" => Some(LearningKind::Correction),
        "insight" => Some(LearningKind::Insight),
        _ => None,
    }
}

fn parse_outcome(s: &str) -> Option<Outcome> {
    match s {
        "SUCCEEDED" => Some(Outcome::Succeeded),
        "PARTIAL" => Some(Outcome::Partial),
        "FAILED" => Some(Outcome::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_index() -> LedgerIndex {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).single().expect("time");
        LedgerIndex {
            meta: LedgerMeta {
                version: 6,
                session_id: "ses_main".to_owned(),
                phase: Phase::Execute,
                last_updated: now,
                status: Some("handoff".to_owned()),
                tasks_completed: Some("1/3".to_owned()),
                active_workflow: None,
            },
            active_epic: Some(EpicRef {
                id: "a3f29c".to_owned(),
                title: "Build Auth".to_owned(),
                status: EpicStatus::InProgress,
            }),
            recent_learnings: vec![
                RecentLearning {
                    kind: LearningKind::Decision,
                    content: "chose OAuth over SAML".to_owned(),
                },
                RecentLearning {
                    kind: LearningKind::AntiPattern,
                    content: "retried without backoff".to_owned(),
                },
            ],
            handoff: Some(Handoff {
                reason: HandoffReason::ContextLimit,
                resume_command: "armitage resume".to_owned(),
                summary: "stopped mid-migration".to_owned(),
                files_modified: vec!["src/auth.rs".to_owned()],
                whats_done: vec!["schema designed".to_owned()],
                whats_next: vec!["wire endpoints".to_owned()],
                key_context: vec!["uses postgres".to_owned()],
            }),
            archive: vec![ArchiveEntry {
                epic_id: "a11111".to_owned(),
                title: "Old epic".to_owned(),
                outcome: Outcome::Succeeded,
                archived_at: Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).single().expect("time"),
            }],
        }
    }

    // ── Round trip ──

    #[test]
    fn test_render_parse_round_trip() {
        let index = sample_index();
        let rendered = render(&index);
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.index, index);
        assert_eq!(parsed.warnings, 0);
    }

    #[test]
    fn test_round_trip_minimal_index() {
        let index = LedgerIndex::fresh("ses_1", Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().expect("time"));
        let parsed = parse(&render(&index)).expect("parse");
        assert_eq!(parsed.index, index);
    }

    #[test]
    fn test_round_trip_with_workflow_state() {
        let mut index = sample_index();
        index.meta.active_workflow =
            Some(serde_json::json!({"name": "ship", "phase": 1, "step": 0, "status": "paused"}));
        let parsed = parse(&render(&index)).expect("parse");
        assert_eq!(parsed.index, index);
    }

    // ── Lenient parsing ──

    #[test]
    fn test_unknown_bullets_are_skipped_and_counted() {
        let index = sample_index();
        let mut body = render(&index);
        body.push_str("\n## Mystery Section\n\n- Something: else\n");

        let parsed = parse(&body).expect("parse");
        assert_eq!(parsed.index, index, "unknown sections do not corrupt state");
        assert!(parsed.warnings > 0);
    }

    #[test]
    fn test_malformed_learning_line_skipped() {
        let mut body = render(&sample_index());
        body.push_str("\n## Recent Learnings\n\n- not a tagged learning\n");
        let parsed = parse(&body).expect("parse");
        assert!(parsed.warnings > 0);
    }

    #[test]
    fn test_missing_meta_is_an_error() {
        let err = parse("# LEDGER\n\n## Archive\n").expect_err("no meta");
        assert!(matches!(err, MarkdownError::NoMetaSection));
    }

    #[test]
    fn test_missing_meta_field_is_an_error() {
        let body = "# LEDGER\n\n## Meta\n\n- Version: 6\n- Session: s\n";
        let err = parse(body).expect_err("incomplete meta");
        assert!(matches!(err, MarkdownError::MissingMeta(_)));
    }
}
