//! Pattern-based extraction of learnings from the event stream.
//!
//! Each event's payload is stringified and run through regex batteries
//! (corrections, success patterns, failure patterns) plus structured
//! rules keyed on the event type. Extractions below the confidence floor
//! are discarded; survivors are sorted by confidence and capped. Be
//! conservative: if nothing matches, nothing is extracted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, warn};

use crate::kernel::ids;
use crate::kernel::stream::EventStream;
use crate::types::{Event, EventType, Learning, LearningKind};

/// Longest learning content kept, in characters.
const MAX_CONTENT_CHARS: usize = 300;

/// Entities kept per learning.
const MAX_ENTITIES: usize = 5;

/// Extractor tuning.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Confidence floor; extractions below it are dropped.
    pub min_confidence: f64,
    /// Cap on learnings returned per extraction run.
    pub max_learnings: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_learnings: 10,
        }
    }
}

/// Counters behind the `observer_stats` tool.
#[derive(Debug, Clone, Default)]
pub struct ObserverStats {
    /// Events inspected.
    pub events_seen: u64,
    /// Learnings that survived the confidence filter.
    pub learnings_extracted: u64,
    /// Extraction counts per kind.
    pub by_kind: HashMap<LearningKind, u64>,
}

struct Batteries {
    correction: Regex,
    success: Regex,
    failure: Regex,
    entity_backtick: Regex,
    entity_path: Regex,
}

impl Batteries {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            correction: Regex::new(
                r"(?i)\bno[,.]?\s+(do|use|try|make|don't|dont|instead|actually)\b",
            )?,
            success: Regex::new(r"(?i)\b(perfect|works now|that worked|fixed it|exactly right)\b")?,
            failure: Regex::new(
                r"(?i)\b(wrong|broken|didn't work|didnt work|failed again|still failing)\b",
            )?,
            entity_backtick: Regex::new(r"`([^`\s]{2,64})`")?,
            entity_path: Regex::new(r"\b[\w-]+(?:/[\w.-]+)+\b")?,
        })
    }
}

/// Pattern-matching learning extractor.
pub struct LearningExtractor {
    config: ExtractorConfig,
    batteries: Batteries,
    enabled: AtomicBool,
    stats: Mutex<ObserverStats>,
}

impl LearningExtractor {
    /// Build an extractor; compiles the regex batteries once.
    pub fn new(config: ExtractorConfig) -> Self {
        let batteries = Batteries::compile().expect("static extractor regexes compile");
        Self {
            config,
            batteries,
            enabled: AtomicBool::new(true),
            stats: Mutex::new(ObserverStats::default()),
        }
    }

    /// Pause or resume extraction (the `observer_control` surface).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether extraction is running.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Current counters.
    pub fn stats(&self) -> ObserverStats {
        self.lock_stats().clone()
    }

    /// Extract learnings from a batch of events.
    ///
    /// Output is filtered by the confidence floor, sorted by confidence
    /// descending, and capped at `max_learnings`.
    pub fn extract(&self, events: &[Event]) -> Vec<Learning> {
        if !self.is_enabled() {
            return Vec::new();
        }

        {
            let mut stats = self.lock_stats();
            stats.events_seen = stats
                .events_seen
                .saturating_add(u64::try_from(events.len()).unwrap_or(u64::MAX));
        }
        let mut out = Vec::new();
        for event in events {
            out.extend(self.extract_one(event));
        }

        out.retain(|l| l.confidence >= self.config.min_confidence);
        out.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(self.config.max_learnings);

        let mut stats = self.lock_stats();
        for learning in &out {
            stats.learnings_extracted = stats.learnings_extracted.saturating_add(1);
            let count = stats.by_kind.entry(learning.kind).or_insert(0);
            *count = count.saturating_add(1);
        }
        out
    }

    fn extract_one(&self, event: &Event) -> Vec<Learning> {
        let mut found = Vec::new();
        let payload_text = event.payload.to_string();

        // Regex batteries over the stringified payload.
        if self.batteries.correction.is_match(&payload_text) {
            found.push(self.learning(event, LearningKind::Correction, &payload_text, 0.9));
        }
        if self.batteries.success.is_match(&payload_text) {
            found.push(self.learning(event, LearningKind::Pattern, &payload_text, 0.8));
        }
        if self.batteries.failure.is_match(&payload_text) {
            found.push(self.learning(event, LearningKind::AntiPattern, &payload_text, 0.8));
        }

        // Structured rules keyed on the event type.
        match &event.event_type {
            EventType::AgentCompleted => {
                if let Some(result) = event.payload.get("result").and_then(|v| v.as_str()) {
                    if !result.is_empty() {
                        found.push(self.learning(event, LearningKind::Decision, result, 0.7));
                    }
                }
            }
            EventType::AgentFailed => {
                if let Some(error) = event.payload.get("error").and_then(|v| v.as_str()) {
                    found.push(self.learning(event, LearningKind::AntiPattern, error, 0.8));
                }
            }
            EventType::CheckpointApproved => {
                if let Some(option) = event
                    .payload
                    .get("selected_option")
                    .and_then(|v| v.as_str())
                {
                    found.push(self.learning(
                        event,
                        LearningKind::Preference,
                        &format!("approved option: {option}"),
                        0.85,
                    ));
                }
            }
            EventType::CheckpointRejected => {
                if let Some(reason) = event.payload.get("reason").and_then(|v| v.as_str()) {
                    found.push(self.learning(
                        event,
                        LearningKind::AntiPattern,
                        &format!("rejected: {reason}"),
                        0.8,
                    ));
                }
            }
            _ => {}
        }

        found
    }

    fn learning(
        &self,
        event: &Event,
        kind: LearningKind,
        content: &str,
        confidence: f64,
    ) -> Learning {
        let mut content: String = content.chars().take(MAX_CONTENT_CHARS).collect();
        if content.is_empty() {
            content = event.event_type.to_string();
        }
        Learning {
            id: ids::learning_id(),
            kind,
            content: content.clone(),
            entities: self.entities(&content),
            confidence,
            source_event_id: event.id.clone(),
            extracted_at: Utc::now(),
        }
    }

    /// Entities from the content: backticked tokens and path-like
    /// tokens, deduplicated, capped.
    fn entities(&self, content: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for capture in self.batteries.entity_backtick.captures_iter(content) {
            if let Some(m) = capture.get(1) {
                out.push(m.as_str().to_owned());
            }
        }
        for m in self.batteries.entity_path.find_iter(content) {
            out.push(m.as_str().to_owned());
        }
        out.dedup();
        let mut seen = std::collections::HashSet::new();
        out.retain(|e| seen.insert(e.clone()));
        out.truncate(MAX_ENTITIES);
        out
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ObserverStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Event types the realtime observer reacts to.
const REALTIME_TYPES: &[EventType] = &[
    EventType::AgentCompleted,
    EventType::AgentFailed,
    EventType::CheckpointApproved,
    EventType::CheckpointRejected,
];

/// Subscribe the extractor to the stream and invoke `on_learning` for
/// every qualifying learning.
///
/// Runs until the stream shuts down (closing the subscription) or the
/// returned task is aborted.
pub fn spawn_realtime<F>(
    extractor: Arc<LearningExtractor>,
    stream: &EventStream,
    on_learning: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Learning) + Send + Sync + 'static,
{
    let mut subscription = stream.subscribe("*");
    tokio::spawn(async move {
        while let Some(event) = subscription.rx.recv().await {
            if !REALTIME_TYPES.contains(&event.event_type) {
                continue;
            }
            for learning in extractor.extract(std::slice::from_ref(&event)) {
                debug!(kind = ?learning.kind, "realtime learning extracted");
                on_learning(learning);
            }
        }
        warn!("realtime observer subscription closed");
    })
}
