//! Memory summarizer - folds recent messages back into long-term memory.
//!
//! A run reads every message recorded since the thread's last summary, asks
//! the model for a refreshed narrative plus any entities worth remembering,
//! and applies both. Runs are detached from the turn that triggered them.
//!
//! At most one run per thread is in flight. A run that finds its thread
//! already leased is skipped, not queued.

use super::conversation::{Conversation, ConversationSummary, Message};
use super::entity::{EntityGraph, EntityNode, MergeReport};
use super::threads::ThreadRegistry;
use crate::llm::{ChatMessage, LlmClient};
use crate::store::{self, summary_key, DocumentStore};
use crate::Result;
use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

/// Stand-in for the previous summary on a thread's first run
pub const NO_PRIOR_SUMMARY: &str = "No prior conversation.";

const SUMMARIZER_INSTRUCTIONS: &str = r#"You maintain the long-term memory of a chat assistant.

You are given the previous summary of a conversation thread, every entity currently remembered, and the messages exchanged since that summary was written.

Respond with exactly two sections:

## NARRATIVE SUMMARY
A concise narrative of the whole thread so far: the previous summary updated with the new messages. Keep facts, decisions, preferences and open questions.

## ENTITIES
A JSON array of entities that are new or changed in these messages. Each entity:
{"id": "person-alice", "type": "person|place|concept|event|task|other", "name": "...", "description": "...", "properties": {}, "relationships": [{"targetId": "...", "relationship": "...", "strength": 0.5}]}
Reuse existing ids when referring to known entities. Use [] if nothing changed."#;

/// Whether enough new messages have accumulated for another run
pub fn should_summarize(total: usize, summarized: usize, frequency: usize) -> bool {
    total.saturating_sub(summarized) >= frequency.max(1)
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// Nothing new since the last summary; no model call, no writes
    NoChanges,
    /// Another run already holds this thread's lease
    Skipped,
    /// The thread was deleted before the run could apply its result
    ThreadGone,
    Updated {
        summary_applied: bool,
        entities: MergeReport,
    },
}

/// Counters for observing the summarizer from outside
#[derive(Debug, Default)]
pub struct SummarizerStats {
    runs: AtomicU64,
    skipped: AtomicU64,
    parse_failures: AtomicU64,
    failures: AtomicU64,
}

impl SummarizerStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sections pulled out of a summarizer reply
#[derive(Debug, Default, PartialEq)]
pub struct ParsedSummary {
    pub narrative: Option<String>,
    pub entities: Option<std::result::Result<Vec<EntityNode>, String>>,
}

/// Held while a run owns a thread. Dropping it releases the lease.
struct LeaseGuard<'a> {
    leases: &'a Mutex<HashSet<String>>,
    thread_id: String,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(&self.thread_id);
    }
}

pub struct MemorySummarizer {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn DocumentStore>,
    temperature: f32,
    max_tokens: u32,
    leases: Mutex<HashSet<String>>,
    stats: SummarizerStats,
}

impl MemorySummarizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn DocumentStore>,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            llm,
            store,
            temperature,
            max_tokens,
            leases: Mutex::new(HashSet::new()),
            stats: SummarizerStats::default(),
        }
    }

    pub fn stats(&self) -> &SummarizerStats {
        &self.stats
    }

    /// True while a run holds `thread_id`
    pub fn is_running(&self, thread_id: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(thread_id)
    }

    fn try_lease(&self, thread_id: &str) -> Option<LeaseGuard<'_>> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !leases.insert(thread_id.to_string()) {
            return None;
        }
        Some(LeaseGuard {
            leases: &self.leases,
            thread_id: thread_id.to_string(),
        })
    }

    /// Summarize one thread.
    ///
    /// Locks are only held while snapshotting inputs and applying results,
    /// never across the model call.
    pub async fn run(
        &self,
        registry: &AsyncMutex<ThreadRegistry>,
        graph: &RwLock<EntityGraph>,
        thread_id: &str,
    ) -> Result<SummaryOutcome> {
        let Some(_lease) = self.try_lease(thread_id) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Summarizer already running for {}, skipping", thread_id);
            return Ok(SummaryOutcome::Skipped);
        };

        // 1. Snapshot the delta
        let (previous, delta, total) = {
            let registry = registry.lock().await;
            if !registry.contains(thread_id) {
                return Ok(SummaryOutcome::ThreadGone);
            }
            if registry.current_id() == thread_id {
                snapshot(registry.current())
            } else {
                let conversation = Conversation::load(self.store.as_ref(), thread_id).await?;
                snapshot(&conversation)
            }
        };

        if delta.is_empty() {
            debug!("No new messages in {}, nothing to summarize", thread_id);
            return Ok(SummaryOutcome::NoChanges);
        }

        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        info!(
            "Summarizing {} new messages in thread {}",
            delta.len(),
            thread_id
        );

        // 2. Build the request
        let entities_json = graph.read().await.to_prompt_json();
        let messages = vec![
            ChatMessage::system(SUMMARIZER_INSTRUCTIONS),
            ChatMessage::user(build_request(
                previous.as_deref().unwrap_or(NO_PRIOR_SUMMARY),
                &entities_json,
                &delta,
            )),
        ];

        // 3. Ask the model
        let completion = self
            .llm
            .complete(&messages, None, self.temperature, self.max_tokens)
            .await?;
        let reply = completion.content.unwrap_or_default();

        // 4. Parse
        let parsed = parse_reply(&reply);

        // 5. Apply the narrative
        let mut summary_applied = false;
        if let Some(narrative) = parsed.narrative {
            let summary = ConversationSummary {
                thread_id: thread_id.to_string(),
                summary: narrative,
                message_count: total,
                last_updated: Utc::now(),
            };
            let mut registry = registry.lock().await;
            if !registry.contains(thread_id) {
                info!("Thread {} was deleted during summarization", thread_id);
                return Ok(SummaryOutcome::ThreadGone);
            }
            registry.apply_summary(summary.clone());
            summary_applied = self.write_summary(&summary).await?;
        } else {
            warn!("Summarizer reply for {} had no narrative section", thread_id);
        }

        // 6. Fold in entities
        let mut report = MergeReport::default();
        match parsed.entities {
            Some(Ok(nodes)) if !nodes.is_empty() => {
                let mut graph = graph.write().await;
                report = graph.merge_nodes(nodes);
                graph.save(self.store.as_ref()).await?;
                info!(
                    "Summarizer merged entities: {} added, {} merged, {} dangling edges pruned",
                    report.added, report.merged, report.pruned_edges
                );
            }
            Some(Ok(_)) => debug!("Summarizer proposed no entity changes"),
            Some(Err(e)) => {
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Could not parse summarizer entities for {}: {}", thread_id, e);
            }
            None => debug!("Summarizer reply had no entity section"),
        }

        Ok(SummaryOutcome::Updated {
            summary_applied,
            entities: report,
        })
    }

    /// Write a summary unless the stored one is already newer
    async fn write_summary(&self, summary: &ConversationSummary) -> Result<bool> {
        let key = summary_key(&summary.thread_id);
        let stored = store::read_json::<ConversationSummary>(self.store.as_ref(), &key).await?;
        if let Some(stored) = stored {
            if stored.message_count > summary.message_count {
                debug!(
                    "Stored summary for {} is newer ({} > {}), keeping it",
                    summary.thread_id, stored.message_count, summary.message_count
                );
                return Ok(false);
            }
        }
        store::write_json(self.store.as_ref(), &key, summary).await?;
        Ok(true)
    }
}

fn snapshot(conversation: &Conversation) -> (Option<String>, Vec<Message>, usize) {
    (
        conversation.summary().map(|s| s.summary.clone()),
        conversation.messages_since_summary().to_vec(),
        conversation.len(),
    )
}

fn build_request(previous: &str, entities_json: &str, delta: &[Message]) -> String {
    let transcript = delta
        .iter()
        .map(|m| format!("[{}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "=== PREVIOUS SUMMARY ===\n{}\n\n=== KNOWN ENTITIES ===\n{}\n\n=== NEW MESSAGES ===\n{}",
        previous, entities_json, transcript
    )
}

fn section_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?mi)^[ \t]*#{1,3}[ \t]*(NARRATIVE SUMMARY|ENTITIES)[ \t]*:?[ \t\r]*$")
            .expect("section marker regex")
    })
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\n?(.*?)\n?[ \t]*```$").expect("code fence regex")
    })
}

/// Split a summarizer reply into its labeled sections
pub fn parse_reply(reply: &str) -> ParsedSummary {
    let markers: Vec<_> = section_marker().captures_iter(reply).collect();
    let mut parsed = ParsedSummary::default();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(reply.len());
        let body = reply[whole.end()..end].trim();

        if label.as_str().eq_ignore_ascii_case("NARRATIVE SUMMARY") {
            if !body.is_empty() {
                parsed.narrative = Some(body.to_string());
            }
        } else {
            parsed.entities = Some(parse_entities(body));
        }
    }

    parsed
}

/// Parse the entity section, tolerating a surrounding code fence
fn parse_entities(body: &str) -> std::result::Result<Vec<EntityNode>, String> {
    let body = code_fence()
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(body);

    if body.is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str::<Vec<EntityNode>>(body).map_err(|e| e.to_string())
}
