//! Memory module for Threadmind
//!
//! Thread registry, per-thread conversation logs, the shared entity graph,
//! and the background summarizer that ties them together.

mod conversation;
mod entity;
mod summarizer;
mod threads;

pub use conversation::{Conversation, ConversationSummary, Message, Role};
pub use entity::{
    clamp_strength, EntityGraph, EntityNode, EntityPatch, EntityType, MergeReport, Relationship,
    Upsert, DEFAULT_STRENGTH,
};
pub use summarizer::{
    parse_reply, should_summarize, MemorySummarizer, ParsedSummary, SummarizerStats,
    SummaryOutcome, NO_PRIOR_SUMMARY,
};
pub use threads::{Thread, ThreadRegistry, DEFAULT_THREAD_NAME};
