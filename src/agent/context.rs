//! Request assembly for conversational turns

use crate::llm::ChatMessage;
use crate::memory::{Conversation, EntityGraph, Role};

/// Builds the message list sent to the model for one turn
pub struct ContextBuilder<'a> {
    graph: &'a EntityGraph,
    conversation: &'a Conversation,
    recent: usize,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(graph: &'a EntityGraph, conversation: &'a Conversation) -> Self {
        Self {
            graph,
            conversation,
            recent: crate::DEFAULT_RECENT_MESSAGES,
        }
    }

    pub fn with_recent(mut self, recent: usize) -> Self {
        self.recent = recent;
        self
    }

    fn system_prompt(&self) -> String {
        let index = if self.graph.is_empty() {
            "(nothing remembered yet)".to_string()
        } else {
            self.graph.index_string()
        };

        format!(
            r#"You are a helpful assistant with long-term memory.

Your memory is a graph of entities (people, places, concepts, events, tasks) shared across every conversation. Use the entity tools proactively: whenever the user mentions a person, place, plan or fact worth remembering, create or update the matching entity and link related entities with relationships. Reuse existing ids. Do not ask permission before updating memory.

=== Known entities (id | name | type) ===
{index}"#
        )
    }

    /// System instruction, optional summary block, then the trailing window
    pub fn build(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt())];

        if let Some(summary) = self.conversation.summary() {
            if !summary.summary.trim().is_empty() {
                messages.push(ChatMessage::system(format!(
                    "=== Summary of earlier conversation in this thread ===\n{}",
                    summary.summary
                )));
            }
        }

        for message in self.conversation.recent_window(self.recent) {
            match message.role {
                Role::User => messages.push(ChatMessage::user(&message.content)),
                Role::Assistant => messages.push(ChatMessage::assistant(&message.content)),
                // Tool results are not replayed across turns
                Role::Tool => {}
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConversationSummary, EntityNode, EntityType, Message};
    use chrono::Utc;

    #[test]
    fn test_build_without_summary() {
        let graph = EntityGraph::new();
        let mut conversation = Conversation::new("t");
        for i in 0..4 {
            conversation.append(Message::user(format!("q{}", i)));
            conversation.append(Message::assistant(format!("a{}", i)));
        }

        let messages = ContextBuilder::new(&graph, &conversation)
            .with_recent(3)
            .build();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role(), "system");
        assert_eq!(messages[1], ChatMessage::assistant("a2"));
        assert_eq!(messages[3], ChatMessage::assistant("a3"));
    }

    #[test]
    fn test_build_includes_summary_and_index() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(EntityNode::new("person-alice", EntityType::Person, "Alice", ""));
        let mut conversation = Conversation::new("t");
        conversation.append(Message::user("hello"));
        conversation.apply_summary(ConversationSummary {
            thread_id: "t".to_string(),
            summary: "Alice is planning a trip.".to_string(),
            message_count: 1,
            last_updated: Utc::now(),
        });

        let messages = ContextBuilder::new(&graph, &conversation).build();

        match &messages[0] {
            ChatMessage::System { content } => {
                assert!(content.contains("- person-alice | Alice | person"))
            }
            other => panic!("expected system message, got {:?}", other),
        }
        match &messages[1] {
            ChatMessage::System { content } => assert!(content.contains("planning a trip")),
            other => panic!("expected summary block, got {:?}", other),
        }
        assert_eq!(messages[2], ChatMessage::user("hello"));
    }
}
