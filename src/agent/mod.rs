//! Chat agent - runs conversational turns against threaded memory.
//!
//! A turn appends the user message, asks the model for a reply with the
//! entity tools available, executes any tool calls against the shared graph,
//! asks again for the final answer, and records the exchange. Summarization
//! is kicked off in the background once enough new messages pile up.

mod context;

pub use context::ContextBuilder;

use crate::llm::{ChatMessage, Completion, LlmClient, ToolCall, ToolDefinition};
use crate::memory::{
    should_summarize, ConversationSummary, EntityGraph, MemorySummarizer, Message,
    SummarizerStats, Thread, ThreadRegistry,
};
use crate::store::DocumentStore;
use crate::tools;
use crate::{Result, ThreadmindConfig, ThreadmindError};
use futures::future::join_all;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ChatAgent {
    config: ThreadmindConfig,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn DocumentStore>,
    registry: Arc<Mutex<ThreadRegistry>>,
    graph: Arc<RwLock<EntityGraph>>,
    summarizer: Arc<MemorySummarizer>,
    tools: Vec<ToolDefinition>,
    /// Detached summarizer runs not yet awaited
    pending: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChatAgent {
    /// Open the thread registry and entity graph held in `store`
    pub async fn new(
        config: ThreadmindConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let registry = ThreadRegistry::open(store.clone()).await?;
        let graph = EntityGraph::load(store.as_ref()).await?;
        let summarizer = MemorySummarizer::new(
            llm.clone(),
            store.clone(),
            config.llm.summary_temperature,
            config.llm.max_tokens,
        );

        Ok(Self {
            config,
            llm,
            store,
            registry: Arc::new(Mutex::new(registry)),
            graph: Arc::new(RwLock::new(graph)),
            summarizer: Arc::new(summarizer),
            tools: tools::entity_tools(),
            pending: StdMutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ThreadmindConfig {
        &self.config
    }

    /// Run one conversational turn on `thread_id` and return the reply.
    ///
    /// Provider failures become the reply text (prefixed `Error: `) and are
    /// recorded like any other answer. Storage failures are returned.
    pub async fn send_turn(&self, thread_id: &str, user_text: &str) -> Result<String> {
        // The registry stays unlocked while the model is working
        let mut messages = {
            let mut registry = self.registry.lock().await;
            if registry.current_id() != thread_id {
                registry.switch_thread(thread_id).await?;
            }
            registry.append(Message::user(user_text));

            let graph = self.graph.read().await;
            ContextBuilder::new(&graph, registry.current())
                .with_recent(self.config.recent_messages_count)
                .build()
        };

        let mut executed = Vec::new();
        let result = self.complete_turn(&mut messages, &mut executed).await;

        let mut registry = self.registry.lock().await;
        if registry.current_id() != thread_id {
            debug!("Thread changed during turn, switching back to {}", thread_id);
            registry.switch_thread(thread_id).await?;
        }

        let (reply, failed) = match result {
            Ok(text) => (text, false),
            Err(e @ (ThreadmindError::Provider(_) | ThreadmindError::ProviderUnavailable(_))) => {
                warn!("Turn on {} failed: {}", thread_id, e);
                (format!("Error: {}", e), true)
            }
            Err(e) => {
                registry.persist_current().await?;
                return Err(e);
            }
        };

        registry.append(Message::assistant(&reply).with_tool_calls(executed));
        registry.persist_current().await?;

        if !failed {
            let conversation = registry.current();
            if should_summarize(
                conversation.len(),
                conversation.summarized_count(),
                self.config.summary_update_frequency,
            ) {
                self.spawn_summary(thread_id);
            }
        }

        Ok(reply)
    }

    /// Completion loop: at most `max_tool_rounds` tool round trips, the last
    /// follow-up offered without tools.
    async fn complete_turn(
        &self,
        messages: &mut Vec<ChatMessage>,
        executed: &mut Vec<ToolCall>,
    ) -> Result<String> {
        let max_rounds = self.config.max_tool_rounds;
        let mut completion = self.complete(messages, max_rounds > 0).await?;

        let mut round = 0;
        while completion.has_tool_calls() {
            if round >= max_rounds {
                warn!(
                    "Ignoring {} tool call(s) past the limit of {} round(s)",
                    completion.tool_calls.len(),
                    max_rounds
                );
                break;
            }
            round += 1;

            let calls = std::mem::take(&mut completion.tool_calls);
            messages.push(ChatMessage::assistant_tool_calls(
                completion.content.take(),
                calls.clone(),
            ));

            {
                let mut graph = self.graph.write().await;
                for call in &calls {
                    let outcome = tools::execute(&mut graph, call);
                    messages.push(ChatMessage::tool_result(outcome.tool_call_id, outcome.output));
                }
                graph.save(self.store.as_ref()).await?;
            }
            executed.extend(calls);

            completion = self.complete(messages, round < max_rounds).await?;
        }

        Ok(completion.content.unwrap_or_default())
    }

    async fn complete(&self, messages: &[ChatMessage], with_tools: bool) -> Result<Completion> {
        let tools = with_tools.then_some(self.tools.as_slice());
        self.llm
            .complete(
                messages,
                tools,
                self.config.llm.temperature,
                self.config.llm.max_tokens,
            )
            .await
    }

    fn spawn_summary(&self, thread_id: &str) {
        let registry = self.registry.clone();
        let graph = self.graph.clone();
        let summarizer = self.summarizer.clone();
        let thread_id = thread_id.to_string();

        debug!("Spawning summarizer for {}", thread_id);
        let handle = tokio::spawn(async move {
            match summarizer.run(&registry, &graph, &thread_id).await {
                Ok(outcome) => debug!("Summarizer for {} finished: {:?}", thread_id, outcome),
                Err(e) => {
                    summarizer.stats().record_failure();
                    warn!("Summarizer for {} failed: {}", thread_id, e);
                }
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every detached summarizer run started so far
    pub async fn wait_for_summaries(&self) {
        let handles: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        debug!("Waiting for {} summarizer run(s)", handles.len());
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Summarizer task panicked or was cancelled: {}", e);
            }
        }
    }

    /// Finish background work and flush the current thread
    pub async fn shutdown(&self) -> Result<()> {
        self.wait_for_summaries().await;
        self.registry.lock().await.persist_current().await?;
        info!("Chat agent shut down");
        Ok(())
    }

    // ─── Thread operations ──────────────────────────────────────────

    pub async fn create_thread(&self, name: &str) -> Result<Thread> {
        self.registry.lock().await.create_thread(name).await
    }

    pub async fn switch_thread(&self, thread_id: &str) -> Result<()> {
        self.registry.lock().await.switch_thread(thread_id).await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.registry.lock().await.delete_thread(thread_id).await
    }

    pub async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<()> {
        self.registry.lock().await.rename_thread(thread_id, name).await
    }

    pub async fn list_threads(&self) -> Vec<Thread> {
        self.registry.lock().await.list()
    }

    pub async fn current_thread_id(&self) -> String {
        self.registry.lock().await.current_id().to_string()
    }

    pub async fn current_messages(&self) -> Vec<Message> {
        self.registry.lock().await.current().messages().to_vec()
    }

    pub async fn current_summary(&self) -> Option<ConversationSummary> {
        self.registry.lock().await.current().summary().cloned()
    }

    /// Snapshot of the shared entity graph
    pub async fn entities(&self) -> EntityGraph {
        self.graph.read().await.clone()
    }

    pub fn summarizer_stats(&self) -> &SummarizerStats {
        self.summarizer.stats()
    }
}
