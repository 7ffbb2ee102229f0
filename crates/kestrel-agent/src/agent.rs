//! The Agent: one instance shared by the gateway, the scheduler, and the
//! CLI. Each `handle_turn` rebuilds the system prompt, optionally compiles
//! the user message, and runs the tool loop. Interrupt hooks let the
//! gateway stop, skip, or inject into a run in flight.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;

use kestrel_core::config::{AgentConfig, ThinkingMode};
use kestrel_llm::{LlmClient, LlmRequest, Message};
use kestrel_memory::MemoryManager;

use crate::compiler;
use crate::context;
use crate::error::Result;
use crate::prompt::{PromptBuilder, SessionInfo};
use crate::skills::SkillRegistry;
use crate::tool_loop::{run_tool_loop, ToolLoopConfig};
use crate::tools::ToolRegistry;

/// What an incoming message means for a run in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Cancel the whole turn; discard produced output.
    Stop,
    /// Skip the current step but keep going.
    Skip,
    /// A normal message — queue it into the running conversation.
    Message,
}

const STOP_COMMANDS: &[&str] = &["/stop", "stop", "停止", "取消"];
const SKIP_COMMANDS: &[&str] = &["/skip", "skip", "跳过"];

pub struct Agent {
    client: Arc<LlmClient>,
    /// Lightweight pool for the compiler, classifiers, and summaries.
    compiler: Option<Arc<LlmClient>>,
    memory: Arc<MemoryManager>,
    registry: Arc<ToolRegistry>,
    prompt: RwLock<PromptBuilder>,
    skills_dir: PathBuf,
    config: AgentConfig,
    thinking_enabled: Arc<AtomicBool>,
    current_cancel: Mutex<Option<CancellationToken>>,
    injected: Arc<Mutex<VecDeque<String>>>,
}

impl Agent {
    pub fn new(
        client: Arc<LlmClient>,
        memory: Arc<MemoryManager>,
        registry: Arc<ToolRegistry>,
        prompt: PromptBuilder,
        skills_dir: PathBuf,
        config: AgentConfig,
    ) -> Self {
        Self {
            client,
            compiler: None,
            memory,
            registry,
            prompt: RwLock::new(prompt),
            skills_dir,
            config,
            thinking_enabled: Arc::new(AtomicBool::new(true)),
            current_cancel: Mutex::new(None),
            injected: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<LlmClient>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Share a thinking flag created before the agent (the toggle tool is
    /// registered against it during wiring).
    pub fn with_thinking_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.thinking_enabled = flag;
        self
    }

    /// Shared flag for the thinking-mode toggle tool.
    pub fn thinking_flag(&self) -> Arc<AtomicBool> {
        self.thinking_enabled.clone()
    }

    pub fn client(&self) -> &Arc<LlmClient> {
        &self.client
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn thinking_for_turn(&self) -> bool {
        match self.config.thinking_mode {
            ThinkingMode::Always => true,
            ThinkingMode::Never => false,
            ThinkingMode::Auto => self.thinking_enabled.load(Ordering::Relaxed),
        }
    }

    /// Run one full turn: prompt assembly → (optional) compilation → tool
    /// loop. `history` is the session's prior conversation as messages;
    /// `media` carries image/voice/document blocks for the user turn so
    /// capability routing sees them; `session` marks IM turns (which never
    /// see the active-task block).
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        history: Vec<Message>,
        user_text: &str,
        media: Vec<kestrel_llm::ContentBlock>,
        session: Option<&SessionInfo>,
    ) -> Result<String> {
        // Memory retrieval runs against the raw user text, before the
        // compiler reshapes it.
        let memory_context = self.memory.retrieve(user_text, false).await;

        // Skills are rescanned every turn so fresh installs appear at once.
        let skills = SkillRegistry::load_dir(&self.skills_dir);
        let system = {
            let builder = self.prompt.read().unwrap();
            builder.build(
                &skills.catalog(),
                &self.registry.catalog(),
                &memory_context,
                session,
                None,
            )
        };

        let final_text = match (&self.compiler, self.config.compile_prompts) {
            (Some(compiler), true) => compiler::compile_prompt(compiler, user_text).await,
            _ => user_text.to_string(),
        };

        let mut messages = history;
        if media.is_empty() {
            messages.push(Message::user(final_text));
        } else {
            let mut blocks = vec![kestrel_llm::ContentBlock::text(final_text)];
            blocks.extend(media);
            messages.push(Message::user_blocks(blocks));
        }
        messages = context::compress_messages(
            self.compiler.as_deref(),
            messages,
            self.config.context_budget_tokens,
            self.config.output_reserve_tokens,
        )
        .await;

        let request = LlmRequest {
            messages,
            system,
            tools: self.registry.specs(),
            max_tokens: self.config.max_tokens,
            temperature: 1.0,
            enable_thinking: self.thinking_for_turn(),
            conversation_id: Some(conversation_id.to_string()),
        };

        let cancel = CancellationToken::new();
        *self.current_cancel.lock().unwrap() = Some(cancel.clone());

        let cfg = ToolLoopConfig {
            client: &self.client,
            summarizer: self.compiler.as_deref(),
            registry: &self.registry,
            max_iterations: self.config.max_iterations,
            context_budget: self.config.context_budget_tokens,
            output_reserve: self.config.output_reserve_tokens,
            cancel: Some(cancel),
            injected: Some(self.injected.as_ref()),
        };
        let outcome = run_tool_loop(&cfg, request).await;
        *self.current_cancel.lock().unwrap() = None;

        let outcome = outcome?;
        info!(
            conversation = conversation_id,
            iterations = outcome.iterations,
            tools = outcome.called_tools.len(),
            "turn complete"
        );
        Ok(outcome.text)
    }

    /// Single-shot completion on the lightweight pool (classifier prompts,
    /// reminder gates). Falls back to the main pool when no compiler
    /// endpoints are configured.
    pub async fn classify(&self, prompt: &str) -> Result<String> {
        let client = self.compiler.as_deref().unwrap_or(self.client.as_ref());
        let req = LlmRequest {
            messages: vec![Message::user(prompt.to_string())],
            max_tokens: 64,
            temperature: 1.0,
            ..Default::default()
        };
        let resp = client.chat(&req).await?;
        Ok(resp.text())
    }

    // ------------------------------------------------------------------
    // Interrupt hooks — polled by the gateway when messages arrive
    // mid-execution.
    // ------------------------------------------------------------------

    pub fn is_stop_command(text: &str) -> bool {
        let t = text.trim().to_lowercase();
        STOP_COMMANDS.iter().any(|c| t == *c)
    }

    pub fn is_skip_command(text: &str) -> bool {
        let t = text.trim().to_lowercase();
        SKIP_COMMANDS.iter().any(|c| t == *c)
    }

    pub fn classify_interrupt(text: &str) -> InterruptKind {
        if Self::is_stop_command(text) {
            InterruptKind::Stop
        } else if Self::is_skip_command(text) {
            InterruptKind::Skip
        } else {
            InterruptKind::Message
        }
    }

    /// True while a turn is executing.
    pub fn is_busy(&self) -> bool {
        self.current_cancel.lock().unwrap().is_some()
    }

    /// Cancel the running turn at the next safe suspension point.
    pub fn cancel_current_task(&self) {
        if let Some(cancel) = self.current_cancel.lock().unwrap().as_ref() {
            info!("cancelling current turn");
            cancel.cancel();
        }
    }

    /// Ask the running turn to move past its current step. The note joins
    /// the conversation at the next loop boundary, where the model can act
    /// on it.
    pub fn skip_current_step(&self) {
        self.injected
            .lock()
            .unwrap()
            .push_back("[The user asked to skip the current step — move on.]".to_string());
    }

    /// Queue a user message into the running conversation; it joins at the
    /// next loop boundary.
    pub fn insert_user_message(&self, text: &str) {
        self.injected.lock().unwrap().push_back(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kestrel_core::identity::IdentityPack;
    use kestrel_llm::config::{ApiType, ClientSettings, EndpointConfig};
    use kestrel_llm::provider::{ChatTransport, Provider};
    use kestrel_llm::{ContentBlock, LlmError, LlmResponse, StopReason, Usage};
    use kestrel_memory::MemoryStore;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            name: "mock".into(),
            provider: "openai".into(),
            api_type: ApiType::OpenAi,
            base_url: "https://api.example.com/v1".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: "mock-model".into(),
            priority: 1,
            max_tokens: 0,
            context_window: 150_000,
            timeout: 180,
            capabilities: Some(vec!["text".into(), "tools".into()]),
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        }
    }

    /// Echoes whether the system prompt mentioned the session channel.
    struct Echo;

    #[async_trait]
    impl ChatTransport for Echo {
        async fn send(
            &self,
            _config: &EndpointConfig,
            req: &LlmRequest,
        ) -> std::result::Result<LlmResponse, LlmError> {
            let text = format!(
                "system_has_session={} user={}",
                req.system.contains("Channel: telegram"),
                req.messages.last().unwrap().content.plain_text()
            );
            Ok(LlmResponse {
                id: "r".into(),
                model: "mock-model".into(),
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                reasoning_content: None,
            })
        }
    }

    fn agent() -> Agent {
        let client = Arc::new(LlmClient::from_providers(
            vec![Provider::with_transport(endpoint(), Box::new(Echo))],
            ClientSettings::default(),
            None,
        ));
        let memory = Arc::new(MemoryManager::new(Arc::new(
            MemoryStore::open_in_memory().unwrap(),
        )));
        Agent::new(
            client,
            memory,
            Arc::new(ToolRegistry::new()),
            PromptBuilder::new(IdentityPack::default()),
            PathBuf::from("/nonexistent/skills"),
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn handle_turn_builds_prompt_and_returns_text() {
        let agent = agent();
        let info = SessionInfo {
            session_key: "telegram:42:7".into(),
            channel: "telegram".into(),
            turn_count: 1,
        };
        let reply = agent
            .handle_turn("telegram:42:7", Vec::new(), "hello there", Vec::new(), Some(&info))
            .await
            .unwrap();
        assert!(reply.contains("system_has_session=true"));
        assert!(reply.contains("user=hello there"));
    }

    #[test]
    fn interrupt_classification() {
        assert_eq!(Agent::classify_interrupt("/stop"), InterruptKind::Stop);
        assert_eq!(Agent::classify_interrupt("STOP"), InterruptKind::Stop);
        assert_eq!(Agent::classify_interrupt("/skip"), InterruptKind::Skip);
        assert_eq!(
            Agent::classify_interrupt("what about dinner"),
            InterruptKind::Message
        );
    }

    #[tokio::test]
    async fn injected_messages_queue_until_drained() {
        let agent = agent();
        agent.insert_user_message("also check the weather");
        assert_eq!(agent.injected.lock().unwrap().len(), 1);
        // A skip request queues its own note.
        agent.skip_current_step();
        assert_eq!(agent.injected.lock().unwrap().len(), 2);
    }
}
