//! The fan-in/fan-out hub.
//!
//! Every inbound message resolves to exactly one session; messages for the
//! same session are processed strictly in arrival order by a per-session
//! worker, while different sessions run concurrently. Command prefixes
//! (`/model`, `/restore`, `/stop`, `/skip`) are intercepted before queueing
//! and never reach the LLM.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kestrel_agent::{im_context, Agent, AgentError, ImContext, SessionInfo};
use kestrel_llm::{ContentBlock, LlmClient, Message, Role, SttClient};
use kestrel_memory::MemoryManager;
use kestrel_scheduler::executor::chunk_message;
use kestrel_scheduler::MessageSink;
use kestrel_sessions::{SessionKey, SessionManager};

use crate::adapter::ChannelAdapter;
use crate::error::{GatewayError, Result};
use crate::types::InboundMessage;

/// Telegram caps messages at 4096; stay under it with margin on every
/// platform.
const MAX_MESSAGE_CHARS: usize = 3500;
/// Per-session inbound queue depth; beyond this the adapter's message is
/// dropped with a warning rather than blocking its event loop.
const WORKER_QUEUE_DEPTH: usize = 32;

pub struct Gateway {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    sessions: Arc<SessionManager>,
    agent: Arc<Agent>,
    memory: Arc<MemoryManager>,
    client: Arc<LlmClient>,
    stt: Option<Arc<SttClient>>,
    workers: DashMap<SessionKey, mpsc::Sender<InboundMessage>>,
    model_switch_hours: f64,
    /// Back-reference for spawned workers and the IM-context sink.
    self_ref: Weak<Gateway>,
}

impl Gateway {
    pub fn new(
        sessions: Arc<SessionManager>,
        agent: Arc<Agent>,
        memory: Arc<MemoryManager>,
        client: Arc<LlmClient>,
        stt: Option<Arc<SttClient>>,
        model_switch_hours: f64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            adapters: RwLock::new(HashMap::new()),
            sessions,
            agent,
            memory,
            client,
            stt,
            workers: DashMap::new(),
            model_switch_hours,
            self_ref: weak.clone(),
        })
    }

    /// A method running on `&self` implies a live Arc upstream.
    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("gateway dropped mid-call")
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------

    /// Register an adapter; replaces any previous adapter with the same
    /// channel tag.
    pub fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        info!(channel = %name, "registering channel adapter");
        self.adapters.write().unwrap().insert(name, adapter);
    }

    pub fn get_adapter(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().unwrap().get(channel).cloned()
    }

    /// Start every adapter. A failing adapter is logged and skipped — the
    /// rest keep running.
    pub async fn start_adapters(&self) {
        let adapters: Vec<_> = self.adapters.read().unwrap().values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.start().await {
                error!(channel = adapter.name(), error = %e, "adapter failed to start");
            }
        }
    }

    pub async fn stop_adapters(&self) {
        let adapters: Vec<_> = self.adapters.read().unwrap().values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.stop().await {
                warn!(channel = adapter.name(), error = %e, "adapter failed to stop");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Entry point adapters call for every inbound message.
    ///
    /// Commands are answered inline (they must work even while a turn is
    /// executing); everything else is queued to the session's worker so
    /// ordering within one chat is strictly arrival order.
    pub async fn handle_inbound(&self, msg: InboundMessage) {
        let key = SessionKey::new(&msg.channel, &msg.chat_id, &msg.user_id);

        if let Some(reply) = self.intercept_command(&key, msg.text.trim()).await {
            self.deliver_text(&msg.channel, &msg.chat_id, &reply).await;
            return;
        }

        let tx = self
            .workers
            .entry(key.clone())
            .or_insert_with(|| self.spawn_worker(key.clone()))
            .clone();
        if tx.try_send(msg).is_err() {
            warn!(key = %key, "session queue full, message dropped");
        }
    }

    fn spawn_worker(&self, key: SessionKey) -> mpsc::Sender<InboundMessage> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(WORKER_QUEUE_DEPTH);
        let gateway = self.arc();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                gateway.process_message(&key, msg).await;
            }
            debug!(key = %key, "session worker exited");
        });
        tx
    }

    /// One full turn for one inbound message.
    async fn process_message(&self, key: &SessionKey, mut msg: InboundMessage) {
        // (a) resolve or create the session.
        let session = self.sessions.get_or_create(key);

        // (b) voice transcription; on failure the `[voice: Ns]` marker stays.
        self.transcribe_voices(&mut msg).await;

        // (c) decorate session metadata for the IM tools.
        let (history, turn_count) = {
            let mut s = session.lock().unwrap();
            if !msg.images.is_empty() {
                s.set_meta("pending_images", serde_json::json!(&msg.images));
            }
            if !msg.voices.is_empty() {
                s.set_meta("pending_voices", serde_json::json!(&msg.voices));
            }
            s.set_meta("_current_message", serde_json::json!(&msg));

            let history: Vec<Message> = s
                .history
                .iter()
                .map(|t| Message {
                    role: if t.role == "assistant" {
                        Role::Assistant
                    } else {
                        Role::User
                    },
                    content: t.content.clone().into(),
                    reasoning_content: None,
                })
                .collect();
            s.append("user", &msg.text);
            (history, s.history.len() as u32)
        };

        let media = load_media_blocks(&msg);
        let info = SessionInfo {
            session_key: key.format(),
            channel: key.channel.clone(),
            turn_count,
        };

        // (e) run the agent inside the session's IM context.
        let ctx = ImContext {
            session: session.clone(),
            sink: self.arc() as Arc<dyn MessageSink>,
        };
        let agent = Arc::clone(&self.agent);
        let conversation_id = key.format();
        let text = msg.text.clone();
        let result = im_context::with_im_context(ctx, async move {
            agent
                .handle_turn(&conversation_id, history, &text, media, Some(&info))
                .await
        })
        .await;

        // (f) fan the reply back out through the originating adapter.
        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                self.deliver_text(&key.channel, &key.chat_id, &reply).await;
                session.lock().unwrap().append("assistant", &reply);
                self.memory
                    .record_turn(&key.format(), "user", &msg.text, None, None);
                self.memory
                    .record_turn(&key.format(), "assistant", &reply, None, None);
                // Drain a few queued extractions off the hot path.
                let memory = Arc::clone(&self.memory);
                tokio::spawn(async move {
                    memory.process_extraction_queue(4).await;
                });
            }
            Ok(_) => {
                debug!(key = %key, "agent returned empty reply, nothing sent");
                self.memory
                    .record_turn(&key.format(), "user", &msg.text, None, None);
            }
            Err(AgentError::Cancelled) => {
                // `/stop` discards the produced text.
                info!(key = %key, "turn cancelled, output discarded");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "agent turn failed");
                self.deliver_text(
                    &key.channel,
                    &key.chat_id,
                    &format!("⚠️ Something went wrong: {e}"),
                )
                .await;
            }
        }
    }

    async fn transcribe_voices(&self, msg: &mut InboundMessage) {
        let Some(stt) = &self.stt else { return };
        for voice in &msg.voices {
            match stt.transcribe(std::path::Path::new(&voice.local_path)).await {
                Ok(transcript) if !transcript.is_empty() => {
                    let marker = format!("[voice: {}s]", voice.duration_s);
                    if msg.text.contains(&marker) {
                        msg.text = msg.text.replace(&marker, &transcript);
                    } else if msg.text.is_empty() {
                        msg.text = transcript;
                    } else {
                        msg.text.push_str(&format!("\n[voice transcript] {transcript}"));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Marker stays — the agent can still respond meaningfully.
                    warn!(path = %voice.local_path, error = %e, "transcription failed");
                    if msg.text.is_empty() {
                        msg.text = format!("[voice: {}s]", voice.duration_s);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Command interception — never forwarded to the LLM
    // ------------------------------------------------------------------

    async fn intercept_command(&self, key: &SessionKey, text: &str) -> Option<String> {
        if text == "/restore" {
            return Some(self.client.clear_conversation_override(&key.format()));
        }
        if text == "/stop" {
            self.agent.cancel_current_task();
            return Some("⏹ stopped".to_string());
        }
        if text == "/skip" {
            self.agent.skip_current_step();
            return Some("⏭ skipping the current step".to_string());
        }
        if text == "/model" {
            let lines: Vec<String> = self
                .client
                .list_models()
                .into_iter()
                .map(|m| {
                    format!(
                        "{}{} — {} [{}]",
                        if m.is_current { "→ " } else { "  " },
                        m.name,
                        m.model,
                        if m.is_healthy { "healthy" } else { "cooling" },
                    )
                })
                .collect();
            return Some(format!("Available endpoints:\n{}", lines.join("\n")));
        }
        if let Some(name) = text.strip_prefix("/model ") {
            let reply = match self.client.set_conversation_override(
                &key.format(),
                name.trim(),
                self.model_switch_hours,
                "user request",
            ) {
                Ok(msg) => msg,
                // Cooldown remaining, unknown endpoint — a sentence, not a
                // stack.
                Err(e) => e.to_string(),
            };
            return Some(reply);
        }
        None
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send text through the channel's adapter, chunked to platform-safe
    /// sizes.
    pub async fn deliver_text(&self, channel: &str, chat_id: &str, text: &str) {
        let Some(adapter) = self.get_adapter(channel) else {
            warn!(channel, "no adapter for outbound message");
            return;
        };
        for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = adapter.send_text(chat_id, &chunk).await {
                error!(channel, chat_id, error = %e, "outbound send failed");
                return;
            }
        }
    }

    /// System push into an existing session (daily self-check report).
    /// The pushed text is recorded in the session history as a system role.
    pub async fn send_to_session(&self, key: &SessionKey, text: &str) {
        self.deliver_text(&key.channel, &key.chat_id, text).await;
        if let Some(session) = self.sessions.get(key) {
            session.lock().unwrap().append("system", text);
        }
    }

    /// Spawn the idle sweeper: closes and archives sessions past the idle
    /// timeout, and drops their workers.
    pub fn spawn_idle_sweeper(&self, every_secs: u64) {
        let gateway = self.arc();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(every_secs.max(10)));
            loop {
                interval.tick().await;
                for key in gateway.sessions.sweep_idle() {
                    gateway.workers.remove(&key);
                }
            }
        });
    }
}

/// Scheduler notifications and the `send_to_chat` tool deliver through the
/// same adapters as chat replies.
#[async_trait]
impl MessageSink for Gateway {
    async fn send_text(
        &self,
        channel: &str,
        chat_id: &str,
        text: &str,
    ) -> std::result::Result<(), String> {
        let adapter = self
            .get_adapter(channel)
            .ok_or_else(|| format!("no adapter for channel {channel}"))?;
        for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
            adapter
                .send_text(chat_id, &chunk)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Read image attachments into base64 content blocks. Unreadable files are
/// skipped — the path stays available to tools via session metadata.
fn load_media_blocks(msg: &InboundMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for image in &msg.images {
        match std::fs::read(&image.local_path) {
            Ok(bytes) => blocks.push(ContentBlock::Image {
                media_type: image.media_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            Err(e) => debug!(path = %image.local_path, error = %e, "image not readable, skipping block"),
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use kestrel_agent::{PromptBuilder, ToolRegistry};
    use kestrel_core::config::AgentConfig;
    use kestrel_core::identity::IdentityPack;
    use kestrel_llm::config::{ApiType, ClientSettings, EndpointConfig};
    use kestrel_llm::provider::{ChatTransport, Provider};
    use kestrel_llm::{LlmError, LlmRequest, LlmResponse, StopReason, Usage};
    use kestrel_memory::MemoryStore;

    fn endpoint(name: &str, priority: i32) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            provider: "openai".into(),
            api_type: ApiType::OpenAi,
            base_url: "https://api.example.com/v1".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: format!("{name}-model"),
            priority,
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

    /// Replies with "echo: <text>".
    struct EchoTransport;

    #[async_trait]
    impl ChatTransport for EchoTransport {
        async fn send(
            &self,
            _config: &EndpointConfig,
            req: &LlmRequest,
        ) -> std::result::Result<LlmResponse, LlmError> {
            let text = req
                .messages
                .last()
                .map(|m| m.content.plain_text())
                .unwrap_or_default();
            Ok(LlmResponse {
                id: "r".into(),
                model: "echo".into(),
                content: vec![ContentBlock::text(format!("echo: {text}"))],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                reasoning_content: None,
            })
        }
    }

    fn gateway() -> (Arc<Gateway>, Arc<MockAdapter>) {
        let client = Arc::new(LlmClient::from_providers(
            vec![
                Provider::with_transport(endpoint("a", 1), Box::new(EchoTransport)),
                Provider::with_transport(endpoint("b", 2), Box::new(EchoTransport)),
            ],
            ClientSettings::default(),
            None,
        ));
        let memory = Arc::new(MemoryManager::new(Arc::new(
            MemoryStore::open_in_memory().unwrap(),
        )));
        let agent = Arc::new(Agent::new(
            client.clone(),
            memory.clone(),
            Arc::new(ToolRegistry::new()),
            PromptBuilder::new(IdentityPack::default()),
            std::path::PathBuf::from("/nonexistent"),
            AgentConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(50, 1800));
        let gateway = Gateway::new(sessions, agent, memory, client, None, 12.0);

        let adapter = Arc::new(MockAdapter::new("telegram"));
        gateway.register_adapter(adapter.clone());
        (gateway, adapter)
    }

    async fn drain(_gateway: &Arc<Gateway>) {
        // Give the session workers a beat to finish their queues.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn inbound_message_round_trips_to_adapter() {
        let (gateway, adapter) = gateway();
        gateway
            .handle_inbound(InboundMessage::text_only("telegram", "42", "7", "hello"))
            .await;
        drain(&gateway).await;

        let sent = adapter.sent_texts.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "42");
        assert_eq!(sent[0].1, "echo: hello");

        // History carries both sides now.
        let key = SessionKey::new("telegram", "42", "7");
        let session = gateway.sessions.get(&key).unwrap();
        assert_eq!(session.lock().unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn messages_in_one_session_stay_ordered() {
        let (gateway, adapter) = gateway();
        for i in 0..5 {
            gateway
                .handle_inbound(InboundMessage::text_only(
                    "telegram",
                    "42",
                    "7",
                    format!("msg {i}"),
                ))
                .await;
        }
        drain(&gateway).await;

        let sent = adapter.sent_texts.lock().unwrap().clone();
        let texts: Vec<&str> = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec!["echo: msg 0", "echo: msg 1", "echo: msg 2", "echo: msg 3", "echo: msg 4"]
        );
    }

    #[tokio::test]
    async fn model_command_is_intercepted_not_forwarded() {
        let (gateway, adapter) = gateway();
        gateway
            .handle_inbound(InboundMessage::text_only("telegram", "42", "7", "/model b"))
            .await;
        drain(&gateway).await;

        let sent = adapter.sent_texts.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("b"), "override reply expected: {}", sent[0].1);
        // No session was created — the command never reached the agent.
        assert!(gateway
            .sessions
            .get(&SessionKey::new("telegram", "42", "7"))
            .is_none());

        // /restore clears it.
        gateway
            .handle_inbound(InboundMessage::text_only("telegram", "42", "7", "/restore"))
            .await;
        drain(&gateway).await;
        let sent = adapter.sent_texts.lock().unwrap().clone();
        assert!(sent[1].1.contains("override cleared"));
    }

    #[tokio::test]
    async fn unknown_channel_outbound_is_swallowed() {
        let (gateway, _) = gateway();
        // Does not panic, returns an error string through the sink API.
        let err = MessageSink::send_text(gateway.as_ref(), "feishu", "1", "hi")
            .await
            .unwrap_err();
        assert!(err.contains("no adapter"));
    }

    #[tokio::test]
    async fn long_replies_are_chunked() {
        let (gateway, adapter) = gateway();
        let long = "y".repeat(8000);
        gateway.deliver_text("telegram", "42", &long).await;
        let sent = adapter.sent_texts.lock().unwrap().clone();
        assert!(sent.len() >= 3);
        assert!(sent.iter().all(|(_, t)| t.len() <= MAX_MESSAGE_CHARS));
    }
}
