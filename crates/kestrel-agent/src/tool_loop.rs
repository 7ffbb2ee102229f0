//! The reason-act loop.
//!
//! Call the LLM, execute any tool calls concurrently, reassemble their
//! results in the original `tool_use` order, append, repeat. The loop exits
//! when the model returns no tool calls or stops with `end_turn`, when the
//! (deliberately generous) iteration cap is hit, or when cancelled.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kestrel_llm::{ContentBlock, LlmClient, LlmRequest, Message, StopReason};

use crate::context;
use crate::error::{AgentError, Result};
use crate::tools::{ToolRegistry, ToolResult};

pub struct ToolLoopConfig<'a> {
    pub client: &'a LlmClient,
    /// Lightweight pool for history summarization; `None` uses the digest
    /// fallback.
    pub summarizer: Option<&'a LlmClient>,
    pub registry: &'a ToolRegistry,
    pub max_iterations: usize,
    pub context_budget: usize,
    pub output_reserve: usize,
    pub cancel: Option<CancellationToken>,
    /// Messages inserted mid-run by the gateway; drained at loop boundaries.
    pub injected: Option<&'a Mutex<VecDeque<String>>>,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub text: String,
    pub iterations: usize,
    pub called_tools: Vec<String>,
}

pub async fn run_tool_loop(
    cfg: &ToolLoopConfig<'_>,
    mut request: LlmRequest,
) -> Result<ToolLoopOutcome> {
    let mut called_tools: Vec<String> = Vec::new();

    for iteration in 0..cfg.max_iterations {
        if let Some(cancel) = &cfg.cancel {
            if cancel.is_cancelled() {
                info!(iteration, "tool loop cancelled");
                return Err(AgentError::Cancelled);
            }
        }

        // Proactive compression before every call.
        if context::needs_compression(&request.messages, cfg.context_budget) {
            request.messages = context::compress_messages(
                cfg.summarizer,
                std::mem::take(&mut request.messages),
                cfg.context_budget,
                cfg.output_reserve,
            )
            .await;
        }

        debug!(iteration, messages = request.messages.len(), "tool loop iteration");
        let response = cfg.client.chat(&request).await?;

        // The produced text is discarded on cancellation — the user asked
        // us to stop, not to dump partial output.
        if let Some(cancel) = &cfg.cancel {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }

        let tool_calls: Vec<(String, String, serde_json::Value)> = response
            .tool_calls()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        if tool_calls.is_empty() || response.stop_reason == StopReason::EndTurn {
            return Ok(ToolLoopOutcome {
                text: response.text(),
                iterations: iteration + 1,
                called_tools,
            });
        }

        // Append the assistant turn verbatim — block order (thinking
        // included) must survive for interleaved-thinking models.
        request
            .messages
            .push(Message::assistant_blocks(response.content.clone()));

        // Execute every call concurrently; join_all keeps input order, so
        // results line up with the tool_use ids.
        let executions = tool_calls.iter().map(|(_, name, input)| {
            let registry = cfg.registry;
            let name = name.clone();
            let input = input.clone();
            async move {
                match registry.get(&name) {
                    Some(tool) => tool.execute(input).await,
                    None => ToolResult::error(format!("unknown tool: {name}")),
                }
            }
        });
        let results = join_all(executions).await;

        let mut result_blocks = Vec::with_capacity(results.len());
        for ((id, name, _), result) in tool_calls.iter().zip(results) {
            if result.is_error {
                warn!(tool = %name, "tool returned error result");
            }
            called_tools.push(name.clone());
            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: result.content,
                is_error: result.is_error,
            });
        }
        request.messages.push(Message::user_blocks(result_blocks));

        // User messages injected mid-run join the conversation here, between
        // iterations, where the model can actually react to them.
        if let Some(injected) = cfg.injected {
            let mut queue = injected.lock().unwrap();
            while let Some(text) = queue.pop_front() {
                request.messages.push(Message::user(text));
            }
        }
    }

    warn!(max_iterations = cfg.max_iterations, "tool loop hit the iteration cap");
    Ok(ToolLoopOutcome {
        text: format!(
            "(stopped after {} iterations without a final answer)",
            cfg.max_iterations
        ),
        iterations: cfg.max_iterations,
        called_tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use kestrel_llm::config::{ApiType, ClientSettings, EndpointConfig};
    use kestrel_llm::provider::{ChatTransport, Provider};
    use kestrel_llm::{LlmError, LlmResponse, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

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

    /// First call returns three tool calls, second call returns plain text.
    struct TwoStep {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatTransport for TwoStep {
        async fn send(
            &self,
            _config: &EndpointConfig,
            req: &LlmRequest,
        ) -> std::result::Result<LlmResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(LlmResponse {
                    id: "r1".into(),
                    model: "mock-model".into(),
                    content: vec![
                        ContentBlock::text("running three tools"),
                        ContentBlock::ToolUse {
                            id: "tu_1".into(),
                            name: "write_note".into(),
                            input: serde_json::json!({"n": 1}),
                        },
                        ContentBlock::ToolUse {
                            id: "tu_2".into(),
                            name: "run_thing".into(),
                            input: serde_json::json!({"n": 2}),
                        },
                        ContentBlock::ToolUse {
                            id: "tu_3".into(),
                            name: "read_note".into(),
                            input: serde_json::json!({"n": 3}),
                        },
                    ],
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                    reasoning_content: None,
                })
            } else {
                // Verify the previous user message carries the results in
                // tool_use order.
                let last = req.messages.last().expect("tool results appended");
                let ids: Vec<&str> = last
                    .content
                    .blocks()
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(ids, vec!["tu_1", "tu_2", "tu_3"]);
                Ok(LlmResponse {
                    id: "r2".into(),
                    model: "mock-model".into(),
                    content: vec![ContentBlock::text("all done")],
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                    reasoning_content: None,
                })
            }
        }
    }

    /// Sleeps briefly so overlap is observable, then echoes its name.
    struct SlowTool {
        name: &'static str,
        running: Arc<AtomicU32>,
        max_running: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "slow"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            ToolResult::success(self.name)
        }
    }

    #[tokio::test]
    async fn multi_tool_turn_runs_concurrently_and_in_order() {
        let client = LlmClient::from_providers(
            vec![Provider::with_transport(
                endpoint(),
                Box::new(TwoStep {
                    calls: AtomicU32::new(0),
                }),
            )],
            ClientSettings::default(),
            None,
        );

        let running = Arc::new(AtomicU32::new(0));
        let max_running = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        for name in ["write_note", "run_thing", "read_note"] {
            registry
                .register(Arc::new(SlowTool {
                    name,
                    running: running.clone(),
                    max_running: max_running.clone(),
                }))
                .unwrap();
        }

        let cfg = ToolLoopConfig {
            client: &client,
            summarizer: None,
            registry: &registry,
            max_iterations: 10,
            context_budget: 100_000,
            output_reserve: 1_000,
            cancel: None,
            injected: None,
        };
        let request = LlmRequest::new(vec![Message::user("do the three things")]);
        let outcome = run_tool_loop(&cfg, request).await.unwrap();

        assert_eq!(outcome.text, "all done");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.called_tools, vec!["write_note", "run_thing", "read_note"]);
        // All three handlers overlapped at some point.
        assert_eq!(max_running.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result_not_abort() {
        struct OneCall {
            calls: AtomicU32,
        }
        #[async_trait]
        impl ChatTransport for OneCall {
            async fn send(
                &self,
                _config: &EndpointConfig,
                req: &LlmRequest,
            ) -> std::result::Result<LlmResponse, LlmError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(LlmResponse {
                        id: "r1".into(),
                        model: "mock-model".into(),
                        content: vec![ContentBlock::ToolUse {
                            id: "tu_1".into(),
                            name: "nope".into(),
                            input: serde_json::json!({}),
                        }],
                        stop_reason: StopReason::ToolUse,
                        usage: Usage::default(),
                        reasoning_content: None,
                    })
                } else {
                    let last = req.messages.last().unwrap();
                    let has_error = last.content.blocks().iter().any(|b| {
                        matches!(b, ContentBlock::ToolResult { is_error: true, .. })
                    });
                    assert!(has_error, "missing tool must surface as is_error");
                    Ok(LlmResponse {
                        id: "r2".into(),
                        model: "mock-model".into(),
                        content: vec![ContentBlock::text("recovered")],
                        stop_reason: StopReason::EndTurn,
                        usage: Usage::default(),
                        reasoning_content: None,
                    })
                }
            }
        }

        let client = LlmClient::from_providers(
            vec![Provider::with_transport(
                endpoint(),
                Box::new(OneCall {
                    calls: AtomicU32::new(0),
                }),
            )],
            ClientSettings::default(),
            None,
        );
        let registry = ToolRegistry::new();
        let cfg = ToolLoopConfig {
            client: &client,
            summarizer: None,
            registry: &registry,
            max_iterations: 5,
            context_budget: 100_000,
            output_reserve: 1_000,
            cancel: None,
            injected: None,
        };
        let outcome = run_tool_loop(&cfg, LlmRequest::new(vec![Message::user("go")]))
            .await
            .unwrap();
        assert_eq!(outcome.text, "recovered");
    }

    #[tokio::test]
    async fn cancellation_discards_output() {
        struct Endless;
        #[async_trait]
        impl ChatTransport for Endless {
            async fn send(
                &self,
                _config: &EndpointConfig,
                _req: &LlmRequest,
            ) -> std::result::Result<LlmResponse, LlmError> {
                Ok(LlmResponse {
                    id: "r".into(),
                    model: "mock-model".into(),
                    content: vec![ContentBlock::ToolUse {
                        id: "tu".into(),
                        name: "noop".into(),
                        input: serde_json::json!({}),
                    }],
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                    reasoning_content: None,
                })
            }
        }
        struct Noop;
        #[async_trait]
        impl Tool for Noop {
            fn name(&self) -> &str {
                "noop"
            }
            fn description(&self) -> &str {
                "noop"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _input: serde_json::Value) -> ToolResult {
                ToolResult::success("ok")
            }
        }

        let client = LlmClient::from_providers(
            vec![Provider::with_transport(endpoint(), Box::new(Endless))],
            ClientSettings::default(),
            None,
        );
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = ToolLoopConfig {
            client: &client,
            summarizer: None,
            registry: &registry,
            max_iterations: 100,
            context_budget: 100_000,
            output_reserve: 1_000,
            cancel: Some(cancel),
            injected: None,
        };
        let err = run_tool_loop(&cfg, LlmRequest::new(vec![Message::user("go")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
