//! Task-local IM context.
//!
//! Tools like `send_to_chat` and `get_chat_history` need to know which
//! session and gateway the current agent run belongs to. A process-wide
//! global would bleed across concurrent sessions; task-local storage scopes
//! the context to one agent run, including scheduler-driven virtual
//! sessions.

use std::future::Future;
use std::sync::{Arc, Mutex};

use kestrel_scheduler::MessageSink;
use kestrel_sessions::Session;

#[derive(Clone)]
pub struct ImContext {
    pub session: Arc<Mutex<Session>>,
    pub sink: Arc<dyn MessageSink>,
}

tokio::task_local! {
    static IM_CONTEXT: ImContext;
}

/// Run `fut` with `ctx` visible to every tool call inside it.
pub async fn with_im_context<F>(ctx: ImContext, fut: F) -> F::Output
where
    F: Future,
{
    IM_CONTEXT.scope(ctx, fut).await
}

/// The context of the current run, if any. Outside an IM-bound run (CLI,
/// bare scheduler classification) this is `None` and IM tools refuse.
pub fn current() -> Option<ImContext> {
    IM_CONTEXT.try_with(|c| c.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kestrel_sessions::SessionKey;

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send_text(
            &self,
            _channel: &str,
            _chat_id: &str,
            _text: &str,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn context_is_scoped_to_the_task() {
        assert!(current().is_none());

        let ctx = ImContext {
            session: Arc::new(Mutex::new(Session::new(
                SessionKey::new("telegram", "1", "1"),
                10,
            ))),
            sink: Arc::new(NullSink),
        };
        with_im_context(ctx, async {
            let got = current().expect("context visible inside scope");
            assert_eq!(got.session.lock().unwrap().key.channel, "telegram");
        })
        .await;

        assert!(current().is_none());
    }
}
