//! The adapter contract every IM channel implements.
//!
//! Wire-level protocol code (Telegram long-polling, Feishu webhooks,
//! OneBot websockets, …) lives out of tree; this trait is the boundary the
//! gateway owns. Optional capabilities downgrade explicitly: the default
//! `send_image`/`send_voice` deliver through `send_file`, so an adapter
//! only overrides what its platform genuinely supports.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase channel tag ("telegram", "feishu", …); unique
    /// across all registered adapters.
    fn name(&self) -> &str;

    /// Own the connection: webhook server, long-polling loop, or websocket.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;

    async fn send_file(&self, chat_id: &str, path: &Path, caption: &str) -> Result<()>;

    /// Platforms without a native image message deliver it as a file.
    async fn send_image(&self, chat_id: &str, path: &Path, caption: &str) -> Result<()> {
        self.send_file(chat_id, path, caption).await
    }

    /// Platforms without a native voice message deliver it as a file.
    async fn send_voice(&self, chat_id: &str, path: &Path, caption: &str) -> Result<()> {
        self.send_file(chat_id, path, caption).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted adapter for gateway tests.

    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::ChannelAdapter;
    use crate::error::Result;

    #[derive(Default)]
    pub struct MockAdapter {
        pub name: String,
        pub running: AtomicBool,
        pub sent_texts: Mutex<Vec<(String, String)>>,
        pub sent_files: Mutex<Vec<(String, String)>>,
    }

    impl MockAdapter {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for MockAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent_texts
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_file(&self, chat_id: &str, path: &Path, _caption: &str) -> Result<()> {
            self.sent_files
                .lock()
                .unwrap()
                .push((chat_id.to_string(), path.display().to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_image_send_downgrades_to_file() {
        let adapter = MockAdapter::new("mock");
        adapter
            .send_image("42", Path::new("/tmp/pic.png"), "a picture")
            .await
            .unwrap();
        let files = adapter.sent_files.lock().unwrap();
        assert_eq!(files.as_slice(), &[("42".to_string(), "/tmp/pic.png".to_string())]);
    }
}
