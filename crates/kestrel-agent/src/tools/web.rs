//! `web_fetch` — fetch a URL and return readable text.

use std::time::Duration;

use async_trait::async_trait;

use super::{Tool, ToolResult};

const MAX_OUTPUT_CHARS: usize = 20_000;
const FETCH_TIMEOUT_SECS: u64 = 30;

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .user_agent("kestrel-agent/0.2")
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return its text content. HTML is \
         converted to plain text."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The http(s) URL to fetch." }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(url) = input.get("url").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: url");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::error("only http(s) URLs are supported");
        }

        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("fetch failed: {e}")),
        };
        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("failed to read body: {e}")),
        };

        let text = if content_type.contains("text/html") {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };

        let mut out = format!("[{status}] {url}\n\n{text}");
        if out.len() > MAX_OUTPUT_CHARS {
            let mut cut = MAX_OUTPUT_CHARS;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out = format!("{}\n\n[truncated]", &out[..cut]);
        }
        ToolResult::success(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let result = WebFetchTool::new()
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await;
        assert!(result.is_error);
    }
}
