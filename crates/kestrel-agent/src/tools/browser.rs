//! Browser automation over the Chrome DevTools Protocol.
//!
//! One shared [`BrowserSession`] owns the launched browser and its current
//! page; the `browser_*` tools drive it: open, navigate, click, type,
//! read content, screenshot, run JS, scroll, close. The browser launches
//! lazily on `browser_open` and survives across turns so multi-step flows
//! (log in, then navigate, then extract) keep their state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{Tool, ToolResult};

const NO_BROWSER_HINT: &str = "browser is not running — call browser_open first";
/// Page text returned to the LLM is capped like every other tool output.
const MAX_CONTENT_CHARS: usize = 20_000;

struct ActiveBrowser {
    browser: Browser,
    page: Page,
    handler: tokio::task::JoinHandle<()>,
}

/// The process-wide browser handle shared by all `browser_*` tools.
pub struct BrowserSession {
    active: tokio::sync::Mutex<Option<ActiveBrowser>>,
    screenshot_dir: PathBuf,
}

impl BrowserSession {
    pub fn new(screenshot_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            active: tokio::sync::Mutex::new(None),
            screenshot_dir,
        })
    }

    /// Launch the browser if it is not already up. Headless by default;
    /// `visible` attaches a window for flows that need a human watching.
    async fn open(&self, visible: bool) -> std::result::Result<String, String> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Ok("browser is already running".to_string());
        }

        let mut builder = BrowserConfig::builder();
        if visible {
            builder = builder.with_head();
        }
        let config = builder.build()?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| format!("browser launch failed: {e}"))?;
        // The handler stream must be polled for the CDP connection to make
        // progress; it ends when the browser goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| format!("cannot open initial page: {e}"))?;

        *guard = Some(ActiveBrowser {
            browser,
            page,
            handler: handler_task,
        });
        Ok(format!(
            "browser started ({})",
            if visible { "visible" } else { "headless" }
        ))
    }

    /// The current page, or the "open first" hint.
    async fn page(&self) -> std::result::Result<Page, String> {
        let guard = self.active.lock().await;
        guard
            .as_ref()
            .map(|a| a.page.clone())
            .ok_or_else(|| NO_BROWSER_HINT.to_string())
    }

    async fn close(&self) -> String {
        let mut guard = self.active.lock().await;
        match guard.take() {
            Some(mut active) => {
                if let Err(e) = active.browser.close().await {
                    warn!(error = %e, "browser close reported an error");
                }
                active.handler.abort();
                "browser closed".to_string()
            }
            None => "browser was not running".to_string(),
        }
    }

    async fn status(&self) -> String {
        let guard = self.active.lock().await;
        match guard.as_ref() {
            None => "browser is not running".to_string(),
            Some(active) => {
                let url = active
                    .page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "about:blank".to_string());
                let title = active.page.get_title().await.ok().flatten().unwrap_or_default();
                format!("browser running — url: {url}, title: {title}")
            }
        }
    }
}

fn cap_output(mut text: String) -> String {
    if text.len() > MAX_CONTENT_CHARS {
        let mut cut = MAX_CONTENT_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n\n[truncated]");
    }
    text
}

pub struct BrowserOpenTool {
    session: Arc<BrowserSession>,
}

impl BrowserOpenTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserOpenTool {
    fn name(&self) -> &str {
        "browser_open"
    }

    fn description(&self) -> &str {
        "Start the automation browser (headless unless visible=true). \
         Required before any other browser_* tool."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "visible": { "type": "boolean", "description": "Show a window (default false)." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let visible = input.get("visible").and_then(|v| v.as_bool()).unwrap_or(false);
        match self.session.open(visible).await {
            Ok(msg) => ToolResult::success(msg),
            Err(e) => ToolResult::error(e),
        }
    }
}

pub struct BrowserNavigateTool {
    session: Arc<BrowserSession>,
}

impl BrowserNavigateTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserNavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    fn description(&self) -> &str {
        "Navigate the browser to a URL and wait for the page to load."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The http(s) URL to open." }
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
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if let Err(e) = page.goto(url).await {
            return ToolResult::error(format!("navigation failed: {e}"));
        }
        let _ = page.wait_for_navigation().await;
        let title = page.get_title().await.ok().flatten().unwrap_or_default();
        ToolResult::success(format!("opened {url} — {title}"))
    }
}

pub struct BrowserClickTool {
    session: Arc<BrowserSession>,
}

impl BrowserClickTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserClickTool {
    fn name(&self) -> &str {
        "browser_click"
    }

    fn description(&self) -> &str {
        "Click the element matching a CSS selector."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "selector": { "type": "string", "description": "CSS selector of the element." }
            },
            "required": ["selector"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(selector) = input.get("selector").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: selector");
        };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        let element = match page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => {
                return ToolResult::error(format!(
                    "no element for '{selector}': {e} — browser_screenshot or \
                     browser_get_content can help find the right selector"
                ))
            }
        };
        match element.click().await {
            Ok(_) => ToolResult::success(format!("clicked {selector}")),
            Err(e) => ToolResult::error(format!("click failed: {e}")),
        }
    }
}

pub struct BrowserTypeTool {
    session: Arc<BrowserSession>,
}

impl BrowserTypeTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserTypeTool {
    fn name(&self) -> &str {
        "browser_type"
    }

    fn description(&self) -> &str {
        "Type text into the element matching a CSS selector (clicks it first)."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "selector": { "type": "string", "description": "CSS selector of the input." },
                "text": { "type": "string", "description": "Text to type." }
            },
            "required": ["selector", "text"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(selector) = input.get("selector").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: selector");
        };
        let Some(text) = input.get("text").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: text");
        };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        let element = match page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => return ToolResult::error(format!("no element for '{selector}': {e}")),
        };
        if let Err(e) = element.click().await {
            return ToolResult::error(format!("focus click failed: {e}"));
        }
        match element.type_str(text).await {
            Ok(_) => ToolResult::success(format!("typed {} chars into {selector}", text.len())),
            Err(e) => ToolResult::error(format!("typing failed: {e}")),
        }
    }
}

pub struct BrowserGetContentTool {
    session: Arc<BrowserSession>,
}

impl BrowserGetContentTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserGetContentTool {
    fn name(&self) -> &str {
        "browser_get_content"
    }

    fn description(&self) -> &str {
        "Read the current page as text (default) or raw HTML."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "enum": ["text", "html"], "description": "Default text." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let format = input.get("format").and_then(|v| v.as_str()).unwrap_or("text");
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        let html = match page.content().await {
            Ok(html) => html,
            Err(e) => return ToolResult::error(format!("cannot read page: {e}")),
        };
        let out = if format == "html" {
            html
        } else {
            html2text::from_read(html.as_bytes(), 100)
        };
        ToolResult::success(cap_output(out))
    }
}

pub struct BrowserScreenshotTool {
    session: Arc<BrowserSession>,
}

impl BrowserScreenshotTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserScreenshotTool {
    fn name(&self) -> &str {
        "browser_screenshot"
    }

    fn description(&self) -> &str {
        "Capture the current page to a PNG file and return its path."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "full_page": { "type": "boolean", "description": "Capture beyond the viewport." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let full_page = input
            .get("full_page")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if let Err(e) = std::fs::create_dir_all(&self.session.screenshot_dir) {
            return ToolResult::error(format!("cannot create screenshot dir: {e}"));
        }
        let path = self
            .session
            .screenshot_dir
            .join(format!("shot-{}.png", uuid::Uuid::new_v4()));
        let params = ScreenshotParams::builder().full_page(full_page).build();
        match page.save_screenshot(params, &path).await {
            Ok(_) => ToolResult::success(format!("screenshot saved: {}", path.display())),
            Err(e) => ToolResult::error(format!("screenshot failed: {e}")),
        }
    }
}

pub struct BrowserExecuteJsTool {
    session: Arc<BrowserSession>,
}

impl BrowserExecuteJsTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserExecuteJsTool {
    fn name(&self) -> &str {
        "browser_execute_js"
    }

    fn description(&self) -> &str {
        "Run a JavaScript expression on the page and return its JSON result."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "script": { "type": "string", "description": "Expression to evaluate." }
            },
            "required": ["script"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(script) = input.get("script").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: script");
        };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        match page.evaluate(script).await {
            Ok(result) => {
                let value = result
                    .value()
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                ToolResult::success(cap_output(value.to_string()))
            }
            Err(e) => ToolResult::error(format!("evaluation failed: {e}")),
        }
    }
}

pub struct BrowserScrollTool {
    session: Arc<BrowserSession>,
}

impl BrowserScrollTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserScrollTool {
    fn name(&self) -> &str {
        "browser_scroll"
    }

    fn description(&self) -> &str {
        "Scroll the page up or down by a number of pixels (default 600)."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "direction": { "type": "string", "enum": ["up", "down"] },
                "amount": { "type": "integer", "description": "Pixels (default 600)." }
            },
            "required": ["direction"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let direction = input.get("direction").and_then(|v| v.as_str()).unwrap_or("down");
        if direction != "up" && direction != "down" {
            return ToolResult::error("direction must be 'up' or 'down'");
        }
        let amount = input.get("amount").and_then(|v| v.as_i64()).unwrap_or(600);
        let delta = if direction == "up" { -amount } else { amount };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        match page.evaluate(format!("window.scrollBy(0, {delta})")).await {
            Ok(_) => ToolResult::success(format!("scrolled {direction} by {amount}px")),
            Err(e) => ToolResult::error(format!("scroll failed: {e}")),
        }
    }
}

pub struct BrowserCloseTool {
    session: Arc<BrowserSession>,
}

impl BrowserCloseTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserCloseTool {
    fn name(&self) -> &str {
        "browser_close"
    }

    fn description(&self) -> &str {
        "Close the automation browser and discard its state."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        ToolResult::success(self.session.close().await)
    }
}

pub struct BrowserStatusTool {
    session: Arc<BrowserSession>,
}

impl BrowserStatusTool {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserStatusTool {
    fn name(&self) -> &str {
        "browser_status"
    }

    fn description(&self) -> &str {
        "Report whether the browser is running and which page it is on."
    }

    fn category(&self) -> &str {
        "web"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        ToolResult::success(self.session.status().await)
    }
}
