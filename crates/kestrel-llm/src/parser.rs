//! Text-embedded tool-call extraction.
//!
//! Some OpenAI-compatible deployments emit tool calls inside the text body
//! instead of the structured `tool_calls` array. Three shapes are handled:
//!
//! - `<function_calls><invoke name="..."><parameter name="x">v</parameter>…`
//! - `<minimax:tool_call>{"name": …, "arguments": {…}}</minimax:tool_call>`
//! - Kimi sections: `<<|tool_calls_section_begin|>> <<|tool_call_begin|>>
//!   functions.name:0 <<|tool_call_argument_begin|>> {…} <<|tool_call_end|>>`
//!
//! The markup is stripped from the returned text and each call becomes a
//! synthetic `tool_use` block with a generated id.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::ContentBlock;

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<invoke\s+name="([^"]+)"\s*>(.*?)</invoke>"#).unwrap()
    })
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<parameter\s+name="([^"]+)"\s*>(.*?)</parameter>"#).unwrap()
    })
}

fn function_calls_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<function_calls>.*?</function_calls>").unwrap())
}

fn minimax_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<minimax:tool_call>(.*?)</minimax:tool_call>").unwrap())
}

fn kimi_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<<\|tool_calls_section_begin\|>>(.*?)<<\|tool_calls_section_end\|>>")
            .unwrap()
    })
}

fn kimi_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)<<\|tool_call_begin\|>>\s*(?:functions\.)?([\w\-.]+?)(?::\d+)?\s*<<\|tool_call_argument_begin\|>>(.*?)<<\|tool_call_end\|>>",
        )
        .unwrap()
    })
}

/// Extract embedded tool calls from `text`.
///
/// Returns the cleaned text and synthetic `tool_use` blocks in the order the
/// calls appeared. Unparseable argument payloads are skipped rather than
/// surfaced as broken calls.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ContentBlock>) {
    let mut calls = Vec::new();
    let mut counter = 0usize;
    let mut next_id = move || {
        counter += 1;
        format!("text_call_{counter}")
    };

    // 1. <function_calls> / <invoke> markup.
    for caps in invoke_re().captures_iter(text) {
        let name = caps[1].to_string();
        let body = &caps[2];
        let mut input = serde_json::Map::new();
        for p in parameter_re().captures_iter(body) {
            let key = p[1].to_string();
            let raw = p[2].trim();
            // Parameters may be JSON scalars/objects or bare strings.
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            input.insert(key, value);
        }
        calls.push(ContentBlock::ToolUse {
            id: next_id(),
            name,
            input: serde_json::Value::Object(input),
        });
    }

    // 2. MiniMax wrapper: body is one or more JSON objects.
    for caps in minimax_re().captures_iter(text) {
        for obj in extract_json_objects(&caps[1]) {
            let Some(name) = obj.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let input = obj
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let input = match input {
                serde_json::Value::String(s) => {
                    serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
                }
                other => other,
            };
            calls.push(ContentBlock::ToolUse {
                id: next_id(),
                name: name.to_string(),
                input,
            });
        }
    }

    // 3. Kimi tool-call sections.
    for section in kimi_section_re().captures_iter(text) {
        for caps in kimi_call_re().captures_iter(&section[1]) {
            let name = caps[1].to_string();
            let Ok(input) = serde_json::from_str::<serde_json::Value>(caps[2].trim()) else {
                continue;
            };
            calls.push(ContentBlock::ToolUse {
                id: next_id(),
                name,
                input,
            });
        }
    }

    let mut clean = function_calls_re().replace_all(text, "").into_owned();
    clean = minimax_re().replace_all(&clean, "").into_owned();
    clean = kimi_section_re().replace_all(&clean, "").into_owned();
    // Stray invoke blocks outside a function_calls wrapper.
    clean = invoke_re().replace_all(&clean, "").into_owned();

    (clean.trim().to_string(), calls)
}

/// Pull every top-level `{…}` object out of a string, tolerating prose and
/// newlines between them.
fn extract_json_objects(s: &str) -> Vec<serde_json::Value> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(st) = start.take() {
                            if let Ok(v) = serde_json::from_str(&s[st..=i]) {
                                out.push(v);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Strip `<thinking>…</thinking>` wrappers, returning (clean text, joined
/// thinking content).
pub fn split_thinking(text: &str) -> (String, Option<String>) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").unwrap());

    let mut thoughts = Vec::new();
    for caps in re.captures_iter(text) {
        let t = caps[1].trim();
        if !t.is_empty() {
            thoughts.push(t.to_string());
        }
    }
    let clean = re.replace_all(text, "").trim().to_string();
    let thinking = (!thoughts.is_empty()).then(|| thoughts.join("\n"));
    (clean, thinking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_markup_extracted_and_stripped() {
        let text = r#"Let me check.
<function_calls>
<invoke name="read_file">
<parameter name="path">/etc/hosts</parameter>
<parameter name="limit">10</parameter>
</invoke>
</function_calls>"#;
        let (clean, calls) = extract_tool_calls(text);
        assert_eq!(clean, "Let me check.");
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "read_file");
                assert_eq!(input["path"], "/etc/hosts");
                assert_eq!(input["limit"], 10);
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn minimax_wrapper_extracted() {
        let text = r#"<minimax:tool_call>
{"name": "get_weather", "arguments": {"city": "Beijing"}}
</minimax:tool_call>"#;
        let (clean, calls) = extract_tool_calls(text);
        assert!(clean.is_empty());
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Beijing");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn kimi_section_extracted() {
        let text = "done<<|tool_calls_section_begin|>><<|tool_call_begin|>>functions.search:0<<|tool_call_argument_begin|>>{\"q\":\"rust\"}<<|tool_call_end|>><<|tool_calls_section_end|>>";
        let (clean, calls) = extract_tool_calls(text);
        assert_eq!(clean, "done");
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "search");
                assert_eq!(input["q"], "rust");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn plain_text_untouched() {
        let (clean, calls) = extract_tool_calls("just an answer");
        assert_eq!(clean, "just an answer");
        assert!(calls.is_empty());
    }

    #[test]
    fn thinking_wrapper_split() {
        let (clean, thinking) = split_thinking("<thinking>step 1</thinking>The answer is 4.");
        assert_eq!(clean, "The answer is 4.");
        assert_eq!(thinking.as_deref(), Some("step 1"));

        let (clean, thinking) = split_thinking("no wrapper here");
        assert_eq!(clean, "no wrapper here");
        assert!(thinking.is_none());
    }
}
