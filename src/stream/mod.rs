use serde::Deserialize;
use serde_json::Value;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[serde(default)]
        delta: Delta,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        total_usage: Option<Usage>,
    },

    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        usage: Option<Usage>,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    content: Vec<Value>,
}

impl AssistantMessage {
    /// Typed view of the content array. Blocks of unrecognized type are
    /// skipped rather than failing the whole event.
    pub fn blocks(&self) -> impl Iterator<Item = ContentBlock> + '_ {
        self.content
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Outcome of parsing one stdout line.
#[derive(Debug)]
pub enum ParsedLine {
    /// A recognized stream event.
    Event(StreamEvent),
    /// Valid JSON of an unknown event type; dropped.
    Ignored,
    /// Not JSON; passed through as raw text.
    Raw,
}

pub fn parse_line(line: &str) -> ParsedLine {
    match serde_json::from_str::<Value>(line) {
        Ok(value) if value.is_object() => match serde_json::from_value::<StreamEvent>(value) {
            Ok(event) => ParsedLine::Event(event),
            Err(_) => ParsedLine::Ignored,
        },
        _ => ParsedLine::Raw,
    }
}

/// Extract a one-line description from a tool use block.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");
    match name.to_ascii_lowercase().as_str() {
        "bash" => format!("Running: {}", truncate_str(field("command"), 60)),
        "read" => format!("Reading: {}", shorten_path(field("file_path"))),
        "write" => format!("Writing: {}", shorten_path(field("file_path"))),
        "edit" => format!("Editing: {}", shorten_path(field("file_path"))),
        "glob" => format!("Searching: {}", field("pattern")),
        "grep" => {
            let pattern = truncate_str(field("pattern"), 30);
            let path = field("path");
            if path.is_empty() {
                format!("Grep: {}", pattern)
            } else {
                format!("Grep: {} {}", pattern, path)
            }
        }
        _ => {
            let encoded = serde_json::to_string(input).unwrap_or_default();
            format!("{}: {}", name, truncate_str(&encoded, 80))
        }
    }
}

/// Get an emoji for a tool, with plain-terminal fallbacks handled by the UI.
pub fn tool_emoji(name: &str) -> &'static str {
    match name {
        "Read" => "\u{1F4D6}",
        "Write" => "\u{1F4DD}",
        "Edit" => "\u{270F}\u{FE0F}",
        "Bash" => "\u{2699}\u{FE0F}",
        "Glob" => "\u{1F50D}",
        "Grep" => "\u{1F50E}",
        _ => "\u{1F527}",
    }
}

/// Shorten a file path to its last 2 components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// First line of a text block, shortened for spinner display.
pub fn truncate_snippet(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    truncate_str(first_line.trim(), max_len)
}
