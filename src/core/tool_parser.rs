//! Tool-call markup inside model text.
//!
//! A call is written inline as
//! `<use_tool><tool_name>NAME</tool_name><arguments>{JSON}</arguments></use_tool>`.
//! [`StreamFilter`] hides call markup from the live text stream while it is
//! still arriving; [`parse_response`] splits the finished text into prose and
//! the first well-formed call.

use serde_json::{Value, json};

pub const TOOL_CALL_START: &str = "<use_tool>";
pub const TOOL_CALL_END: &str = "</use_tool>";
const TOOL_NAME_OPEN: &str = "<tool_name>";
const TOOL_NAME_CLOSE: &str = "</tool_name>";
const ARGUMENTS_OPEN: &str = "<arguments>";
const ARGUMENTS_CLOSE: &str = "</arguments>";

const MARKERS: [&str; 2] = [TOOL_CALL_START, TOOL_CALL_END];

/// Bytes of trailing text that may still turn into a marker.
#[must_use]
pub fn withhold_window() -> usize {
    MARKERS
        .iter()
        .map(|marker| marker.len())
        .max()
        .unwrap_or(1)
        .saturating_sub(1)
}

/// Render a call in wire form.
#[must_use]
pub fn render_tool_call(name: &str, input: &Value) -> String {
    let args = serde_json::to_string(input).unwrap_or_else(|_| input.to_string());
    format!(
        "{TOOL_CALL_START}{TOOL_NAME_OPEN}{name}{TOOL_NAME_CLOSE}{ARGUMENTS_OPEN}{args}{ARGUMENTS_CLOSE}{TOOL_CALL_END}"
    )
}

// === Post-stream parsing ===

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    ToolUse { name: String, params: Value },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedResponse {
    pub segments: Vec<Segment>,
    /// Text up to and including the honored call; everything after is dropped.
    pub rendered_text: String,
}

impl ParsedResponse {
    #[must_use]
    pub fn tool_call(&self) -> Option<(&str, &Value)> {
        self.segments.iter().find_map(|segment| match segment {
            Segment::ToolUse { name, params } => Some((name.as_str(), params)),
            Segment::Text(_) => None,
        })
    }
}

struct Block {
    start: usize,
    end: usize,
    name: String,
    params: Value,
}

/// First well-formed block at or after `from`.
fn find_block(text: &str, from: usize) -> Option<Block> {
    let mut cursor = from;
    loop {
        let start = cursor + text[cursor..].find(TOOL_CALL_START)?;
        let body_start = start + TOOL_CALL_START.len();
        // Unterminated: not a call.
        let body_end = body_start + text[body_start..].find(TOOL_CALL_END)?;
        let end = body_end + TOOL_CALL_END.len();
        if let Some((name, params)) = parse_block_body(&text[body_start..body_end]) {
            return Some(Block {
                start,
                end,
                name,
                params,
            });
        }
        cursor = end;
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let len = text[start..].find(close)?;
    Some(&text[start..start + len])
}

fn parse_block_body(body: &str) -> Option<(String, Value)> {
    let name = between(body, TOOL_NAME_OPEN, TOOL_NAME_CLOSE)?.trim();
    if name.is_empty() {
        return None;
    }
    let params = match between(body, ARGUMENTS_OPEN, ARGUMENTS_CLOSE) {
        None => json!({}),
        Some(raw) if raw.trim().is_empty() => json!({}),
        // Unparseable arguments go to the tool as-is so it can report the problem.
        Some(raw) => parse_tool_input(raw).unwrap_or_else(|| Value::String(raw.trim().to_string())),
    };
    Some((name.to_string(), params))
}

/// Split finished model text into prose and at most one call.
#[must_use]
pub fn parse_response(text: &str) -> ParsedResponse {
    let Some(block) = find_block(text, 0) else {
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(text.to_string())]
        };
        return ParsedResponse {
            segments,
            rendered_text: text.to_string(),
        };
    };

    let mut segments = Vec::new();
    let prose = &text[..block.start];
    if !prose.trim().is_empty() {
        segments.push(Segment::Text(prose.to_string()));
    }
    segments.push(Segment::ToolUse {
        name: block.name,
        params: block.params,
    });
    ParsedResponse {
        segments,
        rendered_text: text[..block.end].to_string(),
    }
}

// === Lenient argument parsing ===

/// Parse call arguments that may be fenced, double-encoded, or wrapped in prose.
#[must_use]
pub fn parse_tool_input(buffer: &str) -> Option<Value> {
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Value::String(inner) = &value
            && let Ok(decoded) = serde_json::from_str::<Value>(inner)
            && decoded.is_object()
        {
            return Some(decoded);
        }
        return Some(value);
    }
    if let Some(stripped) = strip_code_fences(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(&stripped)
    {
        return Some(value);
    }
    extract_json_segment(trimmed).and_then(|segment| serde_json::from_str::<Value>(&segment).ok())
}

fn strip_code_fences(text: &str) -> Option<String> {
    if !text.contains("```") {
        return None;
    }
    let stripped = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn extract_json_segment(text: &str) -> Option<String> {
    extract_balanced_segment(text, '{', '}').or_else(|| extract_balanced_segment(text, '[', ']'))
}

fn extract_balanced_segment(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                let end = start + offset + ch.len_utf8();
                return Some(text[start..end].to_string());
            }
        }
    }
    None
}

// === Streaming filter ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FilterState {
    #[default]
    Prose,
    /// Inside a started block; text is held until the end marker decides.
    InToolCall,
    /// The honored call is complete; the rest of the response is dropped.
    Done,
}

/// Incremental filter that never lets a partial marker reach the display.
#[derive(Debug, Default)]
pub struct StreamFilter {
    pending: String,
    state: FilterState,
}

impl StreamFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a complete call has been seen.
    #[must_use]
    pub fn saw_tool_call(&self) -> bool {
        self.state == FilterState::Done
    }

    /// Feed a delta; returns the text that is now safe to display.
    pub fn push(&mut self, delta: &str) -> String {
        if self.state == FilterState::Done {
            return String::new();
        }
        self.pending.push_str(delta);

        let mut out = String::new();
        loop {
            match self.state {
                FilterState::Done => {
                    self.pending.clear();
                    break;
                }
                FilterState::Prose => {
                    if let Some(idx) = self.pending.find(TOOL_CALL_START) {
                        out.push_str(&self.pending[..idx]);
                        self.pending.drain(..idx);
                        self.state = FilterState::InToolCall;
                        continue;
                    }
                    let held = held_tail_len(&self.pending);
                    let emit = self.pending.len() - held;
                    out.push_str(&self.pending[..emit]);
                    self.pending.drain(..emit);
                    break;
                }
                FilterState::InToolCall => {
                    let body_start = TOOL_CALL_START.len();
                    let Some(rel) = self.pending[body_start..].find(TOOL_CALL_END) else {
                        break;
                    };
                    let body_end = body_start + rel;
                    let end = body_end + TOOL_CALL_END.len();
                    if parse_block_body(&self.pending[body_start..body_end]).is_some() {
                        self.state = FilterState::Done;
                    } else {
                        // Malformed block: it was prose all along.
                        out.push_str(&self.pending[..end]);
                        self.pending.drain(..end);
                        self.state = FilterState::Prose;
                    }
                }
            }
        }
        out
    }

    /// End of stream: release whatever was held back that is not a call.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        match self.state {
            FilterState::Prose | FilterState::InToolCall => pending,
            FilterState::Done => String::new(),
        }
    }
}

/// Length of the longest suffix that is a proper prefix of some marker.
fn held_tail_len(text: &str) -> usize {
    let max = withhold_window().min(text.len());
    for len in (1..=max).rev() {
        let start = text.len() - len;
        if !text.is_char_boundary(start) {
            continue;
        }
        let tail = &text[start..];
        if MARKERS.iter().any(|marker| marker.starts_with(tail)) {
            return len;
        }
    }
    0
}
