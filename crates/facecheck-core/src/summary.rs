//! Summarizer response parsing.
//!
//! A summary is free-form narrative with a flat JSON object of diagram values
//! somewhere near the end, optionally inside a ```` ```json ```` fence. The
//! parser works in explicit stages:
//!
//! 1. scan for single-level `{ … }` blocks that contain a quoted string,
//!    ignoring braces that sit inside quotes,
//! 2. select the last one,
//! 3. decode it, retrying once with line/tab control characters removed,
//! 4. on any failure fall back to the unmodified text with no fields.
//!
//! Parsing never fails; a bad block only degrades the result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open-ended key/value fields decoded from the data block.
pub type Fields = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryParseResult {
    pub narrative_text: String,
    /// Empty when no usable data block was found.
    pub fields: Fields,
}

impl SummaryParseResult {
    /// Typed view over the fields the application layer charts.
    pub fn diagram(&self) -> DiagramFields {
        DiagramFields::from_fields(&self.fields)
    }
}

/// Diagram values recognized downstream. Missing or unusable fields default
/// to 0 or the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramFields {
    pub tireness: i64,
    pub eyes_health: i64,
    pub swelling: i64,
    pub eyes_darkircles: i64,
    pub skin_health: i64,
    pub acne: i64,
    pub skin_condition: String,
}

impl DiagramFields {
    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            tireness: numeric_field(fields, "tireness"),
            eyes_health: numeric_field(fields, "eyes_health"),
            swelling: numeric_field(fields, "swelling"),
            eyes_darkircles: numeric_field(fields, "eyes_darkircles"),
            skin_health: numeric_field(fields, "skin_health"),
            acne: numeric_field(fields, "acne"),
            skin_condition: text_field(fields, "skin_condition"),
        }
    }
}

/// Accepts numbers (rounded) and numeric strings such as `"20%"`.
fn numeric_field(fields: &Fields, key: &str) -> i64 {
    match fields.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .map(|f| f.round() as i64)
            .unwrap_or(0),
        _ => 0,
    }
}

fn text_field(fields: &Fields, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Byte range of a block in the raw text, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Split a summarizer response into narrative and data fields.
pub fn parse(raw: &str) -> SummaryParseResult {
    let Some(&block) = candidate_blocks(raw).last() else {
        tracing::debug!("summary has no data block");
        return narrative_only(raw);
    };

    let Some(fields) = decode_block(&raw[block.start..block.end]) else {
        return narrative_only(raw);
    };

    let removed = fenced_span(raw, block);
    let narrative_text = format!("{}{}", &raw[..removed.start], &raw[removed.end..])
        .trim()
        .to_string();

    SummaryParseResult {
        narrative_text,
        fields,
    }
}

fn narrative_only(raw: &str) -> SummaryParseResult {
    SummaryParseResult {
        narrative_text: raw.to_string(),
        fields: Fields::new(),
    }
}

/// Every `{ … }` block without nested objects that contains at least one
/// quoted string, in text order, non-overlapping. Braces inside a quoted
/// string neither open nor close a block.
fn candidate_blocks(text: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut pos = 0;

    'blocks: while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut quoted = false;
        let mut i = start + 1;

        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    let Some(close) = string_end(bytes, i + 1) else {
                        // No closing quote anywhere, so no later block can hold a string.
                        break 'blocks;
                    };
                    quoted = true;
                    i = close + 1;
                }
                b'{' => {
                    // Nested or stray opener: a block can only start here.
                    pos = i;
                    continue 'blocks;
                }
                b'}' => {
                    if quoted {
                        spans.push(Span { start, end: i + 1 });
                    }
                    pos = i + 1;
                    continue 'blocks;
                }
                _ => i += 1,
            }
        }
        break;
    }

    spans
}

/// Index of the quote that closes a string whose body starts at `from`.
fn string_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Widen `block` to include a Markdown code fence directly around it.
fn fenced_span(text: &str, block: Span) -> Span {
    let before = text[..block.start].trim_end();
    let after = text[block.end..].trim_start();

    let opener = before
        .strip_suffix("```json")
        .or_else(|| before.strip_suffix("```"));

    match (opener, after.strip_prefix("```")) {
        (Some(prefix), Some(rest)) => Span {
            start: prefix.len(),
            end: text.len() - rest.len(),
        },
        _ => block,
    }
}

fn decode_block(block: &str) -> Option<Fields> {
    let first = match serde_json::from_str::<Fields>(block) {
        Ok(fields) => return Some(fields),
        Err(e) => e,
    };

    let cleaned: String = block
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .collect();

    match serde_json::from_str::<Fields>(&cleaned) {
        Ok(fields) => Some(fields),
        Err(second) => {
            tracing::warn!(
                first_error = %first,
                error = %second,
                "summary data block is not valid JSON; keeping narrative only"
            );
            None
        }
    }
}
