//! Decoding structured JSON out of free-form model text.
//!
//! Models often wrap JSON in Markdown fences or surround it with prose.
//! [`decode_json`] never fails: it yields [`Decoded::Parsed`] when a value
//! could be extracted and [`Decoded::Fallback`] with a caller-supplied
//! default otherwise, so every worker/verifier/judge call handles bad
//! output the same way.

use regex::Regex;
use std::sync::LazyLock;
use serde::de::DeserializeOwned;

/// Outcome of decoding model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// The response contained a valid value.
    Parsed(T),
    /// The response was unusable; the deterministic default was substituted.
    Fallback(T),
}

impl<T> Decoded<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Decoded::Fallback(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Decoded::Parsed(v) | Decoded::Fallback(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Decoded::Parsed(v) | Decoded::Fallback(v) => v,
        }
    }
}

/// Fenced code block with its optional language tag.
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n?(.*?)```").unwrap());

fn outer_spans(text: &str, out: &mut Vec<String>) {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                out.push(text[start..=end].to_string());
            }
        }
    }
}

/// Places a JSON document may hide in `text`, most plausible first.
///
/// Fenced blocks tagged `json` (or untagged) come first, then the outermost
/// `{...}` and `[...]` spans of the prose outside any fence, then those
/// spans of the whole text.
fn json_candidates(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in FENCE_RE.captures_iter(text) {
        let tag = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str().trim());
        if !body.is_empty() && (tag.is_empty() || tag.eq_ignore_ascii_case("json")) {
            out.push(body.to_string());
        }
    }
    let prose = FENCE_RE.replace_all(text, "\n");
    outer_spans(&prose, &mut out);
    outer_spans(text, &mut out);
    out.dedup();
    out
}

/// Decode a `T` from model text, substituting `fallback()` on failure.
pub fn decode_json<T, F>(text: &str, fallback: F) -> Decoded<T>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    let parsed = serde_json::from_str::<T>(text.trim()).ok().or_else(|| {
        json_candidates(text)
            .iter()
            .find_map(|body| serde_json::from_str::<T>(body).ok())
    });

    match parsed {
        Some(value) => Decoded::Parsed(value),
        None => {
            crate::llog_debug!(
                "decode fallback for response: {}",
                crate::util::truncate(text, 200)
            );
            Decoded::Fallback(fallback())
        }
    }
}
