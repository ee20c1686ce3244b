use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::envelope::{Envelope, non_empty_string};

#[derive(Debug, Clone, PartialEq)]
pub enum WireBody {
    Json(Value),
    Callback { function: String, argument: Value },
    Xml(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Empty,
    Html,
    Unparseable { len: usize },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Empty => write!(f, "response body is empty"),
            WireError::Html => write!(f, "response is an HTML document"),
            WireError::Unparseable { len } => {
                write!(f, "response is not JSON, callback or XML ({} bytes)", len)
            }
        }
    }
}

impl std::error::Error for WireError {}

fn callback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^\s*([A-Za-z_$][\w$.]*)\s*\(\s*(.*?)\s*\)\s*;?\s*$")
            .expect("callback regex")
    })
}

fn xml_leaf_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<([A-Za-z_][\w.\-]*)(?:\s[^>]*)?>([^<]*)</([A-Za-z_][\w.\-]*)>")
            .expect("xml leaf regex")
    })
}

pub fn looks_like_html(text: &str) -> bool {
    text.contains("<!DOCTYPE") || text.contains("<html")
}

/// JSON first, then a JavaScript callback wrapper, then XML leaf elements.
pub fn parse_body(text: &str) -> Result<WireBody, WireError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(WireError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(WireBody::Json(value));
    }

    if let Some(caps) = callback_re().captures(trimmed)
        && let Ok(argument) = serde_json::from_str::<Value>(&caps[2])
    {
        return Ok(WireBody::Callback {
            function: caps[1].to_string(),
            argument,
        });
    }

    if looks_like_html(trimmed) {
        return Err(WireError::Html);
    }

    if trimmed.starts_with('<') {
        let leaves = xml_leaves(trimmed);
        if !leaves.is_empty() {
            return Ok(WireBody::Xml(leaves));
        }
    }

    Err(WireError::Unparseable { len: text.len() })
}

/// First occurrence wins for repeated element names.
pub fn xml_leaves(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for caps in xml_leaf_re().captures_iter(text) {
        if caps[1] != caps[3] {
            continue;
        }
        out.entry(caps[1].to_string())
            .or_insert_with(|| caps[2].trim().to_string());
    }
    out
}

impl WireBody {
    /// The JSON payload, whether bare or wrapped in a callback.
    pub fn json(&self) -> Option<&Value> {
        match self {
            WireBody::Json(value) => Some(value),
            WireBody::Callback { argument, .. } => Some(argument),
            WireBody::Xml(_) => None,
        }
    }

    pub fn envelope(&self) -> Option<Envelope<'_>> {
        Envelope::parse(self.json()?)
    }

    pub fn field(&self, key: &str) -> Option<String> {
        match self {
            WireBody::Xml(leaves) => leaves
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string()),
            _ => self.envelope()?.field_str(key),
        }
    }

    /// A callback whose single argument is a bare string, e.g.
    /// `nts_reqPortalCallback("token")`.
    pub fn callback_string(&self) -> Option<String> {
        match self {
            WireBody::Callback { argument, .. } => non_empty_string(argument),
            _ => None,
        }
    }
}
