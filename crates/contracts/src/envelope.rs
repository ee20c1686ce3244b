//! Normalized view over the portal's result envelope.
//!
//! The server places status and payload fields inconsistently: sometimes at
//! the top level, sometimes under a `resultMsg` object, and on internal errors
//! `resultMsg` is a bare string. All lookups go through [`Envelope`] so the
//! business code never repeats the "try both places" dance.

use serde_json::{Map, Value};

pub const SUCCESS_CODE: &str = "S";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultMsg<'a> {
    Absent,
    Text(&'a str),
    Fields(&'a Map<String, Value>),
}

#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    body: &'a Map<String, Value>,
    result_msg: ResultMsg<'a>,
}

impl<'a> Envelope<'a> {
    /// `None` when the top-level value is not a JSON object.
    pub fn parse(value: &'a Value) -> Option<Self> {
        let body = value.as_object()?;
        let result_msg = match body.get("resultMsg") {
            Some(Value::Object(fields)) => ResultMsg::Fields(fields),
            Some(Value::String(text)) => ResultMsg::Text(text.as_str()),
            _ => ResultMsg::Absent,
        };
        Some(Self { body, result_msg })
    }

    pub fn body(&self) -> &'a Map<String, Value> {
        self.body
    }

    pub fn result_msg(&self) -> ResultMsg<'a> {
        self.result_msg
    }

    fn nested(&self) -> Option<&'a Map<String, Value>> {
        match self.result_msg {
            ResultMsg::Fields(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn session_map(&self) -> Option<&'a Map<String, Value>> {
        self.nested()?.get("sessionMap")?.as_object()
    }

    pub fn result_code(&self) -> Option<&'a str> {
        self.nested()?.get("result")?.as_str()
    }

    pub fn is_success(&self) -> bool {
        self.result_code() == Some(SUCCESS_CODE)
    }

    pub fn error_code(&self) -> Option<&'a str> {
        self.nested()?
            .get("code")?
            .as_str()
            .filter(|code| !code.is_empty())
    }

    /// A field of the `resultMsg` object only.
    pub fn result_msg_field(&self, key: &str) -> Option<String> {
        self.nested()?.get(key).and_then(non_empty_string)
    }

    /// Most specific human-readable message the server sent, if any.
    pub fn message(&self) -> Option<String> {
        match self.result_msg {
            ResultMsg::Fields(fields) => ["resultMsg", "msg", "detailMsg", "errorMsg"]
                .iter()
                .find_map(|key| non_empty_string(fields.get(*key)?)),
            ResultMsg::Text(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            ResultMsg::Absent => ["errMsg", "msg"]
                .iter()
                .find_map(|key| non_empty_string(self.body.get(*key)?)),
        }
    }

    /// Looks a payload field up at the top level, then under `resultMsg`,
    /// then under `resultMsg.sessionMap`.
    pub fn field(&self, key: &str) -> Option<&'a Value> {
        self.body
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| self.nested()?.get(key).filter(|v| !v.is_null()))
            .or_else(|| self.session_map()?.get(key).filter(|v| !v.is_null()))
    }

    pub fn field_str(&self, key: &str) -> Option<String> {
        [
            self.body.get(key),
            self.nested().and_then(|m| m.get(key)),
            self.session_map().and_then(|m| m.get(key)),
        ]
        .into_iter()
        .flatten()
        .find_map(non_empty_string)
    }

    /// Server-reported total, from `resultMsg.totalCount` or the top level.
    pub fn total_count(&self) -> Option<u64> {
        let raw = self
            .nested()
            .and_then(|m| m.get("totalCount"))
            .and_then(non_empty_string)
            .or_else(|| self.body.get("totalCount").and_then(non_empty_string))?;
        raw.trim().parse::<u64>().ok()
    }

    pub fn list(&self, key: &str) -> Option<&'a Vec<Value>> {
        self.body.get(key)?.as_array()
    }
}

/// Strings are trimmed; numbers are rendered; anything else is ignored.
pub fn non_empty_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
