//! The portal's anti-automation suffix.
//!
//! Every JSON request body is sent as `{serialized json}{token}`: the token
//! is appended after the closing brace, never placed inside the object.

use rand::Rng;

const NTS_FIXED: &str = "lpNhzq7ZwSaVt9TU2s8mHzIzLjmDpVKVgvmLBNswI";
const CHALLENGE_PREFIX: &str = "<nts<nts>nts>";
const NTS_OFFSET: u32 = 11;

pub const NTS_SECONDS_RANGE: std::ops::Range<u32> = 30..60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtsToken {
    seconds: u32,
}

impl NtsToken {
    pub fn generate() -> Self {
        Self {
            seconds: rand::thread_rng().gen_range(NTS_SECONDS_RANGE),
        }
    }

    /// Returns `None` outside `[30, 60)`.
    pub fn from_seconds(seconds: u32) -> Option<Self> {
        NTS_SECONDS_RANGE
            .contains(&seconds)
            .then_some(Self { seconds })
    }

    pub fn seconds(self) -> u32 {
        self.seconds
    }

    pub fn render(self) -> String {
        format!("{}{}{}", self.seconds, NTS_FIXED, self.seconds - NTS_OFFSET)
    }

    /// The login challenge endpoint expects the marker-prefixed form.
    pub fn render_challenge(self) -> String {
        format!("{}{}", CHALLENGE_PREFIX, self.render())
    }
}

/// Serialized JSON followed by a fresh token.
pub fn suffixed_body(json: &str) -> String {
    format!("{}{}", json, NtsToken::generate().render())
}

pub fn empty_body() -> String {
    suffixed_body("{}")
}

pub fn challenge_body() -> String {
    format!("{{}}{}", NtsToken::generate().render_challenge())
}
