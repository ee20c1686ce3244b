use std::time::Instant;

use tracing::Instrument;

pub mod challenge;
pub mod identity;
pub mod jar;
pub mod login;
pub mod session;
pub mod signer;
pub mod sso;

pub use challenge::request_challenge;
pub use identity::fetch_identity;
pub use jar::{SessionJar, StoredCookie};
pub use login::login;
pub use session::{PortalConfig, REQUIRED_COOKIES, Session, SessionIdentity};
pub use signer::{Signer, SignerError};
pub use sso::activate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    /// The portal answered with an HTML page instead of a login result.
    HtmlResponse,
    ServerMessage(String),
    MissingCookies(Vec<String>),
    Unparseable(String),
}

impl std::fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginFailure::HtmlResponse => write!(f, "login returned an HTML document"),
            LoginFailure::ServerMessage(msg) => write!(f, "login rejected: {}", msg),
            LoginFailure::MissingCookies(names) => {
                write!(f, "login did not set required cookies: {}", names.join(", "))
            }
            LoginFailure::Unparseable(detail) => {
                write!(f, "login response not understood: {}", detail)
            }
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    InvalidConfig(String),
    Timeout { step: &'static str },
    Transport { step: &'static str, source: reqwest::Error },
    Challenge(String),
    Login(LoginFailure),
    SsoActivation(String),
    Identity(String),
    Signer(SignerError),
    NotActivated { missing: Vec<String> },
}

impl AuthError {
    pub(crate) fn transport(step: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            AuthError::Timeout { step }
        } else {
            AuthError::Transport { step, source }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidConfig(_) => "ERR_INVALID_CONFIG",
            AuthError::Timeout { .. } => "ERR_TIMEOUT",
            AuthError::Transport { .. } => "ERR_TRANSPORT",
            AuthError::Challenge(_) => "ERR_CHALLENGE",
            AuthError::Login(LoginFailure::HtmlResponse) => "ERR_LOGIN_HTML",
            AuthError::Login(LoginFailure::ServerMessage(_)) => "ERR_LOGIN_REJECTED",
            AuthError::Login(LoginFailure::MissingCookies(_)) => "ERR_LOGIN_COOKIES",
            AuthError::Login(LoginFailure::Unparseable(_)) => "ERR_LOGIN_UNPARSEABLE",
            AuthError::SsoActivation(_) => "ERR_SSO_ACTIVATION",
            AuthError::Identity(_) => "ERR_IDENTITY",
            AuthError::Signer(_) => "ERR_SIGNER",
            AuthError::NotActivated { .. } => "ERR_NOT_ACTIVATED",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AuthError::Timeout { .. })
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidConfig(msg) => write!(f, "{}: {}", self.code(), msg),
            AuthError::Timeout { step } => write!(f, "{}: {} timed out", self.code(), step),
            AuthError::Transport { step, source } => {
                write!(f, "{}: {} failed: {}", self.code(), step, source)
            }
            AuthError::Challenge(msg) => write!(f, "{}: {}", self.code(), msg),
            AuthError::Login(failure) => write!(f, "{}: {}", self.code(), failure),
            AuthError::SsoActivation(msg) => write!(f, "{}: {}", self.code(), msg),
            AuthError::Identity(msg) => write!(f, "{}: {}", self.code(), msg),
            AuthError::Signer(err) => write!(f, "{}: {}", self.code(), err),
            AuthError::NotActivated { missing } => write!(
                f,
                "{}: session not activated for subdomain calls (missing or unscoped: {})",
                self.code(),
                missing.join(", ")
            ),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Transport { source, .. } => Some(source),
            AuthError::Signer(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SignerError> for AuthError {
    fn from(value: SignerError) -> Self {
        AuthError::Signer(value)
    }
}

/// Sends a request and reads the body as text, tagging failures with `step`.
pub(crate) async fn send_text(
    step: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, String), AuthError> {
    let response = request
        .send()
        .await
        .map_err(|err| AuthError::transport(step, err))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| AuthError::transport(step, err))?;
    Ok((status, text))
}

/// Challenge, login, SSO activation and identity lookup, in that order.
///
/// Identity lookup failures are logged and leave the identity from SSO in
/// place; every other step aborts the attempt.
pub async fn authenticate(portal: PortalConfig, signer: &dyn Signer) -> Result<Session, AuthError> {
    let span = tracing::info_span!(
        "auth.authenticate",
        serial = %signer.serial_number().unwrap_or_else(|| "0".to_string()),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        let result: Result<Session, AuthError> = async {
            let mut session = Session::new(portal)?;
            let challenge = request_challenge(&session).await?;
            login(&session, signer, &challenge).await?;
            activate(&mut session).await?;

            match fetch_identity(&session).await {
                Ok(identity) => session.identity_mut().merge_missing(identity),
                Err(err) => tracing::warn!(code = err.code(), error = %err, "auth.identity_failed"),
            }
            Ok(session)
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        match &result {
            Ok(_) => tracing::Span::current().record("outcome", "ok"),
            Err(err) => tracing::Span::current().record("outcome", err.code()),
        };
        result
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_failures_have_distinct_codes() {
        let codes = [
            AuthError::Login(LoginFailure::HtmlResponse).code(),
            AuthError::Login(LoginFailure::ServerMessage("x".to_string())).code(),
            AuthError::Login(LoginFailure::MissingCookies(vec![])).code(),
            AuthError::Login(LoginFailure::Unparseable("x".to_string())).code(),
        ];
        let unique = codes.iter().collect::<std::collections::HashSet<_>>();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn not_activated_names_missing_cookies() {
        let err = AuthError::NotActivated {
            missing: vec!["TXPPsessionID".to_string()],
        };
        assert!(err.to_string().contains("TXPPsessionID"));
        assert!(!err.is_timeout());
        assert!(AuthError::Timeout { step: "challenge" }.is_timeout());
    }
}
