use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Local};
use hometax_contracts::canonical::normalize_pem;
use hometax_contracts::envelope::non_empty_string;
use regex::Regex;
use reqwest::header;
use serde_json::Value;

use crate::signer::Signer;
use crate::{AuthError, LoginFailure, Session, send_text};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const UNKNOWN_SERIAL: &str = "0";

/// What the login response said, before cookies are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginVerdict {
    Accepted,
    /// No result could be read; success depends on the cookies alone.
    Inconclusive,
    Rejected(LoginFailure),
}

fn callback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)nts_loginSystemCallback\s*\(\s*(\{.*?\})\s*\)")
            .expect("login callback regex")
    })
}

fn code_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'code'\s*:\s*'([FS])'").expect("login code regex"))
}

fn err_msg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"'errMsg'\s*:\s*decodeURIComponent\('([^']+)'\)").expect("login errMsg regex")
    })
}

/// `base64("{challenge}${serial}${YYYYMMDDHHmmss}${base64(signature)}")`.
pub fn build_assertion(
    challenge: &str,
    serial: Option<&str>,
    at: DateTime<Local>,
    signature: &[u8],
) -> String {
    let serial = serial
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SERIAL);
    let content = format!(
        "{}${}${}${}",
        challenge,
        serial,
        at.format(TIMESTAMP_FORMAT),
        STANDARD.encode(signature)
    );
    STANDARD.encode(content.as_bytes())
}

fn recovered_err_msg(text: &str) -> Option<String> {
    let caps = err_msg_re().captures(text)?;
    let decoded = urlencoding::decode(&caps[1])
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| caps[1].to_string());
    let decoded = decoded.trim();
    (!decoded.is_empty()).then(|| decoded.to_string())
}

fn callback_verdict(data: &Value) -> LoginVerdict {
    let field = |key: &str| data.get(key).and_then(non_empty_string);
    if field("code").as_deref() == Some("S") || field("result").as_deref() == Some("S") {
        return LoginVerdict::Accepted;
    }
    let message = field("errMsg")
        .or_else(|| field("resultMsg"))
        .unwrap_or_else(|| "login rejected".to_string());
    LoginVerdict::Rejected(LoginFailure::ServerMessage(message))
}

/// Reads the login response: HTML, then the callback object, then the bare
/// code marker, then a recoverable `errMsg`.
pub fn interpret_login_response(text: &str) -> LoginVerdict {
    if hometax_contracts::wire::looks_like_html(text) {
        return LoginVerdict::Rejected(LoginFailure::HtmlResponse);
    }

    if let Some(caps) = callback_re().captures(text)
        && let Ok(data) = serde_json::from_str::<Value>(&caps[1])
    {
        return callback_verdict(&data);
    }

    if let Some(caps) = code_marker_re().captures(text) {
        if &caps[1] == "S" {
            return LoginVerdict::Accepted;
        }
        let message =
            recovered_err_msg(text).unwrap_or_else(|| "result code was not S".to_string());
        return LoginVerdict::Rejected(LoginFailure::ServerMessage(message));
    }

    match recovered_err_msg(text) {
        Some(message) => LoginVerdict::Rejected(LoginFailure::ServerMessage(message)),
        None => LoginVerdict::Inconclusive,
    }
}

/// Submits the signed challenge. On return the session holds the portal's
/// login cookies.
pub async fn login(
    session: &Session,
    signer: &dyn Signer,
    challenge: &str,
) -> Result<(), AuthError> {
    let signature = signer.sign(challenge.as_bytes())?;
    let serial = signer.serial_number();
    if serial.is_none() {
        tracing::warn!("auth.serial_unavailable");
    }
    let assertion = build_assertion(challenge, serial.as_deref(), Local::now(), &signature);
    let random_enc = STANDARD.encode(signer.random_value()?);
    let cert = normalize_pem(&signer.certificate_pem());

    let portal = session.portal();
    let url = session.primary_url(&format!(
        "/pubcLogin.do?domain={}&mainSys=Y",
        urlencoding::encode(&portal.cookie_domain)
    ));
    let form = [
        ("logSgnt", assertion.as_str()),
        ("cert", cert.as_str()),
        ("randomEnc", random_enc.as_str()),
        ("pkcLoginYnImpv", "Y"),
        ("pkcLgnClCd", "04"),
    ];
    let request = session
        .http()
        .post(&url)
        .timeout(portal.auth_timeout)
        .header(header::REFERER, format!("{}/", portal.primary_url))
        .header(header::ORIGIN, portal.primary_url.clone())
        .header(
            header::ACCEPT,
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        )
        .form(&form);

    let (status, text) = send_text("login", request).await?;

    let verdict = interpret_login_response(&text);
    if let LoginVerdict::Rejected(failure) = &verdict {
        tracing::warn!(status = status.as_u16(), failure = %failure, "auth.login_rejected");
        return Err(AuthError::Login(failure.clone()));
    }
    if !status.is_success() && verdict == LoginVerdict::Inconclusive {
        return Err(AuthError::Login(LoginFailure::Unparseable(format!(
            "status {} with {} byte body",
            status.as_u16(),
            text.len()
        ))));
    }

    let missing = session.missing_cookies();
    if !missing.is_empty() {
        return Err(AuthError::Login(LoginFailure::MissingCookies(missing)));
    }

    tracing::info!(
        inconclusive = verdict == LoginVerdict::Inconclusive,
        cookies = session.jar().len(),
        "auth.login"
    );
    Ok(())
}
