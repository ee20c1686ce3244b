//! Cross-host session activation.
//!
//! After login only the primary host trusts the session. The reporting host
//! accepts it once an SSO token issued by the primary host has been posted to
//! it and the cookies are visible from every subdomain.

use std::sync::OnceLock;

use hometax_contracts::UserClass;
use hometax_contracts::canonical::fingerprint;
use hometax_contracts::nts;
use hometax_contracts::wire::{WireBody, parse_body};
use rand::Rng;
use regex::Regex;
use serde_json::json;

use crate::{AuthError, Session, send_text};

pub const PRIMARY_PERMISSION_PATH: &str = "/permission.do?screenId=index_pp";
pub const REPORTING_PERMISSION_PATH: &str = "/permission.do?screenId=UTERNAAZ11";
pub const TOKEN_PATH: &str = "/token.do";

const QUERY_CHARSET: &[u8] = b"qwertyuiopasdfghjklzxxcvbnm0123456789QWERTYUIOPASDDFGHJKLZXCVBNBM";
const QUERY_LEN: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsoGrant {
    pub sso_token: Option<String>,
    pub user_class_code: Option<String>,
    pub admin_code: Option<String>,
}

fn field_re(field: &str) -> Regex {
    Regex::new(&format!(
        r#"["']?{}["']?\s*[:=]\s*["']([^"']+)["']"#,
        regex::escape(field)
    ))
    .expect("sso field regex")
}

fn sso_field_res() -> &'static [(&'static str, Regex); 3] {
    static RES: OnceLock<[(&'static str, Regex); 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            ("ssoToken", field_re("ssoToken")),
            ("userClCd", field_re("userClCd")),
            ("txaaAdmNo", field_re("txaaAdmNo")),
        ]
    })
}

fn regex_field(text: &str, field: &str) -> Option<String> {
    let (_, re) = sso_field_res().iter().find(|(name, _)| *name == field)?;
    let value = re.captures(text)?[1].trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Reads the token-issuance response: JSON or callback-wrapped JSON, a
/// callback carrying the bare token string, then regex field extraction.
pub fn parse_sso_grant(text: &str) -> SsoGrant {
    let body = parse_body(text).ok();
    let structured = |key: &str| body.as_ref().and_then(|b| b.field(key));

    let sso_token = structured("ssoToken")
        .or_else(|| body.as_ref().and_then(WireBody::callback_string))
        .or_else(|| regex_field(text, "ssoToken"));

    SsoGrant {
        sso_token,
        user_class_code: structured("userClCd").or_else(|| regex_field(text, "userClCd")),
        admin_code: structured("txaaAdmNo").or_else(|| regex_field(text, "txaaAdmNo")),
    }
}

pub fn token_query() -> String {
    let mut rng = rand::thread_rng();
    let suffix = (0..QUERY_LEN)
        .map(|_| QUERY_CHARSET[rng.gen_range(0..QUERY_CHARSET.len())] as char)
        .collect::<String>();
    format!("_{}", suffix)
}

/// Non-fatal POST. Logs a warning tagged with `step` and returns the body
/// when one was received.
async fn prime(session: &Session, step: &'static str, url: &str, body: String) -> Option<String> {
    let request = session.json_post(url, body, session.portal().permission_timeout);
    match send_text(step, request).await {
        Ok((status, text)) => {
            if !status.is_success() {
                tracing::warn!(step, status = status.as_u16(), "sso.priming_failed");
            }
            Some(text)
        }
        Err(err) => {
            tracing::warn!(step, code = err.code(), error = %err, "sso.priming_failed");
            None
        }
    }
}

/// Runs the five activation steps in order. Only a missing SSO token is
/// fatal; the cookie re-scope in the last step always runs.
pub async fn activate(session: &mut Session) -> Result<(), AuthError> {
    let primary = session.primary_url(PRIMARY_PERMISSION_PATH);
    let primary_admin_code = prime(session, "sso.primary_permission", &primary, nts::empty_body())
        .await
        .and_then(|text| parse_body(&text).ok())
        .and_then(|body| body.field("txaaAdmNo"));

    let reporting = session.reporting_url(REPORTING_PERMISSION_PATH);
    prime(session, "sso.reporting_priming", &reporting, nts::empty_body()).await;

    let token_url = session.primary_url(&format!("{}?quer={}", TOKEN_PATH, token_query()));
    let request = session
        .http()
        .get(&token_url)
        .timeout(session.portal().permission_timeout);
    let (status, text) = send_text("sso.token", request).await?;
    let grant = parse_sso_grant(&text);
    let Some(sso_token) = grant.sso_token.clone() else {
        return Err(AuthError::SsoActivation(format!(
            "token endpoint returned no ssoToken (status {}, {} bytes)",
            status.as_u16(),
            text.len()
        )));
    };
    tracing::debug!(token_fp = %fingerprint(&sso_token), "sso.token_issued");

    let admin_code = grant.admin_code.clone().or(primary_admin_code);
    let activation = json!({
        "ssoToken": sso_token,
        "userClCd": grant.user_class_code.clone().unwrap_or_default(),
        "txaaAdmNo": admin_code.clone().unwrap_or_default(),
    });
    let activation_url = session.reporting_url(&format!(
        "{}&domain={}",
        REPORTING_PERMISSION_PATH,
        urlencoding::encode(&session.portal().cookie_domain)
    ));
    prime(
        session,
        "sso.reporting_activation",
        &activation_url,
        nts::suffixed_body(&activation.to_string()),
    )
    .await;

    let moved = session.jar().rescope_all(&session.portal().cookie_domain);

    let identity = session.identity_mut();
    if admin_code.is_some() {
        identity.admin_code = admin_code;
    }
    if let Some(code) = grant.user_class_code.as_deref() {
        identity.user_class = Some(UserClass::from_code(code));
    }

    tracing::info!(
        rescoped = moved,
        has_admin_code = session.admin_code().is_some(),
        "sso.activated"
    );
    Ok(())
}
