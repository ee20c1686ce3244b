use hometax_contracts::UserClass;
use hometax_contracts::wire::{WireBody, WireError, parse_body};
use reqwest::header;

use crate::{AuthError, Session, SessionIdentity, send_text};

pub const IDENTITY_PATH: &str = "/permission.do?screenId=UTEABHAA03";

const IDENTITY_BODY: &str = r#"<map id="postParam"><popupYn>false</popupYn></map>"#;
const LOGIN_MARKER: &str = "login";

/// Reads the signed-in user's identifiers from the reporting host.
pub async fn fetch_identity(session: &Session) -> Result<SessionIdentity, AuthError> {
    let url = session.reporting_url(IDENTITY_PATH);
    let request = session
        .http()
        .post(&url)
        .timeout(session.portal().permission_timeout)
        .header(header::CONTENT_TYPE, "application/xml; charset=UTF-8")
        .body(IDENTITY_BODY);
    let (status, text) = send_text("identity", request).await?;
    if !status.is_success() {
        return Err(AuthError::Identity(format!(
            "identity lookup returned status {}",
            status.as_u16()
        )));
    }

    let identity = parse_identity(&text)?;
    tracing::debug!(
        has_tin = identity.tin.is_some(),
        has_admin_code = identity.admin_code.is_some(),
        "auth.identity"
    );
    Ok(identity)
}

fn is_login_error(body: &WireBody) -> bool {
    match body {
        WireBody::Xml(leaves) => leaves.get("errorMsg").map(|v| v.trim()) == Some(LOGIN_MARKER),
        _ => body.envelope().is_some_and(|envelope| {
            envelope.error_code() == Some(LOGIN_MARKER)
                || envelope
                    .result_msg_field("errorMsg")
                    .is_some_and(|v| v == LOGIN_MARKER)
        }),
    }
}

pub fn parse_identity(text: &str) -> Result<SessionIdentity, AuthError> {
    let body = parse_body(text).map_err(|err| match err {
        WireError::Html => AuthError::Identity("identity lookup returned HTML".to_string()),
        other => AuthError::Identity(other.to_string()),
    })?;

    if is_login_error(&body) {
        return Err(AuthError::NotActivated {
            missing: vec!["reporting session".to_string()],
        });
    }

    let identity = SessionIdentity {
        public_user_number: body.field("pubcUserNo"),
        tin: body.field("tin"),
        admin_code: body.field("txaaAdmNo"),
        user_class: body
            .field("lgnUserClCd")
            .or_else(|| body.field("userClCd"))
            .map(|code| UserClass::from_code(&code)),
    };

    if identity == SessionIdentity::default() {
        return Err(AuthError::Identity(
            "identity response carried no session fields".to_string(),
        ));
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_map_fields_are_read() {
        let text = r#"{"resultMsg":{"result":"S","sessionMap":{"tin":"T-9","pubcUserNo":"P-1","txaaAdmNo":"A-3","lgnUserClCd":"02"}}}"#;
        let identity = parse_identity(text).expect("identity");
        assert_eq!(identity.tin.as_deref(), Some("T-9"));
        assert_eq!(identity.public_user_number.as_deref(), Some("P-1"));
        assert_eq!(identity.admin_code.as_deref(), Some("A-3"));
        assert_eq!(identity.user_class, Some(UserClass::Corporate));
    }

    #[test]
    fn xml_fields_are_read() {
        let text = "<map id=\"sessionMap\"><tin>T-1</tin><pubcUserNo>P</pubcUserNo></map>";
        let identity = parse_identity(text).expect("identity");
        assert_eq!(identity.tin.as_deref(), Some("T-1"));
        assert_eq!(identity.admin_code, None);
    }

    #[test]
    fn login_marker_means_not_activated() {
        let err = parse_identity("<map><errorMsg>login</errorMsg></map>").unwrap_err();
        assert_eq!(err.code(), "ERR_NOT_ACTIVATED");

        let err = parse_identity(r#"{"resultMsg":{"result":"F","code":"login"}}"#).unwrap_err();
        assert_eq!(err.code(), "ERR_NOT_ACTIVATED");
    }

    #[test]
    fn empty_payload_is_an_identity_error() {
        let err = parse_identity(r#"{"resultMsg":{"result":"S"}}"#).unwrap_err();
        assert_eq!(err.code(), "ERR_IDENTITY");
    }
}
