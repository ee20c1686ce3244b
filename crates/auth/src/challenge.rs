use hometax_contracts::canonical::fingerprint;
use hometax_contracts::nts;
use hometax_contracts::wire::parse_body;

use crate::{AuthError, Session, send_text};

pub const CHALLENGE_PATH: &str = "/wqAction.do?actionId=ATXPPZXA001R01&screenId=UTXPPABA01";

const TOKEN_FIELD: &str = "pkcEncSsn";

/// Asks the portal for the nonce the certificate must sign.
pub async fn request_challenge(session: &Session) -> Result<String, AuthError> {
    let url = session.primary_url(CHALLENGE_PATH);
    let request = session.json_post(&url, nts::challenge_body(), session.portal().auth_timeout);
    let (status, text) = send_text("challenge", request).await?;

    if !status.is_success() {
        return Err(AuthError::Challenge(format!(
            "challenge endpoint returned status {}",
            status.as_u16()
        )));
    }

    let token = extract_challenge(&text)?;
    tracing::debug!(token_fp = %fingerprint(&token), "auth.challenge_received");
    Ok(token)
}

/// Success code first, then `pkcEncSsn` from the top level or `resultMsg`.
pub fn extract_challenge(text: &str) -> Result<String, AuthError> {
    let body = parse_body(text)
        .map_err(|err| AuthError::Challenge(format!("unreadable challenge response: {}", err)))?;
    let envelope = body
        .envelope()
        .ok_or_else(|| AuthError::Challenge("challenge response is not a JSON object".to_string()))?;

    if !envelope.is_success() {
        let detail = envelope
            .message()
            .unwrap_or_else(|| "result code was not S".to_string());
        return Err(AuthError::Challenge(detail));
    }

    envelope
        .field_str(TOKEN_FIELD)
        .ok_or_else(|| AuthError::Challenge(format!("{} missing from challenge response", TOKEN_FIELD)))
}
