use hometax_auth::{AuthError, Session, Signer};
use reqwest::header;

pub mod bulk;
pub mod config;
pub mod directory;
pub mod metrics;
pub mod pacing;
pub mod reports;

pub use bulk::{BulkFailure, BulkOutcome, BulkPlan, BulkRunner};
pub use config::{CollectorConfig, StartupError};
pub use directory::{DirectoryFetchError, DirectoryQuery, fetch_clients};
pub use pacing::{PacingConfig, PacingController, PacingError, PacingSnapshot};
pub use reports::{CollectionError, ReportResult, ReportStatus, collect, collect_monthly_report};

/// JSON POST to the reporting host with the query timeout. The body must
/// already carry its anti-automation suffix.
pub(crate) async fn post_json(
    session: &Session,
    url: &str,
    body: String,
    referer: Option<&str>,
) -> Result<pacing::RawResponse, reqwest::Error> {
    let mut request = session.json_post(url, body, session.portal().query_timeout);
    if let Some(referer) = referer {
        request = request.header(header::REFERER, referer);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(pacing::RawResponse { status, body })
}

/// Establishes an activated session for one credential and counts the
/// attempt.
pub async fn open_session(config: &CollectorConfig, signer: &dyn Signer) -> Result<Session, AuthError> {
    let result = hometax_auth::authenticate(config.portal(), signer).await;
    match &result {
        Ok(_) => metrics::observe_login("ok"),
        Err(err) => metrics::observe_login(err.code()),
    }
    result
}
