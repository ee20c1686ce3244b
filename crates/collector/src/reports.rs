use std::time::Instant;

use chrono::NaiveDate;
use hometax_auth::{AuthError, Session};
use hometax_contracts::canonical::fingerprint;
use hometax_contracts::wire::parse_body;
use hometax_contracts::{DateRange, ReportCategory, ReportQuery, nts};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::Instrument;

use crate::pacing::{PacingController, PacingError, RawResponse};
use crate::{metrics, post_json};

pub const REPORT_PATH: &str =
    "/wqAction.do?actionId=ATERNABA016R01&screenId=UTERNAAZ0Z31&popupYn=true&realScreenId=UTERNAAZ0Z31";
const REPORT_SCREEN_ID: &str = "UTERNAAZ0Z31";
const ROW_FIELD_PREFIX: &str = "dlt";
const LOGIN_MARKER: &str = "login";

#[derive(Debug)]
pub enum CollectionError {
    UnknownCategory(String),
    InvalidRange(&'static str),
    NotActivated(AuthError),
    Timeout,
    Http(reqwest::Error),
    BadStatus(u16),
    InvalidResponse(String),
    ServerError(String),
    PacingExhausted { attempts: u32 },
}

impl CollectionError {
    pub fn code(&self) -> &'static str {
        match self {
            CollectionError::UnknownCategory(_) => "ERR_UNKNOWN_CATEGORY",
            CollectionError::InvalidRange(_) => "ERR_INVALID_RANGE",
            CollectionError::NotActivated(_) => "ERR_NOT_ACTIVATED",
            CollectionError::Timeout => "ERR_TIMEOUT",
            CollectionError::Http(_) => "ERR_TRANSPORT",
            CollectionError::BadStatus(_) => "ERR_BAD_STATUS",
            CollectionError::InvalidResponse(_) => "ERR_INVALID_RESPONSE",
            CollectionError::ServerError(_) => "ERR_SERVER",
            CollectionError::PacingExhausted { .. } => "ERR_PACING_EXHAUSTED",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CollectionError::Timeout)
    }
}

impl std::fmt::Display for CollectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionError::UnknownCategory(name) => write!(f, "unknown report category {}", name),
            CollectionError::InvalidRange(msg) => write!(f, "invalid date range: {}", msg),
            CollectionError::NotActivated(err) => write!(f, "{}", err),
            CollectionError::Timeout => write!(f, "report query timed out"),
            CollectionError::Http(err) => write!(f, "report query HTTP error: {}", err),
            CollectionError::BadStatus(status) => write!(f, "HTTP {}", status),
            CollectionError::InvalidResponse(detail) => {
                write!(f, "report response could not be parsed: {}", detail)
            }
            CollectionError::ServerError(msg) => write!(f, "portal reported an error: {}", msg),
            CollectionError::PacingExhausted { attempts } => write!(
                f,
                "overload: retries exhausted after {} attempts",
                attempts
            ),
        }
    }
}

impl std::error::Error for CollectionError {}

impl From<reqwest::Error> for CollectionError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            CollectionError::Timeout
        } else {
            CollectionError::Http(value)
        }
    }
}

impl From<PacingError<reqwest::Error>> for CollectionError {
    fn from(value: PacingError<reqwest::Error>) -> Self {
        match value {
            PacingError::Exhausted { attempts } => CollectionError::PacingExhausted { attempts },
            PacingError::Call(err) => err.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Error,
}

/// One per query. Failures are values, not `Err`, so bulk runs keep going.
#[derive(Debug)]
pub struct ReportResult {
    pub query: ReportQuery,
    pub status: ReportStatus,
    pub rows: Vec<Value>,
    pub raw: Option<Value>,
    pub error: Option<CollectionError>,
}

impl ReportResult {
    fn success(query: ReportQuery, rows: Vec<Value>, raw: Value) -> Self {
        Self {
            query,
            status: ReportStatus::Success,
            rows,
            raw: Some(raw),
            error: None,
        }
    }

    fn failure(query: ReportQuery, error: CollectionError, raw: Option<Value>) -> Self {
        Self {
            query,
            status: ReportStatus::Error,
            rows: Vec::new(),
            raw,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// `None` on success. Names category, target and range.
    pub fn describe_failure(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        Some(format!(
            "{} ({}) failed: {}",
            self.query,
            self.query.category.portal_name(),
            error
        ))
    }
}

/// Rows of a report envelope: the first list under a `dlt*` key, else the
/// first list whose first element is an object. Keys are visited in
/// document order.
pub fn extract_rows(body: &Map<String, Value>) -> Vec<Value> {
    let prefixed = body
        .iter()
        .find(|(key, value)| key.starts_with(ROW_FIELD_PREFIX) && value.is_array());
    if let Some((_, Value::Array(rows))) = prefixed {
        return rows.clone();
    }

    body.values()
        .find_map(|value| match value {
            Value::Array(items) if items.first().is_some_and(Value::is_object) => {
                Some(items.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}

pub fn report_body(query: &ReportQuery, public_user_number: &str, admin_code: Option<&str>) -> Value {
    let mut body = json!({
        "befCallYn": "",
        "dprtUserId": "",
        "itrfCd": query.category.code(),
        "ntplInfpYn": "Y",
        "pubcUserNo": public_user_number,
        "rtnDtEnd": query.range.end_yyyymmdd(),
        "rtnDtSrt": query.range.start_yyyymmdd(),
        "scrnId": REPORT_SCREEN_ID,
        "txprRgtNo": query.target_id,
        "pageInfoVO": {
            "pageNum": query.page.to_string(),
        },
    });
    if let (Some(admin_code), Some(obj)) = (admin_code, body.as_object_mut()) {
        obj.insert("txaaAdmNo".to_string(), Value::String(admin_code.to_string()));
    }
    body
}

pub fn referer(primary_url: &str, category: ReportCategory) -> String {
    format!(
        "{}/websquare/websquare.html?w2xPath=/ui/pp/index_pp.xml&tmIdx=04&tm2lIdx=0405000000&tm3lIdx={}",
        primary_url.trim_end_matches('/'),
        category.menu_id()
    )
}

fn interpret(query: ReportQuery, response: RawResponse) -> ReportResult {
    if response.status != 200 {
        return ReportResult::failure(query, CollectionError::BadStatus(response.status), None);
    }

    let body = match parse_body(&response.body) {
        Ok(body) => body,
        Err(err) => {
            return ReportResult::failure(
                query,
                CollectionError::InvalidResponse(err.to_string()),
                None,
            );
        }
    };
    let Some(raw) = body.json().cloned() else {
        return ReportResult::failure(
            query,
            CollectionError::InvalidResponse("response is not JSON".to_string()),
            None,
        );
    };
    let Some(envelope) = body.envelope() else {
        return ReportResult::failure(
            query,
            CollectionError::InvalidResponse("response is not a JSON object".to_string()),
            Some(raw),
        );
    };

    if envelope.error_code() == Some(LOGIN_MARKER) {
        let err = AuthError::NotActivated {
            missing: vec!["reporting session".to_string()],
        };
        return ReportResult::failure(query, CollectionError::NotActivated(err), Some(raw));
    }
    if let Some(code) = envelope.result_code()
        && code != hometax_contracts::envelope::SUCCESS_CODE
    {
        let message = envelope
            .message()
            .unwrap_or_else(|| format!("result code {}", code));
        return ReportResult::failure(query, CollectionError::ServerError(message), Some(raw));
    }

    let rows = extract_rows(envelope.body());
    ReportResult::success(query, rows, raw)
}

/// Runs one report query under `pacing`. Never returns `Err`: every failure
/// is carried in the result.
pub async fn collect(session: &Session, pacing: &PacingController, query: ReportQuery) -> ReportResult {
    let span = tracing::info_span!(
        "collector.report",
        category = query.category.slug(),
        target_fp = %fingerprint(&query.target_id),
        range = %query.range,
        rows = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        let result = match session.ensure_activated() {
            Err(err) => ReportResult::failure(query, CollectionError::NotActivated(err), None),
            Ok(()) => {
                let identity = session.identity();
                let payload = report_body(
                    &query,
                    identity.public_user_number.as_deref().unwrap_or_default(),
                    session.admin_code(),
                )
                .to_string();
                let url = session.reporting_url(REPORT_PATH);
                let referer = referer(&session.portal().primary_url, query.category);

                let (payload, url, referer) = (payload.as_str(), url.as_str(), referer.as_str());
                let sent = pacing
                    .run(move |_retry| {
                        post_json(session, url, nts::suffixed_body(payload), Some(referer))
                    })
                    .await;

                match sent {
                    Ok(response) => interpret(query, response),
                    Err(err) => ReportResult::failure(query, err.into(), None),
                }
            }
        };

        let elapsed = started.elapsed();
        let outcome = match &result.error {
            None => "success",
            Some(err) => err.code(),
        };
        let span = tracing::Span::current();
        span.record("rows", result.row_count() as u64);
        span.record("latency_ms", elapsed.as_millis() as u64);
        span.record("outcome", outcome);
        metrics::observe_report_query(result.query.category.slug(), outcome, elapsed);

        if let Some(err) = &result.error {
            tracing::warn!(code = outcome, error = %err, "collector.report_failed");
        }
        result
    }
    .instrument(span)
    .await
}

/// Accepts the portal's Korean category name or its English slug.
pub async fn collect_monthly_report(
    session: &Session,
    pacing: &PacingController,
    category: &str,
    target_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<ReportResult, CollectionError> {
    let category = ReportCategory::from_name(category)
        .ok_or_else(|| CollectionError::UnknownCategory(category.to_string()))?;
    let range = DateRange::new(start, end).map_err(CollectionError::InvalidRange)?;
    Ok(collect(session, pacing, ReportQuery::new(category, target_id, range)).await)
}
