use std::time::Instant;

use hometax_auth::{AuthError, Session};
use hometax_contracts::wire::parse_body;
use hometax_contracts::{ClientRecord, EngagementStatus, nts};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::pacing::{PacingController, RawResponse};
use crate::{metrics, post_json};

pub const DIRECTORY_PATH: &str =
    "/wqAction.do?actionId=ATEABHAA001R10&screenId=UTEABHAA03&popupYn=false&realScreenId=";
pub const DIRECTORY_LIST_FIELD: &str = "afdsSttnInfrDVOList";
pub const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryQuery {
    /// Falls back to the session's administrator code when `None`.
    pub admin_code: Option<String>,
    pub status: EngagementStatus,
    pub source_tag: String,
    pub page_size: u32,
}

impl DirectoryQuery {
    pub fn new(source_tag: impl Into<String>, status: EngagementStatus) -> Self {
        Self {
            admin_code: None,
            status,
            source_tag: source_tag.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug)]
pub enum DirectoryFetchError {
    NotActivated(AuthError),
    Timeout,
    Http(reqwest::Error),
    BadStatus(u16),
    InvalidResponse(String),
    /// First page came back without the success code.
    Rejected(String),
}

impl DirectoryFetchError {
    pub fn code(&self) -> &'static str {
        match self {
            DirectoryFetchError::NotActivated(_) => "ERR_NOT_ACTIVATED",
            DirectoryFetchError::Timeout => "ERR_TIMEOUT",
            DirectoryFetchError::Http(_) => "ERR_TRANSPORT",
            DirectoryFetchError::BadStatus(_) => "ERR_BAD_STATUS",
            DirectoryFetchError::InvalidResponse(_) => "ERR_INVALID_RESPONSE",
            DirectoryFetchError::Rejected(_) => "ERR_DIRECTORY_REJECTED",
        }
    }
}

impl std::fmt::Display for DirectoryFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryFetchError::NotActivated(err) => write!(f, "{}", err),
            DirectoryFetchError::Timeout => write!(f, "client directory request timed out"),
            DirectoryFetchError::Http(err) => write!(f, "client directory HTTP error: {}", err),
            DirectoryFetchError::BadStatus(status) => {
                write!(f, "client directory returned status {}", status)
            }
            DirectoryFetchError::InvalidResponse(detail) => {
                write!(f, "client directory returned an invalid response: {}", detail)
            }
            DirectoryFetchError::Rejected(msg) => {
                write!(f, "client directory request rejected: {}", msg)
            }
        }
    }
}

impl std::error::Error for DirectoryFetchError {}

impl From<reqwest::Error> for DirectoryFetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            DirectoryFetchError::Timeout
        } else {
            DirectoryFetchError::Http(value)
        }
    }
}

pub fn directory_body(admin_code: &str, status: EngagementStatus, page: u32, page_size: u32) -> Value {
    json!({
        "afdsCl": status.code(),
        "txaaAdmNo": admin_code,
        "pageInfoVO": {
            "pageNum": page.to_string(),
            "pageSize": page_size.to_string(),
            "totalCount": "",
        },
    })
}

enum Page {
    Rows { rows: Vec<Value>, total: Option<u64> },
    Failed(DirectoryFetchError),
}

fn read_page(response: &RawResponse) -> Page {
    if response.status != 200 {
        return Page::Failed(DirectoryFetchError::BadStatus(response.status));
    }
    let body = match parse_body(&response.body) {
        Ok(body) => body,
        Err(err) => return Page::Failed(DirectoryFetchError::InvalidResponse(err.to_string())),
    };
    let Some(envelope) = body.envelope() else {
        return Page::Failed(DirectoryFetchError::InvalidResponse(
            "response is not a JSON object".to_string(),
        ));
    };
    if !envelope.is_success() {
        let message = envelope
            .message()
            .or_else(|| envelope.error_code().map(str::to_string))
            .unwrap_or_else(|| "result code was not S".to_string());
        return Page::Failed(DirectoryFetchError::Rejected(message));
    }
    Page::Rows {
        rows: envelope.list(DIRECTORY_LIST_FIELD).cloned().unwrap_or_default(),
        total: envelope.total_count(),
    }
}

/// Pages through the client directory. Only a first-page failure is an
/// error; a later failing page ends the walk with what was collected.
pub async fn fetch_clients(
    session: &Session,
    pacing: &PacingController,
    query: &DirectoryQuery,
) -> Result<Vec<ClientRecord>, DirectoryFetchError> {
    session
        .ensure_activated()
        .map_err(DirectoryFetchError::NotActivated)?;

    let admin_code = query
        .admin_code
        .clone()
        .or_else(|| session.admin_code().map(str::to_string))
        .unwrap_or_default();
    let page_size = query.page_size.max(1);
    let url = session.reporting_url(DIRECTORY_PATH);

    let span = tracing::info_span!(
        "collector.directory",
        source_tag = %query.source_tag,
        status = query.status.label(),
        pages = tracing::field::Empty,
        rows = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        let mut raw_rows: Vec<Value> = Vec::new();
        let mut page = 1u32;

        loop {
            pacing.pause().await;
            let body = directory_body(&admin_code, query.status, page, page_size);
            let sent = post_json(
                session,
                &url,
                nts::suffixed_body(&body.to_string()),
                None,
            )
            .await;

            let outcome = match sent {
                Ok(response) => read_page(&response),
                Err(err) => Page::Failed(err.into()),
            };

            let (rows, total) = match outcome {
                Page::Rows { rows, total } => {
                    metrics::observe_directory_page("ok");
                    (rows, total)
                }
                Page::Failed(err) => {
                    metrics::observe_directory_page("error");
                    if page == 1 {
                        return Err(err);
                    }
                    tracing::warn!(page, code = err.code(), error = %err, "collector.directory_page_failed");
                    break;
                }
            };

            if rows.is_empty() {
                break;
            }
            let received = rows.len();
            raw_rows.extend(rows);

            if total.is_some_and(|total| raw_rows.len() as u64 >= total) {
                break;
            }
            if received < page_size as usize {
                break;
            }
            page += 1;
        }

        let records = raw_rows
            .iter()
            .filter_map(|row| ClientRecord::from_row(row, &query.source_tag, query.status.label()))
            .collect::<Vec<_>>();
        if records.len() != raw_rows.len() {
            tracing::debug!(
                skipped = raw_rows.len() - records.len(),
                "collector.directory_rows_without_identifier"
            );
        }

        let span = tracing::Span::current();
        span.record("pages", page);
        span.record("rows", records.len() as u64);
        span.record("latency_ms", started.elapsed().as_millis() as u64);
        Ok(records)
    }
    .instrument(span)
    .await
}
