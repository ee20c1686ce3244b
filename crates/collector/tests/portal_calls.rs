use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use hometax_auth::{PortalConfig, REQUIRED_COOKIES, Session};
use hometax_collector::{
    DirectoryFetchError, DirectoryQuery, PacingConfig, PacingController, ReportStatus, collect,
    fetch_clients,
};
use hometax_contracts::{EngagementStatus, ReportCategory, ReportQuery};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Replies to every `wqAction.do` call with the next scripted body; the last
/// one repeats.
#[derive(Clone)]
struct Script {
    replies: Arc<Vec<(u16, String)>>,
    calls: Arc<AtomicUsize>,
}

impl Script {
    fn new(replies: Vec<(u16, String)>) -> Self {
        Self {
            replies: Arc::new(replies),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn scripted(State(script): State<Script>) -> (StatusCode, String) {
    let n = script.calls.fetch_add(1, Ordering::SeqCst);
    let (status, body) = script
        .replies
        .get(n)
        .or_else(|| script.replies.last())
        .cloned()
        .unwrap_or((200, String::new()));
    (StatusCode::from_u16(status).expect("valid status"), body)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn start(script: Script) -> (Session, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/wqAction.do", post(scripted))
        .with_state(script);
    let (addr, shutdown, task) = spawn_server(app).await;
    let session = Session::new(PortalConfig::single_host(
        &format!("http://{}", addr),
        "127.0.0.1",
    ))
    .expect("session should build");
    (session, shutdown, task)
}

fn activate(session: &Session) {
    for name in REQUIRED_COOKIES {
        session.jar().set(name, "v", "127.0.0.1", "/");
    }
}

fn quick_pacing(max_retries: u32) -> PacingController {
    PacingController::new(PacingConfig {
        delay: Duration::ZERO,
        cooldown: Duration::from_millis(5),
        max_retries,
    })
}

fn directory_reply(rows: std::ops::Range<usize>, total: usize) -> (u16, String) {
    let rows = rows
        .map(|i| json!({"bsno": format!("B{}", i)}))
        .collect::<Vec<_>>();
    (
        200,
        json!({
            "resultMsg": {"result": "S", "totalCount": total.to_string()},
            "afdsSttnInfrDVOList": rows,
        })
        .to_string(),
    )
}

fn untotalled_reply(rows: std::ops::Range<usize>) -> (u16, String) {
    let rows = rows
        .map(|i| json!({"bsno": format!("B{}", i)}))
        .collect::<Vec<_>>();
    (
        200,
        json!({"resultMsg": {"result": "S"}, "afdsSttnInfrDVOList": rows}).to_string(),
    )
}

fn small_query() -> DirectoryQuery {
    DirectoryQuery {
        page_size: 2,
        ..DirectoryQuery::new("office", EngagementStatus::Active)
    }
}

#[tokio::test]
async fn directory_requires_an_activated_session() {
    let script = Script::new(vec![directory_reply(0..2, 2)]);
    let (session, shutdown, task) = start(script.clone()).await;

    let err = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect_err("unactivated session must be refused");
    assert!(matches!(err, DirectoryFetchError::NotActivated(_)));
    assert_eq!(script.calls(), 0);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn directory_stops_at_the_reported_total() {
    let script = Script::new(vec![
        directory_reply(0..2, 4),
        directory_reply(2..4, 4),
        directory_reply(4..6, 4),
    ]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let clients = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect("directory should load");
    assert_eq!(clients.len(), 4);
    assert_eq!(script.calls(), 2);
    assert_eq!(clients[3].target_id(), "B3");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn directory_short_page_ends_paging_without_a_total() {
    let script = Script::new(vec![untotalled_reply(0..1), untotalled_reply(1..3)]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let clients = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect("directory should load");
    assert_eq!(clients.len(), 1);
    assert_eq!(script.calls(), 1);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn directory_full_page_without_a_total_requests_the_next_page() {
    let script = Script::new(vec![
        untotalled_reply(0..2),
        untotalled_reply(2..3),
        untotalled_reply(3..5),
    ]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let clients = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect("directory should load");
    assert_eq!(script.calls(), 2);
    assert_eq!(clients.len(), 3);
    assert_eq!(clients[2].target_id(), "B2");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn directory_keeps_rows_when_a_later_page_fails() {
    let script = Script::new(vec![
        directory_reply(0..2, 10),
        (500, "error".to_string()),
    ]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let clients = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect("partial directory is not an error");
    assert_eq!(clients.len(), 2);
    assert_eq!(script.calls(), 2);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn directory_first_page_rejection_is_an_error() {
    let script = Script::new(vec![(
        200,
        json!({"resultMsg": {"result": "F", "msg": "권한이 없습니다"}}).to_string(),
    )]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let err = fetch_clients(&session, &quick_pacing(0), &small_query())
        .await
        .expect_err("first page failure is an error");
    assert_eq!(err.code(), "ERR_DIRECTORY_REJECTED");
    assert!(err.to_string().contains("권한이 없습니다"));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn report_recovers_after_one_overload_cooldown() {
    let script = Script::new(vec![
        (200, "잠시 후 다시 시도하세요. 과부하제어 중".to_string()),
        (
            200,
            json!({"resultMsg": {"result": "S"}, "dltList": [{"rtnYm": "202503"}]}).to_string(),
        ),
    ]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);
    let pacing = quick_pacing(3);

    let query =
        ReportQuery::for_month(ReportCategory::Withholding, "1234567890", 2025, 3).expect("month");
    let result = collect(&session, &pacing, query).await;

    assert_eq!(result.status, ReportStatus::Success);
    assert_eq!(result.row_count(), 1);
    assert_eq!(script.calls(), 2);
    let snapshot = pacing.snapshot();
    assert_eq!(snapshot.total_overloads, 1);
    assert_eq!(snapshot.cooldowns_taken, 1);
    assert_eq!(snapshot.consecutive_overloads, 0);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn report_login_marker_means_not_activated() {
    let script = Script::new(vec![(
        200,
        json!({"resultMsg": {"result": "F", "code": "login"}}).to_string(),
    )]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let query = ReportQuery::for_month(ReportCategory::Vat, "1234567890", 2025, 1).expect("month");
    let result = collect(&session, &quick_pacing(0), query).await;

    assert_eq!(result.status, ReportStatus::Error);
    assert_eq!(
        result.error.as_ref().map(|e| e.code()),
        Some("ERR_NOT_ACTIVATED")
    );
    assert!(result.raw.is_some());

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn report_bad_status_is_carried_in_the_result() {
    let script = Script::new(vec![(503, "unavailable".to_string())]);
    let (session, shutdown, task) = start(script.clone()).await;
    activate(&session);

    let query = ReportQuery::for_month(ReportCategory::Gift, "1234567890", 2025, 1).expect("month");
    let result = collect(&session, &quick_pacing(0), query).await;

    assert!(!result.is_success());
    assert_eq!(result.error.as_ref().map(|e| e.code()), Some("ERR_BAD_STATUS"));
    let description = result.describe_failure().expect("failure description");
    assert!(description.contains("증여세"));
    assert!(description.contains("1234567890"));

    let _ = shutdown.send(());
    let _ = task.await;
}
