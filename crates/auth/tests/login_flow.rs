use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Form, Query, State};
use axum::http::header::SET_COOKIE;
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hometax_auth::{PortalConfig, REQUIRED_COOKIES, Signer, SignerError, authenticate};
use hometax_contracts::UserClass;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct FixedSigner;

impl Signer for FixedSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        let mut out = b"sig:".to_vec();
        out.extend_from_slice(message);
        Ok(out)
    }

    fn serial_number(&self) -> Option<String> {
        Some("12345".to_string())
    }

    fn certificate_pem(&self) -> String {
        "-----BEGIN CERTIFICATE-----\r\nTUlJ\r\n-----END CERTIFICATE-----\r\n".to_string()
    }

    fn random_value(&self) -> Result<Vec<u8>, SignerError> {
        Ok(vec![0xde, 0xad, 0xbe, 0xef])
    }
}

#[derive(Clone)]
struct Portal {
    challenge: &'static str,
    login: &'static str,
    set_cookies: bool,
    token: &'static str,
    identity: &'static str,
    login_form: Arc<Mutex<Option<HashMap<String, String>>>>,
    permission_calls: Arc<Mutex<Vec<String>>>,
}

impl Portal {
    fn happy() -> Self {
        Self {
            challenge: r#"{"resultMsg":{"result":"S"},"pkcEncSsn":"abc123"}"#,
            login: "<script>nts_loginSystemCallback({\"code\":\"S\"});</script>",
            set_cookies: true,
            token: r#"{"ssoToken":"sso-1","userClCd":"02","txaaAdmNo":"ADM7"}"#,
            identity: "<map id=\"sessionMap\"><pubcUserNo>P-100</pubcUserNo><tin>T-200</tin></map>",
            login_form: Arc::new(Mutex::new(None)),
            permission_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn wq_action(State(portal): State<Portal>) -> &'static str {
    portal.challenge
}

async fn pubc_login(
    State(portal): State<Portal>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    *portal.login_form.lock().expect("form lock") = Some(form);
    if portal.set_cookies {
        (
            AppendHeaders([
                (SET_COOKIE, "NTS_LOGIN_SYSTEM_CODE_P=TXPP; Path=/"),
                (SET_COOKIE, "TXPPsessionID=sess-1; Path=/"),
            ]),
            portal.login,
        )
            .into_response()
    } else {
        portal.login.into_response()
    }
}

async fn permission(
    State(portal): State<Portal>,
    Query(query): Query<HashMap<String, String>>,
) -> &'static str {
    let screen = query.get("screenId").cloned().unwrap_or_default();
    portal
        .permission_calls
        .lock()
        .expect("calls lock")
        .push(screen.clone());
    if screen == "UTEABHAA03" {
        portal.identity
    } else {
        r#"{"resultMsg":{"result":"S"}}"#
    }
}

async fn token(State(portal): State<Portal>) -> &'static str {
    portal.token
}

fn app(portal: Portal) -> Router {
    Router::new()
        .route("/wqAction.do", post(wq_action))
        .route("/pubcLogin.do", post(pubc_login))
        .route("/permission.do", post(permission))
        .route("/token.do", get(token))
        .with_state(portal)
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

fn portal_config(addr: SocketAddr) -> PortalConfig {
    PortalConfig::single_host(&format!("http://{}", addr), "127.0.0.1")
}

#[tokio::test]
async fn authenticate_runs_every_step_and_activates_the_session() {
    let portal = Portal::happy();
    let (addr, shutdown, task) = spawn_server(app(portal.clone())).await;

    let session = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect("authenticate should succeed");

    session.ensure_activated().expect("session should be activated");
    for name in REQUIRED_COOKIES {
        assert!(session.jar().is_scoped_to(name, "127.0.0.1"), "{} not re-scoped", name);
    }
    assert_eq!(session.admin_code(), Some("ADM7"));
    assert_eq!(session.identity().user_class, Some(UserClass::Corporate));
    assert_eq!(session.identity().public_user_number.as_deref(), Some("P-100"));
    assert_eq!(session.identity().tin.as_deref(), Some("T-200"));

    let form = portal
        .login_form
        .lock()
        .expect("form lock")
        .clone()
        .expect("login form should be captured");
    assert_eq!(form.get("pkcLgnClCd").map(String::as_str), Some("04"));
    assert_eq!(form.get("pkcLoginYnImpv").map(String::as_str), Some("Y"));
    assert_eq!(
        form.get("randomEnc").map(String::as_str),
        Some(STANDARD.encode([0xde, 0xad, 0xbe, 0xef]).as_str())
    );
    assert!(!form["cert"].contains('\r'));

    let decoded = STANDARD.decode(&form["logSgnt"]).expect("assertion is base64");
    let decoded = String::from_utf8(decoded).expect("assertion is utf8");
    let parts = decoded.split('$').collect::<Vec<_>>();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0], "abc123");
    assert_eq!(parts[1], "12345");
    assert_eq!(parts[2].len(), 14);
    assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(
        STANDARD.decode(parts[3]).expect("signature is base64"),
        b"sig:abc123".to_vec()
    );

    let calls = portal.permission_calls.lock().expect("calls lock").clone();
    assert_eq!(calls, vec!["index_pp", "UTERNAAZ11", "UTERNAAZ11", "UTEABHAA03"]);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn rejected_login_surfaces_the_server_message() {
    let portal = Portal {
        login: "nts_loginSystemCallback({\"code\":\"F\",\"errMsg\":\"인증서가 만료되었습니다\"})",
        set_cookies: false,
        ..Portal::happy()
    };
    let (addr, shutdown, task) = spawn_server(app(portal)).await;

    let err = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect_err("login should be rejected");
    assert_eq!(err.code(), "ERR_LOGIN_REJECTED");
    assert!(err.to_string().contains("인증서가 만료되었습니다"));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn login_without_cookies_fails_even_when_accepted() {
    let portal = Portal {
        set_cookies: false,
        ..Portal::happy()
    };
    let (addr, shutdown, task) = spawn_server(app(portal)).await;

    let err = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect_err("login should fail without cookies");
    assert_eq!(err.code(), "ERR_LOGIN_COOKIES");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn failed_challenge_stops_before_login() {
    let portal = Portal {
        challenge: r#"{"resultMsg":{"result":"F","msg":"점검중입니다"}}"#,
        ..Portal::happy()
    };
    let (addr, shutdown, task) = spawn_server(app(portal.clone())).await;

    let err = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect_err("challenge should fail");
    assert_eq!(err.code(), "ERR_CHALLENGE");
    assert!(portal.login_form.lock().expect("form lock").is_none());

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn missing_sso_token_is_fatal() {
    let portal = Portal {
        token: r#"{"resultMsg":{"result":"S"}}"#,
        ..Portal::happy()
    };
    let (addr, shutdown, task) = spawn_server(app(portal)).await;

    let err = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect_err("activation should fail");
    assert_eq!(err.code(), "ERR_SSO_ACTIVATION");

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn identity_failure_keeps_the_session() {
    let portal = Portal {
        identity: "<result><errorMsg>login</errorMsg></result>",
        ..Portal::happy()
    };
    let (addr, shutdown, task) = spawn_server(app(portal)).await;

    let session = authenticate(portal_config(addr), &FixedSigner)
        .await
        .expect("identity failure is not fatal");
    assert_eq!(session.admin_code(), Some("ADM7"));
    assert_eq!(session.identity().public_user_number, None);

    let _ = shutdown.send(());
    let _ = task.await;
}
