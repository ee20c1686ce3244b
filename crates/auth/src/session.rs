use std::sync::Arc;
use std::time::Duration;

use hometax_contracts::UserClass;
use reqwest::header;

use crate::AuthError;
use crate::jar::SessionJar;

/// Cookies every subdomain endpoint expects after login.
pub const REQUIRED_COOKIES: [&str; 2] = ["NTS_LOGIN_SYSTEM_CODE_P", "TXPPsessionID"];

const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub primary_url: String,
    pub reporting_url: String,
    /// Parent domain cookies are re-scoped to after SSO.
    pub cookie_domain: String,
    pub user_agent: String,
    pub auth_timeout: Duration,
    pub permission_timeout: Duration,
    pub query_timeout: Duration,
}

impl PortalConfig {
    pub fn hometax() -> Self {
        Self {
            primary_url: "https://hometax.go.kr".to_string(),
            reporting_url: "https://teht.hometax.go.kr".to_string(),
            cookie_domain: "hometax.go.kr".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            auth_timeout: Duration::from_secs(10),
            permission_timeout: Duration::from_secs(20),
            query_timeout: Duration::from_secs(30),
        }
    }

    /// Test harnesses point both hosts at one mock server.
    pub fn single_host(base_url: &str, cookie_domain: &str) -> Self {
        Self {
            primary_url: base_url.trim_end_matches('/').to_string(),
            reporting_url: base_url.trim_end_matches('/').to_string(),
            cookie_domain: cookie_domain.to_string(),
            ..Self::hometax()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub public_user_number: Option<String>,
    pub tin: Option<String>,
    pub admin_code: Option<String>,
    pub user_class: Option<UserClass>,
}

impl SessionIdentity {
    /// Fills empty fields from `other`; existing values are kept.
    pub fn merge_missing(&mut self, other: SessionIdentity) {
        if self.public_user_number.is_none() {
            self.public_user_number = other.public_user_number;
        }
        if self.tin.is_none() {
            self.tin = other.tin;
        }
        if self.admin_code.is_none() {
            self.admin_code = other.admin_code;
        }
        if self.user_class.is_none() {
            self.user_class = other.user_class;
        }
    }
}

/// HTTP client and cookie jar shared by every call made for one credential.
///
/// Clones share the jar. Calls for one session are expected to run one after
/// another: each login step reads cookies the previous step set.
#[derive(Clone)]
pub struct Session {
    http: reqwest::Client,
    jar: Arc<SessionJar>,
    portal: PortalConfig,
    identity: SessionIdentity,
}

impl Session {
    pub fn new(portal: PortalConfig) -> Result<Self, AuthError> {
        for (name, url) in [
            ("primary_url", &portal.primary_url),
            ("reporting_url", &portal.reporting_url),
        ] {
            if url::Url::parse(url).is_err() {
                return Err(AuthError::InvalidConfig(format!(
                    "{} is not a valid URL: {}",
                    name, url
                )));
            }
        }
        if portal.cookie_domain.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "cookie_domain must be non-empty".to_string(),
            ));
        }

        let jar = Arc::new(SessionJar::new());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(portal.user_agent.clone())
            .build()
            .map_err(|_| AuthError::InvalidConfig("failed to initialize http client".to_string()))?;

        Ok(Self {
            http,
            jar,
            portal,
            identity: SessionIdentity::default(),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn jar(&self) -> &SessionJar {
        &self.jar
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut SessionIdentity {
        &mut self.identity
    }

    pub fn admin_code(&self) -> Option<&str> {
        self.identity.admin_code.as_deref()
    }

    pub fn primary_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.portal.primary_url.trim_end_matches('/'), path_and_query)
    }

    pub fn reporting_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.portal.reporting_url.trim_end_matches('/'), path_and_query)
    }

    /// POST of a pre-serialized body (JSON plus the anti-automation suffix).
    pub fn json_post(&self, url: &str, body: String, timeout: Duration) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .timeout(timeout)
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(header::ACCEPT, "application/json, text/javascript, */*; q=0.01")
            .body(body)
    }

    pub fn missing_cookies(&self) -> Vec<String> {
        REQUIRED_COOKIES
            .iter()
            .filter(|name| !self.jar.contains(name))
            .map(|name| name.to_string())
            .collect()
    }

    /// Required cookies that are absent or not scoped to the parent domain.
    pub fn unscoped_cookies(&self) -> Vec<String> {
        REQUIRED_COOKIES
            .iter()
            .filter(|name| !self.jar.is_scoped_to(name, &self.portal.cookie_domain))
            .map(|name| name.to_string())
            .collect()
    }

    /// Gate for subdomain calls: errors instead of letting the portal answer
    /// an unauthenticated request with an empty result.
    pub fn ensure_activated(&self) -> Result<(), AuthError> {
        let missing = self.unscoped_cookies();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AuthError::NotActivated { missing })
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("portal", &self.portal)
            .field("identity", &self.identity)
            .field("cookies", &self.jar.len())
            .finish()
    }
}
