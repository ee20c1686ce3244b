//! Cookie store with explicit domain control.
//!
//! reqwest's built-in jar cannot move a cookie from the host that set it to
//! the parent domain, which the SSO hand-off needs. [`SessionJar`] implements
//! reqwest's `CookieStore` so every response still lands here, and exposes
//! get-all / set / delete by `(name, domain, path)` plus [`SessionJar::rescope_all`].

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cookie::Cookie;
use cookie::time::OffsetDateTime;
use reqwest::header::HeaderValue;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Sent only to `domain` itself, not to its subdomains.
    pub host_only: bool,
}

impl StoredCookie {
    fn same_slot(&self, name: &str, domain: &str, path: &str) -> bool {
        self.name == name && self.domain.eq_ignore_ascii_case(domain) && self.path == path
    }

    fn matches(&self, host: &str, request_path: &str) -> bool {
        let domain_ok = if self.host_only {
            host.eq_ignore_ascii_case(&self.domain)
        } else {
            domain_matches(host, &self.domain)
        };
        domain_ok && path_matches(request_path, &self.path)
    }
}

#[derive(Debug, Default)]
pub struct SessionJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl SessionJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<StoredCookie>> {
        match self.cookies.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<StoredCookie>> {
        match self.cookies.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn all(&self) -> Vec<StoredCookie> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Most recently stored value for `name`, whatever its scope.
    pub fn get(&self, name: &str) -> Option<String> {
        self.read()
            .iter()
            .rev()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|c| c.name == name)
    }

    /// True when `name` is stored as a domain cookie for `domain`.
    pub fn is_scoped_to(&self, name: &str, domain: &str) -> bool {
        let domain = trim_domain(domain);
        self.read()
            .iter()
            .any(|c| c.name == name && !c.host_only && c.domain.eq_ignore_ascii_case(domain))
    }

    /// Inserts or replaces a domain cookie.
    pub fn set(&self, name: &str, value: &str, domain: &str, path: &str) {
        let cookie = StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: trim_domain(domain).to_ascii_lowercase(),
            path: normalize_path(path),
            host_only: false,
        };
        upsert(&mut self.write(), cookie);
    }

    pub fn delete(&self, name: &str, domain: &str, path: &str) -> bool {
        let domain = trim_domain(domain);
        let path = normalize_path(path);
        let mut cookies = self.write();
        let before = cookies.len();
        cookies.retain(|c| !c.same_slot(name, domain, &path));
        cookies.len() != before
    }

    /// Moves every cookie to `parent` as a domain cookie, keeping name, value
    /// and path. When two cookies collapse onto the same slot the one stored
    /// later wins. Running it twice yields the same set.
    pub fn rescope_all(&self, parent: &str) -> usize {
        let parent = trim_domain(parent).to_ascii_lowercase();
        let mut cookies = self.write();
        let mut rescoped = Vec::with_capacity(cookies.len());
        let mut moved = 0;
        for cookie in cookies.drain(..) {
            if cookie.host_only || cookie.domain != parent {
                moved += 1;
            }
            upsert(
                &mut rescoped,
                StoredCookie {
                    domain: parent.clone(),
                    host_only: false,
                    ..cookie
                },
            );
        }
        *cookies = rescoped;
        moved
    }

    /// Applies one `Set-Cookie` header received from `url`.
    pub fn store_response_cookie(&self, raw: &str, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        let Ok(parsed) = Cookie::parse(raw.to_owned()) else {
            return;
        };

        let (domain, host_only) = match parsed.domain().map(trim_domain) {
            Some(domain) if !domain.is_empty() => {
                if !domain_matches(host, domain) {
                    return;
                }
                (domain.to_ascii_lowercase(), false)
            }
            _ => (host.to_ascii_lowercase(), true),
        };
        let path = match parsed.path() {
            Some(path) if path.starts_with('/') => path.to_string(),
            _ => default_path(url.path()),
        };

        let mut cookies = self.write();
        if is_expired(&parsed) {
            cookies.retain(|c| !c.same_slot(parsed.name(), &domain, &path));
            return;
        }
        upsert(
            &mut cookies,
            StoredCookie {
                name: parsed.name().to_string(),
                value: parsed.value().to_string(),
                domain,
                path,
                host_only,
            },
        );
    }

    /// `Cookie` header value for a request to `url`, longest paths first.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let cookies = self.read();
        let mut matching = cookies
            .iter()
            .filter(|c| c.matches(host, url.path()))
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.store_response_cookie(raw, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.header_for(url)?).ok()
    }
}

fn upsert(cookies: &mut Vec<StoredCookie>, cookie: StoredCookie) {
    match cookies
        .iter_mut()
        .find(|c| c.same_slot(&cookie.name, &cookie.domain, &cookie.path))
    {
        Some(existing) => *existing = cookie,
        None => cookies.push(cookie),
    }
}

fn is_expired(cookie: &Cookie<'_>) -> bool {
    if let Some(max_age) = cookie.max_age() {
        return max_age.whole_seconds() <= 0;
    }
    cookie
        .expires_datetime()
        .is_some_and(|at| at <= OffsetDateTime::now_utc())
}

fn trim_domain(domain: &str) -> &str {
    domain.trim().trim_start_matches('.')
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        "/".to_string()
    }
}
