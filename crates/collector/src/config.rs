use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use hometax_auth::PortalConfig;
use hometax_contracts::EngagementStatus;

use crate::directory::DEFAULT_PAGE_SIZE;
use crate::pacing::PacingConfig;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub primary_url: String,
    pub reporting_url: String,
    pub cookie_domain: String,
    pub user_agent: String,
    pub auth_timeout_ms: u64,
    pub permission_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub pacing_delay_ms: u64,
    pub overload_cooldown_ms: u64,
    pub overload_max_retries: u32,
    pub directory_page_size: u32,
    pub engagement_status: EngagementStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl CollectorConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("HOMETAX_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let defaults = PortalConfig::hometax();

        let primary_url = parse_url(kv.get("HOMETAX_PRIMARY_URL"), &defaults.primary_url, "HOMETAX_PRIMARY_URL")?;
        let reporting_url = parse_url(
            kv.get("HOMETAX_REPORTING_URL"),
            &defaults.reporting_url,
            "HOMETAX_REPORTING_URL",
        )?;
        let cookie_domain = optional_string(kv.get("HOMETAX_COOKIE_DOMAIN"))
            .unwrap_or(defaults.cookie_domain)
            .trim_start_matches('.')
            .to_string();
        let user_agent =
            optional_string(kv.get("HOMETAX_USER_AGENT")).unwrap_or(defaults.user_agent);

        let auth_timeout_ms = number(kv, "HOMETAX_AUTH_TIMEOUT_MS", 10_000u64)?;
        let permission_timeout_ms = number(kv, "HOMETAX_PERMISSION_TIMEOUT_MS", 20_000u64)?;
        let query_timeout_ms = number(kv, "HOMETAX_QUERY_TIMEOUT_MS", 30_000u64)?;
        for (key, value) in [
            ("HOMETAX_AUTH_TIMEOUT_MS", auth_timeout_ms),
            ("HOMETAX_PERMISSION_TIMEOUT_MS", permission_timeout_ms),
            ("HOMETAX_QUERY_TIMEOUT_MS", query_timeout_ms),
        ] {
            ensure_range(key, value, 1..=u64::MAX, "must be >= 1")?;
        }

        let pacing_delay_ms = number(kv, "HOMETAX_PACING_DELAY_MS", 500u64)?;
        let overload_cooldown_ms = number(kv, "HOMETAX_OVERLOAD_COOLDOWN_MS", 60_000u64)?;
        let overload_max_retries = number(kv, "HOMETAX_OVERLOAD_MAX_RETRIES", 3u32)?;
        ensure_range(
            "HOMETAX_OVERLOAD_MAX_RETRIES",
            overload_max_retries,
            0..=10,
            "must be <= 10",
        )?;

        let directory_page_size = number(kv, "HOMETAX_DIRECTORY_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        ensure_range(
            "HOMETAX_DIRECTORY_PAGE_SIZE",
            directory_page_size,
            1..=1000,
            "must be between 1 and 1000",
        )?;

        let engagement_status = parse_engagement_status(kv.get("HOMETAX_ENGAGEMENT_STATUS"))?;

        Ok(Self {
            primary_url,
            reporting_url,
            cookie_domain,
            user_agent,
            auth_timeout_ms,
            permission_timeout_ms,
            query_timeout_ms,
            pacing_delay_ms,
            overload_cooldown_ms,
            overload_max_retries,
            directory_page_size,
            engagement_status,
        })
    }

    pub fn portal(&self) -> PortalConfig {
        PortalConfig {
            primary_url: self.primary_url.clone(),
            reporting_url: self.reporting_url.clone(),
            cookie_domain: self.cookie_domain.clone(),
            user_agent: self.user_agent.clone(),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            permission_timeout: Duration::from_millis(self.permission_timeout_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            delay: Duration::from_millis(self.pacing_delay_ms),
            cooldown: Duration::from_millis(self.overload_cooldown_ms),
            max_retries: self.overload_max_retries,
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();
    for (idx, line) in contents.lines().enumerate() {
        if let Some((key, value)) = env_line(line, idx + 1)? {
            kv.insert(key, value);
        }
    }
    Ok(kv)
}

/// One `KEY=VALUE` line; blank lines and `#` comments yield `None`.
fn env_line(line: &str, line_no: usize) -> Result<Option<(String, String)>, StartupError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parse_error = |detail: &str| StartupError {
        code: "ERR_CONFIG_FILE_PARSE",
        message: format!("invalid config line {} ({})", line_no, detail),
    };

    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| parse_error("expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(parse_error("empty key"));
    }
    Ok(Some((key.to_string(), strip_quotes(value.trim()).to_string())))
}

fn strip_quotes(s: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| s.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(s)
}

fn optional_string(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_url(value: Option<&String>, default: &str, key: &'static str) -> Result<String, StartupError> {
    let Some(raw) = optional_string(value) else {
        return Ok(default.to_string());
    };
    match raw.parse::<reqwest::Url>() {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            Ok(raw.trim_end_matches('/').to_string())
        }
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an http(s) URL", key),
        }),
    }
}

/// Unset or blank keys take `default`.
fn number<T: FromStr>(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, StartupError> {
    match kv.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn ensure_range<T: PartialOrd>(
    key: &'static str,
    value: T,
    range: RangeInclusive<T>,
    rule: &str,
) -> Result<(), StartupError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} {}", key, rule),
        })
    }
}

fn parse_engagement_status(value: Option<&String>) -> Result<EngagementStatus, StartupError> {
    let raw = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("1");

    EngagementStatus::from_code(raw).ok_or_else(|| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: "HOMETAX_ENGAGEMENT_STATUS must be 1, 2 or 3".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_uses_portal_defaults() {
        let config = CollectorConfig::from_kv(&HashMap::new()).expect("defaults are valid");
        assert_eq!(config.primary_url, "https://hometax.go.kr");
        assert_eq!(config.reporting_url, "https://teht.hometax.go.kr");
        assert_eq!(config.directory_page_size, 200);
        assert_eq!(config.engagement_status, EngagementStatus::Active);

        let pacing = config.pacing();
        assert_eq!(pacing.delay, Duration::from_millis(500));
        assert_eq!(pacing.cooldown, Duration::from_secs(60));
        assert_eq!(pacing.max_retries, 3);

        let portal = config.portal();
        assert_eq!(portal.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn retry_ceiling_is_bounded() {
        let env = HashMap::from([(
            "HOMETAX_OVERLOAD_MAX_RETRIES".to_string(),
            "11".to_string(),
        )]);
        let err = CollectorConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn page_size_and_status_are_validated() {
        let env = HashMap::from([("HOMETAX_DIRECTORY_PAGE_SIZE".to_string(), "0".to_string())]);
        assert!(CollectorConfig::from_kv(&env).is_err());

        let env = HashMap::from([("HOMETAX_ENGAGEMENT_STATUS".to_string(), "9".to_string())]);
        assert!(CollectorConfig::from_kv(&env).is_err());

        let env = HashMap::from([("HOMETAX_ENGAGEMENT_STATUS".to_string(), "2".to_string())]);
        let config = CollectorConfig::from_kv(&env).expect("valid");
        assert_eq!(config.engagement_status, EngagementStatus::Terminated);
    }

    #[test]
    fn non_http_url_fails() {
        let env = HashMap::from([(
            "HOMETAX_PRIMARY_URL".to_string(),
            "ftp://hometax.go.kr".to_string(),
        )]);
        let err = CollectorConfig::from_kv(&env).unwrap_err();
        assert!(err.message.contains("HOMETAX_PRIMARY_URL"));
    }

    #[test]
    fn cookie_domain_drops_leading_dot() {
        let env = HashMap::from([(
            "HOMETAX_COOKIE_DOMAIN".to_string(),
            ".example.test".to_string(),
        )]);
        let config = CollectorConfig::from_kv(&env).expect("valid");
        assert_eq!(config.cookie_domain, "example.test");
    }

    #[test]
    fn numeric_keys_reject_garbage_and_accept_blanks() {
        let env = HashMap::from([("HOMETAX_QUERY_TIMEOUT_MS".to_string(), "soon".to_string())]);
        let err = CollectorConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
        assert!(err.message.contains("HOMETAX_QUERY_TIMEOUT_MS"));

        let env = HashMap::from([("HOMETAX_QUERY_TIMEOUT_MS".to_string(), "0".to_string())]);
        assert!(CollectorConfig::from_kv(&env).is_err());

        let env = HashMap::from([("HOMETAX_PACING_DELAY_MS".to_string(), "  ".to_string())]);
        let config = CollectorConfig::from_kv(&env).expect("blank falls back");
        assert_eq!(config.pacing_delay_ms, 500);
    }

    #[test]
    fn env_lines_skip_comments_and_reject_missing_equals() {
        assert_eq!(env_line("# note", 1).expect("comment"), None);
        assert_eq!(
            env_line(" HOMETAX_USER_AGENT = 'ua/1' ", 2).expect("pair"),
            Some(("HOMETAX_USER_AGENT".to_string(), "ua/1".to_string()))
        );
        let err = env_line("HOMETAX_USER_AGENT", 3).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_FILE_PARSE");
        assert!(err.message.contains("line 3"));
    }

    #[test]
    fn strip_quotes_handles_both_quote_styles() {
        assert_eq!(strip_quotes("\"a\""), "a");
        assert_eq!(strip_quotes("'b'"), "b");
        assert_eq!(strip_quotes("\"c"), "\"c");
    }
}
