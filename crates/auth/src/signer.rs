//! Certificate signing seam.
//!
//! Certificate parsing and the private-key operation live outside this crate;
//! login only needs a signature, the certificate serial, the PEM certificate
//! and the certificate's random-number extension.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

/// `id-kisa-npki-randNum`.
pub const RANDOM_NUMBER_OID: &str = "1.2.410.200004.10.1.1.3";

const OPENSSL_PASS_ENV: &str = "HOMETAX_PKCS12_PASSIN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    SignFailed(String),
    RandomValueUnavailable(String),
    ToolFailed(String),
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerError::SignFailed(msg) => write!(f, "signing failed: {}", msg),
            SignerError::RandomValueUnavailable(msg) => {
                write!(f, "certificate random value unavailable: {}", msg)
            }
            SignerError::ToolFailed(msg) => write!(f, "openssl invocation failed: {}", msg),
        }
    }
}

impl std::error::Error for SignerError {}

pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Decimal certificate serial; `None` when it cannot be read.
    fn serial_number(&self) -> Option<String>;

    fn certificate_pem(&self) -> String;

    /// Raw bytes of the random-number extension.
    fn random_value(&self) -> Result<Vec<u8>, SignerError>;
}

fn random_oid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i){}\s*:?\s*([0-9a-f][0-9a-f\s:]*)",
            regex::escape(RANDOM_NUMBER_OID)
        ))
        .expect("random oid regex")
    })
}

/// Recovers the random value from `openssl pkcs12 -info` output: the hex run
/// following the OID, with whitespace and colons removed.
pub fn parse_openssl_random_dump(dump: &str) -> Option<Vec<u8>> {
    let caps = random_oid_re().captures(dump)?;
    let hex_digits = caps[1]
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>();
    if hex_digits.is_empty() || hex_digits.len() % 2 != 0 {
        return None;
    }
    (0..hex_digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex_digits[i..i + 2], 16).ok())
        .collect()
}

/// Runs the local `openssl` binary against a PKCS#12 container. Blocking; the
/// password is handed over through the child's environment, not its argv.
pub fn pkcs12_random_value(path: &Path, password: &str) -> Result<Vec<u8>, SignerError> {
    let output = Command::new("openssl")
        .arg("pkcs12")
        .arg("-info")
        .arg("-in")
        .arg(path)
        .args(["-nodes", "-nocerts"])
        .arg("-passin")
        .arg(format!("env:{}", OPENSSL_PASS_ENV))
        .env(OPENSSL_PASS_ENV, password)
        .output()
        .map_err(|err| SignerError::ToolFailed(err.to_string()))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        let head = text.chars().take(200).collect::<String>();
        return Err(SignerError::ToolFailed(head));
    }

    parse_openssl_random_dump(&text).ok_or_else(|| {
        SignerError::RandomValueUnavailable(format!("{} not present in dump", RANDOM_NUMBER_OID))
    })
}
