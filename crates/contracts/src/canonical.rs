use hex::ToHex;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

const FINGERPRINT_HEX_LEN: usize = 12;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Short, log-safe stand-in for a secret value (cookie, token).
pub fn fingerprint(secret: &str) -> String {
    let mut hex = sha256_hex(secret.as_bytes());
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

/// PEM text as the login endpoint expects it: LF line endings, no trailing
/// whitespace, exactly one trailing newline.
pub fn normalize_pem(pem: &str) -> String {
    let normalized = pem.replace("\r\n", "\n");
    format!("{}\n", normalized.trim_end())
}

/// Source-credential tags come from file names; compare them in NFC.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().nfc().collect::<String>()
}

/// Drops mask asterisks and the hyphen separator: `800101-1******` becomes
/// `8001011`.
pub fn strip_mask(identifier: &str) -> String {
    identifier
        .trim()
        .chars()
        .filter(|c| *c != '*' && *c != '-')
        .collect::<String>()
}
