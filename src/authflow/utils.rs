//! Small helpers for login id validation and one-time codes.

use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Strip spaces, dashes and parentheses; keep a leading `+`.
pub(crate) fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

/// E.164-ish: optional `+`, 7 to 15 digits.
pub(crate) fn valid_phone(phone_normalized: &str) -> bool {
    Regex::new(r"^\+?[0-9]{7,15}$").is_ok_and(|regex| regex.is_match(phone_normalized))
}

/// `alice@example.com` → `a****@example.com`.
pub(crate) fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{first}****@{domain}")
        }
        None => "****".to_string(),
    }
}

/// Keep the last four digits.
pub(crate) fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().collect();
    let keep = digits.len().min(4);
    let tail: String = digits[digits.len() - keep..].iter().collect();
    format!("****{tail}")
}

/// Numeric code of `length` digits.
pub(crate) fn generate_code(length: usize) -> Result<String> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate verification code")?;
    Ok(bytes
        .iter()
        .map(|byte| char::from(b'0' + byte % 10))
        .collect())
}

/// Hash a code so the raw value is never kept in memory longer than needed.
pub(crate) fn hash_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.finalize().to_vec()
}
