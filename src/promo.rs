use crate::errors::{AppError, AppResult};
use crate::models::PromoCode;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;

// No 0/O/1/I/L so codes survive being read over the phone.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_GROUP_LEN: usize = 4;

static CODE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^[A-HJ-NP-Z2-9]{4}-[A-HJ-NP-Z2-9]{4}$").expect("valid promo code regex")
});

pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let mut group = || {
        (0..CODE_GROUP_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect::<String>()
    };
    format!("{}-{}", group(), group())
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn validate_code_format(code: &str) -> AppResult<()> {
    if CODE_RE.is_match(code) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Promo code '{}' must match XXXX-XXXX using letters and digits without 0/O/1/I/L",
            code
        )))
    }
}

pub fn check_redeemable(code: &PromoCode, now: DateTime<Utc>) -> AppResult<()> {
    if !code.active {
        return Err(AppError::Validation(format!(
            "Promo code '{}' is inactive",
            code.code
        )));
    }
    if let Some(expires_at) = code.expires_at {
        if expires_at < now {
            return Err(AppError::Validation(format!(
                "Promo code '{}' expired at {}",
                code.code,
                expires_at.to_rfc3339()
            )));
        }
    }
    if let Some(max_uses) = code.max_uses {
        if code.uses >= max_uses {
            return Err(AppError::Validation(format!(
                "Promo code '{}' has no redemptions left",
                code.code
            )));
        }
    }
    Ok(())
}
