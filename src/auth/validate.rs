use once_cell::sync::Lazy;
use regex::Regex;

use super::types::RegisterParams;
use crate::{AppError, AppResult};

pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[^\s@]+@[^\s@]+\.[^\s@]{2,}$").expect("email pattern to compile")
});
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]{3,20}$").expect("username pattern to compile")
});

/// Registration input after trimming and email lower-casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRegistration {
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub password: String,
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn check_email(email: &str) -> AppResult<()> {
    if email.is_empty() {
        return Err(AppError::new("AUTH/MISSING_EMAIL", "Please enter your email."));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(AppError::new(
            "AUTH/INVALID_EMAIL",
            "Email format is not valid. Example: user@domain.com",
        ));
    }
    Ok(())
}

fn check_password_length(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::new(
            "AUTH/WEAK_PASSWORD",
            "Password must be at least 6 characters.",
        ));
    }
    Ok(())
}

/// Checks sign-in input before any I/O. Returns the normalized email.
pub fn validate_sign_in(email: &str, password: &str) -> AppResult<String> {
    let email = normalize_email(email);
    check_email(&email)?;
    if password.trim().is_empty() {
        return Err(AppError::new(
            "AUTH/MISSING_PASSWORD",
            "Please enter your password.",
        ));
    }
    check_password_length(password)?;
    Ok(email)
}

pub fn validate_register(params: &RegisterParams) -> AppResult<NormalizedRegistration> {
    let full_name = params.full_name.trim();
    if full_name.is_empty() {
        return Err(AppError::new("AUTH/MISSING_NAME", "Please enter your name."));
    }
    let email = normalize_email(&params.email);
    check_email(&email)?;
    let username = params.username.trim();
    if username.is_empty() {
        return Err(AppError::new(
            "AUTH/MISSING_USERNAME",
            "Please choose a username.",
        ));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(AppError::new(
            "AUTH/INVALID_USERNAME",
            "Usernames use 3-20 letters, digits, dots, dashes or underscores.",
        ));
    }
    check_password_length(&params.password)?;
    if params.password != params.confirm_password {
        return Err(AppError::new(
            "AUTH/PASSWORD_MISMATCH",
            "Passwords do not match.",
        ));
    }
    Ok(NormalizedRegistration {
        full_name: full_name.to_string(),
        email,
        username: username.to_string(),
        password: params.password.clone(),
    })
}
