use crate::models::{LeadPayload, ValidationErrors};
use regex::Regex;
use std::sync::OnceLock;

/// Consent copy shown next to every lead form.
pub const CONSENT_TEXT: &str = "I consent to Digisoft Nexus sharing my data with the relevant developer for property inquiries and marketing communication";

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email regex"))
}

/// Strips every non-digit character.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Dedup key for a phone: the last 10 digits of the normalized number.
pub fn dedup_phone_key(raw: &str) -> String {
    let digits = normalize_phone(raw);
    let skip = digits.len().saturating_sub(10);
    digits[skip..].to_string()
}

/// Validate an Indian mobile number.
///
/// Returns the normalized 10-digit number, or the message to show inline.
pub fn validate_phone(raw: &str) -> Result<String, &'static str> {
    let digits = normalize_phone(raw);
    if digits.len() != 10 {
        return Err("Please enter a 10-digit mobile number");
    }
    if !matches!(digits.as_bytes()[0], b'6'..=b'9') {
        return Err("Enter a valid Indian mobile number");
    }
    Ok(digits)
}

pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.trim().chars().count() < 2 {
        return Err("Please enter your full name");
    }
    Ok(())
}

/// Email is optional: empty input passes.
pub fn validate_email(email: &str) -> Result<(), &'static str> {
    if email.is_empty() {
        return Ok(());
    }
    if !email_regex().is_match(email) {
        return Err("Enter a valid email address");
    }
    Ok(())
}

/// Runs every field check and collects all failures.
pub fn validate_lead(payload: &LeadPayload) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if let Err(msg) = validate_name(&payload.first_name) {
        errors.add("first_name", msg);
    }
    if let Err(msg) = validate_phone(&payload.phone) {
        errors.add("phone", msg);
    }
    if let Some(ref email) = payload.email {
        if let Err(msg) = validate_email(email) {
            errors.add("email", msg);
        }
    }
    if let Some(stage) = payload.profile_stage {
        if !(1..=4).contains(&stage) {
            errors.add("profile_stage", "Profile stage must be between 1 and 4");
        }
    }
    if !payload.consent_given {
        errors.add(
            "consent_given",
            "Consent is required under the Digital Personal Data Protection Act 2023",
        );
    } else if payload.consent_text.trim().is_empty() {
        errors.add("consent_text", "Consent text is missing");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        tracing::debug!("Lead validation failed: {}", errors);
        Err(errors)
    }
}
