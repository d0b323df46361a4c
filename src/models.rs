use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============ Attribution ============

/// Last-touch UTM attribution snapshot.
///
/// Only the keys present in the landing URL are set; a snapshot is always
/// replaced as a whole, never merged with an older one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
}

impl UtmSnapshot {
    /// Recognized query-string keys, in canonical order.
    pub const KEYS: [&'static str; 5] = [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_content",
        "utm_term",
    ];

    pub fn is_empty(&self) -> bool {
        self.utm_source.is_none()
            && self.utm_medium.is_none()
            && self.utm_campaign.is_none()
            && self.utm_content.is_none()
            && self.utm_term.is_none()
    }

    /// Sets a recognized key. Unknown keys are ignored and return `false`.
    pub fn set(&mut self, key: &str, value: String) -> bool {
        let slot = match key {
            "utm_source" => &mut self.utm_source,
            "utm_medium" => &mut self.utm_medium,
            "utm_campaign" => &mut self.utm_campaign,
            "utm_content" => &mut self.utm_content,
            "utm_term" => &mut self.utm_term,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

// ============ Lead ============

/// A/B bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::A => "A",
            Variant::B => "B",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "A" => Some(Variant::A),
            "B" => Some(Variant::B),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lead payload posted to `/api/leads/capture/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadPayload {
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_interest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Progressive profiling depth, 1–4.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_requirements: Option<String>,
    pub consent_given: bool,
    pub consent_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hcaptcha_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test_variants: Option<BTreeMap<String, Variant>>,
    #[serde(flatten)]
    pub utm: UtmSnapshot,
}

/// Field-scoped validation failures, keyed by payload field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields.insert(field.to_string(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(field, msg)| format!("{}: {}", field, msg))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Result of a submission attempt.
///
/// Only `Delivered` and `DeliveredWithError` count as success for the UI;
/// the latter masks exhausted retries.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Server accepted the lead.
    Delivered,
    /// Every attempt failed transiently; the user is told it worked.
    DeliveredWithError { error: String },
    /// This phone number was already submitted in the session.
    AlreadySubmitted,
    /// A successful submission happened too recently.
    RateLimited,
    /// The server rejected the lead (4xx).
    Rejected { error: String },
    /// Client-side validation failed; nothing was sent.
    Invalid(ValidationErrors),
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SubmitOutcome::Delivered | SubmitOutcome::DeliveredWithError { .. }
        )
    }

    /// User-facing message, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            SubmitOutcome::Delivered | SubmitOutcome::DeliveredWithError { .. } => None,
            SubmitOutcome::AlreadySubmitted => {
                Some("We already have your details. Our team will reach out shortly.".to_string())
            }
            SubmitOutcome::RateLimited => {
                Some("Please wait a few seconds before submitting again.".to_string())
            }
            SubmitOutcome::Rejected { error } => Some(error.clone()),
            SubmitOutcome::Invalid(errors) => Some(errors.to_string()),
        }
    }
}

// ============ Popups ============

/// Popup surface to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PopupKind {
    ExitIntent,
    LeadForm,
    LeadMagnet,
}

impl PopupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PopupKind::ExitIntent => "exit-intent",
            PopupKind::LeadForm => "lead-form",
            PopupKind::LeadMagnet => "lead-magnet",
        }
    }
}

/// Fully resolved popup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupConfig {
    #[serde(rename = "type")]
    pub kind: PopupKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_magnet_title: Option<String>,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            kind: PopupKind::ExitIntent,
            title: None,
            property_slug: None,
            campaign_slug: None,
            lead_magnet_title: None,
        }
    }
}

/// Partial popup configuration; set fields override when merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupOverrides {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<PopupKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_magnet_title: Option<String>,
}

impl PopupOverrides {
    pub fn kind(kind: PopupKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }
}

impl PopupConfig {
    /// Applies overrides on top of `self`.
    pub fn merged(mut self, overrides: &PopupOverrides) -> Self {
        if let Some(kind) = overrides.kind {
            self.kind = kind;
        }
        if overrides.title.is_some() {
            self.title = overrides.title.clone();
        }
        if overrides.property_slug.is_some() {
            self.property_slug = overrides.property_slug.clone();
        }
        if overrides.campaign_slug.is_some() {
            self.campaign_slug = overrides.campaign_slug.clone();
        }
        if overrides.lead_magnet_title.is_some() {
            self.lead_magnet_title = overrides.lead_magnet_title.clone();
        }
        self
    }
}

/// What caused a popup to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    TimeDelay,
    ScrollDepth,
    ExitIntent,
    Manual,
    CtaClick,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::TimeDelay => "time-delay",
            TriggerSource::ScrollDepth => "scroll-depth",
            TriggerSource::ExitIntent => "exit-intent",
            TriggerSource::Manual => "manual",
            TriggerSource::CtaClick => "cta-click",
        }
    }

    /// Explicit user actions bypass the once-per-visit rule.
    pub fn is_manual(self) -> bool {
        matches!(self, TriggerSource::Manual | TriggerSource::CtaClick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_flattens_utm_and_omits_absent_fields() {
        let payload = LeadPayload {
            first_name: "Asha".to_string(),
            phone: "9876543210".to_string(),
            consent_given: true,
            consent_text: "ok".to_string(),
            utm: UtmSnapshot {
                utm_source: Some("google".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["utm_source"], "google");
        assert!(json.get("utm_medium").is_none());
        assert!(json.get("email").is_none());
        assert!(json.get("utm").is_none());
    }

    #[test]
    fn test_popup_merge_order() {
        let page = PopupOverrides {
            property_slug: Some("godrej-emerald".to_string()),
            kind: Some(PopupKind::LeadForm),
            ..Default::default()
        };
        let trigger = PopupOverrides::kind(PopupKind::LeadMagnet);

        let merged = PopupConfig::default().merged(&page).merged(&trigger);
        assert_eq!(merged.kind, PopupKind::LeadMagnet);
        assert_eq!(merged.property_slug.as_deref(), Some("godrej-emerald"));
    }

    #[test]
    fn test_popup_kind_wire_names() {
        let json = serde_json::to_string(&PopupConfig::default()).unwrap();
        assert_eq!(json, r#"{"type":"exit-intent"}"#);
    }

    #[test]
    fn test_outcome_success_flags() {
        assert!(SubmitOutcome::Delivered.is_success());
        assert!(SubmitOutcome::DeliveredWithError {
            error: "Server error 503".to_string()
        }
        .is_success());
        assert!(!SubmitOutcome::RateLimited.is_success());
        assert!(!SubmitOutcome::AlreadySubmitted.is_success());
    }
}
