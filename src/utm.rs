//! Last-touch UTM attribution.
//!
//! Captured once per navigation, stored redundantly in local storage and a
//! 30-day cookie, and read synchronously when a lead is submitted.

use crate::errors::FunnelError;
use crate::models::UtmSnapshot;
use crate::platform::Clock;
use crate::state::FunnelState;
use crate::storage::{Cookie, CookieJar, KeyValueStore, KeyValueStoreExt};
use chrono::Duration;
use std::sync::Arc;

pub const UTM_STORAGE_KEY: &str = "digisoft_utm";
pub const UTM_COOKIE_DAYS: i64 = 30;

/// Extracts recognized UTM parameters from a query string or full URL.
/// Blank values are treated as absent.
pub fn parse_utm(query_or_url: &str) -> UtmSnapshot {
    let query = match url::Url::parse(query_or_url) {
        Ok(parsed) => parsed.query().unwrap_or_default().to_string(),
        Err(_) => query_or_url.trim_start_matches('?').to_string(),
    };

    let mut snapshot = UtmSnapshot::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.trim().is_empty() {
            continue;
        }
        // First occurrence wins, like URLSearchParams::get.
        if UtmSnapshot::KEYS.contains(&&*key) && !already_set(&snapshot, &key) {
            snapshot.set(&key, value.into_owned());
        }
    }
    snapshot
}

fn already_set(snapshot: &UtmSnapshot, key: &str) -> bool {
    match key {
        "utm_source" => snapshot.utm_source.is_some(),
        "utm_medium" => snapshot.utm_medium.is_some(),
        "utm_campaign" => snapshot.utm_campaign.is_some(),
        "utm_content" => snapshot.utm_content.is_some(),
        "utm_term" => snapshot.utm_term.is_some(),
        _ => false,
    }
}

pub struct UtmAttribution {
    local: Arc<dyn KeyValueStore>,
    cookies: Arc<dyn CookieJar>,
    clock: Arc<dyn Clock>,
    state: FunnelState,
}

impl UtmAttribution {
    pub fn new(
        local: Arc<dyn KeyValueStore>,
        cookies: Arc<dyn CookieJar>,
        clock: Arc<dyn Clock>,
        state: FunnelState,
    ) -> Self {
        Self {
            local,
            cookies,
            clock,
            state,
        }
    }

    /// Captures attribution for a navigation.
    ///
    /// With no UTM parameters the stored snapshot is left untouched and
    /// `Ok(None)` is returned. Otherwise the new snapshot replaces the old one
    /// in local storage, the cookie and the shared state.
    pub fn capture(&self, query_or_url: &str) -> Result<Option<UtmSnapshot>, FunnelError> {
        let snapshot = parse_utm(query_or_url);
        if snapshot.is_empty() {
            tracing::debug!("No UTM parameters on this navigation, keeping stored snapshot");
            return Ok(None);
        }

        let serialized = serde_json::to_string(&snapshot)?;
        self.local.set(UTM_STORAGE_KEY, &serialized)?;

        let expires = self.clock.now() + Duration::days(UTM_COOKIE_DAYS);
        self.cookies
            .set_cookie(Cookie::lax(UTM_STORAGE_KEY, serialized, expires))?;

        self.state.set_utm_params(snapshot.clone());

        tracing::info!(
            "Captured UTM attribution: source={:?} medium={:?} campaign={:?}",
            snapshot.utm_source,
            snapshot.utm_medium,
            snapshot.utm_campaign
        );
        Ok(Some(snapshot))
    }

    /// Reads the stored snapshot. Missing or unreadable data yields an empty one.
    pub fn stored(&self) -> UtmSnapshot {
        stored_utm(self.local.as_ref())
    }
}

/// Synchronous read path used by submission.
pub fn stored_utm(local: &dyn KeyValueStore) -> UtmSnapshot {
    match local.get_json::<UtmSnapshot>(UTM_STORAGE_KEY) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => UtmSnapshot::default(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable UTM snapshot: {}", e);
            UtmSnapshot::default()
        }
    }
}
