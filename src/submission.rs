//! Lead submission guard.
//!
//! Every lead goes through the same pipeline before it reaches the API:
//!
//! 1. Field validation (nothing is sent on failure).
//! 2. Session dedup on the normalized phone number; a number is claimed
//!    before the first attempt so overlapping submits post it once.
//! 3. Client-side rate limit: one successful submission per 30 seconds.
//! 4. Enrichment with the last-touch UTM snapshot and the page URL.
//! 5. Delivery with up to two retries on 5xx / network failure, backing off
//!    linearly (1 s, 2 s).
//!
//! When every attempt fails the visitor is still told the lead went
//! through. The payload is kept in a durable outbox, a
//! [`FunnelEvent::LeadDeliveryFailed`] event is published and an error is
//! logged, so the lead can be replayed with [`SubmissionGuard::replay_failed`].

use crate::errors::FunnelError;
use crate::events::{EventBus, FunnelEvent};
use crate::gateway_client::LeadTransport;
use crate::models::{LeadPayload, SubmitOutcome, UtmSnapshot};
use crate::platform::Clock;
use crate::storage::{KeyValueStore, KeyValueStoreExt};
use crate::utm::stored_utm;
use crate::validation::{dedup_phone_key, normalize_phone, validate_lead};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const RATE_LIMIT_KEY: &str = "digisoft_last_submit";
pub const SUBMITTED_PHONES_KEY: &str = "digisoft_submitted_phones";
pub const FAILED_LEADS_KEY: &str = "digisoft_failed_leads";
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(30);

/// Bounded linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// A lead whose delivery was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedLead {
    pub payload: LeadPayload,
    pub error: String,
    pub failed_at: i64,
}

/// Outcome of an outbox replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub rejected: usize,
    pub remaining: usize,
}

/// SHA-256 of the dedup key, hex encoded. Only this is kept in session
/// storage, never the raw number.
pub fn phone_fingerprint(phone: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dedup_phone_key(phone).as_bytes());
    hex::encode(hasher.finalize())
}

/// Overlays stored attribution onto the payload; stored keys win.
fn apply_utm(target: &mut UtmSnapshot, stored: UtmSnapshot) {
    if stored.utm_source.is_some() {
        target.utm_source = stored.utm_source;
    }
    if stored.utm_medium.is_some() {
        target.utm_medium = stored.utm_medium;
    }
    if stored.utm_campaign.is_some() {
        target.utm_campaign = stored.utm_campaign;
    }
    if stored.utm_content.is_some() {
        target.utm_content = stored.utm_content;
    }
    if stored.utm_term.is_some() {
        target.utm_term = stored.utm_term;
    }
}

/// Claim on a phone fingerprint while its submission is in flight.
/// Dropping it releases the claim.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    fingerprint: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.fingerprint);
    }
}

enum Delivery {
    Accepted,
    Rejected(String),
    Failed(String),
}

pub struct SubmissionGuard {
    transport: Arc<dyn LeadTransport>,
    local: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl SubmissionGuard {
    pub fn new(
        transport: Arc<dyn LeadTransport>,
        local: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Self {
        Self {
            transport,
            local,
            session,
            clock,
            bus,
            retry: RetryPolicy::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn submitted_fingerprints(&self) -> Vec<String> {
        match self.session.get_json::<Vec<String>>(SUBMITTED_PHONES_KEY) {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Unreadable submitted-phone set, treating as empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether this number was already submitted in the current session.
    pub fn is_already_submitted(&self, phone: &str) -> bool {
        let fingerprint = phone_fingerprint(phone);
        self.submitted_fingerprints().contains(&fingerprint)
    }

    /// Whether a successful submission happened within the last 30 seconds.
    pub fn is_rate_limited(&self) -> bool {
        let last = match self.local.get(RATE_LIMIT_KEY) {
            Ok(Some(raw)) => raw.parse::<i64>().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Could not read rate-limit timestamp: {}", e);
                None
            }
        };
        match last {
            Some(last) => {
                self.clock.now_ms() - last < RATE_LIMIT_WINDOW.as_millis() as i64
            }
            None => false,
        }
    }

    /// Checks the session set and claims the number in one critical
    /// section. `None` means the number is submitted or being submitted.
    fn reserve(&self, phone: &str) -> Option<InFlight<'_>> {
        let fingerprint = phone_fingerprint(phone);
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&fingerprint)
            || self.submitted_fingerprints().contains(&fingerprint)
        {
            return None;
        }
        in_flight.insert(fingerprint.clone());
        Some(InFlight {
            set: &self.in_flight,
            fingerprint,
        })
    }

    fn remember_phone(&self, phone: &str) {
        let fingerprint = phone_fingerprint(phone);
        let mut list = self.submitted_fingerprints();
        if !list.contains(&fingerprint) {
            list.push(fingerprint);
        }
        if let Err(e) = self.session.set_json(SUBMITTED_PHONES_KEY, &list) {
            tracing::warn!("Could not record submitted phone: {}", e);
        }
    }

    fn stamp_rate_limit(&self) {
        if let Err(e) = self
            .local
            .set(RATE_LIMIT_KEY, &self.clock.now_ms().to_string())
        {
            tracing::warn!("Could not record submission time: {}", e);
        }
    }

    fn enrich(&self, mut payload: LeadPayload, page_url: Option<&str>) -> LeadPayload {
        payload.phone = normalize_phone(&payload.phone);
        payload.first_name = payload.first_name.trim().to_string();
        if let Some(url) = page_url {
            payload.page_url = Some(url.to_string());
        }
        apply_utm(&mut payload.utm, stored_utm(self.local.as_ref()));
        payload
    }

    fn publish_captured(&self, payload: &LeadPayload, server_success: bool) {
        self.bus.publish(FunnelEvent::LeadCaptured {
            phone: payload.phone.clone(),
            source: payload.source.clone(),
            campaign: payload.campaign_slug.clone(),
            stage: payload.profile_stage,
            server_success,
            timestamp: self.clock.now_ms(),
        });
    }

    async fn attempt_once(&self, payload: &LeadPayload) -> Delivery {
        match self.transport.post_lead(payload).await {
            Ok(resp) if resp.is_success() => Delivery::Accepted,
            Ok(resp) if resp.is_client_error() => Delivery::Rejected(resp.error_message()),
            Ok(resp) => Delivery::Failed(format!("Server error {}", resp.status)),
            Err(e) => Delivery::Failed(e.to_string()),
        }
    }

    /// Validates, deduplicates, rate-limits, enriches and delivers a lead.
    pub async fn submit(&self, payload: LeadPayload, page_url: Option<&str>) -> SubmitOutcome {
        if let Err(errors) = validate_lead(&payload) {
            return SubmitOutcome::Invalid(errors);
        }
        let Some(_claim) = self.reserve(&payload.phone) else {
            tracing::info!("Lead for this phone already submitted this session");
            return SubmitOutcome::AlreadySubmitted;
        };
        if self.is_rate_limited() {
            tracing::info!("Lead submission rate limited");
            return SubmitOutcome::RateLimited;
        }

        let enriched = self.enrich(payload, page_url);
        let mut last_error = String::new();

        for attempt in 0..=self.retry.max_retries {
            match self.attempt_once(&enriched).await {
                Delivery::Accepted => {
                    self.remember_phone(&enriched.phone);
                    self.stamp_rate_limit();
                    self.publish_captured(&enriched, true);
                    tracing::info!(
                        "Lead delivered (source={:?}, attempt {})",
                        enriched.source,
                        attempt + 1
                    );
                    return SubmitOutcome::Delivered;
                }
                Delivery::Rejected(error) => {
                    tracing::warn!("Lead rejected by API: {}", error);
                    return SubmitOutcome::Rejected { error };
                }
                Delivery::Failed(error) => {
                    tracing::warn!(
                        "Lead delivery attempt {} failed: {}",
                        attempt + 1,
                        error
                    );
                    last_error = error;
                }
            }

            if attempt < self.retry.max_retries {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        self.give_up(enriched, last_error)
    }

    fn give_up(&self, payload: LeadPayload, error: String) -> SubmitOutcome {
        tracing::error!(
            "Lead delivery failed after {} attempts, queued for replay: {}",
            self.retry.max_retries + 1,
            error
        );

        // The visitor was told it worked; a resubmission would only duplicate
        // the queued lead.
        self.remember_phone(&payload.phone);
        self.publish_captured(&payload, false);
        self.bus.publish(FunnelEvent::LeadDeliveryFailed {
            phone: payload.phone.clone(),
            error: error.clone(),
            timestamp: self.clock.now_ms(),
        });

        let entry = FailedLead {
            payload,
            error: error.clone(),
            failed_at: self.clock.now_ms(),
        };
        if let Err(e) = self.push_failed(entry) {
            tracing::error!("Could not persist failed lead: {}", e);
        }

        SubmitOutcome::DeliveredWithError { error }
    }

    fn push_failed(&self, entry: FailedLead) -> Result<(), FunnelError> {
        let mut queue = self.failed_leads()?;
        queue.push(entry);
        self.local.set_json(FAILED_LEADS_KEY, &queue)
    }

    /// Leads waiting in the outbox.
    pub fn failed_leads(&self) -> Result<Vec<FailedLead>, FunnelError> {
        Ok(self
            .local
            .get_json::<Vec<FailedLead>>(FAILED_LEADS_KEY)?
            .unwrap_or_default())
    }

    /// Resends queued leads once each, in order. Delivered and rejected
    /// entries leave the outbox; the first transient failure stops the replay
    /// and keeps it and everything after it.
    pub async fn replay_failed(&self) -> Result<ReplayReport, FunnelError> {
        let queue = self.failed_leads()?;
        let mut report = ReplayReport::default();
        let mut remaining = Vec::new();
        let mut stopped = false;

        for mut entry in queue {
            if stopped {
                remaining.push(entry);
                continue;
            }
            match self.attempt_once(&entry.payload).await {
                Delivery::Accepted => {
                    report.delivered += 1;
                    self.publish_captured(&entry.payload, true);
                }
                Delivery::Rejected(error) => {
                    tracing::warn!("Queued lead rejected on replay, dropping: {}", error);
                    report.rejected += 1;
                }
                Delivery::Failed(error) => {
                    tracing::warn!("Replay stopped on transient failure: {}", error);
                    entry.error = error;
                    remaining.push(entry);
                    stopped = true;
                }
            }
        }

        report.remaining = remaining.len();
        if remaining.is_empty() {
            self.local.remove(FAILED_LEADS_KEY)?;
        } else {
            self.local.set_json(FAILED_LEADS_KEY, &remaining)?;
        }

        tracing::info!(
            "Outbox replay: {} delivered, {} rejected, {} remaining",
            report.delivered,
            report.rejected,
            report.remaining
        );
        Ok(report)
    }
}
