//! Per-session wiring of the funnel components.
//!
//! [`LeadFunnel`] owns the shared state and event bus and hands them to the
//! UTM store, the variant assigner, the submission guard and every trigger
//! coordinator it builds.

use crate::ab_test::VariantAssigner;
use crate::analytics::{spawn_forwarder, Analytics};
use crate::errors::FunnelError;
use crate::events::EventBus;
use crate::gateway_client::LeadTransport;
use crate::models::{LeadPayload, SubmitOutcome, UtmSnapshot};
use crate::platform::{Clock, RandomSource, RenderTarget};
use crate::state::FunnelState;
use crate::storage::{CookieJar, KeyValueStore};
use crate::submission::{ReplayReport, RetryPolicy, SubmissionGuard};
use crate::trigger::{TriggerCoordinator, TriggerSettings};
use crate::utm::UtmAttribution;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const SCROLL_TIMING_TEST: &str = "scroll-popup-timing";

/// Host capabilities the funnel runs on.
#[derive(Clone)]
pub struct FunnelPlatform {
    pub local: Arc<dyn KeyValueStore>,
    pub session: Arc<dyn KeyValueStore>,
    pub cookies: Arc<dyn CookieJar>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub render: RenderTarget,
}

pub struct LeadFunnel {
    state: FunnelState,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    render: RenderTarget,
    settings: TriggerSettings,
    scroll_experiment: bool,
    utm: UtmAttribution,
    assigner: VariantAssigner,
    guard: SubmissionGuard,
    analytics: Analytics,
}

impl LeadFunnel {
    pub fn new(
        platform: FunnelPlatform,
        transport: Arc<dyn LeadTransport>,
        settings: TriggerSettings,
    ) -> Self {
        let bus = EventBus::default();
        let state = FunnelState::load(platform.local.clone());

        let utm = UtmAttribution::new(
            platform.local.clone(),
            platform.cookies.clone(),
            platform.clock.clone(),
            state.clone(),
        );
        let assigner = VariantAssigner::new(
            platform.local.clone(),
            platform.random.clone(),
            platform.clock.clone(),
            bus.clone(),
        );
        let guard = SubmissionGuard::new(
            transport,
            platform.local.clone(),
            platform.session.clone(),
            platform.clock.clone(),
            bus.clone(),
        );

        Self {
            state,
            bus,
            clock: platform.clock,
            render: platform.render,
            settings,
            scroll_experiment: false,
            utm,
            assigner,
            guard,
            analytics: Analytics::default(),
        }
    }

    pub fn with_analytics(mut self, analytics: Analytics) -> Self {
        self.analytics = analytics;
        self
    }

    /// Lets the `scroll-popup-timing` experiment pick the scroll threshold
    /// instead of the configured one.
    pub fn with_scroll_experiment(mut self, enabled: bool) -> Self {
        self.scroll_experiment = enabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.guard = self.guard.with_retry_policy(retry);
        self
    }

    pub fn state(&self) -> &FunnelState {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn assigner(&self) -> &VariantAssigner {
        &self.assigner
    }

    pub fn guard(&self) -> &SubmissionGuard {
        &self.guard
    }

    pub fn utm(&self) -> &UtmAttribution {
        &self.utm
    }

    /// Forwards bus events to the configured analytics sink.
    pub fn spawn_analytics(&self) -> JoinHandle<()> {
        spawn_forwarder(&self.bus, self.analytics.clone())
    }

    /// Route change. Captures UTM attribution from the new URL.
    pub fn navigate(&self, url: &str) -> Result<Option<UtmSnapshot>, FunnelError> {
        tracing::debug!("Navigation to {}", url);
        self.utm.capture(url)
    }

    /// Trigger settings for this visitor. The configured scroll threshold
    /// applies unless the scroll timing experiment is enabled.
    pub fn trigger_settings(&self) -> TriggerSettings {
        let mut settings = self.settings.clone();
        if !self.scroll_experiment {
            return settings;
        }
        if let Some(depth) = self
            .assigner
            .variant_value(SCROLL_TIMING_TEST, "triggerAt")
            .and_then(|raw| raw.parse::<f64>().ok())
        {
            settings.scroll_depth = depth;
        }
        settings
    }

    /// Builds a coordinator for one page visit.
    pub fn coordinator(&self) -> TriggerCoordinator {
        TriggerCoordinator::new(
            self.trigger_settings(),
            self.state.clone(),
            self.bus.clone(),
            self.clock.clone(),
            self.render,
        )
    }

    /// Submits a lead through the guard and updates the funnel on success.
    pub async fn submit(&self, mut payload: LeadPayload, page_url: Option<&str>) -> SubmitOutcome {
        let source = payload.source.clone().unwrap_or_else(|| "unknown".to_string());
        self.analytics.form_submit(&source, payload.profile_stage);

        let assignments = self.assigner.assignments();
        if payload.ab_test_variants.is_none() && !assignments.is_empty() {
            payload.ab_test_variants = Some(assignments.clone());
        }
        let requested_stage = payload.profile_stage;

        let outcome = self.guard.submit(payload, page_url).await;
        if !outcome.is_success() {
            return outcome;
        }

        self.state.mark_lead_captured();
        if let Some(stage) = requested_stage {
            let next = stage.max(self.state.current_stage());
            if let Err(e) = self.state.set_stage(next) {
                tracing::warn!("Could not advance profiling stage: {}", e);
            }
        }
        for test_id in assignments.keys() {
            self.assigner.record_conversion(test_id);
        }
        if self.state.is_popup_open() {
            self.analytics.popup_converted(&source);
            self.state.close_popup();
        }
        outcome
    }

    pub fn close_popup(&self) {
        self.state.close_popup();
    }

    pub async fn replay_failed(&self) -> Result<ReplayReport, FunnelError> {
        self.guard.replay_failed().await
    }
}
