//! Analytics egress.
//!
//! Funnel events are forwarded to a global analytics function (gtag-style)
//! when one is installed. Without one every call is a silent no-op.

use crate::events::{AbEventKind, EventBus, FunnelEvent};
use crate::models::Variant;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub type AnalyticsParams = BTreeMap<String, Value>;

/// The page's analytics function, e.g. `window.gtag('event', name, params)`.
pub trait AnalyticsSink: Send + Sync {
    fn event(&self, name: &str, params: &AnalyticsParams);
}

/// Sink that writes analytics events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn event(&self, name: &str, params: &AnalyticsParams) {
        tracing::info!(target: "digisoft_funnel::analytics", "{} {:?}", name, params);
    }
}

fn params<const N: usize>(pairs: [(&str, Value); N]) -> AnalyticsParams {
    pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Tracking helpers bound to an optional sink.
#[derive(Clone, Default)]
pub struct Analytics {
    sink: Option<Arc<dyn AnalyticsSink>>,
}

impl Analytics {
    pub fn new(sink: Option<Arc<dyn AnalyticsSink>>) -> Self {
        Self { sink }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    fn send(&self, name: &str, params: AnalyticsParams) {
        if let Some(ref sink) = self.sink {
            sink.event(name, &params);
        }
    }

    pub fn property_view(&self, slug: &str, title: &str, price: u64) {
        self.send(
            "property_view",
            params([
                ("property_slug", json!(slug)),
                ("property_title", json!(title)),
                ("price", json!(price)),
            ]),
        );
    }

    pub fn form_view(&self, source: &str, property_slug: Option<&str>) {
        self.send(
            "form_view",
            params([
                ("form_source", json!(source)),
                ("property_slug", json!(property_slug)),
            ]),
        );
    }

    pub fn form_start(&self, source: &str) {
        self.send("form_start", params([("form_source", json!(source))]));
    }

    pub fn form_submit(&self, source: &str, stage: Option<u8>) {
        self.send(
            "form_submit",
            params([("form_source", json!(source)), ("stage", json!(stage))]),
        );
    }

    pub fn lead_captured(&self, source: &str, campaign_slug: Option<&str>) {
        self.send(
            "lead_captured",
            params([
                ("form_source", json!(source)),
                ("campaign_slug", json!(campaign_slug)),
                ("value", json!(1)),
                ("currency", json!("INR")),
            ]),
        );
    }

    pub fn popup_shown(&self, trigger: &str, popup_type: &str) {
        self.send(
            "popup_shown",
            params([("trigger", json!(trigger)), ("popup_type", json!(popup_type))]),
        );
    }

    pub fn popup_closed(&self, trigger: &str, popup_type: &str) {
        self.send(
            "popup_closed",
            params([("trigger", json!(trigger)), ("popup_type", json!(popup_type))]),
        );
    }

    pub fn popup_converted(&self, trigger: &str) {
        self.send("popup_converted", params([("trigger", json!(trigger))]));
    }

    pub fn whatsapp_click(&self, property_slug: Option<&str>) {
        self.send(
            "whatsapp_click",
            params([("property_slug", json!(property_slug))]),
        );
    }

    pub fn call_click(&self, property_slug: Option<&str>) {
        self.send("call_click", params([("property_slug", json!(property_slug))]));
    }

    pub fn brochure_download(&self, property_slug: Option<&str>) {
        self.send(
            "brochure_download",
            params([("property_slug", json!(property_slug))]),
        );
    }

    pub fn site_visit_request(&self, property_slug: Option<&str>) {
        self.send(
            "site_visit_request",
            params([("property_slug", json!(property_slug))]),
        );
    }

    pub fn ab_event(&self, test_id: &str, variant: Variant, kind: AbEventKind) {
        let name = match kind {
            AbEventKind::Impression => "ab_impression",
            AbEventKind::Conversion => "ab_conversion",
        };
        self.send(
            name,
            params([("test_id", json!(test_id)), ("variant", json!(variant.as_str()))]),
        );
    }

    pub fn scroll_depth(&self, percentage: u8) {
        self.send("scroll_depth", params([("percentage", json!(percentage))]));
    }

    pub fn lead_delivery_failed(&self, error: &str) {
        self.send("lead_delivery_failed", params([("error", json!(error))]));
    }

    /// Maps one funnel event onto its analytics call.
    pub fn forward(&self, event: &FunnelEvent) {
        match event {
            FunnelEvent::LeadCaptured {
                source, campaign, ..
            } => self.lead_captured(source.as_deref().unwrap_or("unknown"), campaign.as_deref()),
            FunnelEvent::LeadDeliveryFailed { error, .. } => self.lead_delivery_failed(error),
            FunnelEvent::PopupTriggered { source, config } => {
                self.popup_shown(source.as_str(), config.kind.as_str())
            }
            FunnelEvent::AbEvent {
                test_id,
                variant,
                kind,
                ..
            } => self.ab_event(test_id, *variant, *kind),
            FunnelEvent::ScrollDepth { percentage } => self.scroll_depth(*percentage),
        }
    }
}

/// Subscribes to `bus` and forwards every event until the bus closes.
pub fn spawn_forwarder(bus: &EventBus, analytics: Analytics) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => analytics.forward(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Analytics forwarder lagged, dropped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Analytics forwarder stopped");
    })
}
