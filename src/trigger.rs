//! Popup trigger coordination.
//!
//! Three automatic signals (time delay, scroll depth, exit intent) race to
//! open the lead-capture popup. The first one to qualify wins and the rest
//! become no-ops for the remainder of the page visit. Manual triggers (CTA
//! clicks) skip the once-per-visit rule but never fire after a lead has been
//! captured.
//!
//! [`TriggerCoordinator`] holds the rules and is driven either directly (one
//! call per browser event) or through [`TriggerCoordinator::run`], which
//! owns the delay timer and consumes [`PageSignal`]s from a channel.

use crate::events::{EventBus, FunnelEvent};
use crate::models::{PopupConfig, PopupKind, PopupOverrides, TriggerSource};
use crate::platform::{Clock, RenderTarget};
use crate::state::FunnelState;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_DELAY: Duration = Duration::from_millis(8000);
pub const DEFAULT_SCROLL_DEPTH: f64 = 35.0;
pub const DEFAULT_MIN_DWELL: Duration = Duration::from_millis(3000);
pub const DEFAULT_EXIT_THRESHOLD_PX: f64 = 10.0;
pub const DEFAULT_DEPTH_MARKS: [u8; 4] = [25, 50, 75, 100];

/// Per-page trigger configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSettings {
    pub delay: Duration,
    /// Percentage of scrollable height.
    pub scroll_depth: f64,
    pub exit_intent: bool,
    /// Opt-out for pages that already show a dedicated form.
    pub disabled: bool,
    /// Exit intent is ignored until the visitor has been on the page this long.
    pub min_dwell: Duration,
    /// Pointer distance from the viewport top that counts as leaving.
    pub exit_threshold_px: f64,
    /// Page-level popup config injected into every trigger.
    pub default_config: PopupOverrides,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            scroll_depth: DEFAULT_SCROLL_DEPTH,
            exit_intent: true,
            disabled: false,
            min_dwell: DEFAULT_MIN_DWELL,
            exit_threshold_px: DEFAULT_EXIT_THRESHOLD_PX,
            default_config: PopupOverrides::default(),
        }
    }
}

/// Scroll position as reported by the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_y: f64,
    pub scroll_height: f64,
    pub inner_height: f64,
}

impl ScrollMetrics {
    /// `scroll_y / (scroll_height - inner_height) * 100`, or `None` when the
    /// page is not scrollable.
    pub fn percent(&self) -> Option<f64> {
        let total = self.scroll_height - self.inner_height;
        if total <= 0.0 {
            return None;
        }
        Some(self.scroll_y / total * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Browser events fed to the coordinator driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSignal {
    Scroll(ScrollMetrics),
    PointerMove { client_y: f64 },
    VisibilityChange(Visibility),
    Manual {
        source: TriggerSource,
        overrides: PopupOverrides,
    },
    /// Component teardown / navigation away.
    Teardown,
}

/// A popup that was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFired {
    pub source: TriggerSource,
    pub config: PopupConfig,
}

/// Reports analytics scroll-depth marks once each per visit.
#[derive(Debug, Clone)]
pub struct ScrollDepthTracker {
    marks: Vec<u8>,
    reported: BTreeSet<u8>,
}

impl ScrollDepthTracker {
    pub fn new(marks: impl Into<Vec<u8>>) -> Self {
        let mut marks = marks.into();
        marks.sort_unstable();
        marks.dedup();
        Self {
            marks,
            reported: BTreeSet::new(),
        }
    }

    /// Returns the marks newly crossed by this scroll position.
    pub fn observe(&mut self, metrics: &ScrollMetrics) -> Vec<u8> {
        let Some(pct) = metrics.percent() else {
            return Vec::new();
        };
        let pct = pct.round();
        let mut crossed = Vec::new();
        for &mark in &self.marks {
            if pct >= f64::from(mark) && self.reported.insert(mark) {
                crossed.push(mark);
            }
        }
        crossed
    }
}

impl Default for ScrollDepthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH_MARKS)
    }
}

pub struct TriggerCoordinator {
    settings: TriggerSettings,
    state: FunnelState,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    render: RenderTarget,
    armed_at: Option<i64>,
    has_triggered: bool,
    last_pointer_y: Option<f64>,
    torn_down: bool,
    depth: ScrollDepthTracker,
}

impl TriggerCoordinator {
    pub fn new(
        settings: TriggerSettings,
        state: FunnelState,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        render: RenderTarget,
    ) -> Self {
        Self {
            settings,
            state,
            bus,
            clock,
            render,
            armed_at: None,
            has_triggered: false,
            last_pointer_y: None,
            torn_down: false,
            depth: ScrollDepthTracker::default(),
        }
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    pub fn has_triggered(&self) -> bool {
        self.has_triggered
    }

    /// Whether automatic triggers are listening.
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some() && !self.has_triggered && !self.torn_down
    }

    /// Starts the page visit. Returns `false` when auto triggers stay inert:
    /// server render, disabled page, or a lead already captured.
    pub fn arm(&mut self) -> bool {
        if !self.render.is_browser() {
            tracing::debug!("Trigger coordinator inert outside the browser");
            return false;
        }
        if self.settings.disabled {
            tracing::debug!("Auto triggers disabled for this page");
            return false;
        }
        if self.state.has_lead_been_captured() {
            tracing::debug!("Lead already captured, auto triggers not armed");
            return false;
        }
        let now = self.clock.now_ms();
        self.armed_at = Some(now);
        tracing::debug!(
            "Armed popup triggers: delay={:?} scroll={}% exit_intent={}",
            self.settings.delay,
            self.settings.scroll_depth,
            self.settings.exit_intent
        );
        true
    }

    /// Epoch-ms deadline of the pending delay timer, if one is running.
    pub fn delay_deadline_ms(&self) -> Option<i64> {
        if !self.is_armed() {
            return None;
        }
        self.armed_at
            .map(|t| t + self.settings.delay.as_millis() as i64)
    }

    fn dwell_elapsed(&self, now: i64) -> bool {
        self.armed_at
            .map(|t| now - t >= self.settings.min_dwell.as_millis() as i64)
            .unwrap_or(false)
    }

    /// Delay timer callback.
    pub fn on_tick(&mut self) -> Option<TriggerFired> {
        let deadline = self.delay_deadline_ms()?;
        if self.clock.now_ms() < deadline {
            return None;
        }
        self.fire(
            TriggerSource::TimeDelay,
            PopupOverrides::kind(PopupKind::LeadMagnet),
        )
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> Option<TriggerFired> {
        if !self.render.is_browser() || self.torn_down {
            return None;
        }
        for percentage in self.depth.observe(&metrics) {
            self.bus.publish(FunnelEvent::ScrollDepth { percentage });
        }

        if !self.is_armed() {
            return None;
        }
        let pct = metrics.percent()?;
        if pct < self.settings.scroll_depth {
            return None;
        }
        self.fire(
            TriggerSource::ScrollDepth,
            PopupOverrides::kind(PopupKind::LeadForm),
        )
    }

    /// Desktop exit intent: pointer crossing the threshold while moving up
    /// toward the browser chrome. Pointer tracking starts once the dwell
    /// time has passed; earlier moves are ignored.
    pub fn on_pointer_move(&mut self, client_y: f64) -> Option<TriggerFired> {
        if !self.settings.exit_intent || !self.is_armed() {
            return None;
        }
        if !self.dwell_elapsed(self.clock.now_ms()) {
            return None;
        }
        let last_y = self.last_pointer_y.replace(client_y);
        let threshold = self.settings.exit_threshold_px;
        match last_y {
            Some(prev) if client_y < threshold && prev > threshold => self.fire(
                TriggerSource::ExitIntent,
                PopupOverrides::kind(PopupKind::ExitIntent),
            ),
            _ => None,
        }
    }

    /// Mobile exit intent: tab switch or app minimize.
    pub fn on_visibility_change(&mut self, visibility: Visibility) -> Option<TriggerFired> {
        if visibility != Visibility::Hidden || !self.settings.exit_intent || !self.is_armed() {
            return None;
        }
        if !self.dwell_elapsed(self.clock.now_ms()) {
            return None;
        }
        self.fire(
            TriggerSource::ExitIntent,
            PopupOverrides::kind(PopupKind::ExitIntent),
        )
    }

    /// Explicit CTA click. Works on pages with auto triggers disabled.
    pub fn trigger_manual(
        &mut self,
        source: TriggerSource,
        overrides: PopupOverrides,
    ) -> Option<TriggerFired> {
        if !self.render.is_browser() || self.torn_down {
            return None;
        }
        let source = if source.is_manual() {
            source
        } else {
            TriggerSource::Manual
        };
        self.fire(source, overrides)
    }

    pub fn handle(&mut self, signal: PageSignal) -> Option<TriggerFired> {
        match signal {
            PageSignal::Scroll(metrics) => self.on_scroll(metrics),
            PageSignal::PointerMove { client_y } => self.on_pointer_move(client_y),
            PageSignal::VisibilityChange(v) => self.on_visibility_change(v),
            PageSignal::Manual { source, overrides } => self.trigger_manual(source, overrides),
            PageSignal::Teardown => {
                self.teardown();
                None
            }
        }
    }

    /// Cancels every pending trigger.
    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.armed_at = None;
    }

    fn fire(&mut self, source: TriggerSource, overrides: PopupOverrides) -> Option<TriggerFired> {
        if self.state.has_lead_been_captured() {
            tracing::debug!("Suppressed {} trigger: lead already captured", source.as_str());
            if !source.is_manual() {
                self.armed_at = None;
            }
            return None;
        }
        if self.has_triggered && !source.is_manual() {
            return None;
        }
        self.has_triggered = true;

        let config = PopupConfig::default()
            .merged(&self.settings.default_config)
            .merged(&overrides);

        self.state.open_popup(config.clone(), self.clock.now_ms());
        self.bus.publish(FunnelEvent::PopupTriggered {
            source,
            config: config.clone(),
        });

        tracing::info!(
            "Popup opened by {} trigger ({})",
            source.as_str(),
            config.kind.as_str()
        );
        Some(TriggerFired { source, config })
    }

    /// Drives the coordinator from a signal channel until teardown or until
    /// the sender side is dropped. Returns every popup opened during the
    /// visit.
    pub async fn run(mut self, mut signals: mpsc::Receiver<PageSignal>) -> Vec<TriggerFired> {
        let mut fired = Vec::new();
        self.arm();

        loop {
            let wait = self
                .delay_deadline_ms()
                .map(|deadline| (deadline - self.clock.now_ms()).max(0) as u64);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait.unwrap_or_default())), if wait.is_some() => {
                    fired.extend(self.on_tick());
                }
                signal = signals.recv() => {
                    match signal {
                        None | Some(PageSignal::Teardown) => break,
                        Some(signal) => fired.extend(self.handle(signal)),
                    }
                }
            }
        }

        self.teardown();
        tracing::debug!("Trigger coordinator stopped after {} popup(s)", fired.len());
        fired
    }
}
