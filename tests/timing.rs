/// Timer-driven behavior under a paused tokio clock
/// Covers the popup delay driver and submission backoff without real waiting
use async_trait::async_trait;
use digisoft_funnel::errors::FunnelError;
use digisoft_funnel::events::EventBus;
use digisoft_funnel::gateway_client::{LeadTransport, TransportResponse};
use digisoft_funnel::models::{PopupKind, TriggerSource};
use digisoft_funnel::platform::{RenderTarget, TokioClock};
use digisoft_funnel::state::FunnelState;
use digisoft_funnel::storage::MemoryStore;
use digisoft_funnel::submission::SubmissionGuard;
use digisoft_funnel::trigger::{
    PageSignal, ScrollMetrics, TriggerCoordinator, TriggerFired, TriggerSettings, Visibility,
};
use digisoft_funnel::validation::CONSENT_TEXT;
use digisoft_funnel::{LeadPayload, SubmitOutcome};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Transport that replays scripted statuses and records call times.
struct ScriptedTransport {
    script: Mutex<VecDeque<Option<u16>>>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Option<u16>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LeadTransport for ScriptedTransport {
    async fn post_lead(&self, _payload: &LeadPayload) -> Result<TransportResponse, FunnelError> {
        self.calls.lock().push(Instant::now());
        match self.script.lock().pop_front().flatten() {
            Some(status) => Ok(TransportResponse {
                status,
                body: String::new(),
            }),
            None => Err(FunnelError::TransportError("connection refused".to_string())),
        }
    }
}

fn lead() -> LeadPayload {
    LeadPayload {
        first_name: "Meera".to_string(),
        phone: "9988776655".to_string(),
        consent_given: true,
        consent_text: CONSENT_TEXT.to_string(),
        ..Default::default()
    }
}

fn guard(transport: Arc<ScriptedTransport>) -> SubmissionGuard {
    SubmissionGuard::new(
        transport,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(TokioClock::new()),
        EventBus::default(),
    )
}

fn gaps(calls: &[Instant]) -> Vec<Duration> {
    calls.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_one_then_two_seconds() {
    let transport = Arc::new(ScriptedTransport::new(vec![None, None, None]));
    let guard = guard(transport.clone());

    let outcome = guard.submit(lead(), None).await;
    assert!(matches!(outcome, SubmitOutcome::DeliveredWithError { .. }));

    let calls = transport.calls.lock();
    assert_eq!(calls.len(), 3);
    let gaps = gaps(&calls);
    for (gap, expected) in gaps.iter().zip([Duration::from_secs(1), Duration::from_secs(2)]) {
        assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
        assert!(*gap < expected + Duration::from_millis(50));
    }
}

#[tokio::test(start_paused = true)]
async fn test_recovery_on_second_attempt() {
    let transport = Arc::new(ScriptedTransport::new(vec![Some(500), Some(201)]));
    let guard = guard(transport.clone());

    assert_eq!(guard.submit(lead(), None).await, SubmitOutcome::Delivered);
    assert_eq!(transport.calls.lock().len(), 2);
    assert!(guard.failed_leads().unwrap().is_empty());
    assert!(guard.is_rate_limited());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_submits_for_same_phone_post_once() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Some(500),
        Some(201),
        Some(201),
    ]));
    let guard = guard(transport.clone());

    let (first, second) = tokio::join!(guard.submit(lead(), None), guard.submit(lead(), None));

    assert_eq!(first, SubmitOutcome::Delivered);
    assert_eq!(second, SubmitOutcome::AlreadySubmitted);
    assert_eq!(transport.calls.lock().len(), 2);
    assert!(guard.is_already_submitted("9988776655"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_lead_releases_phone() {
    let transport = Arc::new(ScriptedTransport::new(vec![Some(422), Some(201)]));
    let guard = guard(transport.clone());

    assert_eq!(
        guard.submit(lead(), None).await,
        SubmitOutcome::Rejected {
            error: "Error 422".to_string()
        }
    );
    assert_eq!(guard.submit(lead(), None).await, SubmitOutcome::Delivered);
    assert_eq!(transport.calls.lock().len(), 2);
}

struct Page {
    state: FunnelState,
    signals: mpsc::Sender<PageSignal>,
    driver: tokio::task::JoinHandle<Vec<TriggerFired>>,
}

fn open_page(settings: TriggerSettings) -> Page {
    let state = FunnelState::load(Arc::new(MemoryStore::new()));
    let coordinator = TriggerCoordinator::new(
        settings,
        state.clone(),
        EventBus::default(),
        Arc::new(TokioClock::new()),
        RenderTarget::Browser,
    );
    let (signals, rx) = mpsc::channel(16);
    let driver = tokio::spawn(coordinator.run(rx));
    Page {
        state,
        signals,
        driver,
    }
}

fn scrolled(pct: f64) -> ScrollMetrics {
    ScrollMetrics {
        scroll_y: pct * 20.0,
        scroll_height: 2800.0,
        inner_height: 800.0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_delay_timer_opens_lead_magnet() {
    let page = open_page(TriggerSettings::default());

    tokio::time::sleep(Duration::from_millis(7_900)).await;
    assert!(!page.state.is_popup_open());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(page.state.is_popup_open());

    drop(page.signals);
    let fired = page.driver.await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].source, TriggerSource::TimeDelay);
    assert_eq!(fired[0].config.kind, PopupKind::LeadMagnet);
}

#[tokio::test(start_paused = true)]
async fn test_scroll_first_cancels_delay() {
    let page = open_page(TriggerSettings::default());

    tokio::time::sleep(Duration::from_secs(2)).await;
    page.signals
        .send(PageSignal::Scroll(scrolled(40.0)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    page.signals
        .send(PageSignal::VisibilityChange(Visibility::Hidden))
        .await
        .unwrap();
    drop(page.signals);

    let fired = page.driver.await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].source, TriggerSource::ScrollDepth);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_pending_timer() {
    let page = open_page(TriggerSettings::default());

    tokio::time::sleep(Duration::from_secs(3)).await;
    page.signals.send(PageSignal::Teardown).await.unwrap();

    let fired = page.driver.await.unwrap();
    assert!(fired.is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!page.state.is_popup_open());
}

#[tokio::test(start_paused = true)]
async fn test_visibility_exit_intent_after_dwell() {
    let page = open_page(TriggerSettings {
        delay: Duration::from_secs(60),
        ..Default::default()
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    page.signals
        .send(PageSignal::VisibilityChange(Visibility::Hidden))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    page.signals
        .send(PageSignal::VisibilityChange(Visibility::Hidden))
        .await
        .unwrap();
    drop(page.signals);

    let fired = page.driver.await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].source, TriggerSource::ExitIntent);
    assert_eq!(fired[0].config.kind, PopupKind::ExitIntent);
}

#[tokio::test(start_paused = true)]
async fn test_manual_trigger_after_auto_trigger() {
    let page = open_page(TriggerSettings::default());

    tokio::time::sleep(Duration::from_secs(9)).await;
    page.signals
        .send(PageSignal::Manual {
            source: TriggerSource::CtaClick,
            overrides: Default::default(),
        })
        .await
        .unwrap();
    drop(page.signals);

    let fired = page.driver.await.unwrap();
    let sources: Vec<_> = fired.iter().map(|f| f.source).collect();
    assert_eq!(sources, vec![TriggerSource::TimeDelay, TriggerSource::CtaClick]);
}
