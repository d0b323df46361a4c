//! DigiSoft Lead Funnel Library
//!
//! This library provides the client-side lead-capture orchestration for the
//! DigiSoft property microsites: UTM attribution, popup trigger coordination,
//! guarded lead submission with retry and a durable outbox, and sticky A/B
//! variant assignment. Browser capabilities (storage, cookies, clock,
//! randomness, analytics) are injected through traits so the same logic runs
//! in the page, in tests and in the `digisoft-funnel` CLI.
//!
//! # Modules
//!
//! - `ab_test`: Experiment catalog and sticky variant assignment.
//! - `analytics`: Analytics egress for funnel events.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `events`: Typed funnel events and the broadcast bus.
//! - `funnel`: Per-session wiring of every component.
//! - `gateway_client`: Lead capture API client.
//! - `models`: Core data models.
//! - `platform`: Clock, randomness and render-target capabilities.
//! - `state`: Shared funnel state container.
//! - `storage`: Local/session storage and cookies.
//! - `submission`: Validation, dedup, rate limit, retry and outbox.
//! - `trigger`: Popup trigger coordination.
//! - `utm`: Last-touch UTM attribution.
//! - `validation`: Field validation rules.

pub mod ab_test;
pub mod analytics;
pub mod config;
pub mod errors;
pub mod events;
pub mod funnel;
pub mod gateway_client;
pub mod models;
pub mod platform;
pub mod state;
pub mod storage;
pub mod submission;
pub mod trigger;
pub mod utm;
pub mod validation;

pub use errors::{FunnelError, ResultExt};
pub use funnel::{FunnelPlatform, LeadFunnel};
pub use models::{LeadPayload, SubmitOutcome, UtmSnapshot, Variant};
