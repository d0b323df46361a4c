//! Shared funnel state: popup visibility, lead-captured flag, profiling
//! stage and the published UTM snapshot.
//!
//! One `FunnelState` is created per browser session and handed to every
//! component that needs it. Persisted fields are written through to local
//! storage on each change.

use crate::errors::FunnelError;
use crate::models::{PopupConfig, UtmSnapshot};
use crate::storage::{KeyValueStore, KeyValueStoreExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const STATE_STORAGE_KEY: &str = "digisoft-lead";

/// Progressive profiling depth.
pub const MIN_STAGE: u8 = 1;
pub const MAX_STAGE: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedState {
    current_stage: u8,
    utm_params: UtmSnapshot,
    has_lead_been_captured: bool,
}

/// Point-in-time copy of the state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub session_id: Uuid,
    pub current_stage: u8,
    pub utm_params: UtmSnapshot,
    pub is_popup_open: bool,
    pub popup_config: PopupConfig,
    pub has_lead_been_captured: bool,
    pub popup_history: Vec<String>,
    pub last_popup_shown_at: Option<i64>,
}

struct Inner {
    session_id: Uuid,
    current_stage: u8,
    utm_params: UtmSnapshot,
    is_popup_open: bool,
    popup_config: PopupConfig,
    has_lead_been_captured: bool,
    popup_history: Vec<String>,
    last_popup_shown_at: Option<i64>,
}

impl Inner {
    fn persisted(&self) -> PersistedState {
        PersistedState {
            current_stage: self.current_stage,
            utm_params: self.utm_params.clone(),
            has_lead_been_captured: self.has_lead_been_captured,
        }
    }
}

#[derive(Clone)]
pub struct FunnelState {
    inner: Arc<Mutex<Inner>>,
    store: Arc<dyn KeyValueStore>,
}

impl FunnelState {
    /// Restores persisted fields from `store`; unreadable state starts fresh.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let persisted = match store.get_json::<PersistedState>(STATE_STORAGE_KEY) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Discarding unreadable funnel state: {}", e);
                None
            }
        };

        let inner = Inner {
            session_id: Uuid::new_v4(),
            current_stage: persisted
                .as_ref()
                .map(|p| p.current_stage.clamp(MIN_STAGE, MAX_STAGE))
                .unwrap_or(MIN_STAGE),
            utm_params: persisted
                .as_ref()
                .map(|p| p.utm_params.clone())
                .unwrap_or_default(),
            is_popup_open: false,
            popup_config: PopupConfig::default(),
            has_lead_been_captured: persisted
                .as_ref()
                .map(|p| p.has_lead_been_captured)
                .unwrap_or(false),
            popup_history: Vec::new(),
            last_popup_shown_at: None,
        };

        tracing::debug!(
            "Funnel state loaded for session {} (stage {}, captured {})",
            inner.session_id,
            inner.current_stage,
            inner.has_lead_been_captured
        );

        Self {
            inner: Arc::new(Mutex::new(inner)),
            store,
        }
    }

    fn persist(&self, state: PersistedState) {
        if let Err(e) = self.store.set_json(STATE_STORAGE_KEY, &state) {
            tracing::warn!("Failed to persist funnel state: {}", e);
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let s = self.inner.lock();
        StateSnapshot {
            session_id: s.session_id,
            current_stage: s.current_stage,
            utm_params: s.utm_params.clone(),
            is_popup_open: s.is_popup_open,
            popup_config: s.popup_config.clone(),
            has_lead_been_captured: s.has_lead_been_captured,
            popup_history: s.popup_history.clone(),
            last_popup_shown_at: s.last_popup_shown_at,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.lock().session_id
    }

    pub fn is_popup_open(&self) -> bool {
        self.inner.lock().is_popup_open
    }

    pub fn has_lead_been_captured(&self) -> bool {
        self.inner.lock().has_lead_been_captured
    }

    pub fn current_stage(&self) -> u8 {
        self.inner.lock().current_stage
    }

    pub fn open_popup(&self, config: PopupConfig, now_ms: i64) {
        let mut s = self.inner.lock();
        s.popup_history.push(config.kind.as_str().to_string());
        s.popup_config = config;
        s.is_popup_open = true;
        s.last_popup_shown_at = Some(now_ms);
    }

    pub fn close_popup(&self) {
        self.inner.lock().is_popup_open = false;
    }

    pub fn mark_lead_captured(&self) {
        let persisted = {
            let mut s = self.inner.lock();
            s.has_lead_been_captured = true;
            s.persisted()
        };
        self.persist(persisted);
    }

    pub fn set_stage(&self, stage: u8) -> Result<(), FunnelError> {
        if !(MIN_STAGE..=MAX_STAGE).contains(&stage) {
            return Err(FunnelError::InvalidInput(format!(
                "stage {} outside {}..={}",
                stage, MIN_STAGE, MAX_STAGE
            )));
        }
        let persisted = {
            let mut s = self.inner.lock();
            s.current_stage = stage;
            s.persisted()
        };
        self.persist(persisted);
        Ok(())
    }

    pub fn set_utm_params(&self, params: UtmSnapshot) {
        let persisted = {
            let mut s = self.inner.lock();
            s.utm_params = params;
            s.persisted()
        };
        self.persist(persisted);
    }

    /// Clears the lead progress. UTM attribution is kept.
    pub fn reset_lead(&self) {
        let persisted = {
            let mut s = self.inner.lock();
            s.current_stage = MIN_STAGE;
            s.has_lead_been_captured = false;
            s.popup_history.clear();
            s.last_popup_shown_at = None;
            s.persisted()
        };
        self.persist(persisted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PopupKind;
    use crate::storage::MemoryStore;

    #[test]
    fn test_open_popup_records_history() {
        let state = FunnelState::load(Arc::new(MemoryStore::new()));
        state.open_popup(
            PopupConfig {
                kind: PopupKind::LeadMagnet,
                ..Default::default()
            },
            42,
        );

        let snap = state.snapshot();
        assert!(snap.is_popup_open);
        assert_eq!(snap.popup_history, vec!["lead-magnet".to_string()]);
        assert_eq!(snap.last_popup_shown_at, Some(42));

        state.close_popup();
        assert!(!state.is_popup_open());
    }

    #[test]
    fn test_persisted_fields_survive_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let state = FunnelState::load(store.clone());
        state.set_stage(3).unwrap();
        state.mark_lead_captured();
        state.open_popup(PopupConfig::default(), 1);

        let reloaded = FunnelState::load(store);
        let snap = reloaded.snapshot();
        assert_eq!(snap.current_stage, 3);
        assert!(snap.has_lead_been_captured);
        // Popup visibility is per page, never persisted.
        assert!(!snap.is_popup_open);
        assert_ne!(snap.session_id, state.session_id());
    }

    #[test]
    fn test_stage_bounds() {
        let state = FunnelState::load(Arc::new(MemoryStore::new()));
        assert!(state.set_stage(0).is_err());
        assert!(state.set_stage(5).is_err());
        assert_eq!(state.current_stage(), 1);
    }

    #[test]
    fn test_reset_keeps_attribution() {
        let state = FunnelState::load(Arc::new(MemoryStore::new()));
        state.set_utm_params(UtmSnapshot {
            utm_source: Some("google".to_string()),
            ..Default::default()
        });
        state.mark_lead_captured();
        state.reset_lead();

        let snap = state.snapshot();
        assert!(!snap.has_lead_been_captured);
        assert_eq!(snap.utm_params.utm_source.as_deref(), Some("google"));
    }

    #[test]
    fn test_corrupt_state_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        store.set(STATE_STORAGE_KEY, "not json").unwrap();
        let state = FunnelState::load(store);
        assert_eq!(state.current_stage(), 1);
        assert!(!state.has_lead_been_captured());
    }
}
