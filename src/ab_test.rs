//! Sticky A/B bucketing.
//!
//! Each test id gets one persisted variant per browser. Assignment draws
//! once, records an impression and never changes afterwards.

use crate::events::{AbEventKind, EventBus, FunnelEvent};
use crate::models::Variant;
use crate::platform::{Clock, RandomSource};
use crate::storage::KeyValueStore;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const AB_STORAGE_PREFIX: &str = "digisoft_ab_";
pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;

/// A running experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct AbTest {
    pub id: &'static str,
    /// Probability of variant A.
    pub split_ratio: f64,
    pub hypothesis: &'static str,
    pub variant_a: &'static [(&'static str, &'static str)],
    pub variant_b: &'static [(&'static str, &'static str)],
}

impl AbTest {
    pub fn values(&self, variant: Variant) -> &'static [(&'static str, &'static str)] {
        match variant {
            Variant::A => self.variant_a,
            Variant::B => self.variant_b,
        }
    }

    pub fn value(&self, variant: Variant, key: &str) -> Option<&'static str> {
        self.values(variant)
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

pub static AB_TESTS: &[AbTest] = &[
    AbTest {
        id: "popup-headline",
        split_ratio: 0.5,
        hypothesis: "Does urgency framing outperform value framing for lead capture?",
        variant_a: &[
            ("headline", "Before You Leave — Get Your Free Report"),
            ("subheadline", "Download the Gurugram 2026 Investment ROI Forecast"),
            ("cta", "Send Me the Free Report"),
            ("badge", "Limited Time"),
        ],
        variant_b: &[
            ("headline", "Gurugram 2026 Investment ROI Forecast"),
            ("subheadline", "Expert analysis of which sectors will deliver 20%+ returns"),
            ("cta", "Get Instant Access — Free"),
            ("badge", "HNI Favourite"),
        ],
    },
    AbTest {
        id: "scroll-popup-timing",
        split_ratio: 0.5,
        hypothesis: "35% scroll depth vs 50% — which produces higher conversion rate?",
        variant_a: &[("triggerAt", "35")],
        variant_b: &[("triggerAt", "50")],
    },
    AbTest {
        id: "lead-form-cta",
        split_ratio: 0.5,
        hypothesis: "Direct action CTA vs benefit-focused CTA",
        variant_a: &[("buttonText", "Get Free Consultation"), ("buttonIcon", "phone")],
        variant_b: &[("buttonText", "Unlock VIP Pricing"), ("buttonIcon", "lock")],
    },
    AbTest {
        id: "form-type",
        split_ratio: 0.5,
        hypothesis: "Progressive multi-step form vs. single compact form",
        variant_a: &[("type", "progressive")],
        variant_b: &[("type", "compact")],
    },
    AbTest {
        id: "exit-intent-type",
        split_ratio: 0.5,
        hypothesis: "Lead magnet chooser vs. simple phone-first form",
        variant_a: &[("type", "lead-magnet-chooser")],
        variant_b: &[("type", "phone-first-form")],
    },
];

pub fn find_test(test_id: &str) -> Option<&'static AbTest> {
    AB_TESTS.iter().find(|t| t.id == test_id)
}

pub struct VariantAssigner {
    local: Arc<dyn KeyValueStore>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl VariantAssigner {
    pub fn new(
        local: Arc<dyn KeyValueStore>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Self {
        Self {
            local,
            random,
            clock,
            bus,
        }
    }

    fn storage_key(test_id: &str) -> String {
        format!("{}{}", AB_STORAGE_PREFIX, test_id)
    }

    fn counter_key(test_id: &str, variant: Variant, kind: AbEventKind) -> String {
        format!(
            "{}{}_{}_{}s",
            AB_STORAGE_PREFIX,
            test_id,
            variant,
            kind.as_str()
        )
    }

    /// The stored assignment, if any. Garbage values count as unassigned.
    pub fn stored(&self, test_id: &str) -> Option<Variant> {
        match self.local.get(&Self::storage_key(test_id)) {
            Ok(raw) => raw.as_deref().and_then(Variant::parse),
            Err(e) => {
                tracing::warn!("Could not read A/B assignment for {}: {}", test_id, e);
                None
            }
        }
    }

    /// Returns the sticky variant for `test_id`, assigning it on first use.
    pub fn variant(&self, test_id: &str) -> Variant {
        if let Some(existing) = self.stored(test_id) {
            return existing;
        }

        let split = find_test(test_id)
            .map(|t| t.split_ratio)
            .unwrap_or(DEFAULT_SPLIT_RATIO);
        let assigned = if self.random.next_unit() < split {
            Variant::A
        } else {
            Variant::B
        };

        if let Err(e) = self.local.set(&Self::storage_key(test_id), assigned.as_str()) {
            tracing::warn!("Could not persist A/B assignment for {}: {}", test_id, e);
        }
        tracing::info!("Assigned variant {} for test '{}'", assigned, test_id);

        self.track(test_id, assigned, AbEventKind::Impression);
        assigned
    }

    /// Looks up a copy value for the visitor's variant.
    pub fn variant_value(&self, test_id: &str, key: &str) -> Option<&'static str> {
        let test = find_test(test_id)?;
        test.value(self.variant(test_id), key)
    }

    /// Records a conversion against the stored variant.
    ///
    /// Returns the variant credited, or `None` when the visitor was never
    /// assigned to this test.
    pub fn record_conversion(&self, test_id: &str) -> Option<Variant> {
        let Some(variant) = self.stored(test_id) else {
            tracing::warn!("Conversion for unassigned test '{}' ignored", test_id);
            return None;
        };
        self.track(test_id, variant, AbEventKind::Conversion);
        Some(variant)
    }

    /// All stored assignments for the catalog tests.
    pub fn assignments(&self) -> BTreeMap<String, Variant> {
        AB_TESTS
            .iter()
            .filter_map(|t| self.stored(t.id).map(|v| (t.id.to_string(), v)))
            .collect()
    }

    pub fn count(&self, test_id: &str, variant: Variant, kind: AbEventKind) -> u64 {
        self.local
            .get(&Self::counter_key(test_id, variant, kind))
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    fn track(&self, test_id: &str, variant: Variant, kind: AbEventKind) {
        self.bus.publish(FunnelEvent::AbEvent {
            test_id: test_id.to_string(),
            variant,
            kind,
            timestamp: self.clock.now_ms(),
        });

        let key = Self::counter_key(test_id, variant, kind);
        let next = self.count(test_id, variant, kind) + 1;
        if let Err(e) = self.local.set(&key, &next.to_string()) {
            tracing::debug!("Could not update A/B counter {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::platform::{FixedRandom, ManualClock};
    use crate::storage::MemoryStore;

    fn assigner(draws: Vec<f64>) -> (VariantAssigner, Arc<MemoryStore>, EventBus) {
        let local = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        let assigner = VariantAssigner::new(
            local.clone(),
            Arc::new(FixedRandom::new(draws)),
            Arc::new(ManualClock::new(0)),
            bus.clone(),
        );
        (assigner, local, bus)
    }

    #[test]
    fn test_split_ratio_boundary() {
        let (a, _, _) = assigner(vec![0.49]);
        assert_eq!(a.variant("popup-headline"), Variant::A);

        let (b, _, _) = assigner(vec![0.5]);
        assert_eq!(b.variant("popup-headline"), Variant::B);
    }

    #[test]
    fn test_assignment_is_sticky_and_impression_fires_once() {
        // Later draws would flip the bucket if it were ever re-drawn.
        let (assigner, _, bus) = assigner(vec![0.1, 0.9, 0.9]);
        let mut rx = bus.subscribe();

        let first = assigner.variant("form-type");
        for _ in 0..5 {
            assert_eq!(assigner.variant("form-type"), first);
        }

        let impressions: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FunnelEvent::AbEvent { kind: AbEventKind::Impression, .. }))
            .collect();
        assert_eq!(impressions.len(), 1);
        assert_eq!(assigner.count("form-type", first, AbEventKind::Impression), 1);
    }

    #[test]
    fn test_existing_storage_value_reused() {
        let (assigner, local, bus) = assigner(vec![0.0]);
        local.set("digisoft_ab_lead-form-cta", "B").unwrap();
        let mut rx = bus.subscribe();

        assert_eq!(assigner.variant("lead-form-cta"), Variant::B);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_conversion_tagged_with_stored_variant() {
        let (assigner, _, bus) = assigner(vec![0.8]);
        assert_eq!(assigner.variant("exit-intent-type"), Variant::B);
        let mut rx = bus.subscribe();

        assert_eq!(assigner.record_conversion("exit-intent-type"), Some(Variant::B));
        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [FunnelEvent::AbEvent { variant: Variant::B, kind: AbEventKind::Conversion, .. }]
        ));
        assert_eq!(
            assigner.count("exit-intent-type", Variant::B, AbEventKind::Conversion),
            1
        );
    }

    #[test]
    fn test_conversion_without_assignment_is_noop() {
        let (assigner, _, bus) = assigner(vec![0.1]);
        let mut rx = bus.subscribe();
        assert_eq!(assigner.record_conversion("popup-headline"), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unknown_test_uses_default_split() {
        let (assigner, _, _) = assigner(vec![0.3]);
        assert_eq!(assigner.variant("brand-new-test"), Variant::A);
        assert_eq!(assigner.variant_value("brand-new-test", "headline"), None);
    }

    #[test]
    fn test_variant_value_lookup() {
        let (assigner, _, _) = assigner(vec![0.9]);
        assert_eq!(
            assigner.variant_value("scroll-popup-timing", "triggerAt"),
            Some("50")
        );
        assert_eq!(
            assigner.assignments().get("scroll-popup-timing"),
            Some(&Variant::B)
        );
    }
}
