//! Property-based test generators using proptest.
//!
//! Provides strategies for entity snapshots, retry settings and the
//! action scripts driven against simulated devices.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use std::time::Duration;
use wayfare_sync_engine::RetryConfig;
use wayfare_sync_protocol::{ConflictStrategy, EntityKey, EntitySnapshot, EntityType};

/// Strategy for non-blank trip names.
pub fn trip_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,11}( [A-Z][a-z]{2,9})?").expect("Invalid regex")
}

/// Strategy for timestamps within a few days of `base`.
pub fn timestamp_strategy(base: DateTime<Utc>) -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..300_000).prop_map(move |secs| base + ChronoDuration::seconds(secs))
}

/// Strategy for valid trip snapshots.
pub fn trip_strategy(base: DateTime<Utc>) -> impl Strategy<Value = EntitySnapshot> {
    (trip_name_strategy(), timestamp_strategy(base)).prop_map(|(name, at)| {
        EntitySnapshot::new(EntityKey::generate(EntityType::Trip), at).with_field("name", name)
    })
}

/// Strategy for a trip and a series of later edits to its name.
pub fn edit_series_strategy(
    base: DateTime<Utc>,
    max_edits: usize,
) -> impl Strategy<Value = Vec<EntitySnapshot>> {
    (
        trip_strategy(base),
        prop::collection::vec((trip_name_strategy(), 1i64..3_600), 1..max_edits),
    )
        .prop_map(|(trip, edits)| {
            let mut series = vec![trip];
            for (name, gap) in edits {
                let previous = &series[series.len() - 1];
                let at = previous.updated_at + ChronoDuration::seconds(gap);
                series.push(previous.edited("name", name, at));
            }
            series
        })
}

/// Strategy for retry settings that pass validation.
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u32..12, 1u64..5_000, 0u64..600_000).prop_map(|(attempts, base_ms, extra_ms)| {
        RetryConfig::new(attempts)
            .with_base_delay(Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(base_ms + extra_ms))
    })
}

/// Strategy for strategies that resolve without user input.
pub fn automatic_strategy() -> impl Strategy<Value = ConflictStrategy> {
    prop_oneof![
        Just(ConflictStrategy::ServerWins),
        Just(ConflictStrategy::ClientWins),
        Just(ConflictStrategy::NewerWins),
        Just(ConflictStrategy::Merge),
    ]
}

/// One step of a device script.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    /// Create a trip.
    CreateTrip {
        /// Trip name.
        name: String,
    },
    /// Rename a known trip, picked by index modulo the known count.
    Rename {
        /// Trip selector.
        target: usize,
        /// New name.
        name: String,
    },
    /// Delete a known trip.
    Delete {
        /// Trip selector.
        target: usize,
    },
    /// Run a sync cycle.
    Sync,
    /// Toggle connectivity.
    SetOnline(bool),
}

/// Strategy for a single device action.
pub fn device_action_strategy() -> impl Strategy<Value = DeviceAction> {
    prop_oneof![
        3 => trip_name_strategy().prop_map(|name| DeviceAction::CreateTrip { name }),
        4 => (any::<usize>(), trip_name_strategy())
            .prop_map(|(target, name)| DeviceAction::Rename { target, name }),
        1 => any::<usize>().prop_map(|target| DeviceAction::Delete { target }),
        3 => Just(DeviceAction::Sync),
        1 => any::<bool>().prop_map(DeviceAction::SetOnline),
    ]
}

/// Strategy for a script of device actions.
pub fn device_script_strategy(
    min_actions: usize,
    max_actions: usize,
) -> impl Strategy<Value = Vec<DeviceAction>> {
    prop::collection::vec(device_action_strategy(), min_actions..max_actions)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 128,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 24,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
