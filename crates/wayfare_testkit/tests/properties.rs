//! Property tests over devices, the queue and conflict resolution.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wayfare_sync_engine::{
    Clock, Ledger, ManualClock, NetworkStatus, PendingMutation, QueueManager,
};
use wayfare_sync_protocol::{
    resolve, ConflictStrategy, EntityKey, EntityType, OperationKind, Priority, Resolution,
};
use wayfare_testkit::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn live_trips(device: &Device) -> Vec<EntityKey> {
    let mut keys: Vec<EntityKey> = device
        .store
        .entities()
        .into_iter()
        .filter(|e| e.snapshot.key.entity_type == EntityType::Trip && !e.snapshot.deleted)
        .map(|e| e.snapshot.key)
        .collect();
    keys.sort();
    keys
}

async fn play(device: &Device, action: &DeviceAction) {
    match action {
        DeviceAction::CreateTrip { name } => {
            device.create_trip(name);
        }
        DeviceAction::Rename { target, name } => {
            let trips = live_trips(device);
            if !trips.is_empty() {
                device.edit(&trips[target % trips.len()], "name", name);
            }
        }
        DeviceAction::Delete { target } => {
            let trips = live_trips(device);
            if !trips.is_empty() {
                device.delete(&trips[target % trips.len()]);
            }
        }
        DeviceAction::Sync => {
            device.sync().await;
        }
        DeviceAction::SetOnline(online) => {
            let status = if *online {
                NetworkStatus::Wifi
            } else {
                NetworkStatus::Offline
            };
            device.network.set(status);
        }
    }
}

/// Local state of `key`; a trip deleted before it ever reached the
/// remote counts as absent.
fn observed(device: &Device, key: &EntityKey) -> Option<(serde_json::Map<String, serde_json::Value>, bool)> {
    device
        .entity(key)
        .filter(|e| !(e.snapshot.deleted && e.meta.server_id.is_none()))
        .map(|e| (e.snapshot.fields, e.snapshot.deleted))
}

fn all_keys(devices: &[&Device]) -> Vec<EntityKey> {
    let keys: HashSet<EntityKey> = devices
        .iter()
        .flat_map(|d| d.store.entities())
        .map(|e| e.snapshot.key)
        .collect();
    keys.into_iter().collect()
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    /// Whatever a single device does, once it is online and has synced,
    /// the remote holds exactly its state and the queue is empty.
    #[test]
    fn single_device_reaches_remote(script in device_script_strategy(1, 30)) {
        runtime().block_on(async {
            let remote = InMemoryRemote::new();
            let device = Device::with_remote("phone", &remote.route("graphql"));
            for action in &script {
                play(&device, action).await;
            }
            device.network.set(NetworkStatus::Wifi);
            let report = device.sync().await;

            prop_assert_eq!(report.counts.conflicts_resolved, 0);
            prop_assert_eq!(device.queue_len(), 0);
            for stored in device.store.entities() {
                if stored.snapshot.deleted && stored.meta.server_id.is_none() {
                    prop_assert!(remote.get(&stored.snapshot.key).is_none());
                    continue;
                }
                let server = remote.get(&stored.snapshot.key);
                prop_assert!(server.is_some());
                let server = server.unwrap();
                prop_assert_eq!(&server.payload.fields, &stored.snapshot.fields);
                prop_assert_eq!(server.payload.deleted, stored.snapshot.deleted);
                prop_assert_eq!(server.sync_version, stored.meta.sync_version);
                prop_assert!(!stored.meta.needs_sync);
            }
            Ok(())
        })?;
    }

    /// Two devices editing the same trips converge after both sync twice.
    #[test]
    fn devices_converge(
        first in device_script_strategy(1, 20),
        second in device_script_strategy(1, 20),
        strategy in automatic_strategy(),
    ) {
        runtime().block_on(async {
            let remote = InMemoryRemote::new();
            let a = Device::builder("a").remote(&remote.route("graphql")).strategy(strategy).build();
            let b = Device::builder("b").remote(&remote.route("graphql")).strategy(strategy).build();

            let shared = a.create_trip("Shared");
            a.sync().await;
            b.sync().await;

            let longest = first.len().max(second.len());
            for step in 0..longest {
                if let Some(action) = first.get(step) {
                    play(&a, action).await;
                }
                if let Some(action) = second.get(step) {
                    play(&b, action).await;
                }
            }

            a.network.set(NetworkStatus::Wifi);
            b.network.set(NetworkStatus::Wifi);
            for _ in 0..2 {
                a.sync().await;
                b.sync().await;
            }

            let mut keys = all_keys(&[&a, &b]);
            keys.push(shared.key);
            for key in &keys {
                let left = observed(&a, key);
                let right = observed(&b, key);
                prop_assert_eq!(&left, &right);
                let server = remote.get(key).map(|c| (c.payload.fields, c.payload.deleted));
                prop_assert_eq!(&left, &server);
            }
            prop_assert_eq!(a.queue_len(), 0);
            prop_assert_eq!(b.queue_len(), 0);
            Ok(())
        })?;
    }

    /// Offline edits to one trip collapse into a single entry carrying the
    /// last state, delivered as one remote version.
    #[test]
    fn offline_edits_coalesce(names in prop::collection::vec(trip_name_strategy(), 1..10)) {
        runtime().block_on(async {
            let remote = InMemoryRemote::new();
            let device = Device::builder("phone")
                .remote(&remote.route("graphql"))
                .network(NetworkStatus::Offline)
                .build();
            let trip = device.create_trip("Draft");
            for name in &names {
                device.edit(&trip.key, "name", name);
            }
            prop_assert_eq!(device.queue_len(), 1);
            let entry = device.queued(&trip.key).unwrap();
            prop_assert_eq!(entry.operation, OperationKind::Create);

            device.network.set(NetworkStatus::Wifi);
            device.sync().await;
            let server = remote.get(&trip.key).unwrap();
            prop_assert_eq!(server.sync_version, 1);
            prop_assert_eq!(server.payload.text("name"), names.last().map(String::as_str));
            prop_assert_eq!(remote.pushes_for(&trip.key), 1);
            Ok(())
        })?;
    }

    /// Retry delays never shrink and never exceed the cap.
    #[test]
    fn backoff_is_monotonic(retry in retry_config_strategy()) {
        let mut previous = Duration::ZERO;
        for failures in 0..=retry.max_attempts + 2 {
            let delay = retry.delay_after(failures);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= retry.max_delay);
            previous = delay;
        }
        prop_assert_eq!(retry.delay_after(1), (retry.base_delay * 2).min(retry.max_delay));
    }

    /// A failed entry is held back for exactly its backoff delay and gives
    /// up after the configured number of attempts.
    #[test]
    fn queue_waits_out_backoff(retry in retry_config_strategy(), trip in trip_strategy(epoch())) {
        let clock = Arc::new(ManualClock::new(epoch()));
        let ledger = Ledger::in_memory().unwrap().into_shared();
        let queue = QueueManager::new(ledger, clock.clone(), retry);
        queue
            .enqueue(PendingMutation {
                operation: OperationKind::Create,
                payload: trip,
                priority: Priority::Normal,
                had_server_id: false,
            })
            .unwrap();

        let none = HashSet::new();
        for attempt in 1..=retry.max_attempts {
            let batch = queue.dequeue_batch(10, &none).unwrap();
            prop_assert_eq!(batch.len(), 1);
            let failed_at = clock.now();
            queue.mark_failed(&batch[0].id, "unreachable").unwrap();

            let entry = queue.entry(&batch[0].id).unwrap();
            prop_assert_eq!(entry.attempts, attempt);
            if attempt == retry.max_attempts {
                prop_assert!(queue.dequeue_batch(10, &none).unwrap().is_empty());
                break;
            }

            let delay = retry.delay_after(attempt);
            if delay > Duration::from_millis(1) {
                clock.advance(delay - Duration::from_millis(1));
                prop_assert!(queue.dequeue_batch(10, &none).unwrap().is_empty());
            }
            clock.set(failed_at + chrono::Duration::from_std(delay).unwrap());
        }
    }

    /// Resolution depends only on its inputs, and `NewerWins` keeps the
    /// later snapshot whichever side it is on.
    #[test]
    fn resolution_is_deterministic(
        series in edit_series_strategy(epoch(), 4),
        strategy in automatic_strategy(),
    ) {
        let older = series[0].clone();
        let newer = series[series.len() - 1].clone();
        let baseline = Some(epoch());

        prop_assert_eq!(
            resolve(&older, &newer, baseline, strategy),
            resolve(&older, &newer, baseline, strategy)
        );

        let local_newer = resolve(&newer, &older, baseline, ConflictStrategy::NewerWins);
        let remote_newer = resolve(&older, &newer, baseline, ConflictStrategy::NewerWins);
        prop_assert_eq!(local_newer, Resolution::KeepLocal);
        prop_assert_eq!(remote_newer, Resolution::AcceptRemote);
        prop_assert_eq!(
            resolve(&newer, &newer, baseline, ConflictStrategy::Merge),
            Resolution::AcceptRemote
        );
    }
}
