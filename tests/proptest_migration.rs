//! Property-based tests for the batch copy engine
//!
//! Uses proptest to verify termination, cursor monotonicity and snapshot
//! idempotence across randomly sized databases and batch limits.
#![allow(clippy::unwrap_used)]

mod common;

use proptest::prelude::*;

use redis_copy::config::ListPolicy;
use redis_copy::migration::{BatchOutcome, ControlNamespace, KeyLister, Servername};
use redis_copy::store::{KeyValueStore, Value};

use common::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Test Strategies
// ============================================================================

/// Strategy for one source value of any supported type
fn value_strategy() -> impl Strategy<Value = Value> {
    let item = || prop::collection::vec(any::<u8>(), 1..8).prop_map(bytes::Bytes::from);
    prop_oneof![
        item().prop_map(Value::String),
        prop::collection::hash_map(item(), item(), 1..4).prop_map(Value::Hash),
        prop::collection::vec_deque(item(), 1..4).prop_map(Value::List),
        prop::collection::hash_set(item(), 1..4).prop_map(Value::Set),
        prop::collection::hash_map(item(), -1000i32..1000, 1..4).prop_map(|members| {
            Value::SortedSet(members.into_iter().map(|(m, s)| (m, f64::from(s))).collect())
        }),
    ]
}

// ============================================================================
// Copy Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// N keys at limit L take exactly ceil(N/L) copying runs; the cursor
    /// only grows and every later run is a no-op.
    #[test]
    fn prop_terminates_in_ceil_batches(n in 0usize..60, limit in 1usize..17) {
        runtime().block_on(async {
            let (source, target) = new_stores();
            seed_strings(&source, 0, n);
            let config = test_config(&[0], limit);
            let migration = migration(&config, &source, &target);

            let mut cursor = 0u64;
            let mut copying_runs = 0usize;
            loop {
                let report = migration.run_cycle().await.unwrap();
                match report.databases[0].batch {
                    BatchOutcome::Copied { from, to, total, .. } => {
                        prop_assert_eq!(from, cursor);
                        prop_assert!(to > from);
                        prop_assert!(to <= total);
                        cursor = to;
                        copying_runs += 1;
                    }
                    BatchOutcome::AlreadyComplete { total } => {
                        prop_assert_eq!(cursor, total);
                        break;
                    }
                }
                prop_assert!(copying_runs <= n + 1);
            }

            prop_assert_eq!(copying_runs, n.div_ceil(limit));
            prop_assert_eq!(cursor, n as u64);
            let again = migration.run_cycle().await.unwrap();
            prop_assert!(
                matches!(again.databases[0].batch, BatchOutcome::AlreadyComplete { .. }),
                "expected no-op run"
            );
            Ok(())
        })?;
    }

    /// After completion every key on the target equals its source value,
    /// whatever the mix of types and the batch size.
    #[test]
    fn prop_converges_for_all_types(
        values in prop::collection::vec(value_strategy(), 1..24),
        limit in 1usize..9,
    ) {
        runtime().block_on(async {
            let (source, target) = new_stores();
            for (i, value) in values.into_iter().enumerate() {
                source.insert(1, format!("k{i:02}"), value);
            }
            let mut config = test_config(&[1], limit);
            config.copy.list_policy = ListPolicy::Replace;
            let migration = migration(&config, &source, &target);

            while !migration.run_cycle().await.unwrap().is_complete() {}

            let keys = user_keys(&source, 1);
            prop_assert_eq!(user_keys(&target, 1), keys.clone());
            for key in keys {
                prop_assert_eq!(target.value(1, &key), source.value(1, &key));
            }
            Ok(())
        })?;
    }

    /// Listing a second time leaves the snapshot and all control state
    /// byte-identical.
    #[test]
    fn prop_listing_is_idempotent(n in 0usize..40, scan_count in 1usize..12) {
        runtime().block_on(async {
            let (source, _target) = new_stores();
            seed_strings(&source, 0, n);
            let config = test_config(&[0], 10);
            let lister = KeyLister::new(
                source.clone(),
                ControlNamespace::new(&config.control, &config.databases),
                scan_count,
                10_000,
            );
            let servername = Servername::new(config.source.as_ref().unwrap(), 0);

            let first = lister.ensure_snapshot(&servername).await.unwrap();
            prop_assert_eq!(first.snapshot_len, n as u64);
            let snapshot = source.lrange(0, b"mig:keylist:10.0.0.1:6379:0", 0, -1).await.unwrap();
            let writes = source.write_count();

            let second = lister.ensure_snapshot(&servername).await.unwrap();
            prop_assert!(!second.listed_now);
            prop_assert_eq!(source.write_count(), writes);
            prop_assert_eq!(
                source.lrange(0, b"mig:keylist:10.0.0.1:6379:0", 0, -1).await.unwrap(),
                snapshot.clone()
            );
            prop_assert_eq!(snapshot, user_keys(&source, 0));
            Ok(())
        })?;
    }
}
