//! Integration tests for the migrator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use kvmigrate_core::migration::{MigrationRecordStore, StepOutcome};
use kvmigrate_core::{
    BootstrapMigration, Context, Direction, Error, FnMigration, MigrationError, MigrationRegistry, Migrator,
    MigratorConfig, MigratorState, StorageConfig, Store,
};
use parking_lot::Mutex;

/// Migration creating one bucket; `down` drops it and logs its name.
fn bucket_step(name: &'static str, bucket: &'static str, log: &Arc<Mutex<Vec<String>>>) -> FnMigration {
    let log = Arc::clone(log);
    FnMigration::new(name, move |_, tx| {
        tx.create_bucket(bucket)?;
        Ok(())
    })
    .with_down(move |_, tx| {
        tx.delete_bucket(bucket)?;
        log.lock().push(name.to_string());
        Ok(())
    })
}

fn three_steps(log: &Arc<Mutex<Vec<String>>>) -> MigrationRegistry {
    MigrationRegistry::builder()
        .add(bucket_step("create users", "users", log))
        .add(bucket_step("create orgs", "orgs", log))
        .add(bucket_step("create sessions", "sessions", log))
        .build()
        .unwrap()
}

fn record_names(store: &Store) -> Vec<(u64, String)> {
    store
        .view(|tx| MigrationRecordStore::list(tx))
        .unwrap()
        .into_iter()
        .map(|r| (r.sequence_index, r.name))
        .collect()
}

#[test]
fn test_second_up_performs_no_writes() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let migrator = Migrator::new(store.clone(), three_steps(&log), MigratorConfig::default());
    let ctx = Context::background();

    let first = migrator.up(&ctx).unwrap();
    assert_eq!(first.steps.len(), 3);
    let after_first = store.stats();

    let second = migrator.up(&ctx).unwrap();
    assert!(second.is_noop());
    assert_eq!(second.previously_applied, 3);
    assert_eq!(store.stats(), after_first);
    assert_eq!(migrator.state(), MigratorState::Applied);
}

#[test]
fn test_each_migration_applied_exactly_once() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let runs: Vec<Arc<AtomicUsize>> = (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let build = || {
        let mut builder = MigrationRegistry::builder();
        for (i, counter) in runs.iter().enumerate() {
            let counter = Arc::clone(counter);
            builder = builder.add(FnMigration::new(format!("step {}", i), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        builder.build().unwrap()
    };

    Migrator::new(store.clone(), build(), MigratorConfig::default())
        .up(&Context::background())
        .unwrap();
    // A fresh migrator re-derives applied state from the store
    Migrator::new(store.clone(), build(), MigratorConfig::default())
        .up(&Context::background())
        .unwrap();

    for counter in &runs {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
    let expected: Vec<_> = (0..5).map(|i| (i as u64, format!("step {}", i))).collect();
    assert_eq!(record_names(&store), expected);
}

#[test]
fn test_failed_step_leaves_no_trace() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let fail = Arc::new(AtomicBool::new(true));

    let build = |fail: Arc<AtomicBool>| {
        MigrationRegistry::builder()
            .add(FnMigration::new("create data", |_, tx| {
                tx.create_bucket("data")?;
                Ok(())
            }))
            .add(FnMigration::new("write five keys", move |_, tx| {
                for k in 0..5u8 {
                    // fails on the third write
                    if k == 2 && fail.load(Ordering::SeqCst) {
                        return Err(Error::InvalidData("disk full".to_string()).into());
                    }
                    tx.put("data", [k], [k])?;
                }
                Ok(())
            }))
            .build()
            .unwrap()
    };

    let migrator = Migrator::new(store.clone(), build(Arc::clone(&fail)), MigratorConfig::default());
    let err = migrator.up(&Context::background()).unwrap_err();

    match &err {
        MigrationError::Step {
            index,
            name,
            direction,
            ..
        } => {
            assert_eq!(*index, 1);
            assert_eq!(name, "write five keys");
            assert_eq!(*direction, Direction::Up);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(migrator.state(), MigratorState::Failed(1));
    assert_eq!(record_names(&store).len(), 1);
    let data = store.view(|tx| tx.scan("data", None, usize::MAX)).unwrap();
    assert!(data.is_empty());

    // Retry after the cause is gone
    fail.store(false, Ordering::SeqCst);
    let report = migrator.up(&Context::background()).unwrap();
    assert_eq!(report.previously_applied, 1);
    assert_eq!(report.steps.len(), 1);

    let data = store.view(|tx| tx.scan("data", None, usize::MAX)).unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(record_names(&store).len(), 2);
}

#[test]
fn test_rollback_reverses_in_descending_order() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let migrator = Migrator::new(store.clone(), three_steps(&log), MigratorConfig::default());
    let ctx = Context::background();

    migrator.up(&ctx).unwrap();
    let report = migrator.down(&ctx, 0).unwrap();

    let indexes: Vec<usize> = report.steps.iter().map(|s: &StepOutcome| s.index).collect();
    assert_eq!(indexes, vec![2, 1]);
    assert_eq!(*log.lock(), vec!["create sessions", "create orgs"]);
    assert_eq!(record_names(&store), vec![(0, "create users".to_string())]);
    assert_eq!(store.bucket_names().unwrap(), vec!["migrations", "users"]);

    // Re-applying picks up where the rollback left off
    let report = migrator.up(&ctx).unwrap();
    assert_eq!(report.steps.len(), 2);
    assert_eq!(record_names(&store).len(), 3);
}

#[test]
fn test_irreversible_step_stops_rollback() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = MigrationRegistry::builder()
        .add(bucket_step("create users", "users", &log))
        .add(FnMigration::new("one way", |_, _| Ok(())))
        .build()
        .unwrap();
    let migrator = Migrator::new(store.clone(), registry, MigratorConfig::default());
    let ctx = Context::background();

    migrator.up(&ctx).unwrap();
    let err = migrator.down_all(&ctx).unwrap_err();

    match err {
        MigrationError::Step {
            index: 1,
            direction: Direction::Down,
            source,
            ..
        } => assert!(matches!(*source, MigrationError::Irreversible { .. })),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(record_names(&store).len(), 2);
    assert!(log.lock().is_empty());
}

#[test]
fn test_sequence_regression_is_fatal() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    Migrator::new(store.clone(), three_steps(&log), MigratorConfig::default())
        .up(&Context::background())
        .unwrap();

    let older = MigrationRegistry::builder()
        .add(bucket_step("create users", "users", &log))
        .add(bucket_step("create orgs", "orgs", &log))
        .build()
        .unwrap();
    let migrator = Migrator::new(store.clone(), older, MigratorConfig::default());
    let before = store.stats();

    let err = migrator.up(&Context::background()).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::SequenceRegression {
            applied: 3,
            declared: 2
        }
    ));
    assert!(matches!(
        migrator.down(&Context::background(), 0),
        Err(MigrationError::SequenceRegression { .. })
    ));
    assert_eq!(store.stats(), before);
}

#[test]
fn test_cancelled_context_aborts_before_writing() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let migrator = Migrator::new(store.clone(), three_steps(&log), MigratorConfig::default());

    let ctx = Context::background();
    ctx.cancel();

    let err = migrator.up(&ctx).unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(err.failed_index(), Some(0));
    assert!(record_names(&store).is_empty());
    assert_eq!(store.stats().commits, 0);
}

#[test]
fn test_cancellation_mid_run_keeps_committed_steps() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let ctx = Context::background();
    let cancel = ctx.clone();

    let registry = MigrationRegistry::builder()
        .add(FnMigration::new("first", move |_, tx| {
            tx.create_bucket("first")?;
            Ok(())
        }))
        .add(FnMigration::new("second", move |_, tx| {
            tx.create_bucket("second")?;
            // The step's own transaction is discarded
            cancel.cancel();
            Ok(())
        }))
        .build()
        .unwrap();
    let migrator = Migrator::new(store.clone(), registry, MigratorConfig::default());

    let err = migrator.up(&ctx).unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(record_names(&store), vec![(0, "first".to_string())]);
    assert!(!store.view(|tx| tx.bucket_exists("second")).unwrap());
}

#[test]
fn test_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::new(dir.path());
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let store = Store::open(config.clone()).unwrap();
        let registry = MigrationRegistry::builder()
            .add(bucket_step("create users", "users", &log))
            .build()
            .unwrap();
        Migrator::new(store.clone(), registry, MigratorConfig::default())
            .up(&Context::background())
            .unwrap();
        store.flush().unwrap();
    }

    {
        let store = Store::open(config).unwrap();
        let migrator = Migrator::new(store.clone(), three_steps(&log), MigratorConfig::default());

        let report = migrator.up(&Context::background()).unwrap();
        let names: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["create orgs", "create sessions"]);

        let status = migrator.status().unwrap();
        assert!(status.iter().all(|s| s.is_applied()));
        let first = status[0].record.as_ref().unwrap();
        let third = status[2].record.as_ref().unwrap();
        assert!(first.applied_at <= third.applied_at);
    }
}

#[test]
fn test_full_rollback_keeps_bootstrapped_data() {
    let store = Store::open(StorageConfig::temporary()).unwrap();
    let registry = MigrationRegistry::builder()
        .add(BootstrapMigration::new("initial buckets", ["users", "orgs"]))
        .build()
        .unwrap();
    let migrator = Migrator::new(store.clone(), registry, MigratorConfig::default());
    let ctx = Context::background();

    migrator.up(&ctx).unwrap();
    store.update(|tx| tx.put("users", b"u1", b"alice")).unwrap();

    let report = migrator.down_all(&ctx).unwrap();
    assert_eq!(report.applied_count, 0);
    assert!(record_names(&store).is_empty());

    let value = store.view(|tx| tx.get("users", b"u1")).unwrap();
    assert_eq!(value.as_deref(), Some(&b"alice"[..]));

    // re-applying adopts the surviving buckets
    migrator.up(&ctx).unwrap();
    assert_eq!(record_names(&store), vec![(0, "initial buckets".to_string())]);
}
