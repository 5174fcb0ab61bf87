//! kvmigrate CLI - runs the metadata store migrations.

pub mod config;
pub mod error;
pub mod schema;

use std::io::Write;

use kvmigrate_core::{Context, MigrationReport, Migrator, Store};
use tracing::info;

pub use config::{Args, Command, Config};
pub use error::Error;

/// Open the store and run the configured command, writing results to `out`.
pub fn run(config: Config, out: &mut impl Write) -> Result<(), Error> {
    let store = Store::open(config.storage.clone())?;
    if store.was_recovered() {
        info!(path = %config.storage.path.display(), "store recovered");
    }

    let ctx = match config.timeout {
        Some(timeout) => Context::with_timeout(timeout),
        None => Context::background(),
    };
    let registry = schema::compose(config.backfill.clone())?;
    let migrator = Migrator::new(store.clone(), registry, config.migrator.clone());

    match config.command {
        Command::Up => {
            let report = migrator.up(&ctx)?;
            print_report(out, &report)?;
        }
        Command::Down { target } => {
            let report = migrator.down(&ctx, target)?;
            print_report(out, &report)?;
        }
        Command::Status => print_status(out, &migrator)?,
        Command::VerifyIndex => verify_index(out, &store)?,
    }

    store.flush()?;
    info!(size_on_disk = store.size_on_disk()?, "store flushed");
    Ok(())
}

fn print_report(out: &mut impl Write, report: &MigrationReport) -> Result<(), Error> {
    if report.is_noop() {
        writeln!(out, "nothing to do ({} applied)", report.applied_count)?;
        return Ok(());
    }
    for step in &report.steps {
        writeln!(
            out,
            "{} {:>3} {} ({} ms)",
            report.direction,
            step.index,
            step.name,
            step.elapsed.as_millis()
        )?;
    }
    writeln!(out, "{} applied", report.applied_count)?;
    Ok(())
}

fn print_status(out: &mut impl Write, migrator: &Migrator) -> Result<(), Error> {
    for status in migrator.status()? {
        let applied = match &status.record {
            Some(record) => format!("applied at {}", record.applied_at),
            None => "pending".to_string(),
        };
        writeln!(out, "{:>3} {:<8} {}", status.index, applied, status.name)?;
    }
    Ok(())
}

fn verify_index(out: &mut impl Write, store: &Store) -> Result<(), Error> {
    let index = schema::urm_by_user_index();
    let diff = store.view(|tx| index.verify(tx))?;

    writeln!(
        out,
        "{}: {} missing, {} orphaned, {} stale",
        index.name(),
        diff.missing.len(),
        diff.orphaned.len(),
        diff.stale.len()
    )?;

    if diff.is_consistent() {
        Ok(())
    } else {
        Err(Error::IndexInconsistent {
            index: index.name().to_string(),
            missing: diff.missing.len(),
            orphaned: diff.orphaned.len(),
            stale: diff.stale.len(),
        })
    }
}
