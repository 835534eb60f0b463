//! Reconciliation CLI command

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use super::output::Output;
use crate::provider::Provider;
use crate::reconcile::ReconciliationEngine;
use crate::workspace::Workspace;

pub fn run(output: &Output, backend: &str, repair: bool, every: Option<u64>) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let provider = workspace.provider(backend)?;
    let engine = workspace.engine();

    let Some(secs) = every else {
        return check_once(output, &engine, &provider, repair);
    };

    let interval = Duration::from_secs(secs.max(1));
    loop {
        // A failed pass is reported and retried on the next tick
        if let Err(e) = check_once(output, &engine, &provider, repair) {
            output.warn(&format!("{:#}", e));
        }
        thread::sleep(interval);
    }
}

fn check_once(
    output: &Output,
    engine: &ReconciliationEngine,
    provider: &Provider,
    repair: bool,
) -> Result<()> {
    let issues = engine
        .report(provider.backend())
        .with_context(|| format!("Failed to check backend '{}'", provider.name()))?;

    if !repair {
        output.issues(provider.name(), &issues);
        return Ok(());
    }

    let results = engine.repair_all(provider.backend(), issues);
    output.repairs(provider.name(), &results);

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} repairs failed", failed, results.len());
    }
    Ok(())
}
