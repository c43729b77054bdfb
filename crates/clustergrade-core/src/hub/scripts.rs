//! Data migration scripts.
//!
//! Scripts live under `<root>/<phase>/`, where `phase` is `initialize`,
//! `finalize` or `revert`. Each `*.sql` file is an index script applied
//! through the parallel statement runner, in file name order.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::event::bus::EventBus;
use crate::statement::{IndexScript, PoolFactory};

/// Script directory of one phase.
pub fn phase_dir(root: &Path, phase: &str) -> PathBuf {
    root.join(phase)
}

/// `*.sql` files directly inside `dir`, sorted. A missing directory yields
/// an empty list.
pub async fn script_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Apply every script in `dir` against the cluster on `port` running major
/// version `major`. Returns the number of scripts applied.
///
/// Scripts run one after another; a failing script stops the run and names
/// the file.
pub async fn apply_data_migration_scripts<F: PoolFactory>(
    pools: &F,
    dir: &Path,
    port: u16,
    major: u64,
    jobs: usize,
    bus: Option<&EventBus>,
) -> anyhow::Result<usize> {
    let files = script_files(dir).await?;
    if files.is_empty() {
        tracing::info!(dir = %dir.display(), "no data migration scripts");
        return Ok(0);
    }

    for file in &files {
        let script = IndexScript::read(file).await?;
        tracing::info!(
            script = %file.display(),
            database = %script.database,
            statements = script.statements.len(),
            "applying data migration script"
        );
        script
            .apply(pools, port, major, jobs, bus)
            .await
            .with_context(|| format!("applying {}", file.display()))?;
    }

    Ok(files.len())
}
