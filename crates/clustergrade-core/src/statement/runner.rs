//! Bounded worker pool that applies grouped statements.
//!
//! Statements are grouped by [`Statement::group_key`]. Each group runs in
//! input order on a single worker; distinct groups run concurrently on up to
//! `min(jobs, groups)` workers. A failing statement is recorded and its group
//! carries on with the next statement.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clustergrade_types::event::UpgradeEvent;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use super::{PoolFactory, PoolOptions, Statement, StatementError, StatementFailure, StatementPool};
use crate::event::bus::EventBus;

/// Split statements into ordered groups, keeping first-appearance order.
fn group(statements: Vec<Statement>) -> Vec<Vec<Statement>> {
    let mut groups: Vec<Vec<Statement>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for statement in statements {
        match statement.group_key().map(str::to_string) {
            Some(key) => match index.get(&key) {
                Some(&i) => groups[i].push(statement),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![statement]);
                }
            },
            None => groups.push(vec![statement]),
        }
    }

    groups
}

/// Execute `statements` through a pool opened from `factory`.
///
/// Fails iff any statement failed; the error carries every failure. The pool
/// is closed before returning.
pub async fn execute_statements<F: PoolFactory>(
    factory: &F,
    options: &PoolOptions,
    statements: Vec<Statement>,
    bus: Option<&EventBus>,
) -> Result<(), StatementError> {
    if statements.is_empty() {
        return Ok(());
    }

    let total = statements.len();
    let groups = group(statements);
    let workers = options.jobs.min(groups.len()).max(1);

    let pool = Arc::new(factory.open(options).await?);
    tracing::info!(
        uri = pool.connection_string(),
        statements = total,
        groups = groups.len(),
        workers,
        "executing statements"
    );

    let (group_tx, group_rx) = mpsc::channel(groups.len());
    for g in groups {
        // Capacity equals the number of groups, so this never waits.
        if group_tx.send(g).await.is_err() {
            break;
        }
    }
    drop(group_tx);
    let group_rx = Arc::new(Mutex::new(group_rx));

    let (err_tx, mut err_rx) = mpsc::channel(total);
    let completed = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let pool = Arc::clone(&pool);
        let group_rx = Arc::clone(&group_rx);
        let err_tx = err_tx.clone();
        let completed = Arc::clone(&completed);
        let bus = bus.cloned();

        set.spawn(async move {
            loop {
                let next = group_rx.lock().await.recv().await;
                let Some(batch) = next else { break };

                for statement in batch {
                    if let Err(message) = pool.execute(statement.sql()).await {
                        tracing::warn!(worker, statement = statement.sql(), error = %message, "statement failed");
                        let _ = err_tx
                            .send(StatementFailure {
                                connection: pool.connection_string().to_string(),
                                statement: statement.sql().to_string(),
                                message,
                            })
                            .await;
                    }

                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(bus) = &bus {
                        bus.publish(UpgradeEvent::StatementProgress {
                            completed: done,
                            total,
                        });
                    }
                }
            }
        });
    }
    drop(err_tx);

    let mut worker_error = None;
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            worker_error.get_or_insert_with(|| e.to_string());
        }
    }

    pool.close().await;

    let mut failures = Vec::new();
    while let Some(failure) = err_rx.recv().await {
        failures.push(failure);
    }

    if !failures.is_empty() {
        return Err(StatementError::Failed(failures));
    }
    if let Some(e) = worker_error {
        return Err(StatementError::Worker(e));
    }
    Ok(())
}
