//! Resumable substep sequencer.
//!
//! A [`StepRun`] executes the substeps of one [`Step`] in registration order.
//! Each substep's status is persisted through a [`StatusStore`] before the
//! run moves on, so a step that is interrupted or fails can be invoked again
//! and only the unfinished substeps execute.
//!
//! Admission rules:
//! - `run` / `run_conditionally`: skipped if an earlier substep of this
//!   invocation failed, or if the store already marks the substep complete.
//! - `always_run`: executes regardless of both.
//! - After a body returns [`Flow::Abort`] nothing else executes, `always_run`
//!   included.

use std::future::Future;

use clustergrade_types::error::StoreError;
use clustergrade_types::event::UpgradeEvent;
use clustergrade_types::step::{Step, Substep, SubstepStatus, SubstepStatuses};

use crate::event::bus::EventBus;

use super::gate::ConfirmationGate;
use super::store::StatusStore;
use super::streams::OutStreams;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a substep body tells the engine after it finishes without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The substep did its work; record it `complete`.
    Continue,
    /// Nothing to do this time; record it `skipped`.
    Skip,
    /// End the whole step cleanly. Not a failure.
    Abort,
}

/// Result of [`StepRun::begin`].
#[derive(Debug)]
pub enum Admission<S: StatusStore> {
    Proceed(StepRun<S>),
    /// The operator declined the confirmation prompt.
    Declined,
}

/// Result of [`StepRun::complete`] when no substep failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every admitted substep ran; carries the summary to show the operator.
    Finished(String),
    /// A body aborted the step.
    Quit,
}

/// Errors surfaced by a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The first substep failure of this invocation. The source chain reads
    /// `substep "<name>": <cause>`.
    #[error("step \"{step}\"")]
    Failed {
        step: Step,
        #[source]
        source: anyhow::Error,
    },

    #[error("loading status of step \"{step}\": {source}")]
    Load {
        step: Step,
        #[source]
        source: StoreError,
    },

    #[error("confirming step \"{step}\": {source}")]
    Confirm {
        step: Step,
        #[source]
        source: anyhow::Error,
    },
}

impl StepError {
    pub fn step(&self) -> Step {
        match self {
            StepError::Failed { step, .. }
            | StepError::Load { step, .. }
            | StepError::Confirm { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Run,
    RunConditionally(bool),
    AlwaysRun,
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// One invocation of a step.
///
/// Generic over `S: StatusStore` so it works with the JSON file store or an
/// in-memory mock.
#[derive(Debug)]
pub struct StepRun<S: StatusStore> {
    step: Step,
    store: S,
    store_enabled: bool,
    statuses: SubstepStatuses,
    bus: EventBus,
    failure: Option<anyhow::Error>,
    quit: bool,
}

impl<S: StatusStore> StepRun<S> {
    /// Load persisted status for `step` and ask for confirmation.
    ///
    /// The gate is consulted unless `already_confirmed` is set.
    pub async fn begin(
        step: Step,
        store: S,
        bus: EventBus,
        gate: &dyn ConfirmationGate,
        already_confirmed: bool,
    ) -> Result<Admission<S>, StepError> {
        if !already_confirmed {
            let proceed = gate
                .confirm(step)
                .map_err(|source| StepError::Confirm { step, source })?;
            if !proceed {
                tracing::info!(step = %step, "operator declined to proceed");
                return Ok(Admission::Declined);
            }
        }

        let statuses = store
            .read(step)
            .await
            .map_err(|source| StepError::Load { step, source })?;

        tracing::info!(step = %step, recorded = statuses.iter().count(), "step started");
        bus.publish(UpgradeEvent::StepStarted { step });

        Ok(Admission::Proceed(StepRun {
            step,
            store,
            store_enabled: true,
            statuses,
            bus,
            failure: None,
            quit: false,
        }))
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Recorded status of a substep as of the latest write.
    pub fn status(&self, substep: Substep) -> Option<SubstepStatus> {
        self.statuses.get(substep)
    }

    /// True once any substep of this invocation failed.
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Stop persisting statuses for the rest of this run.
    ///
    /// Used by the substep that deletes the state directory so later writes
    /// do not recreate it.
    pub fn disable_store(&mut self) {
        self.store_enabled = false;
    }

    /// Access the event bus this run publishes to.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Run `body` unless an earlier substep failed or it already completed.
    pub async fn run<F, Fut>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(OutStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<Flow>>,
    {
        self.dispatch(substep, Policy::Run, body).await;
    }

    /// Like [`StepRun::run`], but a false `condition` records the substep
    /// `skipped` without calling `body`.
    pub async fn run_conditionally<F, Fut>(&mut self, substep: Substep, condition: bool, body: F)
    where
        F: FnOnce(OutStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<Flow>>,
    {
        self.dispatch(substep, Policy::RunConditionally(condition), body)
            .await;
    }

    /// Run `body` even after a failure and even if it completed before.
    pub async fn always_run<F, Fut>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(OutStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<Flow>>,
    {
        self.dispatch(substep, Policy::AlwaysRun, body).await;
    }

    /// Finish the step.
    ///
    /// Returns the first recorded failure, [`Completion::Quit`] if a body
    /// aborted, and otherwise [`Completion::Finished`] with `summary`.
    pub fn complete(mut self, summary: impl Into<String>) -> Result<Completion, StepError> {
        let step = self.step;

        if let Some(source) = self.failure.take() {
            tracing::error!(step = %step, error = format!("{source:#}"), "step failed");
            self.bus.publish(UpgradeEvent::StepFinished {
                step,
                succeeded: false,
                quit: false,
            });
            return Err(StepError::Failed { step, source });
        }

        self.bus.publish(UpgradeEvent::StepFinished {
            step,
            succeeded: true,
            quit: self.quit,
        });

        if self.quit {
            tracing::info!(step = %step, "step ended early");
            return Ok(Completion::Quit);
        }

        tracing::info!(step = %step, "step completed");
        Ok(Completion::Finished(summary.into()))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn dispatch<F, Fut>(&mut self, substep: Substep, policy: Policy, body: F)
    where
        F: FnOnce(OutStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<Flow>>,
    {
        if self.quit {
            return;
        }

        if policy != Policy::AlwaysRun {
            if self.failure.is_some() {
                tracing::debug!(step = %self.step, substep = %substep, "not attempted after earlier failure");
                return;
            }

            if self.statuses.get(substep) == Some(SubstepStatus::Complete) {
                tracing::info!(step = %self.step, substep = %substep, "already complete");
                // Shown as skipped but left `complete` on disk.
                self.publish(substep, SubstepStatus::Skipped);
                return;
            }

            if policy == Policy::RunConditionally(false) {
                tracing::info!(step = %self.step, substep = %substep, "condition not met");
                if let Err(e) = self.record(substep, SubstepStatus::Skipped).await {
                    self.fail(substep, e.into());
                }
                return;
            }
        }

        let previous = self.statuses.get(substep);
        if let Err(e) = self.record(substep, SubstepStatus::Running).await {
            self.fail(substep, e.into());
            return;
        }

        let streams = OutStreams::new(self.step, substep, self.bus.clone());
        let outcome = body(streams).await;

        let recorded = match outcome {
            Ok(Flow::Continue) => self.record(substep, SubstepStatus::Complete).await,
            Ok(Flow::Skip) => self.record(substep, SubstepStatus::Skipped).await,
            Ok(Flow::Abort) => {
                self.quit = true;
                let restored = previous.unwrap_or(SubstepStatus::Pending);
                tracing::info!(step = %self.step, substep = %substep, restored = %restored, "substep ended the step");
                self.record(substep, restored).await
            }
            Err(e) => {
                let write = self.record(substep, SubstepStatus::Failed).await;
                self.fail(substep, e);
                write
            }
        };

        if let Err(e) = recorded {
            self.fail(substep, e.into());
        }
    }

    /// Keep the first failure, wrapped with the substep name.
    fn fail(&mut self, substep: Substep, error: anyhow::Error) {
        tracing::error!(step = %self.step, substep = %substep, error = format!("{error:#}"), "substep failed");
        if self.failure.is_none() {
            self.failure = Some(error.context(format!("substep \"{substep}\"")));
        }
    }

    async fn record(&mut self, substep: Substep, status: SubstepStatus) -> Result<(), StoreError> {
        self.statuses.set(substep, status);
        self.publish(substep, status);
        if self.store_enabled {
            self.store.write(self.step, substep, status).await?;
        }
        Ok(())
    }

    fn publish(&self, substep: Substep, status: SubstepStatus) {
        tracing::debug!(step = %self.step, substep = %substep, status = %status, "substep status");
        self.bus.publish(UpgradeEvent::SubstepStatus {
            step: self.step,
            substep,
            status,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::workflow::gate::AutoConfirm;

    /// In-memory status store shared between invocations of a test.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        pub data: Arc<Mutex<HashMap<Step, SubstepStatuses>>>,
        pub writes: Arc<AtomicUsize>,
        pub fail_writes: bool,
        pub config: Arc<Mutex<Option<clustergrade_types::config::UpgradeConfig>>>,
    }

    impl MemoryStore {
        pub fn get(&self, step: Step, substep: Substep) -> Option<SubstepStatus> {
            self.data
                .lock()
                .unwrap()
                .get(&step)
                .and_then(|s| s.get(substep))
        }
    }

    impl StatusStore for MemoryStore {
        async fn read(&self, step: Step) -> Result<SubstepStatuses, StoreError> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .get(&step)
                .cloned()
                .unwrap_or_default())
        }

        async fn write(
            &self,
            step: Step,
            substep: Substep,
            status: SubstepStatus,
        ) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Write("disk full".into()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.data
                .lock()
                .unwrap()
                .entry(step)
                .or_default()
                .set(substep, status);
            Ok(())
        }
    }

    impl crate::workflow::store::ConfigStore for MemoryStore {
        async fn load(&self) -> Result<Option<clustergrade_types::config::UpgradeConfig>, StoreError> {
            Ok(self.config.lock().unwrap().clone())
        }

        async fn save(&self, config: &clustergrade_types::config::UpgradeConfig) -> Result<(), StoreError> {
            *self.config.lock().unwrap() = Some(config.clone());
            Ok(())
        }
    }

    struct Decline;

    impl ConfirmationGate for Decline {
        fn confirm(&self, _step: Step) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn ask(&self, _question: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    async fn begin(store: &MemoryStore, step: Step) -> StepRun<MemoryStore> {
        match StepRun::begin(step, store.clone(), EventBus::new(64), &AutoConfirm, false)
            .await
            .unwrap()
        {
            Admission::Proceed(run) => run,
            Admission::Declined => panic!("unexpected decline"),
        }
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn completed_substeps_are_not_rerun() {
        let store = MemoryStore::default();
        let calls = counter();

        for _ in 0..2 {
            let mut run = begin(&store, Step::Initialize).await;
            let c = calls.clone();
            run.run(Substep::GenerateTargetConfig, |_| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            })
            .await;
            assert!(matches!(run.complete("done"), Ok(Completion::Finished(_))));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(Step::Initialize, Substep::GenerateTargetConfig),
            Some(SubstepStatus::Complete)
        );
    }

    #[tokio::test]
    async fn always_run_executes_on_every_invocation() {
        let store = MemoryStore::default();
        let calls = counter();

        for _ in 0..3 {
            let mut run = begin(&store, Step::Finalize).await;
            let c = calls.clone();
            run.always_run(Substep::ExecuteFinalizeDataMigrationScripts, |_| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            })
            .await;
            run.complete("").unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_stops_run_but_not_always_run() {
        let store = MemoryStore::default();
        let later = counter();
        let always = counter();

        let mut run = begin(&store, Step::Revert).await;
        run.run(Substep::ShutdownTargetCluster, |_| async {
            Err(anyhow::anyhow!("gpstop exited 1"))
        })
        .await;

        let l = later.clone();
        run.run(Substep::DeleteTargetDataDirectories, |_| async move {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;
        let l = later.clone();
        run.run_conditionally(Substep::DeleteTargetTablespaces, false, |_| async move {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;
        let a = always.clone();
        run.always_run(Substep::ExecuteRevertDataMigrationScripts, |_| async move {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;

        let err = run.complete("").unwrap_err();
        assert_eq!(err.step(), Step::Revert);
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(
            rendered,
            "step \"revert\": substep \"shutdown_target_cluster\": gpstop exited 1"
        );

        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(always.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(Step::Revert, Substep::ShutdownTargetCluster),
            Some(SubstepStatus::Failed)
        );
        // Not attempted after a failure: nothing persisted.
        assert_eq!(store.get(Step::Revert, Substep::DeleteTargetDataDirectories), None);
        assert_eq!(store.get(Step::Revert, Substep::DeleteTargetTablespaces), None);
    }

    #[tokio::test]
    async fn failed_substep_is_retried_on_next_invocation() {
        let store = MemoryStore::default();
        let attempts = counter();

        for expect_ok in [false, true] {
            let mut run = begin(&store, Step::Initialize).await;
            run.run(Substep::SavingSourceClusterConfig, |_| async { Ok(Flow::Continue) })
                .await;
            let a = attempts.clone();
            run.run(Substep::InitTargetCluster, |_| async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(anyhow::anyhow!("gpinitsystem failed"))
                } else {
                    Ok(Flow::Continue)
                }
            })
            .await;
            assert_eq!(run.complete("").is_ok(), expect_ok);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.get(Step::Initialize, Substep::InitTargetCluster),
            Some(SubstepStatus::Complete)
        );
    }

    #[tokio::test]
    async fn running_status_is_treated_as_incomplete() {
        let store = MemoryStore::default();
        store
            .write(Step::Execute, Substep::UpgradePrimaries, SubstepStatus::Running)
            .await
            .unwrap();

        let calls = counter();
        let mut run = begin(&store, Step::Execute).await;
        let c = calls.clone();
        run.run(Substep::UpgradePrimaries, |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;
        run.complete("").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn false_condition_records_skipped() {
        let store = MemoryStore::default();
        let calls = counter();
        let mut run = begin(&store, Step::Finalize).await;
        let c = calls.clone();
        run.run_conditionally(Substep::UpgradeStandby, false, |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;
        run.complete("").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get(Step::Finalize, Substep::UpgradeStandby),
            Some(SubstepStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn skip_flow_records_skipped() {
        let store = MemoryStore::default();
        let mut run = begin(&store, Step::Execute).await;
        run.run(Substep::ReindexInvalidIndexes, |_| async { Ok(Flow::Skip) })
            .await;
        assert_eq!(run.status(Substep::ReindexInvalidIndexes), Some(SubstepStatus::Skipped));
        run.complete("").unwrap();
    }

    #[tokio::test]
    async fn abort_stops_everything_and_restores_status() {
        let store = MemoryStore::default();
        store
            .write(
                Step::Initialize,
                Substep::ExecuteInitializeDataMigrationScripts,
                SubstepStatus::Complete,
            )
            .await
            .unwrap();

        let after = counter();
        let mut run = begin(&store, Step::Initialize).await;
        run.always_run(Substep::ExecuteInitializeDataMigrationScripts, |_| async {
            Ok(Flow::Abort)
        })
        .await;
        let a = after.clone();
        run.always_run(Substep::CheckUpgrade, |_| async move {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;

        assert_eq!(run.complete("").unwrap(), Completion::Quit);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get(Step::Initialize, Substep::ExecuteInitializeDataMigrationScripts),
            Some(SubstepStatus::Complete)
        );
    }

    #[tokio::test]
    async fn abort_without_previous_status_restores_pending() {
        let store = MemoryStore::default();
        let mut run = begin(&store, Step::Initialize).await;
        run.run(Substep::VerifyVersions, |_| async { Ok(Flow::Abort) })
            .await;
        assert_eq!(run.complete("").unwrap(), Completion::Quit);
        assert_eq!(
            store.get(Step::Initialize, Substep::VerifyVersions),
            Some(SubstepStatus::Pending)
        );
    }

    #[tokio::test]
    async fn declined_confirmation_does_not_load_or_run() {
        let store = MemoryStore::default();
        let admission = StepRun::begin(Step::Finalize, store.clone(), EventBus::new(4), &Decline, false)
            .await
            .unwrap();
        assert!(matches!(admission, Admission::Declined));

        let admitted = StepRun::begin(Step::Finalize, store, EventBus::new(4), &Decline, true)
            .await
            .unwrap();
        assert!(matches!(admitted, Admission::Proceed(_)));
    }

    #[tokio::test]
    async fn disabled_store_stops_persisting() {
        let store = MemoryStore::default();
        let mut run = begin(&store, Step::Finalize).await;
        run.run(Substep::ArchiveLogDirectories, |_| async { Ok(Flow::Continue) })
            .await;
        let before = store.writes.load(Ordering::SeqCst);

        run.disable_store();
        run.run(Substep::DeleteCoordinatorStatedir, |_| async { Ok(Flow::Continue) })
            .await;

        assert_eq!(store.writes.load(Ordering::SeqCst), before);
        assert_eq!(run.status(Substep::DeleteCoordinatorStatedir), Some(SubstepStatus::Complete));
        run.complete("").unwrap();
    }

    #[tokio::test]
    async fn store_write_failure_fails_the_step() {
        let store = MemoryStore {
            fail_writes: true,
            ..Default::default()
        };
        let calls = counter();
        let mut run = begin(&store, Step::Execute).await;
        let c = calls.clone();
        run.run(Substep::CheckActiveConnections, |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(run.complete("").is_err());
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let store = MemoryStore::default();
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let Admission::Proceed(mut run) =
            StepRun::begin(Step::Execute, store, bus, &AutoConfirm, true)
                .await
                .unwrap()
        else {
            panic!("declined");
        };
        run.run(Substep::CopyCoordinator, |_| async { Ok(Flow::Continue) })
            .await;
        run.complete("").unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UpgradeEvent::SubstepStatus { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec![SubstepStatus::Running, SubstepStatus::Complete]);
    }
}
