//! Store trait definitions.
//!
//! Defines the durable mapping `step -> substep -> status` that makes steps
//! resumable, and the persisted upgrade configuration. The infrastructure
//! layer (clustergrade-infra) implements both with JSON files in the state
//! directory.

use clustergrade_types::config::UpgradeConfig;
use clustergrade_types::error::StoreError;
use clustergrade_types::step::{Step, Substep, SubstepStatus, SubstepStatuses};

/// Persistence for substep statuses.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StatusStore: Send + Sync {
    /// All recorded statuses of `step`, empty if none were recorded.
    fn read(
        &self,
        step: Step,
    ) -> impl std::future::Future<Output = Result<SubstepStatuses, StoreError>> + Send;

    /// Durably record one substep status before returning.
    fn write(
        &self,
        step: Step,
        substep: Substep,
        status: SubstepStatus,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

impl<T: StatusStore> StatusStore for &T {
    fn read(
        &self,
        step: Step,
    ) -> impl std::future::Future<Output = Result<SubstepStatuses, StoreError>> + Send {
        (**self).read(step)
    }

    fn write(
        &self,
        step: Step,
        substep: Substep,
        status: SubstepStatus,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send {
        (**self).write(step, substep, status)
    }
}

/// Persistence for the upgrade configuration written by `initialize`.
pub trait ConfigStore: Send + Sync {
    /// The saved configuration, or `None` before the first save.
    fn load(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<UpgradeConfig>, StoreError>> + Send;

    fn save(
        &self,
        config: &UpgradeConfig,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
