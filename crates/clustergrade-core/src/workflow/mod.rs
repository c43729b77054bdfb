//! Step/substep workflow engine.
//!
//! - [`engine`]: `StepRun`, the resumable substep sequencer
//! - [`store`]: the durable status and configuration store ports
//! - [`streams`]: output sink handed to substep bodies
//! - [`gate`]: confirmation prompt shown before a step starts

pub mod engine;
pub mod gate;
pub mod store;
pub mod streams;

pub use engine::{Admission, Completion, Flow, StepError, StepRun};
pub use gate::{AutoConfirm, ConfirmationGate};
pub use store::{ConfigStore, StatusStore};
pub use streams::OutStreams;
