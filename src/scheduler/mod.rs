//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Priority-based request scheduling with preemption
//! - Continuous batching (iteration-level scheduling)
//! - Packing scheduled sequences into executor inputs

pub mod batch;
pub mod continuous;

pub use self::batch::ModelInput;
pub use self::continuous::{ContinuousScheduler, SchedulerHandle, StepStats};
