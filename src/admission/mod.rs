//! Admission API
//!
//! Entry point for callers: build an [`AdmissionController`], then run
//! queries and transactions through it.

mod builder;
mod controller;
mod gate;
mod options;
mod probe;
mod shutdown;

pub use builder::AdmissionBuilder;
pub use controller::AdmissionController;
pub use gate::PoolGate;
pub use options::QueryOptions;
pub use probe::FactoryProbe;
pub use shutdown::{LifecycleState, ShutdownCoordinator, ShutdownReport};
