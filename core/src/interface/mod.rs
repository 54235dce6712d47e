//! Narrow interfaces to the collaborators the core consumes: raw readers
//! and pulsar phase prediction.

pub mod phase;
pub mod reader;

pub use phase::{PhaseModel, SpinModel};
pub use reader::{ArrayStream, Generator};
