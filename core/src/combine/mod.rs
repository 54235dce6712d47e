//! Wrappers that merge several streams into one.

pub mod concatenate;
pub mod stack;

pub use concatenate::{Concatenate, ConcatenateConfig};
pub use stack::{Stack, StackAxis};
