//! Lazy, seekable stream transforms for baseband pulsar data.
//!
//! Every reader and every task implements [`SampleStream`], so tasks chain
//! freely: a read on the outermost task pulls exactly the parent samples it
//! needs, frame by frame, in bounded memory.

pub mod combine;
pub mod interface;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use prelude::{Dtype, Element, PartialRead, SampleStream, StreamError, StreamInfo, StreamResult};
pub use processing::Task;
