pub mod convolve;
pub mod dedisperse;
pub mod elementwise;
pub mod fold;
pub mod fourier;
pub mod integrate;
pub mod scheduler;
pub mod task;

pub use convolve::{
    Convolve, ConvolveConfig, EdgePolicy, FilterResponse, FilterSupport, Spectrum, Taps,
};
pub use dedisperse::{ChirpSense, Dedisperse, Disperse, DispersionChirp, DispersionConfig};
pub use elementwise::{RealPart, Square, SquareMode, ToComplex};
pub use fold::{Fold, FoldAccumulator, FoldConfig, FoldSpan, FoldState};
pub use fourier::{FourierTransform, InverseFourierTransform, SpectrumLayout};
pub use integrate::{Integrate, IntegrateConfig, IntegrateInterval};
pub use scheduler::{FrameGeometry, FrameScheduler};
pub use task::{FramePlan, FrameTransform, Task};
