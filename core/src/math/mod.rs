pub mod dispersion;
pub mod fft;
pub mod stats;

pub use dispersion::DispersionMeasure;
pub use fft::{FftDirection, FftHelper};
pub use stats::StatsHelper;
