//! Sample-by-sample transforms: detection and dtype conversions.

use crate::prelude::{Dtype, Element, StreamError, StreamInfo, StreamResult};
use crate::processing::scheduler::FrameGeometry;
use crate::processing::task::{FramePlan, FrameTransform};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquareMode {
    /// `|x|^2` of every element.
    #[default]
    Power,
    /// Trailing polarization axis `[X, Y]` becomes `[XX, YY, Re XY*, Im XY*]`.
    Coherency,
}

/// Detection: voltages to real power.
#[derive(Debug, Clone, Copy, Default)]
pub struct Square {
    mode: SquareMode,
}

impl Square {
    pub fn new(mode: SquareMode) -> Self {
        Self { mode }
    }

    pub fn power() -> Self {
        Self::new(SquareMode::Power)
    }

    pub fn coherency() -> Self {
        Self::new(SquareMode::Coherency)
    }
}

/// Metadata of a 1:1 transform producing `dtype` samples of `shape`.
fn elementwise_plan(parent: &StreamInfo, shape: Vec<usize>, dtype: Dtype) -> FramePlan {
    let mut info = parent.clone();
    if info.channels() != shape.first().copied().unwrap_or(1) {
        info.frequency = None;
        info.sideband = None;
    }
    info.sample_shape = shape;
    info.dtype = dtype;
    FramePlan {
        geometry: FrameGeometry::new(1, 1),
        info,
    }
}

impl<I: Element> FrameTransform<I> for Square {
    type Output = f32;

    fn name(&self) -> &'static str {
        "square"
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        let mut shape = parent.sample_shape.clone();
        if self.mode == SquareMode::Coherency {
            match shape.last_mut() {
                Some(last) if *last == 2 => *last = 4,
                _ => {
                    return Err(StreamError::Configuration(format!(
                        "coherency products need a trailing polarization axis of 2, got {:?}",
                        parent.sample_shape
                    )))
                }
            }
        }
        Ok(elementwise_plan(parent, shape, f32::DTYPE))
    }

    fn execute(&mut self, input: ArrayView2<'_, I>, frames: usize) -> StreamResult<Array2<f32>> {
        match self.mode {
            SquareMode::Power => Ok(input.mapv(|value| value.power())),
            SquareMode::Coherency => {
                let pairs = input.ncols() / 2;
                let mut output = Array2::zeros((frames, pairs * 4));
                for row in 0..frames {
                    for pair in 0..pairs {
                        let x = input[[row, 2 * pair]].to_complex();
                        let y = input[[row, 2 * pair + 1]].to_complex();
                        let cross = x * y.conj();
                        output[[row, 4 * pair]] = x.norm_sqr();
                        output[[row, 4 * pair + 1]] = y.norm_sqr();
                        output[[row, 4 * pair + 2]] = cross.re;
                        output[[row, 4 * pair + 3]] = cross.im;
                    }
                }
                Ok(output)
            }
        }
    }
}

/// Real samples promoted to complex with a zero imaginary part.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToComplex;

impl FrameTransform<f32> for ToComplex {
    type Output = Complex32;

    fn name(&self) -> &'static str {
        "to-complex"
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        Ok(elementwise_plan(parent, parent.sample_shape.clone(), Complex32::DTYPE))
    }

    fn execute(
        &mut self,
        input: ArrayView2<'_, f32>,
        _frames: usize,
    ) -> StreamResult<Array2<Complex32>> {
        Ok(input.mapv(|value| value.to_complex()))
    }
}

/// Complex samples reduced to their real part.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealPart;

impl FrameTransform<Complex32> for RealPart {
    type Output = f32;

    fn name(&self) -> &'static str {
        "real-part"
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        Ok(elementwise_plan(parent, parent.sample_shape.clone(), f32::DTYPE))
    }

    fn execute(
        &mut self,
        input: ArrayView2<'_, Complex32>,
        _frames: usize,
    ) -> StreamResult<Array2<f32>> {
        Ok(input.mapv(|value| value.re))
    }
}
