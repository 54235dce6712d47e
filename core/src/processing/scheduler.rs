use crate::prelude::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Upper bound on the input rows a task gathers for one batch of frames.
const TARGET_BATCH_ROWS: usize = 1 << 16;

/// Input/output sample accounting of a framed transform.
///
/// Frames start `step()` input samples apart, so consecutive frames share
/// `overlap` samples. Input indices are *virtual*: `pad_start` zero samples
/// precede the parent's first sample and `pad_end` zero samples follow its
/// last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub samples_in: usize,
    pub samples_out: usize,
    #[serde(default)]
    pub overlap: usize,
    #[serde(default)]
    pub pad_start: usize,
    #[serde(default)]
    pub pad_end: usize,
}

impl FrameGeometry {
    pub fn new(samples_in: usize, samples_out: usize) -> Self {
        Self {
            samples_in,
            samples_out,
            overlap: 0,
            pad_start: 0,
            pad_end: 0,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_padding(mut self, pad_start: usize, pad_end: usize) -> Self {
        self.pad_start = pad_start;
        self.pad_end = pad_end;
        self
    }

    /// Fresh input samples consumed per frame.
    pub fn step(&self) -> usize {
        self.samples_in.saturating_sub(self.overlap)
    }

    /// Output samples per input sample.
    pub fn rate_ratio(&self) -> f64 {
        self.samples_out as f64 / self.step() as f64
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.samples_out == 0 {
            return Err(StreamError::Configuration(
                "a frame must produce at least one sample".into(),
            ));
        }
        if self.samples_in <= self.overlap {
            return Err(StreamError::Configuration(format!(
                "frame of {} samples cannot carry an overlap of {}",
                self.samples_in, self.overlap
            )));
        }
        Ok(())
    }
}

/// Maps output sample indices onto frames and parent sample ranges.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    geometry: FrameGeometry,
    parent_length: Option<u64>,
    batch_frames: u64,
}

impl FrameScheduler {
    pub fn new(geometry: FrameGeometry, parent_length: Option<u64>) -> StreamResult<Self> {
        geometry.validate()?;
        let batch_frames = (TARGET_BATCH_ROWS / geometry.samples_in).max(1) as u64;
        Ok(Self {
            geometry,
            parent_length,
            batch_frames,
        })
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Number of output samples that depend only on real or padded input.
    pub fn output_length(&self) -> Option<u64> {
        let geometry = &self.geometry;
        self.parent_length.map(|length| {
            let virtual_length = length + (geometry.pad_start + geometry.pad_end) as u64;
            match virtual_length.checked_sub(geometry.overlap as u64) {
                Some(usable) => {
                    (usable as u128 * geometry.samples_out as u128 / geometry.step() as u128) as u64
                }
                None => 0,
            }
        })
    }

    pub fn frame_of(&self, output_index: u64) -> u64 {
        output_index / self.geometry.samples_out as u64
    }

    pub fn frame_output_start(&self, frame: u64) -> u64 {
        frame * self.geometry.samples_out as u64
    }

    /// Virtual input range covering frames `first..end`.
    pub fn input_span(&self, first: u64, end: u64) -> Range<u64> {
        let step = self.geometry.step() as u64;
        let start = first * step;
        start..(end - 1) * step + self.geometry.samples_in as u64
    }

    /// Parent indices backing a virtual input range; the rest is padding.
    pub fn parent_span(&self, span: &Range<u64>) -> Range<u64> {
        let pad = self.geometry.pad_start as u64;
        let mut start = span.start.saturating_sub(pad);
        let mut end = span.end.saturating_sub(pad);
        if let Some(length) = self.parent_length {
            start = start.min(length);
            end = end.min(length);
        }
        start..end.max(start)
    }

    /// Virtual index of the first input sample of the frame holding
    /// `output_index`; always at least `overlap` before the naively scaled
    /// position once the frame is past the stream start.
    pub fn virtual_offset(&self, output_index: u64) -> u64 {
        self.frame_of(output_index) * self.geometry.step() as u64
    }

    /// Parent cursor position needed before producing `output_index`.
    pub fn parent_offset(&self, output_index: u64) -> u64 {
        let offset = self
            .virtual_offset(output_index)
            .saturating_sub(self.geometry.pad_start as u64);
        match self.parent_length {
            Some(length) => offset.min(length),
            None => offset,
        }
    }

    /// End of the next batch starting at `first` and aiming for `wanted`.
    pub fn batch_end(&self, first: u64, wanted: u64) -> u64 {
        wanted.min(first + self.batch_frames).max(first + 1)
    }
}
