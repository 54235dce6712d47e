use crate::prelude::{
    check_read, rates_match, resolve_seek, Element, SampleStream, StreamError, StreamInfo,
    StreamResult,
};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::{s, Array2};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;

fn default_grid_tolerance() -> f64 {
    0.01
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcatenateConfig {
    /// Largest gap, in samples, that may be filled.
    #[serde(default)]
    pub max_gap: u64,
    /// Value of the samples filling a gap.
    #[serde(default)]
    pub fill: f32,
    /// Allowed misalignment, in samples, between a stream's start and the
    /// sample grid of the streams before it.
    #[serde(default = "default_grid_tolerance")]
    pub grid_tolerance: f64,
}

impl Default for ConcatenateConfig {
    fn default() -> Self {
        Self {
            max_gap: 0,
            fill: 0.0,
            grid_tolerance: default_grid_tolerance(),
        }
    }
}

impl ConcatenateConfig {
    pub fn with_max_gap(mut self, max_gap: u64) -> Self {
        self.max_gap = max_gap;
        self
    }

    pub fn with_fill(mut self, fill: f32) -> Self {
        self.fill = fill;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stream(usize),
    Fill,
}

/// Contiguous stretch of output served by one stream or by fill samples.
#[derive(Debug, Clone, Copy)]
struct Segment {
    source: Source,
    start: u64,
    length: Option<u64>,
}

impl Segment {
    fn contains(&self, index: u64) -> bool {
        index >= self.start && self.length.map_or(true, |length| index < self.start + length)
    }
}

/// Streams joined end to end in order of start time, with gaps filled.
pub struct Concatenate<S: SampleStream> {
    streams: Vec<S>,
    segments: Vec<Segment>,
    info: StreamInfo,
    fill: S::Sample,
    position: u64,
    metrics: MetricsRecorder,
}

impl<S: SampleStream> Concatenate<S> {
    pub fn new(mut streams: Vec<S>, config: ConcatenateConfig) -> StreamResult<Self> {
        let logger = LogManager::new("concatenate");
        if streams.is_empty() {
            return Err(StreamError::Configuration("nothing to concatenate".into()));
        }
        streams.sort_by(|a, b| a.info().start_time.total_cmp(&b.info().start_time));

        let first = streams[0].info().clone();
        let mut segments = Vec::with_capacity(2 * streams.len());
        let mut cursor = 0u64;
        for (index, stream) in streams.iter().enumerate() {
            let info = stream.info();
            if !rates_match(info.sample_rate, first.sample_rate)
                || info.sample_shape != first.sample_shape
                || info.frequency != first.frequency
                || info.sideband != first.sideband
            {
                return Err(StreamError::Mismatch(format!(
                    "stream {} ({} Hz, shape {:?}) does not match stream 0 ({} Hz, shape {:?})",
                    index,
                    info.sample_rate,
                    info.sample_shape,
                    first.sample_rate,
                    first.sample_shape
                )));
            }
            if index > 0 {
                let offset = (info.start_time - first.time_at(cursor)) * first.sample_rate;
                let gap = offset.round();
                if offset < -config.grid_tolerance {
                    return Err(StreamError::Mismatch(format!(
                        "stream {} overlaps the previous one by {:.3} samples",
                        index, -offset
                    )));
                }
                if (offset - gap).abs() > config.grid_tolerance {
                    return Err(StreamError::Mismatch(format!(
                        "stream {} starts {:.3} samples off the sample grid",
                        index,
                        offset - gap
                    )));
                }
                let gap = gap.max(0.0) as u64;
                if gap > config.max_gap {
                    return Err(StreamError::Gap {
                        gap,
                        max_gap: config.max_gap,
                    });
                }
                if gap > 0 {
                    logger.notice(format_args!("filling {} samples before stream {}", gap, index));
                    segments.push(Segment {
                        source: Source::Fill,
                        start: cursor,
                        length: Some(gap),
                    });
                    cursor += gap;
                }
            }
            segments.push(Segment {
                source: Source::Stream(index),
                start: cursor,
                length: info.length,
            });
            match info.length {
                Some(length) => cursor += length,
                None if index + 1 < streams.len() => {
                    return Err(StreamError::Configuration(format!(
                        "stream {} is unbounded but not the last",
                        index
                    )))
                }
                None => {}
            }
        }

        let mut info = first;
        info.length = streams
            .last()
            .and_then(|stream| stream.info().length)
            .map(|_| cursor);
        logger.record(format_args!(
            "{} streams in {} segments, length {:?}",
            streams.len(),
            segments.len(),
            info.length
        ));

        Ok(Self {
            streams,
            segments,
            info,
            fill: <S::Sample as Element>::from_complex(Complex32::new(config.fill, 0.0)),
            position: 0,
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn streams(&self) -> &[S] {
        &self.streams
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn segment_of(&self, index: u64) -> StreamResult<Segment> {
        let slot = self
            .segments
            .partition_point(|segment| segment.start <= index)
            .saturating_sub(1);
        self.segments
            .get(slot)
            .filter(|segment| segment.contains(index))
            .copied()
            .ok_or_else(|| StreamError::Internal(format!("no segment holds sample {}", index)))
    }
}

impl<S: SampleStream> SampleStream for Concatenate<S> {
    type Sample = S::Sample;

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        let target = resolve_seek(pos, self.position, self.info.length)?;
        if target != self.position {
            self.position = target;
            self.metrics.record_seek();
        }
        Ok(target)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<S::Sample>> {
        check_read(&self.info, self.position, count)?;
        let mut output = Array2::from_elem((count, self.info.columns()), self.fill);
        let mut filled = 0usize;
        while filled < count {
            let index = self.position + filled as u64;
            let segment = self.segment_of(index)?;
            let available = segment
                .length
                .map_or(u64::MAX, |length| segment.start + length - index);
            let take = available.min((count - filled) as u64) as usize;
            if let Source::Stream(slot) = segment.source {
                let stream = &mut self.streams[slot];
                let local = index - segment.start;
                if stream.tell() != local {
                    stream.seek(SeekFrom::Start(local))?;
                }
                let block = stream.read(take)?;
                output.slice_mut(s![filled..filled + take, ..]).assign(&block);
                self.metrics.record_parent_samples(take);
            }
            filled += take;
        }
        self.position += count as u64;
        self.metrics.record_output(count);
        Ok(output)
    }
}
