use crate::prelude::{
    check_read, rates_match, resolve_seek, SampleStream, StreamError, StreamInfo, StreamResult,
};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;

/// Where the inputs of a [`Stack`] are joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackAxis {
    /// New last axis, e.g. polarizations: `shape + [n]`.
    #[default]
    Trailing,
    /// New first axis: `[n] + shape`.
    Leading,
    /// Existing channel axis, concatenated: `[sum of channels] + rest`.
    Channels,
}

/// Streams combined sample for sample along a non-time axis.
///
/// Inputs must share start time and sample rate; the stack is as long as the
/// shortest input.
pub struct Stack<S: SampleStream> {
    streams: Vec<S>,
    axis: StackAxis,
    /// Output column of every input column, per stream.
    targets: Vec<Vec<usize>>,
    info: StreamInfo,
    position: u64,
    metrics: MetricsRecorder,
}

impl<S: SampleStream> Stack<S> {
    pub fn new(streams: Vec<S>, axis: StackAxis) -> StreamResult<Self> {
        let logger = LogManager::new("stack");
        let first = match streams.first() {
            Some(stream) => stream.info().clone(),
            None => return Err(StreamError::Configuration("nothing to stack".into())),
        };
        let count = streams.len();
        for (index, stream) in streams.iter().enumerate().skip(1) {
            let info = stream.info();
            if !rates_match(info.sample_rate, first.sample_rate) {
                return Err(StreamError::Mismatch(format!(
                    "stream {} runs at {} Hz, stream 0 at {} Hz",
                    index, info.sample_rate, first.sample_rate
                )));
            }
            if (info.start_time - first.start_time).abs() * first.sample_rate > 0.01 {
                return Err(StreamError::Mismatch(format!(
                    "stream {} starts at {}, stream 0 at {}",
                    index, info.start_time, first.start_time
                )));
            }
            let compatible = match axis {
                StackAxis::Channels => info.sample_shape.get(1..) == first.sample_shape.get(1..),
                _ => info.sample_shape == first.sample_shape,
            };
            if !compatible {
                return Err(StreamError::Mismatch(format!(
                    "stream {} has shape {:?}, stream 0 {:?}",
                    index, info.sample_shape, first.sample_shape
                )));
            }
        }

        let columns = first.columns();
        let mut info = first.clone();
        info.length = streams
            .iter()
            .filter_map(|stream| stream.info().length)
            .min();
        let single_channel_frequencies = || -> Option<(Vec<f64>, Vec<i8>)> {
            let mut frequency = Vec::with_capacity(count);
            let mut sideband = Vec::with_capacity(count);
            for stream in &streams {
                let info = stream.info();
                if info.channels() != 1 {
                    return None;
                }
                frequency.push(info.frequency.as_ref()?[0]);
                sideband.push(info.channel_sidebands()[0]);
            }
            Some((frequency, sideband))
        };

        let targets: Vec<Vec<usize>> = match axis {
            StackAxis::Leading => {
                let mut shape = vec![count];
                shape.extend_from_slice(&first.sample_shape);
                info.sample_shape = shape;
                let labels = single_channel_frequencies();
                info.frequency = labels.as_ref().map(|(frequency, _)| frequency.clone());
                info.sideband = labels.map(|(_, sideband)| sideband);
                (0..count)
                    .map(|stream| (0..columns).map(|column| stream * columns + column).collect())
                    .collect()
            }
            StackAxis::Trailing => {
                info.sample_shape.push(count);
                if first.sample_shape.is_empty() {
                    let labels = single_channel_frequencies();
                    info.frequency = labels.as_ref().map(|(frequency, _)| frequency.clone());
                    info.sideband = labels.map(|(_, sideband)| sideband);
                } else if streams
                    .iter()
                    .any(|stream| stream.info().frequency != first.frequency)
                {
                    info.frequency = None;
                    info.sideband = None;
                }
                (0..count)
                    .map(|stream| (0..columns).map(|column| column * count + stream).collect())
                    .collect()
            }
            StackAxis::Channels => {
                let rest: usize = first.sample_shape.iter().skip(1).product();
                let total: usize = streams.iter().map(|stream| stream.info().channels()).sum();
                let mut shape = vec![total];
                shape.extend_from_slice(first.sample_shape.get(1..).unwrap_or(&[]));
                info.sample_shape = shape;
                let labelled = streams.iter().all(|stream| stream.info().frequency.is_some());
                info.frequency = None;
                info.sideband = None;
                if labelled {
                    let mut frequency = Vec::with_capacity(total);
                    let mut sideband = Vec::with_capacity(total);
                    for stream in &streams {
                        frequency.extend(stream.info().frequency.iter().flatten().copied());
                        sideband.extend(stream.info().channel_sidebands());
                    }
                    info.frequency = Some(frequency);
                    info.sideband = Some(sideband);
                }
                let mut offset = 0;
                streams
                    .iter()
                    .map(|stream| {
                        let width = stream.info().channels() * rest;
                        let target = (offset..offset + width).collect();
                        offset += width;
                        target
                    })
                    .collect()
            }
        };
        info.validate()?;
        logger.record(format_args!(
            "{} streams along {:?} into shape {:?}, length {:?}",
            count, axis, info.sample_shape, info.length
        ));

        Ok(Self {
            streams,
            axis,
            targets,
            info,
            position: 0,
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn axis(&self) -> StackAxis {
        self.axis
    }

    pub fn streams(&self) -> &[S] {
        &self.streams
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<S: SampleStream> SampleStream for Stack<S> {
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
            for stream in &mut self.streams {
                stream.seek(SeekFrom::Start(target))?;
            }
            self.position = target;
            self.metrics.record_seek();
        }
        Ok(target)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<S::Sample>> {
        check_read(&self.info, self.position, count)?;
        let mut output = Array2::zeros((count, self.info.columns()));
        for (stream, targets) in self.streams.iter_mut().zip(&self.targets) {
            if stream.tell() != self.position {
                stream.seek(SeekFrom::Start(self.position))?;
            }
            let block = stream.read(count)?;
            for (column, &target) in targets.iter().enumerate() {
                output.column_mut(target).assign(&block.column(column));
            }
            self.metrics.record_parent_samples(count);
        }
        self.position += count as u64;
        self.metrics.record_output(count);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ArrayStream;
    use ndarray::array;

    fn pol(start: f64, rate: f64, offset: f32, rows: usize) -> ArrayStream<f32> {
        let data = Array2::from_shape_fn((rows, 2), |(r, c)| offset + (r * 2 + c) as f32);
        ArrayStream::new(data, start, rate)
            .unwrap()
            .with_frequency(vec![1e8, 2e8], vec![1, 1])
            .unwrap()
    }

    #[test]
    fn trailing_axis_interleaves_inputs() {
        let streams = vec![pol(0.0, 1.0, 0.0, 4), pol(0.0, 1.0, 100.0, 3)];
        let mut stack = Stack::new(streams, StackAxis::Trailing).unwrap();
        assert_eq!(stack.info().sample_shape, vec![2, 2]);
        assert_eq!(stack.info().length, Some(3));
        assert_eq!(stack.info().frequency.as_ref().unwrap(), &vec![1e8, 2e8]);
        assert_eq!(stack.read(1).unwrap(), array![[0.0, 100.0, 1.0, 101.0]]);
    }

    #[test]
    fn leading_axis_places_inputs_in_blocks() {
        let streams = vec![pol(0.0, 1.0, 0.0, 4), pol(0.0, 1.0, 100.0, 4)];
        let mut stack = Stack::new(streams, StackAxis::Leading).unwrap();
        assert_eq!(stack.info().sample_shape, vec![2, 2]);
        assert_eq!(stack.info().frequency, None);
        stack.seek(SeekFrom::Start(2)).unwrap();
        assert_eq!(stack.read(1).unwrap(), array![[4.0, 5.0, 104.0, 105.0]]);
        assert_eq!(stack.streams()[1].tell(), 3);
    }

    #[test]
    fn channel_axis_concatenates_frequencies() {
        let narrow = ArrayStream::new(array![[7.0f32], [8.0]], 0.0, 1.0)
            .unwrap()
            .with_frequency(vec![3e8], vec![-1])
            .unwrap();
        let streams: Vec<Box<dyn SampleStream<Sample = f32>>> =
            vec![Box::new(pol(0.0, 1.0, 0.0, 2)), Box::new(narrow)];
        let mut stack = Stack::new(streams, StackAxis::Channels).unwrap();
        assert_eq!(stack.info().sample_shape, vec![3]);
        assert_eq!(stack.info().frequency.as_ref().unwrap(), &vec![1e8, 2e8, 3e8]);
        assert_eq!(stack.info().sideband.as_ref().unwrap(), &vec![1, 1, -1]);
        assert_eq!(stack.read(2).unwrap(), array![[0.0, 1.0, 7.0], [2.0, 3.0, 8.0]]);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let other_rate = vec![pol(0.0, 1.0, 0.0, 4), pol(0.0, 2.0, 0.0, 4)];
        assert!(matches!(
            Stack::new(other_rate, StackAxis::Trailing).err(),
            Some(StreamError::Mismatch(_))
        ));
        let other_start = vec![pol(0.0, 1.0, 0.0, 4), pol(1.0, 1.0, 0.0, 4)];
        assert!(matches!(
            Stack::new(other_start, StackAxis::Trailing).err(),
            Some(StreamError::Mismatch(_))
        ));
        let scalar =
            ArrayStream::with_shape(Array2::<f32>::zeros((4, 1)), 0.0, 1.0, vec![]).unwrap();
        let streams: Vec<Box<dyn SampleStream<Sample = f32>>> =
            vec![Box::new(pol(0.0, 1.0, 0.0, 4)), Box::new(scalar)];
        assert!(matches!(
            Stack::new(streams, StackAxis::Leading).err(),
            Some(StreamError::Mismatch(_))
        ));
    }
}
