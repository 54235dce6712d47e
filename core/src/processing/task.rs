use crate::prelude::{
    check_read, rates_match, resolve_seek, Element, SampleStream, StreamError, StreamInfo,
    StreamResult,
};
use crate::processing::scheduler::{FrameGeometry, FrameScheduler};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::{s, Array2, ArrayView2};
use std::io::SeekFrom;

/// Frame geometry and output metadata a transform derives from its parent.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub geometry: FrameGeometry,
    /// Output metadata; `length` is filled in by the task.
    pub info: StreamInfo,
}

/// Per-frame transform driven by [`Task`].
pub trait FrameTransform<I: Element> {
    type Output: Element;

    fn name(&self) -> &'static str;

    /// Validates the transform against its parent. Called once, when the
    /// task is constructed, so configuration errors surface there.
    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan>;

    /// Transforms `frames` consecutive frames. `input` holds
    /// `(frames - 1) * step + samples_in` rows; the result must hold
    /// `frames * samples_out` rows.
    fn execute(
        &mut self,
        input: ArrayView2<'_, I>,
        frames: usize,
    ) -> StreamResult<Array2<Self::Output>>;
}

/// Trailing input rows kept for the next contiguous batch.
struct Carry<T> {
    start: u64,
    rows: Array2<T>,
}

/// Transformed rows beyond what the last read handed out.
struct Leftover<T> {
    start: u64,
    rows: Array2<T>,
}

impl<T> Leftover<T> {
    fn rows_from(&self, index: u64) -> Option<ArrayView2<'_, T>> {
        let end = self.start + self.rows.nrows() as u64;
        if index >= self.start && index < end {
            let offset = (index - self.start) as usize;
            Some(self.rows.slice(s![offset.., ..]))
        } else {
            None
        }
    }
}

/// Lazy stream transform: a parent stream seen through a [`FrameTransform`].
///
/// Reads pull exactly the parent samples needed for the requested output,
/// reusing the overlap carried from the previous batch, and any split of a
/// read yields the same samples as a single read.
pub struct Task<P: SampleStream, K: FrameTransform<P::Sample>> {
    parent: P,
    kernel: K,
    info: StreamInfo,
    scheduler: FrameScheduler,
    position: u64,
    carry: Option<Carry<P::Sample>>,
    leftover: Option<Leftover<K::Output>>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl<P, K> Task<P, K>
where
    P: SampleStream,
    K: FrameTransform<P::Sample>,
{
    pub fn new(mut parent: P, mut kernel: K) -> StreamResult<Self> {
        let logger = LogManager::new(kernel.name());
        let FramePlan { geometry, mut info } = kernel.initialize(parent.info())?;
        let scheduler = FrameScheduler::new(geometry, parent.info().length)?;

        let expected_rate = parent.info().sample_rate * geometry.rate_ratio();
        if !rates_match(info.sample_rate, expected_rate) {
            return Err(StreamError::Configuration(format!(
                "{} advertises {} Hz but frames of {} -> {} samples imply {} Hz",
                kernel.name(),
                info.sample_rate,
                geometry.step(),
                geometry.samples_out,
                expected_rate
            )));
        }
        if info.dtype != <K::Output as Element>::DTYPE {
            return Err(StreamError::Internal(format!(
                "{} advertises {:?} but produces {:?}",
                kernel.name(),
                info.dtype,
                <K::Output as Element>::DTYPE
            )));
        }
        info.length = scheduler.output_length();
        info.validate()?;

        let offset = scheduler.parent_offset(0);
        if parent.tell() != offset {
            parent.seek(SeekFrom::Start(offset))?;
        }

        logger.record(format_args!(
            "frames of {} in / {} out, overlap {}, padding {}+{}, {} Hz, length {:?}",
            geometry.samples_in,
            geometry.samples_out,
            geometry.overlap,
            geometry.pad_start,
            geometry.pad_end,
            info.sample_rate,
            info.length
        ));

        Ok(Self {
            parent,
            kernel,
            info,
            scheduler,
            position: 0,
            carry: None,
            leftover: None,
            metrics: MetricsRecorder::new(),
            logger,
        })
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn geometry(&self) -> &FrameGeometry {
        self.scheduler.geometry()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn into_parent(self) -> P {
        self.parent
    }

    fn transform_frames(&mut self, first: u64, end: u64) -> StreamResult<Array2<K::Output>> {
        let geometry = *self.scheduler.geometry();
        let span = self.scheduler.input_span(first, end);
        let rows = (span.end - span.start) as usize;
        let mut input = Array2::zeros((rows, self.parent.info().columns()));

        let mut cursor = span.start;
        if let Some(carry) = self.carry.take() {
            if carry.start == span.start {
                let reuse = carry.rows.nrows().min(rows);
                input
                    .slice_mut(s![..reuse, ..])
                    .assign(&carry.rows.slice(s![..reuse, ..]));
                cursor += reuse as u64;
            }
        }

        let wanted = self.scheduler.parent_span(&(cursor..span.end));
        if !wanted.is_empty() {
            if self.parent.tell() != wanted.start {
                self.parent.seek(SeekFrom::Start(wanted.start))?;
            }
            let block = self.parent.read((wanted.end - wanted.start) as usize)?;
            let offset = (wanted.start + geometry.pad_start as u64 - span.start) as usize;
            input
                .slice_mut(s![offset..offset + block.nrows(), ..])
                .assign(&block);
            self.metrics.record_parent_samples(block.nrows());
        }

        if geometry.overlap > 0 {
            let keep = rows - geometry.overlap;
            self.carry = Some(Carry {
                start: span.end - geometry.overlap as u64,
                rows: input.slice(s![keep.., ..]).to_owned(),
            });
        }

        let frames = (end - first) as usize;
        let output = self.kernel.execute(input.view(), frames)?;
        if output.nrows() != frames * geometry.samples_out
            || output.ncols() != self.info.columns()
        {
            return Err(StreamError::Internal(format!(
                "{} produced a {:?} block for {} frames",
                self.kernel.name(),
                output.dim(),
                frames
            )));
        }
        self.metrics.record_frames(frames);
        self.logger.detail(format_args!(
            "frames {}..{} from virtual input {}..{}",
            first, end, span.start, span.end
        ));
        Ok(output)
    }
}

impl<P, K> SampleStream for Task<P, K>
where
    P: SampleStream,
    K: FrameTransform<P::Sample>,
{
    type Sample = K::Output;

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
            let offset = self.scheduler.parent_offset(target);
            if self.parent.tell() != offset {
                self.parent.seek(SeekFrom::Start(offset))?;
            }
            self.metrics.record_seek();
        }
        Ok(target)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<K::Output>> {
        check_read(&self.info, self.position, count)?;
        let mut output = Array2::zeros((count, self.info.columns()));
        let end = self.position + count as u64;
        let mut filled = 0usize;

        while filled < count {
            let index = self.position + filled as u64;
            if let Some(rows) = self.leftover.as_ref().and_then(|left| left.rows_from(index)) {
                let take = rows.nrows().min(count - filled);
                output
                    .slice_mut(s![filled..filled + take, ..])
                    .assign(&rows.slice(s![..take, ..]));
                filled += take;
                continue;
            }

            let first = self.scheduler.frame_of(index);
            let wanted = self.scheduler.frame_of(end - 1) + 1;
            let last = self.scheduler.batch_end(first, wanted);
            let block = self.transform_frames(first, last)?;

            let block_start = self.scheduler.frame_output_start(first);
            let skip = (index - block_start) as usize;
            let take = (block.nrows() - skip).min(count - filled);
            output
                .slice_mut(s![filled..filled + take, ..])
                .assign(&block.slice(s![skip..skip + take, ..]));
            filled += take;

            let tail = block.nrows() - self.scheduler.geometry().samples_out;
            self.leftover = Some(Leftover {
                start: block_start + tail as u64,
                rows: block.slice(s![tail.., ..]).to_owned(),
            });
        }

        self.position = end;
        self.metrics.record_output(count);
        Ok(output)
    }
}
