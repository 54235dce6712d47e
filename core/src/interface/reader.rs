use crate::prelude::{
    check_read, resolve_seek, Element, SampleStream, StreamError, StreamInfo, StreamResult,
};
use ndarray::{s, Array2, ArrayView2};
use std::io::SeekFrom;

/// Finite stream backed by an in-memory `(time, columns)` array.
pub struct ArrayStream<T: Element> {
    info: StreamInfo,
    data: Array2<T>,
    position: u64,
}

impl<T: Element> ArrayStream<T> {
    /// Stream whose sample shape is the number of columns of `data`.
    pub fn new(data: Array2<T>, start_time: f64, sample_rate: f64) -> StreamResult<Self> {
        let shape = vec![data.ncols()];
        Self::with_shape(data, start_time, sample_rate, shape)
    }

    pub fn with_shape(
        data: Array2<T>,
        start_time: f64,
        sample_rate: f64,
        sample_shape: Vec<usize>,
    ) -> StreamResult<Self> {
        let info = StreamInfo::new(
            start_time,
            sample_rate,
            sample_shape,
            T::DTYPE,
            Some(data.nrows() as u64),
        );
        info.validate()?;
        if info.columns() != data.ncols() {
            return Err(StreamError::Configuration(format!(
                "sample shape {:?} does not match {} columns",
                info.sample_shape,
                data.ncols()
            )));
        }
        Ok(Self {
            info,
            data,
            position: 0,
        })
    }

    pub fn with_frequency(mut self, frequency: Vec<f64>, sideband: Vec<i8>) -> StreamResult<Self> {
        self.info = self.info.with_frequency(frequency, sideband);
        self.info.validate()?;
        Ok(self)
    }

    pub fn data(&self) -> ArrayView2<'_, T> {
        self.data.view()
    }
}

impl<T: Element> SampleStream for ArrayStream<T> {
    type Sample = T;

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        self.position = resolve_seek(pos, self.position, self.info.length)?;
        Ok(self.position)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<T>> {
        check_read(&self.info, self.position, count)?;
        let start = self.position as usize;
        let block = self.data.slice(s![start..start + count, ..]).to_owned();
        self.position += count as u64;
        Ok(block)
    }
}

/// Stream computed on demand from a sample function of `(index, column)`.
///
/// Unbounded unless a length is set, so it can stand in for readers of
/// arbitrarily long recordings.
pub struct Generator<T: Element, F: Fn(u64, usize) -> T> {
    info: StreamInfo,
    function: F,
    position: u64,
}

impl<T: Element, F: Fn(u64, usize) -> T> Generator<T, F> {
    pub fn new(
        function: F,
        start_time: f64,
        sample_rate: f64,
        sample_shape: Vec<usize>,
    ) -> StreamResult<Self> {
        let info = StreamInfo::new(start_time, sample_rate, sample_shape, T::DTYPE, None);
        info.validate()?;
        Ok(Self {
            info,
            function,
            position: 0,
        })
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.info.length = Some(length);
        self
    }

    pub fn with_frequency(mut self, frequency: Vec<f64>, sideband: Vec<i8>) -> StreamResult<Self> {
        self.info = self.info.with_frequency(frequency, sideband);
        self.info.validate()?;
        Ok(self)
    }
}

impl<T: Element, F: Fn(u64, usize) -> T> SampleStream for Generator<T, F> {
    type Sample = T;

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        self.position = resolve_seek(pos, self.position, self.info.length)?;
        Ok(self.position)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<T>> {
        check_read(&self.info, self.position, count)?;
        let start = self.position;
        let function = &self.function;
        let block = Array2::from_shape_fn((count, self.info.columns()), |(row, column)| {
            function(start + row as u64, column)
        });
        self.position += count as u64;
        Ok(block)
    }
}
