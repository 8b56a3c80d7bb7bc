//! PCM block → 25-band magnitude vector.
//!
//! Runs on the audio driver's callback thread, so `process` must not allocate
//! or lock once the block size has settled.  The FFT plan, scratch space and
//! the band→bin mapping are rebuilt only when the block size or sample rate
//! changes.

use std::ops::Range;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use viz_proto::bands::{BandTable, BandVector, BAND_COUNT};

/// Bin ranges per band for one `(block_size, sample_rate)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BinMap {
    block_size: usize,
    sample_rate: u32,
    ranges: [Range<usize>; BAND_COUNT],
}

impl BinMap {
    /// Select, for each band, the bins whose centre `k * rate / n` the band
    /// contains.  Bin centres ascend with k so each selection is one
    /// contiguous range, possibly empty.
    pub fn build(table: &BandTable, block_size: usize, sample_rate: u32) -> Self {
        let bins = spectrum_len(block_size);
        let centre = |k: usize| (k as f64 * sample_rate as f64 / block_size as f64) as f32;

        let ranges = std::array::from_fn(|i| {
            let band = &table.bands()[i];
            let start = (0..bins)
                .find(|&k| band.contains(centre(k)))
                .unwrap_or(bins);
            let end = (start..bins)
                .find(|&k| !band.contains(centre(k)))
                .unwrap_or(bins);
            start..end
        });

        Self {
            block_size,
            sample_rate,
            ranges,
        }
    }

    pub fn matches(&self, block_size: usize, sample_rate: u32) -> bool {
        self.block_size == block_size && self.sample_rate == sample_rate
    }

    /// Bin indices selected by the 1-based band `index`.
    #[cfg(test)]
    pub fn bins_for(&self, index: usize) -> Option<Range<usize>> {
        index
            .checked_sub(1)
            .and_then(|i| self.ranges.get(i))
            .cloned()
    }
}

/// Number of non-redundant bins of a real-input transform of `n` samples.
pub fn spectrum_len(n: usize) -> usize {
    n / 2 + 1
}

pub struct SpectrumBinner {
    table: BandTable,
    sample_rate: u32,
    fft: Option<Arc<dyn Fft<f32>>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    map: Option<BinMap>,
    map_rebuilds: u64,
}

impl SpectrumBinner {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_table(BandTable::standard(), sample_rate)
    }

    pub fn with_table(table: BandTable, sample_rate: u32) -> Self {
        Self {
            table,
            sample_rate,
            fft: None,
            buffer: Vec::new(),
            scratch: Vec::new(),
            magnitudes: Vec::new(),
            map: None,
            map_rebuilds: 0,
        }
    }

    /// Pre-build everything for `block_size` so the first real block does not
    /// pay for planning on the realtime thread.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        if block_size > 0 {
            self.prepare(block_size);
        }
        self
    }

    /// How many times the band→bin mapping has been computed.
    #[cfg(test)]
    pub fn map_rebuilds(&self) -> u64 {
        self.map_rebuilds
    }

    #[cfg(test)]
    pub fn bin_map(&self) -> Option<&BinMap> {
        self.map.as_ref()
    }

    fn prepare(&mut self, n: usize) {
        if self.buffer.len() != n || self.fft.is_none() {
            let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
            self.scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
            self.buffer = vec![Complex::new(0.0, 0.0); n];
            self.magnitudes = vec![0.0; spectrum_len(n)];
            self.fft = Some(fft);
        }

        let stale = match &self.map {
            Some(map) => !map.matches(n, self.sample_rate),
            None => true,
        };
        if stale {
            self.map = Some(BinMap::build(&self.table, n, self.sample_rate));
            self.map_rebuilds += 1;
        }
    }

    /// Reduce one mono block to band magnitudes.
    ///
    /// Each band is the mean magnitude of its selected bins times the band
    /// gain, or exactly 0 when no bin falls inside the band.  An empty block
    /// yields silence.
    pub fn process(&mut self, block: &[f32]) -> BandVector {
        let n = block.len();
        if n == 0 {
            return BandVector::silent();
        }
        self.prepare(n);

        for (dst, &sample) in self.buffer.iter_mut().zip(block) {
            let re = if sample.is_finite() { sample } else { 0.0 };
            *dst = Complex::new(re, 0.0);
        }

        let (Some(fft), Some(map)) = (self.fft.as_ref(), self.map.as_ref()) else {
            return BandVector::silent();
        };
        fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (mag, bin) in self.magnitudes.iter_mut().zip(&self.buffer) {
            *mag = bin.norm();
        }

        let mut out = BandVector::silent();
        for (i, (band, range)) in self.table.iter().zip(map.ranges.iter()).enumerate() {
            if range.is_empty() {
                continue;
            }
            let sum: f32 = self.magnitudes[range.clone()].iter().sum();
            let value = sum / range.len() as f32 * band.gain;
            out.0[i] = if value.is_finite() { value } else { 0.0 };
        }
        out
    }
}
