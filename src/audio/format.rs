//! PCM formats and conversion to/from the canonical voice format
//!
//! Capture devices and output devices speak whatever format they like.
//! Everything between the capture callback and the playback sink is
//! canonical: 48 kHz, mono, interleaved i16. [`FormatConverter`] bridges the
//! two with a pull-style `convert(source) -> destination` call.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use cpal::{Sample, SampleFormat};
use rubato::{Fft, FixedSync, Resampler};
use std::time::Duration;

use crate::audio::buffer::AudioFrame;
use crate::constants::{CHANNELS, SAMPLE_RATE};
use crate::error::AudioError;

/// Description of a PCM stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    sample_rate: u32,
    channels: u16,
    sample_format: SampleFormat,
    interleaved: bool,
}

impl PcmFormat {
    /// Build a format, rejecting anything the converter cannot represent
    pub fn new(
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
        interleaved: bool,
    ) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::FormatCreation("sample rate must be non-zero".into()));
        }
        if channels == 0 {
            return Err(AudioError::FormatCreation("channel count must be non-zero".into()));
        }
        if !Self::is_supported(sample_format) {
            return Err(AudioError::FormatCreation(format!(
                "unsupported sample representation: {:?}",
                sample_format
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            sample_format,
            interleaved,
        })
    }

    /// 48 kHz, mono, i16, interleaved
    pub fn canonical() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            sample_format: SampleFormat::I16,
            interleaved: true,
        }
    }

    /// Sample representations with a [`SampleData`] variant
    pub fn is_supported(sample_format: SampleFormat) -> bool {
        matches!(
            sample_format,
            SampleFormat::I16 | SampleFormat::U16 | SampleFormat::I32 | SampleFormat::F32
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    pub fn is_canonical(&self) -> bool {
        *self == Self::canonical()
    }
}

/// Typed sample storage
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl SampleData {
    pub fn len(&self) -> usize {
        match self {
            SampleData::I16(v) => v.len(),
            SampleData::U16(v) => v.len(),
            SampleData::I32(v) => v.len(),
            SampleData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_format(&self) -> SampleFormat {
        match self {
            SampleData::I16(_) => SampleFormat::I16,
            SampleData::U16(_) => SampleFormat::U16,
            SampleData::I32(_) => SampleFormat::I32,
            SampleData::F32(_) => SampleFormat::F32,
        }
    }

    /// Normalize to f32 in [-1.0, 1.0]
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            SampleData::I16(v) => v.iter().map(|&s| f32::from_sample(s)).collect(),
            SampleData::U16(v) => v.iter().map(|&s| f32::from_sample(s)).collect(),
            SampleData::I32(v) => v.iter().map(|&s| f32::from_sample(s)).collect(),
            SampleData::F32(v) => v.clone(),
        }
    }

    /// Quantize normalized f32 samples into the given representation
    pub fn from_f32(sample_format: SampleFormat, samples: &[f32]) -> Result<Self, AudioError> {
        let clamped = samples.iter().map(|s| s.clamp(-1.0, 1.0));
        match sample_format {
            SampleFormat::I16 => Ok(SampleData::I16(clamped.map(i16::from_sample).collect())),
            SampleFormat::U16 => Ok(SampleData::U16(clamped.map(u16::from_sample).collect())),
            SampleFormat::I32 => Ok(SampleData::I32(clamped.map(i32::from_sample).collect())),
            SampleFormat::F32 => Ok(SampleData::F32(clamped.collect())),
            other => Err(AudioError::Conversion(format!(
                "unsupported sample representation: {:?}",
                other
            ))),
        }
    }
}

/// A block of PCM in an arbitrary format
#[derive(Clone, Debug, PartialEq)]
pub struct PcmBuffer {
    format: PcmFormat,
    data: SampleData,
}

impl PcmBuffer {
    pub fn new(format: PcmFormat, data: SampleData) -> Self {
        Self { format, data }
    }

    /// Canonical buffer wrapping a codec frame
    pub fn from_frame(frame: AudioFrame) -> Self {
        Self {
            format: PcmFormat::canonical(),
            data: SampleData::I16(frame.into_samples()),
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    /// Borrow the samples when they are i16
    pub fn as_i16(&self) -> Option<&[i16]> {
        match &self.data {
            SampleData::I16(v) => Some(v),
            _ => None,
        }
    }

    /// Frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.data.len() / self.format.channels as usize
    }

    pub fn duration(&self) -> Duration {
        let nanos = self.frame_count() as u64 * 1_000_000_000 / u64::from(self.format.sample_rate);
        Duration::from_nanos(nanos)
    }

    /// Check that the data actually matches the declared format
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.data.sample_format() != self.format.sample_format {
            return Err(AudioError::Conversion(format!(
                "buffer holds {:?} samples but declares {:?}",
                self.data.sample_format(),
                self.format.sample_format
            )));
        }
        if self.data.len() % self.format.channels as usize != 0 {
            return Err(AudioError::Conversion(format!(
                "{} samples is not a whole number of {}-channel frames",
                self.data.len(),
                self.format.channels
            )));
        }
        Ok(())
    }
}

/// Resampler chunk on the fixed side: 10 ms at the destination rate
const RESAMPLE_CHUNK_MS: usize = 10;

/// Sub-chunks for the FFT resampler (1 keeps latency lowest)
const RESAMPLER_SUB_CHUNKS: usize = 1;

/// Stateful FFT resampler over all working channels
///
/// Input that does not fill a whole chunk is held until the next call, so
/// consecutive deliveries are resampled as one continuous stream. Output
/// therefore arrives in whole chunks of `destination_rate / 100` frames.
struct RateConverter {
    resampler: Fft<f32>,
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    pending: Vec<Vec<f32>>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
}

impl RateConverter {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self, AudioError> {
        let chunk = (to_rate as usize * RESAMPLE_CHUNK_MS / 1000).max(1);
        let resampler = Fft::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            chunk,
            RESAMPLER_SUB_CHUNKS,
            channels,
            FixedSync::Output,
        )
        .map_err(|e| {
            AudioError::FormatCreation(format!(
                "cannot resample {} Hz -> {} Hz: {}",
                from_rate, to_rate, e
            ))
        })?;

        let input_frames_max = resampler.input_frames_max();
        let output_frames_max = resampler.output_frames_max();

        Ok(Self {
            resampler,
            from_rate,
            to_rate,
            channels,
            pending: vec![Vec::new(); channels],
            work_in: vec![vec![0.0; input_frames_max]; channels],
            work_out: vec![vec![0.0; output_frames_max]; channels],
        })
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        *self = Self::new(self.from_rate, self.to_rate, self.channels)?;
        Ok(())
    }

    /// Feed one plane per channel; returns every complete chunk now available
    fn process(&mut self, planes: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, AudioError> {
        for (pending, plane) in self.pending.iter_mut().zip(planes) {
            pending.extend(plane);
        }

        let mut output = vec![Vec::new(); self.channels];
        while self.pending[0].len() >= self.resampler.input_frames_next() {
            let frames_needed = self.resampler.input_frames_next();
            for (work, pending) in self.work_in.iter_mut().zip(self.pending.iter_mut()) {
                work[..frames_needed].copy_from_slice(&pending[..frames_needed]);
                pending.drain(..frames_needed);
            }

            let input_adapter =
                SequentialSliceOfVecs::new(&self.work_in[..], self.channels, frames_needed)
                    .map_err(|e| AudioError::Conversion(format!("resampler input: {}", e)))?;
            let output_frames = self.resampler.output_frames_next();
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut self.work_out[..], self.channels, output_frames)
                    .map_err(|e| AudioError::Conversion(format!("resampler output: {}", e)))?;

            let (_, frames_written) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| AudioError::Conversion(format!("resampling failed: {}", e)))?;

            for (out, work) in output.iter_mut().zip(&self.work_out) {
                out.extend_from_slice(&work[..frames_written]);
            }
        }
        Ok(output)
    }
}

/// Converts PCM from one format to another
///
/// Channel policy: equal counts pass through; otherwise the source is
/// averaged down to mono and, if the destination has more than one
/// channel, the mono signal is duplicated.
pub struct FormatConverter {
    source: PcmFormat,
    destination: PcmFormat,
    /// `None` when both sides share a sample rate
    resampler: Option<RateConverter>,
    working_channels: usize,
}

impl FormatConverter {
    pub fn new(source: PcmFormat, destination: PcmFormat) -> Result<Self, AudioError> {
        let working_channels = if source.channels == destination.channels {
            source.channels as usize
        } else {
            1
        };
        let resampler = if source.sample_rate == destination.sample_rate {
            None
        } else {
            Some(RateConverter::new(
                source.sample_rate,
                destination.sample_rate,
                working_channels,
            )?)
        };

        Ok(Self {
            source,
            destination,
            resampler,
            working_channels,
        })
    }

    /// Converter from a device format to the canonical format
    pub fn to_canonical(source: PcmFormat) -> Result<Self, AudioError> {
        Self::new(source, PcmFormat::canonical())
    }

    /// Converter from the canonical format to a device format
    pub fn from_canonical(destination: PcmFormat) -> Result<Self, AudioError> {
        Self::new(PcmFormat::canonical(), destination)
    }

    pub fn needs_conversion(source: &PcmFormat, destination: &PcmFormat) -> bool {
        source != destination
    }

    /// Forget buffered input and filter history (use after a discontinuity)
    pub fn reset(&mut self) -> Result<(), AudioError> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.reset(),
            None => Ok(()),
        }
    }

    /// Convert one buffer; fails if the buffer does not match the source format
    pub fn convert(&mut self, buffer: &PcmBuffer) -> Result<PcmBuffer, AudioError> {
        if buffer.format != self.source {
            return Err(AudioError::Conversion(format!(
                "buffer format {:?} does not match converter source {:?}",
                buffer.format, self.source
            )));
        }
        buffer.validate()?;

        let planes = split_channels(&buffer.data, self.source.channels as usize, self.source.interleaved);
        let working = if planes.len() == self.working_channels {
            planes
        } else {
            vec![downmix(&planes)]
        };

        let resampled = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(working)?,
            None => working,
        };

        let destination_channels = self.destination.channels as usize;
        let output_planes = if resampled.len() == destination_channels {
            resampled
        } else {
            // working set is mono here; fan it out
            let mono = resampled.into_iter().next().unwrap_or_default();
            vec![mono; destination_channels]
        };

        let flat = join_channels(&output_planes, self.destination.interleaved);
        let data = SampleData::from_f32(self.destination.sample_format, &flat)?;
        Ok(PcmBuffer::new(self.destination, data))
    }
}

fn split_channels(data: &SampleData, channels: usize, interleaved: bool) -> Vec<Vec<f32>> {
    let flat = data.to_f32();
    let frames = flat.len() / channels;
    (0..channels)
        .map(|c| {
            (0..frames)
                .map(|i| {
                    if interleaved {
                        flat[i * channels + c]
                    } else {
                        flat[c * frames + i]
                    }
                })
                .collect()
        })
        .collect()
}

fn downmix(planes: &[Vec<f32>]) -> Vec<f32> {
    let frames = planes.first().map_or(0, Vec::len);
    let count = planes.len() as f32;
    (0..frames)
        .map(|i| planes.iter().map(|p| p[i]).sum::<f32>() / count)
        .collect()
}

fn join_channels(planes: &[Vec<f32>], interleaved: bool) -> Vec<f32> {
    let frames = planes.first().map_or(0, Vec::len);
    if !interleaved {
        return planes.concat();
    }
    let mut out = Vec::with_capacity(frames * planes.len());
    for i in 0..frames {
        for plane in planes {
            out.push(plane[i]);
        }
    }
    out
}
