//! Audio output sinks
//!
//! The engine writes interleaved 16-bit stereo PCM and paces itself off
//! the sink's free space, so a sink only needs to expose a byte window:
//! `bytes_free`, `write`, and the effective buffer size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use stomp_core::{PlayerError, Result};
use tracing::{error, info};

/// Bytes per stereo frame (2 channels × 16-bit)
pub const BYTES_PER_FRAME: usize = 4;

/// Fixed engine output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 44.1 kHz stereo signed 16-bit little-endian PCM
    pub const ENGINE: AudioFormat = AudioFormat {
        sample_rate: 44100,
        channels: 2,
        bits_per_sample: 16,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Active,
    Stopped,
}

/// Output sink contract. Implementations are owned by the audio loop
/// thread and never cross threads themselves.
pub trait AudioSink {
    /// Free space in bytes the next `write` is guaranteed to accept
    fn bytes_free(&self) -> usize;
    /// Write PCM bytes, returning how many were accepted
    fn write(&mut self, bytes: &[u8]) -> usize;
    fn state(&self) -> SinkState;
    fn stop(&mut self);
    /// Effective buffer capacity in bytes
    fn buffer_size(&self) -> usize;
}

/// Real output device sink. A bounded frame ring sits between the engine
/// and the cpal callback; the callback drains the ring and zero-fills on
/// underrun, so the engine side never blocks on the device.
pub struct CpalSink {
    frames: Sender<(i16, i16)>,
    capacity_frames: usize,
    stopped: Arc<AtomicBool>,
    _stream: cpal::Stream,
}

impl CpalSink {
    /// Open the default output device in the engine format with a ring of
    /// `buffer_bytes`.
    pub fn open(format: &AudioFormat, buffer_bytes: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PlayerError::DeviceUnavailable("no audio output devices found".into())
        })?;

        let config = device
            .supported_output_configs()
            .map_err(|e| PlayerError::DeviceUnavailable(format!("query output configs: {e}")))?
            .find(|c| {
                c.channels() == format.channels
                    && c.sample_format() == cpal::SampleFormat::I16
                    && c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
            })
            .ok_or_else(|| {
                PlayerError::DeviceUnavailable(format!(
                    "device does not support {}/{}ch/{}-bit",
                    format.sample_rate, format.channels, format.bits_per_sample
                ))
            })?
            .with_sample_rate(cpal::SampleRate(format.sample_rate));

        let capacity_frames = (buffer_bytes / BYTES_PER_FRAME).max(1);
        let (tx, rx): (Sender<(i16, i16)>, Receiver<(i16, i16)>) = bounded(capacity_frames);

        let stopped = Arc::new(AtomicBool::new(false));
        let callback_stopped = Arc::clone(&stopped);

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(2) {
                        let (l, r) = if callback_stopped.load(Ordering::Relaxed) {
                            (0, 0)
                        } else {
                            rx.try_recv().unwrap_or((0, 0))
                        };
                        frame[0] = l;
                        if let Some(s) = frame.get_mut(1) {
                            *s = r;
                        }
                    }
                },
                move |err| error!("output stream error: {err}"),
                None,
            )
            .map_err(|e| PlayerError::DeviceUnavailable(format!("build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| PlayerError::DeviceUnavailable(format!("start output stream: {e}")))?;

        info!(
            device = %device.name().unwrap_or_default(),
            buffer_bytes = capacity_frames * BYTES_PER_FRAME,
            "opened output sink"
        );

        Ok(Self {
            frames: tx,
            capacity_frames,
            stopped,
            _stream: stream,
        })
    }
}

impl AudioSink for CpalSink {
    fn bytes_free(&self) -> usize {
        (self.capacity_frames - self.frames.len()) * BYTES_PER_FRAME
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut written = 0;
        for frame in bytes.chunks_exact(BYTES_PER_FRAME) {
            let l = i16::from_le_bytes([frame[0], frame[1]]);
            let r = i16::from_le_bytes([frame[2], frame[3]]);
            match self.frames.try_send((l, r)) {
                Ok(()) => written += BYTES_PER_FRAME,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => break,
            }
        }
        written
    }

    fn state(&self) -> SinkState {
        if self.stopped.load(Ordering::Relaxed) {
            SinkState::Stopped
        } else {
            SinkState::Active
        }
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn buffer_size(&self) -> usize {
        self.capacity_frames * BYTES_PER_FRAME
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Offline sink capturing everything written to it. Its window is always
/// reported free, so the engine renders as fast as it can produce; used
/// for offline rendering and tests.
pub struct BufferSink {
    captured: Arc<Mutex<Vec<u8>>>,
    window_bytes: usize,
    state: SinkState,
}

impl BufferSink {
    pub fn new(window_bytes: usize) -> Self {
        Self::with_buffer(Arc::new(Mutex::new(Vec::new())), window_bytes)
    }

    /// Capture into a shared buffer the caller keeps a handle to.
    pub fn with_buffer(captured: Arc<Mutex<Vec<u8>>>, window_bytes: usize) -> Self {
        Self {
            captured,
            window_bytes,
            state: SinkState::Active,
        }
    }

    pub fn captured(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.captured)
    }
}

impl AudioSink for BufferSink {
    fn bytes_free(&self) -> usize {
        self.window_bytes
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Ok(mut captured) = self.captured.lock() else {
            return 0;
        };
        captured.extend_from_slice(bytes);
        bytes.len()
    }

    fn state(&self) -> SinkState {
        self.state
    }

    fn stop(&mut self) {
        self.state = SinkState::Stopped;
    }

    fn buffer_size(&self) -> usize {
        self.window_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_captures_written_bytes() {
        let mut sink = BufferSink::new(1024);
        assert_eq!(sink.bytes_free(), 1024);
        assert_eq!(sink.write(&[1, 2, 3, 4]), 4);
        assert_eq!(sink.write(&[5, 6, 7, 8]), 4);
        assert_eq!(*sink.captured().lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // window stays open; the offline sink drains instantly
        assert_eq!(sink.bytes_free(), 1024);
    }

    #[test]
    fn buffer_sink_stop_changes_state() {
        let mut sink = BufferSink::new(64);
        assert_eq!(sink.state(), SinkState::Active);
        sink.stop();
        assert_eq!(sink.state(), SinkState::Stopped);
    }
}
