//! Rolling audio buffer for turn classification.
//!
//! Keeps the most recent N seconds of raw PCM as fixed-size frames.
//! Pushes are non-blocking; once the buffer is full the oldest frames
//! are dropped. Reads address the stream by session-relative time,
//! derived from the total number of frames ever pushed.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

struct RingState {
    frames: VecDeque<Bytes>,
    /// Bytes accumulated until a full frame is available.
    pending: BytesMut,
    /// Frames pushed over the buffer's lifetime, dropped ones included.
    total_frames: u64,
}

/// Ring buffer of PCM frames with time-addressed slicing.
pub struct AudioRingBuffer {
    sample_rate: u32,
    sample_width: usize,
    /// Samples per frame.
    frame_size: usize,
    frame_bytes: usize,
    max_frames: usize,
    state: Mutex<RingState>,
}

impl AudioRingBuffer {
    /// `total_seconds` bounds how much trailing audio is retained.
    pub fn new(sample_rate: u32, sample_width: usize, frame_size: usize, total_seconds: f64) -> Self {
        let frames_per_second = sample_rate as f64 / frame_size as f64;
        let max_frames = (total_seconds * frames_per_second).ceil().max(1.0) as usize;
        Self {
            sample_rate,
            sample_width,
            frame_size,
            frame_bytes: frame_size * sample_width,
            max_frames,
            state: Mutex::new(RingState {
                frames: VecDeque::with_capacity(max_frames),
                pending: BytesMut::new(),
                total_frames: 0,
            }),
        }
    }

    fn frame_index_at(&self, time: f64) -> u64 {
        // Small epsilon so 0.1s at a 0.02s frame length lands on frame 5.
        (time * (self.sample_rate as f64 / self.frame_size as f64) + 1e-9) as u64
    }

    fn time_at_frame(&self, frame_index: u64) -> f64 {
        frame_index as f64 * self.frame_size as f64 / self.sample_rate as f64
    }

    /// Append arbitrary-length audio. Data accumulates until a full
    /// frame is available; full frames rotate into the ring.
    pub fn push_bytes(&self, data: &[u8]) {
        let mut state = self.state.lock();

        if state.pending.is_empty() && data.len() == self.frame_bytes {
            Self::push_frame_locked(&mut state, Bytes::copy_from_slice(data), self.max_frames);
            return;
        }

        state.pending.extend_from_slice(data);
        while state.pending.len() >= self.frame_bytes {
            let frame = state.pending.split_to(self.frame_bytes).freeze();
            Self::push_frame_locked(&mut state, frame, self.max_frames);
        }
    }

    fn push_frame_locked(state: &mut RingState, frame: Bytes, max_frames: usize) {
        state.frames.push_back(frame);
        state.total_frames += 1;
        while state.frames.len() > max_frames {
            state.frames.pop_front();
        }
    }

    /// Copy out the audio between two session-relative times. Ranges are
    /// clamped to what the ring still holds; a fully-evicted or
    /// not-yet-written range yields an empty buffer.
    pub fn slice(&self, start_time: f64, end_time: f64) -> Vec<u8> {
        let state = self.state.lock();

        let start_index = self.frame_index_at(start_time.max(0.0));
        let end_index = self.frame_index_at(end_time.max(0.0));

        let buffer_start = state.total_frames - state.frames.len() as u64;
        let buffer_end = state.total_frames;

        if end_index <= buffer_start || start_index >= buffer_end || start_index >= end_index {
            return Vec::new();
        }

        let clamped_start = (start_index.max(buffer_start) - buffer_start) as usize;
        let clamped_end = (end_index.min(buffer_end) - buffer_start) as usize;

        let mut out = Vec::with_capacity((clamped_end - clamped_start) * self.frame_bytes);
        for frame in state.frames.iter().skip(clamped_start).take(clamped_end - clamped_start) {
            out.extend_from_slice(frame);
        }
        out
    }

    /// Decode a byte slice from [`slice`](Self::slice) as i16 samples.
    pub fn as_i16_samples(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Total seconds of audio ever pushed (including evicted frames).
    pub fn total_time(&self) -> f64 {
        let state = self.state.lock();
        self.time_at_frame(state.total_frames)
    }

    /// Drop all retained frames. Timing continues from the same origin.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.frames.clear();
        state.pending.clear();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_width(&self) -> usize {
        self.sample_width
    }
}
