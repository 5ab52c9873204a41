/// Double-buffered raw samples. The producer fills `write`; `swap_to_read`
/// copies it wholesale into `read`, which is what the spectrum consumes.
pub struct FrameBuffers {
    channels: usize,
    sample_size: usize,
    write: Vec<f32>,
    read: Vec<f32>,
}

impl FrameBuffers {
    pub fn allocate(channels: usize, sample_size: usize) -> Self {
        Self {
            channels,
            sample_size,
            write: vec![0.0; channels * sample_size],
            read: vec![0.0; channels * sample_size],
        }
    }

    /// Number of interleaved samples one frame must contain.
    pub fn frame_len(&self) -> usize {
        self.channels * self.sample_size
    }

    /// De-interleave one frame into the write buffer.
    /// Returns false and leaves the buffer untouched if `interleaved` has the
    /// wrong length.
    pub fn write_frame(&mut self, interleaved: &[f32]) -> bool {
        if interleaved.len() != self.frame_len() {
            return false;
        }
        for (i, frame) in interleaved.chunks_exact(self.channels).enumerate() {
            for (ch, &sample) in frame.iter().enumerate() {
                self.write[ch * self.sample_size + i] = sample;
            }
        }
        true
    }

    pub fn swap_to_read(&mut self) {
        self.read.copy_from_slice(&self.write);
    }

    pub fn read_channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.sample_size;
        &self.read[start..start + self.sample_size]
    }
}

/// Per-channel band energies. `buf(c)` spans the full sample size; the view
/// exposes only the first `bars` values of each channel.
pub struct BarStore {
    channels: usize,
    stride: usize,
    bars: usize,
    flat: Vec<f32>,
}

impl BarStore {
    pub fn allocate(channels: usize, sample_size: usize, bars: usize) -> Self {
        Self {
            channels,
            stride: sample_size,
            bars: bars.min(sample_size),
            flat: vec![0.0; channels * sample_size],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    #[cfg(test)]
    pub fn buf(&self, channel: usize) -> &[f32] {
        let start = channel * self.stride;
        &self.flat[start..start + self.stride]
    }

    pub fn buf_mut(&mut self, channel: usize) -> &mut [f32] {
        let start = channel * self.stride;
        &mut self.flat[start..start + self.stride]
    }

    pub fn view(&self) -> BarView<'_> {
        BarView {
            flat: &self.flat,
            stride: self.stride,
            bars: self.bars,
            channels: self.channels,
        }
    }
}

/// Borrowed, trimmed view of a [`BarStore`]. Only valid inside the
/// pipeline's lock scope.
#[derive(Clone, Copy)]
pub struct BarView<'a> {
    flat: &'a [f32],
    stride: usize,
    bars: usize,
    channels: usize,
}

impl<'a> BarView<'a> {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bars(&self) -> usize {
        self.bars
    }

    pub fn channel(&self, channel: usize) -> &'a [f32] {
        let start = channel * self.stride;
        &self.flat[start..start + self.bars]
    }

    pub fn get(&self, channel: usize, band: usize) -> Option<f32> {
        if channel >= self.channels || band >= self.bars {
            return None;
        }
        Some(self.flat[channel * self.stride + band])
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [f32]> + 'a {
        let view = *self;
        (0..view.channels).map(move |c| view.channel(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_is_prefix_of_each_channel_buffer() {
        for (sample_size, bars) in [(500, 10), (64, 64), (8, 1), (1024, 33)] {
            let mut store = BarStore::allocate(2, sample_size, bars);
            store.buf_mut(1)[0] = 3.5;
            let view = store.view();
            assert_eq!(view.channels(), 2);
            for c in 0..2 {
                let lane = view.channel(c);
                assert_eq!(lane.len(), bars);
                assert_eq!(lane, &store.buf(c)[..bars]);
                assert_eq!(lane.as_ptr(), store.buf(c).as_ptr());
            }
            assert_eq!(view.get(1, 0), Some(3.5));
        }
    }

    #[test]
    fn view_get_rejects_out_of_range() {
        let store = BarStore::allocate(2, 16, 4);
        let view = store.view();
        assert_eq!(view.get(2, 0), None);
        assert_eq!(view.get(0, 4), None);
        assert_eq!(view.iter().count(), 2);
    }

    #[test]
    fn frame_is_deinterleaved_per_channel() {
        let mut frames = FrameBuffers::allocate(2, 3);
        assert!(frames.write_frame(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]));
        assert_eq!(frames.read_channel(0), &[0.0, 0.0, 0.0]);
        frames.swap_to_read();
        assert_eq!(frames.read_channel(0), &[1.0, 2.0, 3.0]);
        assert_eq!(frames.read_channel(1), &[-1.0, -2.0, -3.0]);
    }

    #[test]
    fn wrong_sized_frame_is_rejected_whole() {
        let mut frames = FrameBuffers::allocate(2, 3);
        assert!(frames.write_frame(&[1.0; 6]));
        assert!(!frames.write_frame(&[9.0; 5]));
        frames.swap_to_read();
        assert_eq!(frames.read_channel(1), &[1.0, 1.0, 1.0]);
    }
}
