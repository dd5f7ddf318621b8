//! A small pool mixer. Each source owns a channel, writes interleaved 16-bit
//! frames into it, and one `mix` pass per audio period sums every active
//! channel into the output buffer.
//!
//! Channel buffers use the same frame layout as the output (`num_channels`
//! samples per frame). No resampling or format conversion is done.

use log::{debug, warn};

pub const MAX_MIXER_CHANNELS: usize = 64;
/// Initial channel and output capacity in frames
pub const MIXER_BUFFER_SIZE: usize = 4096;
pub const MIXER_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone)]
pub struct MixerChannel {
    buffer: Vec<i16>,
    read_pos: usize,
    active: bool,
    volume: f32,
    pan: f32,
}

impl Default for MixerChannel {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            read_pos: 0,
            active: false,
            volume: 1.0,
            pan: 0.0,
        }
    }
}

impl MixerChannel {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    /// Samples written but not yet mixed
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Appends samples, doubling the buffer when full. A failed allocation
    /// drops the write.
    fn write(&mut self, data: &[i16]) {
        let needed = self.buffer.len() + data.len();
        if needed > self.buffer.capacity() {
            let grown = (self.buffer.capacity() * 2).max(needed);
            if let Err(e) = self.buffer.try_reserve_exact(grown - self.buffer.len()) {
                warn!("Mixer channel could not grow to {grown} samples: {e}");
                return;
            }
        }
        self.buffer.extend_from_slice(data);
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[derive(Debug, Clone)]
pub struct Mixer {
    channels: Vec<MixerChannel>,
    output: Vec<i16>,
    /// Samples of `output` filled by the last mix
    output_len: usize,
    sample_rate: u32,
    num_channels: usize,
    normalize: bool,
}

impl Mixer {
    /// A zero `sample_rate` or `num_channels` falls back to 44100 Hz stereo.
    /// More than two output channels are treated as stereo.
    pub fn new(sample_rate: u32, num_channels: usize, normalize: bool) -> Self {
        let num_channels = match num_channels {
            0 => 2,
            n => n.min(2),
        };
        Self {
            channels: vec![MixerChannel::default(); MAX_MIXER_CHANNELS],
            output: vec![0; MIXER_BUFFER_SIZE * num_channels],
            output_len: 0,
            sample_rate: if sample_rate > 0 {
                sample_rate
            } else {
                MIXER_SAMPLE_RATE
            },
            num_channels,
            normalize,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }

    pub fn set_normalize(&mut self, normalize: bool) {
        self.normalize = normalize;
    }

    pub fn channel(&self, id: usize) -> Option<&MixerChannel> {
        self.channels.get(id)
    }

    /// Claims the first free channel with volume 1 and centre pan
    pub fn allocate_channel(&mut self) -> Option<usize> {
        let (id, channel) = self
            .channels
            .iter_mut()
            .enumerate()
            .find(|(_, c)| !c.active)?;
        *channel = MixerChannel {
            buffer: Vec::with_capacity(MIXER_BUFFER_SIZE * self.num_channels),
            active: true,
            ..MixerChannel::default()
        };
        Some(id)
    }

    /// Frees the channel and its buffer
    pub fn release_channel(&mut self, id: usize) {
        if let Some(channel) = self.channels.get_mut(id) {
            *channel = MixerChannel::default();
        }
    }

    /// Queues interleaved samples on an active channel. A trailing partial
    /// frame is never played: `mix` discards it when the channel drains.
    pub fn write_channel(&mut self, id: usize, data: &[i16]) {
        if let Some(channel) = self.channels.get_mut(id).filter(|c| c.active) {
            channel.write(data);
        }
    }

    /// Volume is clamped to 0..1, pan to -1..1
    pub fn set_channel_volume(&mut self, id: usize, volume: f32, pan: f32) {
        if let Some(channel) = self.channels.get_mut(id).filter(|c| c.active) {
            channel.volume = volume.clamp(0.0, 1.0);
            channel.pan = pan.clamp(-1.0, 1.0);
        }
    }

    /// Mixes every pending frame of the active channels into the output
    /// buffer and returns the frame count. Drained channels are emptied but
    /// stay allocated.
    pub fn mix(&mut self) -> usize {
        let stride = self.num_channels;
        let frames = self
            .channels
            .iter()
            .filter(|c| c.active)
            .map(|c| c.pending() / stride)
            .max()
            .unwrap_or(0);

        let active = self.channels.iter().filter(|c| c.active).count();
        let needed = frames * stride;
        if self.output.len() < needed {
            self.output.resize(needed, 0);
        }

        for frame in 0..frames {
            let mut left = 0.0f32;
            let mut right = 0.0f32;
            for channel in self.channels.iter_mut().filter(|c| c.active) {
                if channel.pending() < stride {
                    continue;
                }
                let pan_left = (1.0 - channel.pan).min(1.0);
                let pan_right = (1.0 + channel.pan).min(1.0);
                let l = channel.buffer[channel.read_pos] as f32 * channel.volume;
                let r = channel.buffer[channel.read_pos + stride - 1] as f32 * channel.volume;
                left += l * pan_left;
                right += r * pan_right;
                channel.read_pos += stride;
            }

            if self.normalize && active > 0 {
                left /= active as f32;
                right /= active as f32;
            }

            if stride == 2 {
                self.output[frame * 2] = clamp_sample(left);
                self.output[frame * 2 + 1] = clamp_sample(right);
            } else {
                self.output[frame] = clamp_sample((left + right) * 0.5);
            }
        }
        self.output_len = needed;

        let drained = self.channels.iter_mut().enumerate().filter(|(_, c)| c.active);
        for (id, channel) in drained {
            let rest = channel.pending();
            if rest < stride {
                if rest > 0 {
                    debug!("Mixer channel {id}: dropped {rest} sample(s) of a partial frame");
                }
                channel.reset();
            }
        }
        frames
    }

    /// The samples produced by the last `mix`
    pub fn output(&self) -> &[i16] {
        &self.output[..self.output_len]
    }
}

fn clamp_sample(sample: f32) -> i16 {
    sample.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
