//! Sample specs, channel maps and per-channel volumes.
//!
//! Only the pieces a source needs on its data path: validation, silence and
//! linear software volume. No resampling or format conversion.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of channels in a sample spec or channel map.
pub const CHANNELS_MAX: usize = 32;

/// Highest accepted sample rate.
pub const RATE_MAX: u32 = 384_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16Le,
    S16Be,
    S32Le,
    #[serde(rename = "float32le")]
    F32Le,
    #[serde(rename = "float32be")]
    F32Be,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S32Le | SampleFormat::F32Le | SampleFormat::F32Be => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::S32Le => "s32le",
            SampleFormat::F32Le => "float32le",
            SampleFormat::F32Be => "float32be",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFormat(pub String);

impl fmt::Display for UnknownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sample format '{}'", self.0)
    }
}

impl std::error::Error for UnknownFormat {}

impl FromStr for SampleFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" => Ok(SampleFormat::U8),
            "s16le" | "s16" => Ok(SampleFormat::S16Le),
            "s16be" => Ok(SampleFormat::S16Be),
            "s32le" | "s32" => Ok(SampleFormat::S32Le),
            "float32le" | "f32le" | "float32" => Ok(SampleFormat::F32Le),
            "float32be" | "f32be" => Ok(SampleFormat::F32Be),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// Format, rate and channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= RATE_MAX
            && self.channels > 0
            && self.channels as usize <= CHANNELS_MAX
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Playback time of `bytes` worth of whole frames.
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let frame = self.frame_size();
        if frame == 0 || self.rate == 0 {
            return Duration::ZERO;
        }
        let frames = (bytes / frame) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / self.rate as u64)
    }

    /// Byte length of `duration`, rounded down to whole frames.
    pub fn duration_to_bytes(&self, duration: Duration) -> usize {
        let frames = duration.as_nanos() * self.rate as u128 / 1_000_000_000;
        frames as usize * self.frame_size()
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearLeft,
    RearRight,
    RearCenter,
    Lfe,
    SideLeft,
    SideRight,
    Aux(u8),
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPosition::Mono => f.write_str("mono"),
            ChannelPosition::FrontLeft => f.write_str("front-left"),
            ChannelPosition::FrontRight => f.write_str("front-right"),
            ChannelPosition::FrontCenter => f.write_str("front-center"),
            ChannelPosition::RearLeft => f.write_str("rear-left"),
            ChannelPosition::RearRight => f.write_str("rear-right"),
            ChannelPosition::RearCenter => f.write_str("rear-center"),
            ChannelPosition::Lfe => f.write_str("lfe"),
            ChannelPosition::SideLeft => f.write_str("side-left"),
            ChannelPosition::SideRight => f.write_str("side-right"),
            ChannelPosition::Aux(n) => write!(f, "aux{}", n),
        }
    }
}

/// Channel positions for each channel of a stream. Fixed capacity, `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    channels: u8,
    positions: [ChannelPosition; CHANNELS_MAX],
}

impl ChannelMap {
    /// Build from explicit positions. `None` if empty or longer than
    /// [`CHANNELS_MAX`].
    pub fn new(positions: &[ChannelPosition]) -> Option<Self> {
        if positions.is_empty() || positions.len() > CHANNELS_MAX {
            return None;
        }
        let mut map = Self {
            channels: positions.len() as u8,
            positions: [ChannelPosition::Mono; CHANNELS_MAX],
        };
        map.positions[..positions.len()].copy_from_slice(positions);
        Some(map)
    }

    /// Default layout for a channel count: mono, stereo, 2.1, quad, 5.0,
    /// 5.1, 6.1, 7.1, then auxiliary channels past eight.
    pub fn auto(channels: u8) -> Option<Self> {
        use ChannelPosition::*;

        let base: &[ChannelPosition] = match channels {
            0 => return None,
            1 => &[Mono],
            2 => &[FrontLeft, FrontRight],
            3 => &[FrontLeft, FrontRight, Lfe],
            4 => &[FrontLeft, FrontRight, RearLeft, RearRight],
            5 => &[FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter],
            6 => &[FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe],
            7 => &[
                FrontLeft,
                FrontRight,
                RearLeft,
                RearRight,
                FrontCenter,
                Lfe,
                RearCenter,
            ],
            _ => &[
                FrontLeft,
                FrontRight,
                RearLeft,
                RearRight,
                FrontCenter,
                Lfe,
                SideLeft,
                SideRight,
            ],
        };

        if channels as usize > CHANNELS_MAX {
            return None;
        }

        let mut positions = [Mono; CHANNELS_MAX];
        positions[..base.len()].copy_from_slice(base);
        for (aux, slot) in positions[base.len()..channels as usize].iter_mut().enumerate() {
            *slot = Aux(aux as u8);
        }

        Some(Self {
            channels,
            positions,
        })
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions[..self.channels as usize]
    }

    /// Non-empty, within bounds, and mono only as the sole channel.
    pub fn is_valid(&self) -> bool {
        if self.channels == 0 || self.channels as usize > CHANNELS_MAX {
            return false;
        }
        let positions = self.positions();
        positions.len() == 1 || !positions.contains(&ChannelPosition::Mono)
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pos) in self.positions().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", pos)?;
        }
        Ok(())
    }
}

/// Linear software volume. `NORM` is unity gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Volume(pub u32);

impl Volume {
    pub const MUTED: Volume = Volume(0);
    pub const NORM: Volume = Volume(0x10000);

    pub fn is_muted(self) -> bool {
        self == Volume::MUTED
    }
}

/// One volume per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelVolume {
    channels: u8,
    values: [Volume; CHANNELS_MAX],
}

impl ChannelVolume {
    /// Every channel set to `volume`.
    ///
    /// # Panics
    ///
    /// If `channels` is zero or above [`CHANNELS_MAX`].
    pub fn uniform(channels: u8, volume: Volume) -> Self {
        assert!(
            channels > 0 && channels as usize <= CHANNELS_MAX,
            "invalid channel count {}",
            channels
        );
        let mut values = [Volume::MUTED; CHANNELS_MAX];
        values[..channels as usize].fill(volume);
        Self { channels, values }
    }

    /// Unity gain on every channel.
    pub fn norm(channels: u8) -> Self {
        Self::uniform(channels, Volume::NORM)
    }

    pub fn from_values(values: &[Volume]) -> Option<Self> {
        if values.is_empty() || values.len() > CHANNELS_MAX {
            return None;
        }
        let mut cv = Self::uniform(values.len() as u8, Volume::MUTED);
        cv.values[..values.len()].copy_from_slice(values);
        Some(cv)
    }

    pub fn reset(&mut self, channels: u8) {
        *self = Self::norm(channels);
    }

    pub fn set(&mut self, channels: u8, volume: Volume) {
        *self = Self::uniform(channels, volume);
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn values(&self) -> &[Volume] {
        &self.values[..self.channels as usize]
    }

    pub fn is_norm(&self) -> bool {
        self.values().iter().all(|&v| v == Volume::NORM)
    }

    pub fn is_muted(&self) -> bool {
        self.values().iter().all(|v| v.is_muted())
    }
}

/// Overwrite `buf` with the format's silence value.
pub fn silence(buf: &mut [u8], format: SampleFormat) {
    let value = match format {
        SampleFormat::U8 => 0x80,
        _ => 0,
    };
    buf.fill(value);
}

/// Scale interleaved samples in place, channel `i % channels` by `volume[i]`.
/// Integer formats saturate. A trailing partial sample is left untouched.
pub fn scale(buf: &mut [u8], spec: &SampleSpec, volume: &ChannelVolume) {
    debug_assert_eq!(volume.channels(), spec.channels);

    let width = spec.format.bytes_per_sample();
    let factors = volume.values();
    let channels = factors.len();

    for (i, sample) in buf.chunks_exact_mut(width).enumerate() {
        let v = factors[i % channels].0 as i64;
        match spec.format {
            SampleFormat::U8 => {
                let s = sample[0] as i64 - 0x80;
                sample[0] = (((s * v) >> 16).clamp(-128, 127) + 0x80) as u8;
            }
            SampleFormat::S16Le => {
                let s = i16::from_le_bytes([sample[0], sample[1]]) as i64;
                let out = ((s * v) >> 16).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                sample.copy_from_slice(&out.to_le_bytes());
            }
            SampleFormat::S16Be => {
                let s = i16::from_be_bytes([sample[0], sample[1]]) as i64;
                let out = ((s * v) >> 16).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                sample.copy_from_slice(&out.to_be_bytes());
            }
            SampleFormat::S32Le => {
                let s = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]) as i64;
                let out = ((s * v) >> 16).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                sample.copy_from_slice(&out.to_le_bytes());
            }
            SampleFormat::F32Le => {
                let s = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let out = s * (v as f32 / Volume::NORM.0 as f32);
                sample.copy_from_slice(&out.to_le_bytes());
            }
            SampleFormat::F32Be => {
                let s = f32::from_be_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let out = s * (v as f32 / Volume::NORM.0 as f32);
                sample.copy_from_slice(&out.to_be_bytes());
            }
        }
    }
}
