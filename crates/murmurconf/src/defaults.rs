//! Source defaults - seed the capture source the daemon creates at startup.

use serde::{Deserialize, Serialize};

/// Defaults for a capture source created without explicit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefaults {
    /// Requested source name. The name registry may append `.N` on collision.
    #[serde(default = "SourceDefaults::default_name")]
    pub name: String,

    #[serde(default = "SourceDefaults::default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "SourceDefaults::default_channels")]
    pub channels: u8,

    /// Sample format name: u8, s16le, s16be, s32le, float32le, float32be
    #[serde(default = "SourceDefaults::default_format")]
    pub format: String,
}

impl SourceDefaults {
    fn default_name() -> String {
        "murmur.capture".to_string()
    }

    fn default_sample_rate() -> u32 {
        44100
    }

    fn default_channels() -> u8 {
        2
    }

    fn default_format() -> String {
        "s16le".to_string()
    }
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            sample_rate: Self::default_sample_rate(),
            channels: Self::default_channels(),
            format: Self::default_format(),
        }
    }
}
