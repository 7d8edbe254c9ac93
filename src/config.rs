//! Configuration and adapter options.
//!
//! [`BridgeConfig`] holds process-wide defaults and can be deserialized (all fields
//! optional). The per-call option structs are builder-style and can be seeded
//! from a config with `from_config`.
//!
//! # Example
//!
//! ```
//! use flowbridge::{BridgeConfig, ReadableMode, ToPullOptions};
//!
//! let config = BridgeConfig {
//!     readable_mode: ReadableMode::Bytes,
//!     ..BridgeConfig::default()
//! };
//! let options = ToPullOptions::from_config(&config).as_transform(true);
//! assert_eq!(options.mode, ReadableMode::Bytes);
//! assert!(options.as_transform);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::WriteCallback;
use crate::pull::WritableStream;

/// Default push-stream high water mark in bytes.
pub const DEFAULT_PUSH_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default pull-stream writable high water mark (queued chunks).
pub const DEFAULT_WRITABLE_HIGH_WATER_MARK: usize = 1;

/// Queueing mode of a pull-stream readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadableMode {
    /// Counts queued chunks. High water mark 1.
    #[default]
    Default,
    /// Counts queued bytes. High water mark 0.
    Bytes,
}

impl ReadableMode {
    /// The high water mark a readable in this mode starts with.
    #[must_use]
    pub const fn default_high_water_mark(self) -> usize {
        match self {
            Self::Default => 1,
            Self::Bytes => 0,
        }
    }

    /// Size of one chunk as counted against the high water mark.
    #[must_use]
    pub const fn chunk_size(self, len: usize) -> usize {
        match self {
            Self::Default => 1,
            Self::Bytes => len,
        }
    }
}

impl fmt::Display for ReadableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Bytes => f.write_str("bytes"),
        }
    }
}

/// Bridge-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// High water mark, in bytes, for push streams created by the bridge.
    pub push_high_water_mark: usize,
    /// Mode of pull readables created by the bridge.
    pub readable_mode: ReadableMode,
    /// High water mark of pull writables created by the bridge.
    pub writable_high_water_mark: usize,
    /// Close the pull writer when a push-facing adapter finishes.
    pub close_writable_on_final: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            push_high_water_mark: DEFAULT_PUSH_HIGH_WATER_MARK,
            readable_mode: ReadableMode::Default,
            writable_high_water_mark: DEFAULT_WRITABLE_HIGH_WATER_MARK,
            close_writable_on_final: false,
        }
    }
}

/// Errors loading a [`BridgeConfig`].
#[cfg(feature = "config-file")]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(feature = "config-file")]
impl BridgeConfig {
    /// Parses a config from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Options for push streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    /// Buffered bytes at which `push` and `write` start reporting backpressure.
    pub high_water_mark: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_PUSH_HIGH_WATER_MARK,
        }
    }
}

impl PushOptions {
    /// Sets the high water mark.
    #[must_use]
    pub const fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
}

/// Options for [`to_pull`](crate::to_pull).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToPullOptions {
    /// Queueing mode of the produced readable.
    pub mode: ReadableMode,
    /// High water mark of the produced readable. `None` uses the mode default.
    pub readable_high_water_mark: Option<usize>,
    /// High water mark of the produced writable.
    pub writable_high_water_mark: usize,
    /// Mark a read/write pair as a transform instead of a duplex.
    pub as_transform: bool,
}

impl Default for ToPullOptions {
    fn default() -> Self {
        Self {
            mode: ReadableMode::Default,
            readable_high_water_mark: None,
            writable_high_water_mark: DEFAULT_WRITABLE_HIGH_WATER_MARK,
            as_transform: false,
        }
    }
}

impl ToPullOptions {
    /// Seeds options from bridge defaults.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            mode: config.readable_mode,
            readable_high_water_mark: None,
            writable_high_water_mark: config.writable_high_water_mark,
            as_transform: false,
        }
    }

    /// Selects the readable mode.
    #[must_use]
    pub const fn mode(mut self, mode: ReadableMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for byte mode.
    #[must_use]
    pub const fn bytes(self) -> Self {
        self.mode(ReadableMode::Bytes)
    }

    /// Overrides the readable high water mark.
    #[must_use]
    pub const fn readable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.readable_high_water_mark = Some(high_water_mark);
        self
    }

    /// Overrides the writable high water mark.
    #[must_use]
    pub const fn writable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.writable_high_water_mark = high_water_mark;
        self
    }

    /// Selects transform instead of duplex for read/write pairs.
    #[must_use]
    pub const fn as_transform(mut self, as_transform: bool) -> Self {
        self.as_transform = as_transform;
        self
    }

    /// The readable high water mark after applying the mode default.
    #[must_use]
    pub fn effective_readable_high_water_mark(&self) -> usize {
        self.readable_high_water_mark
            .unwrap_or_else(|| self.mode.default_high_water_mark())
    }
}

/// Replacement write capability for [`to_push`](crate::to_push).
#[derive(Clone)]
pub enum WriteOverride {
    /// Write through a pull writable.
    Stream(WritableStream),
    /// Call a function for every chunk.
    Callback(WriteCallback),
}

impl fmt::Debug for WriteOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Options for [`to_push`](crate::to_push).
#[derive(Debug, Clone, Default)]
pub struct ToPushOptions {
    /// Write capability used when the input has none of its own.
    pub write: Option<WriteOverride>,
    /// Produce a transform instead of a duplex when both sides exist.
    pub as_transform: bool,
    /// Options for the produced push stream.
    pub push: PushOptions,
    /// Close the pull writer from the push stream's final hook.
    pub close_writable_on_final: bool,
}

impl ToPushOptions {
    /// Seeds options from bridge defaults.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            write: None,
            as_transform: false,
            push: PushOptions::default().high_water_mark(config.push_high_water_mark),
            close_writable_on_final: config.close_writable_on_final,
        }
    }

    /// Sets the write override.
    #[must_use]
    pub fn write(mut self, write: WriteOverride) -> Self {
        self.write = Some(write);
        self
    }

    /// Writes through `stream` when the input carries no writable.
    #[must_use]
    pub fn write_stream(self, stream: WritableStream) -> Self {
        self.write(WriteOverride::Stream(stream))
    }

    /// Sends every written chunk to `callback`.
    #[must_use]
    pub fn write_callback(self, callback: WriteCallback) -> Self {
        self.write(WriteOverride::Callback(callback))
    }

    /// Selects transform instead of duplex.
    #[must_use]
    pub const fn as_transform(mut self, as_transform: bool) -> Self {
        self.as_transform = as_transform;
        self
    }

    /// Sets push stream options.
    #[must_use]
    pub const fn push(mut self, push: PushOptions) -> Self {
        self.push = push;
        self
    }

    /// Closes the pull writer when the push stream finishes.
    #[must_use]
    pub const fn close_writable_on_final(mut self, close: bool) -> Self {
        self.close_writable_on_final = close;
        self
    }
}
