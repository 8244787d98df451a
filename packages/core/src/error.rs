//! Unified error types for the mediamon-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.
//!
//! These errors stay inside the library for the most part: the public
//! device-control operations on [`crate::device::MediaDevice`] log them and
//! report a [`crate::media_type::MediaError`] or a plain `bool` instead.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned a non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Command did not finish in time and was killed.
    #[snafu(display("command '{command}' timed out after {timeout:?}"))]
    CommandTimeout { command: String, timeout: Duration },

    /// The mount table file could not be read.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTableRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A mount lookup was requested for an empty device path.
    #[snafu(display("no device path given for mount lookup"))]
    NoDevicePath,

    /// The device does not appear in the mount table.
    #[snafu(display("no mount of '{device}' found"))]
    NotMounted { device: String },

    /// Failed to open or control the device node.
    #[snafu(display("failed to access device {}", path.display()))]
    DeviceAccess {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A device ioctl failed.
    #[snafu(display("ioctl {request} on {} failed", path.display()))]
    DeviceIoctl {
        path: PathBuf,
        request: &'static str,
        source: nix::Error,
    },

    /// Failed to open an image stream.
    #[snafu(display("unable to open \"{path}\""))]
    StreamOpen {
        path: String,
        source: std::io::Error,
    },

    /// A block read on the image failed.
    #[snafu(display("failed to read {count} block(s) at lba {lba}"))]
    BlockRead {
        lba: u32,
        count: u32,
        source: std::io::Error,
    },

    /// The block input has been closed.
    #[snafu(display("block input is closed"))]
    BlockInputClosed,

    /// The image is not a readable UDF volume.
    #[snafu(display("invalid UDF volume: {message}"))]
    Udf { message: String },

    /// Path does not exist in the UDF volume.
    #[snafu(display("'{path}' not found in UDF volume"))]
    UdfNotFound { path: String },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Unknown media type name in an extension registration.
    #[snafu(display("unknown media type name: {name}"))]
    UnknownMediaType { name: String },

    /// Config directory could not be determined.
    #[snafu(display("could not determine config directory"))]
    ConfigDirNotFound,
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount table read errors.
    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for device node errors.
    fn device_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for block read errors.
    fn block_read_context(self, lba: u32, count: u32) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountTableReadSnafu { path: path.into() })
    }

    fn device_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(DeviceAccessSnafu { path: path.into() })
    }

    fn block_read_context(self, lba: u32, count: u32) -> Result<T> {
        self.context(BlockReadSnafu { lba, count })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}
