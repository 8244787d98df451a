//! mediamon-core: removable media detection and mounting.
//!
//! This library tracks removable media devices (optical drives, USB disks,
//! memory cards), mounts and unmounts them with the system tools, and
//! classifies their content.
//!
//! # Modules
//!
//! - [`media_type`]: Media type bit set, device status and control results
//! - [`extensions`]: File extension to media type registry
//! - [`mount_table`]: Mount table scanning
//! - [`executor`]: External command execution and mount tool selection
//! - [`device`]: The per-device state machine
//! - [`platform`]: Drive and OS specific drivers
//! - [`block`]: Block access over seekable streams
//! - [`udf`]: Read-only UDF directory reader
//! - [`image`]: DVD / Blu-ray image classification
//! - [`config`]: JSON configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediamon_core::{MediaConfig, MediaStatus};
//!
//! let config = MediaConfig::load_default().unwrap();
//! let ctx = Arc::new(config.build_context().unwrap());
//!
//! for mut device in config.build_devices(&ctx) {
//!     device.subscribe(|change| println!("{}: {} -> {}", change.device, change.old, change.new));
//!     if device.check_media() == MediaStatus::NotMounted && device.mount() {
//!         println!("{} holds {}", device.device_path(), device.media_type());
//!     }
//! }
//! ```

pub mod block;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod image;
pub mod media_type;
pub mod mount_table;
pub mod platform;
pub mod udf;

// Re-export commonly used types
pub use config::{DeviceSpec, MediaConfig};
pub use device::{MediaContext, MediaDevice, StatusChange};
pub use error::{Error, Result};
pub use extensions::ExtensionRegistry;
pub use image::{ImageType, inspect_image};
pub use media_type::{MediaError, MediaResult, MediaStatus, MediaType};
pub use platform::{DeviceKind, PlatformFlavor};
