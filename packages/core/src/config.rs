//! Monitor configuration.
//!
//! Stored as JSON under the user config directory. Every field is optional;
//! a missing file yields the defaults for the build target.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::device::{MediaContext, MediaDevice, default_mount_source};
use crate::error::{ConfigParseSnafu, Error, IoResultExt, Result};
use crate::executor::MountTools;
use crate::extensions::ExtensionRegistry;
use crate::media_type::MediaType;
use crate::mount_table::MountTableSource;
use crate::platform::{DeviceKind, PlatformFlavor};

/// Directory name below the user config directory.
pub const CONFIG_DIR_NAME: &str = "mediamon";
/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// A device to monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub path: String,
    #[serde(default)]
    pub kind: DeviceKind,
    /// The OS mounts and unmounts this device on its own.
    #[serde(default)]
    pub supermount: bool,
    #[serde(default = "default_allow_eject")]
    pub allow_eject: bool,
}

fn default_allow_eject() -> bool {
    true
}

impl DeviceSpec {
    pub fn new(path: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            path: path.into(),
            kind,
            supermount: false,
            allow_eject: default_allow_eject(),
        }
    }
}

/// Extra extensions for one media type, e.g. `{"media_type": "video",
/// "extensions": "mpv,vro"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRegistration {
    pub media_type: String,
    pub extensions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Mount table file. When unset, `/proc/mounts` is read, or `mount`
    /// output on platforms without it.
    pub mounts_file: Option<PathBuf>,
    pub mount_tools: MountTools,
    pub flavor: PlatformFlavor,
    pub devices: Vec<DeviceSpec>,
    /// Registered after the default extension tables.
    pub extensions: Vec<ExtensionRegistration>,
}

impl MediaConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or(Error::ConfigDirNotFound)?;
        Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        serde_json::from_str(&content).context(ConfigParseSnafu { path })
    }

    /// Loads the config at the default location, or defaults if there is none.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = Some(path.into());
        self
    }

    pub fn with_flavor(mut self, flavor: PlatformFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_mount_tools(mut self, tools: MountTools) -> Self {
        self.mount_tools = tools;
        self
    }

    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        self.devices.push(device);
        self
    }

    pub fn mount_table_source(&self) -> MountTableSource {
        match &self.mounts_file {
            Some(path) => MountTableSource::File { path: path.clone() },
            None => default_mount_source(self.flavor, &self.mount_tools),
        }
    }

    /// Default extension tables plus the configured registrations.
    pub fn build_registry(&self) -> Result<ExtensionRegistry> {
        let mut registry = ExtensionRegistry::with_defaults();
        for extra in &self.extensions {
            let media_type = MediaType::from_name(&extra.media_type)?;
            registry.register(media_type, &extra.extensions);
        }
        Ok(registry)
    }

    /// Shared context for the devices of this config, using system commands.
    pub fn build_context(&self) -> Result<MediaContext> {
        Ok(MediaContext::new(self.build_registry()?)
            .with_tools(self.mount_tools.clone())
            .with_mount_source(self.mount_table_source())
            .with_flavor(self.flavor))
    }

    /// Creates a device for every configured entry.
    pub fn build_devices(&self, ctx: &Arc<MediaContext>) -> Vec<MediaDevice> {
        self.devices
            .iter()
            .map(|spec| {
                MediaDevice::with_kind(
                    Arc::clone(ctx),
                    spec.kind,
                    spec.path.clone(),
                    spec.supermount,
                    spec.allow_eject,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: MediaConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MediaConfig::default());
        assert_eq!(config.flavor, PlatformFlavor::current());
        assert_eq!(config.mount_tools, MountTools::default());
    }

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "mounts_file": "/tmp/mounts",
                "flavor": "freebsd",
                "mount_tools": {"mount": "/sbin/mount"},
                "devices": [
                    {"path": "/dev/cd0"},
                    {"path": "/dev/da0s1", "kind": "disk", "supermount": true, "allow_eject": false}
                ],
                "extensions": [{"media_type": "video", "extensions": "vro, .mpv"}]
            }"#,
        )
        .unwrap();

        let config = MediaConfig::load(&path).unwrap();
        assert_eq!(config.flavor, PlatformFlavor::FreeBsd);
        assert_eq!(config.mount_tools.mount, PathBuf::from("/sbin/mount"));
        assert_eq!(config.mount_tools.umount, MountTools::default().umount);
        assert_eq!(config.devices[0], DeviceSpec::new("/dev/cd0", DeviceKind::Optical));
        assert_eq!(config.devices[1].kind, DeviceKind::Disk);
        assert!(config.devices[1].supermount);
        assert!(!config.devices[1].allow_eject);
        assert_eq!(
            config.mount_table_source(),
            MountTableSource::File {
                path: PathBuf::from("/tmp/mounts")
            }
        );

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.lookup("vro"), Some(MediaType::VIDEO_FILES));
        assert_eq!(registry.lookup("mpv"), Some(MediaType::VIDEO_FILES));
        assert_eq!(registry.lookup("mp3"), Some(MediaType::MUSIC_FILES));
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            MediaConfig::load(&dir.path().join("missing.json")),
            Err(Error::ConfigRead { .. })
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            MediaConfig::load(&path),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_unknown_media_type_name() {
        let config = MediaConfig {
            extensions: vec![ExtensionRegistration {
                media_type: "hologram".into(),
                extensions: "holo".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.build_registry(),
            Err(Error::UnknownMediaType { .. })
        ));
    }

    #[test]
    fn test_configured_extensions_ignore_case() {
        let config = MediaConfig {
            extensions: vec![ExtensionRegistration {
                media_type: "video".into(),
                extensions: "VRO".into(),
            }],
            ..Default::default()
        };
        let registry = config.build_registry().unwrap();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("VR_MOVIE.VRO"), b"").unwrap();
        assert_eq!(
            crate::device::detect_media_type_in(&registry, dir.path()),
            MediaType::VIDEO_FILES
        );
    }

    #[test]
    fn test_darwin_reads_mount_command() {
        let config = MediaConfig::default().with_flavor(PlatformFlavor::Darwin);
        assert_eq!(
            config.mount_table_source(),
            MountTableSource::Command {
                program: config.mount_tools.mount.clone()
            }
        );

        let config = config.with_mounts_file("/tmp/mounts");
        assert!(matches!(
            config.mount_table_source(),
            MountTableSource::File { .. }
        ));
    }

    #[test]
    fn test_build_devices() {
        let config = MediaConfig::default()
            .with_flavor(PlatformFlavor::Linux)
            .with_device(DeviceSpec::new("/dev/sdz1", DeviceKind::Disk))
            .with_device(DeviceSpec::new("/dev/sr9", DeviceKind::Optical));
        let ctx = Arc::new(config.build_context().unwrap());

        let devices = config.build_devices(&ctx);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_path(), "/dev/sdz1");
        assert_eq!(devices[0].driver_name(), "disk");
        assert!(devices[1].allow_eject());
        assert!(!devices[1].is_super_mount());
    }
}
