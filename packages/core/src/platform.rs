//! Platform and device-kind specific behaviour.
//!
//! A [`DeviceDriver`] supplies what differs between a plain removable disk
//! and an optical drive, and between operating systems: probing the current
//! media status, drive speed control, ejecting, and classifying content once
//! the medium is mounted. [`driver_for`] picks the implementation.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::device::MediaDevice;
use crate::media_type::{MediaError, MediaResult, MediaStatus, MediaType};

// If a DVD has its directories in lowercase it was mounted as ISO9660
// instead of UDF.
const BAD_DVD_MARKER: &str = "video_ts";
const DVD_MARKER: &str = "VIDEO_TS";
const BLURAY_MARKER: &str = "BDMV";
const VCD_MARKER: &str = "vcd";
const SVCD_MARKER: &str = "svcd";
/// macOS mounts audio CDs with a table of contents file.
const AUDIO_MARKER: &str = ".TOC.plist";

/// Operating system conventions the device layer has to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformFlavor {
    Linux,
    /// macOS: no `/proc/mounts`, disk arbitration mounts media itself.
    Darwin,
    FreeBsd,
    Other,
}

impl Default for PlatformFlavor {
    fn default() -> Self {
        Self::current()
    }
}

impl PlatformFlavor {
    /// The flavor of the build target.
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::Darwin
        } else if cfg!(target_os = "freebsd") {
            Self::FreeBsd
        } else {
            Self::Other
        }
    }

    /// Whether the mount table must be read from `mount` command output.
    pub fn uses_mount_command(self) -> bool {
        self == Self::Darwin
    }

    /// Whether the OS mounts inserted media on its own.
    pub fn mounts_externally(self) -> bool {
        self == Self::Darwin
    }

    /// Whether devices are addressed by short BSD node names (`disk2`) that
    /// also exist in raw form (`/dev/rdisk2`).
    pub fn uses_bsd_node_names(self) -> bool {
        self == Self::Darwin
    }
}

/// What kind of hardware a device path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// CD, DVD or Blu-ray drive.
    #[default]
    Optical,
    /// USB stick, memory card or other removable disk.
    Disk,
}

/// Per-platform capabilities of a media device.
pub trait DeviceDriver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Determines the current status of the medium.
    fn probe(&self, device: &mut MediaDevice) -> MediaStatus {
        probe_mount_table(device)
    }

    /// Sets the drive read speed.
    fn set_device_speed(&self, device_path: &str, speed: i32) -> MediaResult {
        info!("SetDeviceSpeed({device_path},{speed}) - not implemented on this OS.");
        Err(MediaError::Unsupported)
    }

    /// Classifies the content of a freshly mounted medium.
    fn on_mounted(&self, device: &mut MediaDevice) {
        let detected = device.detect_media_type();
        device.set_media_type(detected);
    }

    /// Opens (`open_close == true`) or closes the tray.
    fn eject(&self, device: &mut MediaDevice, open_close: bool) -> MediaResult {
        let _ = open_close;
        eject_with_diskutil(device)
    }
}

/// Returns the driver for `kind` on `flavor`.
pub fn driver_for(kind: DeviceKind, flavor: PlatformFlavor) -> Arc<dyn DeviceDriver> {
    match (kind, flavor) {
        #[cfg(target_os = "linux")]
        (DeviceKind::Optical, PlatformFlavor::Linux) => Arc::new(linux::LinuxOpticalDriver),
        (DeviceKind::Optical, _) => Arc::new(OpticalDriver),
        (DeviceKind::Disk, _) => Arc::new(DiskDriver),
    }
}

/// Removable disks: content is classified by file extensions alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskDriver;

impl DeviceDriver for DiskDriver {
    fn name(&self) -> &'static str {
        "disk"
    }
}

/// Optical drives on platforms without drive-specific support.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpticalDriver;

impl DeviceDriver for OpticalDriver {
    fn name(&self) -> &'static str {
        "optical"
    }

    fn on_mounted(&self, device: &mut MediaDevice) {
        classify_disc(device);
    }
}

/// Status from the device node and the mount table.
pub fn probe_mount_table(device: &mut MediaDevice) -> MediaStatus {
    if !device.uses_bsd_node_names() && !Path::new(device.device_path()).exists() {
        return MediaStatus::Unplugged;
    }

    let mounted = device.is_mounted(true);
    match (mounted, device.status()) {
        // Classified discs stay useable, mounted or not.
        (_, MediaStatus::Useable) => MediaStatus::Useable,
        (true, _) => MediaStatus::Mounted,
        (false, _) => MediaStatus::NotMounted,
    }
}

/// Ejects through `diskutil` on macOS; unsupported elsewhere.
fn eject_with_diskutil(device: &mut MediaDevice) -> MediaResult {
    if !device.uses_bsd_node_names() {
        return Err(MediaError::Unsupported);
    }

    let path = device.device_path().to_string();
    match device.runner().run("diskutil", &["eject", &path]) {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => {
            error!(device = %path, stderr = %output.stderr.trim(), "diskutil eject failed");
            Err(MediaError::Failed)
        }
        Err(e) => {
            error!(device = %path, error = %e, "diskutil eject could not be run");
            Err(MediaError::Failed)
        }
    }
}

/// Marker-based classification of a mounted CD, DVD or Blu-ray.
///
/// Markers are checked in a fixed order: DVD, Blu-ray, audio CD, (S)VCD.
/// If none matches, the extension statistics decide.
pub fn classify_disc(device: &mut MediaDevice) {
    let Some(mount) = device.mount_path().filter(|p| p.is_dir()).map(Path::to_path_buf) else {
        error!(
            "Mountpoint '{}' doesn't exist",
            device
                .mount_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        device.set_media_type(MediaType::UNKNOWN);
        device.record_status(MediaStatus::Error);
        return;
    };

    device.set_media_type(MediaType::DATA);
    device.record_status(MediaStatus::Mounted);

    let found = if mount.join(DVD_MARKER).is_dir() {
        info!("Probable DVD detected.");
        Some(MediaType::DVD)
    } else if mount.join(BLURAY_MARKER).is_dir() {
        info!("Probable Blu-ray detected.");
        Some(MediaType::BLURAY)
    } else if mount.join(AUDIO_MARKER).exists() {
        info!("Probable Audio CD detected.");
        Some(MediaType::AUDIO)
    } else if mount.join(VCD_MARKER).is_dir() || mount.join(SVCD_MARKER).is_dir() {
        info!("Probable VCD/SVCD detected.");
        Some(MediaType::VCD)
    } else {
        if mount.join(BAD_DVD_MARKER).is_dir() {
            warn!("DVD incorrectly mounted? (ISO9660 instead of UDF)");
        } else {
            info!(
                "CD/DVD '{}' contained none of /{DVD_MARKER}, /{BLURAY_MARKER}, \
                 /{AUDIO_MARKER}, /{VCD_MARKER} or /{SVCD_MARKER}",
                mount.display()
            );
        }
        info!("Searching CD statistically - file by file!");
        None
    };

    match found {
        Some(media_type) => {
            device.set_media_type(media_type);
            device.record_status(MediaStatus::Useable);
        }
        None => {
            let detected = device.detect_media_type();
            device.set_media_type(detected);
        }
    }

    // Unlock the door and, for discs a player reads from the raw device,
    // unmount again so the manual eject button works.
    if device.allow_eject() {
        let _ = device.unlock();
        let media_type = device.media_type();
        if media_type == MediaType::DVD || media_type == MediaType::VCD {
            device.unmount();
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;

    use tracing::{debug, error, info};

    use super::{DeviceDriver, classify_disc, probe_mount_table};
    use crate::device::MediaDevice;
    use crate::error::Error;
    use crate::media_type::{MediaError, MediaResult, MediaStatus};

    const CDROMEJECT: u32 = 0x5309;
    const CDROMCLOSETRAY: u32 = 0x5319;
    const CDROM_SELECT_SPEED: u32 = 0x5322;
    const CDROM_DRIVE_STATUS: u32 = 0x5326;

    /// Slot argument meaning "the current slot".
    const CDSL_CURRENT: i32 = i32::MAX;

    const CDS_NO_INFO: i32 = 0;
    const CDS_NO_DISC: i32 = 1;
    const CDS_TRAY_OPEN: i32 = 2;
    const CDS_DRIVE_NOT_READY: i32 = 3;
    const CDS_DISC_OK: i32 = 4;

    nix::ioctl_none_bad!(cdrom_eject, CDROMEJECT);
    nix::ioctl_none_bad!(cdrom_close_tray, CDROMCLOSETRAY);
    nix::ioctl_write_int_bad!(cdrom_select_speed, CDROM_SELECT_SPEED);
    nix::ioctl_write_int_bad!(cdrom_drive_status, CDROM_DRIVE_STATUS);

    fn ioctl_error(device: &MediaDevice, request: &'static str, source: nix::Error) -> Error {
        Error::DeviceIoctl {
            path: device.device_path().into(),
            request,
            source,
        }
    }

    /// Linux CD-ROM driver using the `cdrom.h` ioctls.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LinuxOpticalDriver;

    impl DeviceDriver for LinuxOpticalDriver {
        fn name(&self) -> &'static str {
            "linux-cdrom"
        }

        fn probe(&self, device: &mut MediaDevice) -> MediaStatus {
            if !Path::new(device.device_path()).exists() {
                return MediaStatus::Unplugged;
            }
            let Some(fd) = device.raw_fd() else {
                debug!(device = %device.device_path(), "cannot open drive for status");
                return device.status();
            };

            // SAFETY: fd is an open descriptor owned by `device`.
            let drive = unsafe { cdrom_drive_status(fd, CDSL_CURRENT) };
            match drive {
                Ok(CDS_TRAY_OPEN) => MediaStatus::Open,
                Ok(CDS_NO_DISC) => MediaStatus::NoDisk,
                Ok(CDS_DRIVE_NOT_READY) => device.status(),
                Ok(CDS_DISC_OK) | Ok(CDS_NO_INFO) => probe_mount_table(device),
                Ok(other) => {
                    debug!(status = other, "unexpected drive status");
                    probe_mount_table(device)
                }
                Err(e) => {
                    let e = ioctl_error(device, "CDROM_DRIVE_STATUS", e);
                    debug!(error = %e, "falling back to the mount table");
                    probe_mount_table(device)
                }
            }
        }

        fn set_device_speed(&self, device_path: &str, speed: i32) -> MediaResult {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
                .open(device_path)
                .map_err(|e| {
                    error!(device = %device_path, error = %e, "SetDeviceSpeed() open failed");
                    MediaError::Failed
                })?;

            // SAFETY: the descriptor stays open for the duration of the call.
            match unsafe { cdrom_select_speed(file.as_raw_fd(), speed) } {
                Ok(_) => {
                    info!("SetDeviceSpeed({device_path},{speed}) done");
                    Ok(())
                }
                Err(e) => {
                    error!(device = %device_path, error = %e, "CDROM_SELECT_SPEED failed");
                    Err(MediaError::Failed)
                }
            }
        }

        fn on_mounted(&self, device: &mut MediaDevice) {
            classify_disc(device);
        }

        fn eject(&self, device: &mut MediaDevice, open_close: bool) -> MediaResult {
            if open_close && device.is_mounted(true) && !device.unmount() {
                return Err(MediaError::Failed);
            }
            let Some(fd) = device.raw_fd() else {
                return Err(MediaError::Failed);
            };

            // SAFETY: fd is an open descriptor owned by `device`.
            let (request, result) = if open_close {
                ("CDROMEJECT", unsafe { cdrom_eject(fd) })
            } else {
                ("CDROMCLOSETRAY", unsafe { cdrom_close_tray(fd) })
            };

            result.map(|_| ()).map_err(|source| {
                error!(error = %ioctl_error(device, request, source), "eject failed");
                MediaError::Failed
            })
        }
    }
}
