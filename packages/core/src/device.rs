//! Removable media device state machine.
//!
//! A [`MediaDevice`] is bound to one device path and tracks the medium in it:
//! its [`MediaStatus`], the detected [`MediaType`] and the mount point.
//! Mounting is done with external tools (see [`crate::executor`]), the mount
//! table is read through [`crate::mount_table`], and everything that differs
//! between drive kinds and platforms lives behind a
//! [`DeviceDriver`](crate::platform::DeviceDriver).
//!
//! Status changes are reported to subscribers registered with
//! [`MediaDevice::subscribe`]. Transitions from or to
//! [`MediaStatus::Unknown`] are never reported.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::fcntl::OFlag;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::executor::{CommandRunner, MountCommand, MountTools, SystemRunner};
use crate::extensions::ExtensionRegistry;
use crate::media_type::{MediaError, MediaResult, MediaStatus, MediaType};
use crate::mount_table::{self, MountQuery, MountTableSource};
use crate::platform::{self, DeviceDriver, DeviceKind, PlatformFlavor};

/// Delays and retry counts used while mounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Pause before the single retry of a failed command.
    pub command_retry_delay: Duration,
    /// Pause after a successful mount command before checking the table.
    pub settle_delay: Duration,
    /// Pause after each repeated mount command.
    pub poll_delay: Duration,
    /// How often the mount command is repeated while the mount is missing.
    pub poll_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            command_retry_delay: Duration::from_millis(300),
            settle_delay: Duration::from_secs(1),
            poll_delay: Duration::from_millis(500),
            poll_retries: 2,
        }
    }
}

#[cfg(test)]
impl RetryPolicy {
    pub(crate) fn immediate() -> Self {
        Self {
            command_retry_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            poll_delay: Duration::ZERO,
            poll_retries: 2,
        }
    }
}

/// Environment shared by all devices of one monitor.
pub struct MediaContext {
    registry: ExtensionRegistry,
    runner: Box<dyn CommandRunner>,
    tools: MountTools,
    mount_source: MountTableSource,
    flavor: PlatformFlavor,
}

impl MediaContext {
    /// Context for the build target with `registry` and system defaults.
    pub fn new(registry: ExtensionRegistry) -> Self {
        let flavor = PlatformFlavor::current();
        let tools = MountTools::default();
        let mount_source = default_mount_source(flavor, &tools);
        Self {
            registry,
            runner: Box::new(SystemRunner::default()),
            tools,
            mount_source,
            flavor,
        }
    }

    pub fn with_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    pub fn with_tools(mut self, tools: MountTools) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_mount_source(mut self, source: MountTableSource) -> Self {
        self.mount_source = source;
        self
    }

    pub fn with_flavor(mut self, flavor: PlatformFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn tools(&self) -> &MountTools {
        &self.tools
    }

    pub fn mount_source(&self) -> &MountTableSource {
        &self.mount_source
    }

    pub fn flavor(&self) -> PlatformFlavor {
        self.flavor
    }
}

/// Platforms without `/proc/mounts` list mounts with the `mount` binary.
pub(crate) fn default_mount_source(
    flavor: PlatformFlavor,
    tools: &MountTools,
) -> MountTableSource {
    if flavor.uses_mount_command() {
        MountTableSource::Command {
            program: tools.mount.clone(),
        }
    } else {
        MountTableSource::default()
    }
}

/// A reported status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device: String,
    pub old: MediaStatus,
    pub new: MediaStatus,
}

/// Callback invoked on every reported status transition.
pub type StatusListener = Box<dyn Fn(&StatusChange) + Send + Sync>;

/// One removable media device.
pub struct MediaDevice {
    device_path: String,
    /// Final target of `device_path` through symlinks.
    real_device: String,
    handle: Option<File>,
    locked: bool,
    super_mount: bool,
    allow_eject: bool,

    status: MediaStatus,
    media_type: MediaType,
    mount_path: Option<PathBuf>,
    volume_id: String,
    key_id: String,

    ctx: Arc<MediaContext>,
    driver: Arc<dyn DeviceDriver>,
    pub(crate) retry: RetryPolicy,
    listeners: Vec<StatusListener>,
}

impl std::fmt::Debug for MediaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDevice")
            .field("device_path", &self.device_path)
            .field("real_device", &self.real_device)
            .field("driver", &self.driver.name())
            .field("status", &self.status)
            .field("media_type", &self.media_type)
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

impl MediaDevice {
    /// Binds a device to `device_path`.
    ///
    /// On platforms that mount media themselves the device is always treated
    /// as supermount-managed.
    pub fn new(
        ctx: Arc<MediaContext>,
        driver: Arc<dyn DeviceDriver>,
        device_path: impl Into<String>,
        super_mount: bool,
        allow_eject: bool,
    ) -> Self {
        let device_path = device_path.into();
        let real_device = mount_table::resolve_symlink(Path::new(&device_path))
            .to_string_lossy()
            .into_owned();
        if real_device != device_path {
            debug!(device = %device_path, real = %real_device, "resolved device symlink");
        }
        let super_mount = super_mount || ctx.flavor().mounts_externally();

        Self {
            device_path,
            real_device,
            handle: None,
            locked: false,
            super_mount,
            allow_eject,
            status: MediaStatus::Unknown,
            media_type: MediaType::UNKNOWN,
            mount_path: None,
            volume_id: String::new(),
            key_id: String::new(),
            ctx,
            driver,
            retry: RetryPolicy::default(),
            listeners: Vec::new(),
        }
    }

    /// Creates a device with the driver for `kind` on the context's platform.
    pub fn with_kind(
        ctx: Arc<MediaContext>,
        kind: DeviceKind,
        device_path: impl Into<String>,
        super_mount: bool,
        allow_eject: bool,
    ) -> Self {
        let driver = platform::driver_for(kind, ctx.flavor());
        Self::new(ctx, driver, device_path, super_mount, allow_eject)
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn real_device(&self) -> &str {
        &self.real_device
    }

    pub fn status(&self) -> MediaStatus {
        self.status
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn set_media_type(&mut self, media_type: MediaType) {
        self.media_type = media_type;
    }

    /// `MEDIATYPE_*` names of the current media type.
    pub fn media_type_string(&self) -> String {
        self.media_type.to_string()
    }

    pub fn mount_path(&self) -> Option<&Path> {
        self.mount_path.as_deref()
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn set_volume_id(&mut self, volume_id: impl Into<String>) {
        self.volume_id = volume_id.into();
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn set_key_id(&mut self, key_id: impl Into<String>) {
        self.key_id = key_id.into();
    }

    pub fn is_super_mount(&self) -> bool {
        self.super_mount
    }

    pub fn allow_eject(&self) -> bool {
        self.allow_eject
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.ctx.runner()
    }

    pub fn uses_bsd_node_names(&self) -> bool {
        self.ctx.flavor().uses_bsd_node_names()
    }

    /// Registers a status change subscriber.
    pub fn subscribe(&mut self, listener: impl Fn(&StatusChange) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    // -- device handle --

    /// Opens the device node read-only and non-blocking, if not yet open.
    pub fn open_device(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.device_path)
            .device_context(&self.device_path)?;
        self.handle = Some(file);
        Ok(())
    }

    pub fn close_device(&mut self) {
        if self.handle.take().is_some() {
            debug!(device = %self.device_path, "closed device handle");
        }
    }

    pub fn is_device_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Descriptor of the open device, opening it on demand.
    pub fn raw_fd(&mut self) -> Option<RawFd> {
        if let Err(e) = self.open_device() {
            debug!(error = %e, "device not available");
            return None;
        }
        self.handle.as_ref().map(File::as_raw_fd)
    }

    /// Holds the device open. The lock flag mirrors whether that worked.
    pub fn lock(&mut self) -> MediaResult {
        match self.open_device() {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "lock failed");
                self.locked = false;
                Err(MediaError::Failed)
            }
        }
    }

    pub fn unlock(&mut self) -> MediaResult {
        self.locked = false;
        Ok(())
    }

    // -- mount state --

    /// Refreshes the mount path from the mount table.
    ///
    /// Returns false (and leaves the mount path untouched) when the device
    /// is not listed or the table cannot be read.
    pub fn find_mount_path(&mut self) -> bool {
        let entries = match self.ctx.mount_source().read_entries(self.ctx.runner()) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "find_mount_path() - cannot read the mount table");
                return false;
            }
        };

        let query = MountQuery {
            device_path: &self.device_path,
            real_device: &self.real_device,
            short_names: self.uses_bsd_node_names(),
        };
        match mount_table::find_mount_path(&entries, &query) {
            Ok(path) => {
                self.mount_path = Some(path);
                true
            }
            Err(Error::NotMounted { .. }) => false,
            Err(e) => {
                debug!(error = %e, "find_mount_path() failed");
                false
            }
        }
    }

    /// Whether the medium is mounted.
    ///
    /// With `verify` the mount table is consulted; otherwise the cached
    /// status decides.
    pub fn is_mounted(&mut self, verify: bool) -> bool {
        if verify {
            self.find_mount_path()
        } else {
            self.status == MediaStatus::Mounted
        }
    }

    pub fn mount(&mut self) -> bool {
        self.perform_mount(true)
    }

    pub fn unmount(&mut self) -> bool {
        self.perform_mount(false)
    }

    /// Mounts (`do_mount`) or unmounts the medium.
    pub fn perform_mount(&mut self, do_mount: bool) -> bool {
        if do_mount && self.is_mounted(true) {
            if self.ctx.flavor().mounts_externally() {
                // The OS mounted it; classify the content anew.
                self.run_on_mounted();
                info!("Detected MediaType {}", self.media_type);
            } else {
                warn!(device = %self.device_path, "Logic Error? Device already mounted.");
            }
            return true;
        }

        self.close_device();

        if self.super_mount {
            info!(device = %self.device_path, "Disk inserted on a supermount device");
            if do_mount {
                self.find_mount_path();
                self.mounted();
            } else {
                self.unmounted();
            }
            return true;
        }

        let command = MountCommand::new(self.ctx.tools(), do_mount, &self.device_path);
        info!("Executing '{command}'");

        let runner = self.ctx.runner();
        let mut ok = command.execute(runner);
        if !ok {
            thread::sleep(self.retry.command_retry_delay);
            info!("Retrying '{command}'");
            ok = command.execute(runner);
        }
        if !ok {
            let action = if do_mount { "mount" } else { "unmount" };
            error!("Failed to {action} {}.", self.device_path);
            return false;
        }

        if !do_mount {
            self.unmounted();
            return true;
        }

        thread::sleep(self.retry.settle_delay);
        let mut tries = self.retry.poll_retries;
        while !self.find_mount_path() && tries > 0 {
            info!("Repeating '{command}'");
            command.execute(self.ctx.runner());
            thread::sleep(self.retry.poll_delay);
            tries -= 1;
        }
        if !self.find_mount_path() {
            error!("Couldn't find mount path of {} after mount", self.device_path);
            return false;
        }

        self.mounted();
        true
    }

    fn mounted(&mut self) {
        if self.status != MediaStatus::Useable {
            self.set_status(MediaStatus::Mounted, false);
        }
        self.run_on_mounted();
        info!("Detected MediaType {}", self.media_type);
    }

    fn unmounted(&mut self) {
        self.mount_path = None;
        // A classified disc stays useable after a transient unmount.
        if self.status == MediaStatus::Mounted {
            self.set_status(MediaStatus::NotMounted, false);
        }
    }

    fn run_on_mounted(&mut self) {
        let driver = Arc::clone(&self.driver);
        driver.on_mounted(self);
    }

    // -- status --

    /// Stores a status without side effects or notifications.
    ///
    /// Used by drivers to refine the status while classifying content.
    pub fn record_status(&mut self, status: MediaStatus) {
        self.status = status;
    }

    /// Updates the status and returns it.
    ///
    /// A change into a status that forbids a mounted medium unmounts it.
    /// Subscribers hear of the change unless either side is
    /// [`MediaStatus::Unknown`]. With `close_after` the device handle is
    /// closed afterwards.
    pub fn set_status(&mut self, new_status: MediaStatus, close_after: bool) -> MediaStatus {
        let old_status = self.status;

        if new_status != old_status {
            info!(
                device = %self.device_path,
                "Status changed from {old_status} to {new_status}"
            );
            self.status = new_status;

            if matches!(
                new_status,
                MediaStatus::NoDisk | MediaStatus::Open | MediaStatus::Unplugged
            ) {
                self.clear_data();
            }

            if new_status.forces_unmount() && self.is_mounted(true) {
                self.unmount();
            }

            if old_status != MediaStatus::Unknown && new_status != MediaStatus::Unknown {
                let change = StatusChange {
                    device: self.device_path.clone(),
                    old: old_status,
                    new: new_status,
                };
                for listener in &self.listeners {
                    listener(&change);
                }
            }
        }

        if close_after {
            self.close_device();
        }
        self.status
    }

    /// Probes the hardware and applies the result with [`Self::set_status`].
    pub fn check_media(&mut self) -> MediaStatus {
        let driver = Arc::clone(&self.driver);
        let status = driver.probe(self);
        self.set_status(status, true)
    }

    /// Forgets everything learned about the current medium.
    pub fn clear_data(&mut self) {
        self.volume_id.clear();
        self.key_id.clear();
        self.media_type = MediaType::UNKNOWN;
    }

    // -- identity and control --

    /// Whether `path` names this device.
    ///
    /// BSD-style platforms also accept the raw node (`/dev/rdisk2` for
    /// `disk2`).
    pub fn is_same_device(&self, path: &str) -> bool {
        if path == self.device_path {
            return true;
        }
        self.uses_bsd_node_names() && bsd_node_name(path) == bsd_node_name(&self.device_path)
    }

    pub fn eject(&mut self, open_close: bool) -> MediaResult {
        let driver = Arc::clone(&self.driver);
        driver.eject(self, open_close)
    }

    pub fn set_speed(&self, speed: i32) -> MediaResult {
        self.driver.set_device_speed(&self.device_path, speed)
    }

    // -- content --

    /// Classifies the mounted content by counting file extensions.
    ///
    /// Hidden entries and symlinks are skipped. The result is the union of
    /// the media types of every registered extension found, or
    /// [`MediaType::UNKNOWN`] if there is none.
    pub fn detect_media_type(&self) -> MediaType {
        match self.mount_path.as_deref() {
            Some(root) => detect_media_type_in(self.ctx.registry(), root),
            None => MediaType::UNKNOWN,
        }
    }
}

/// Classifies the files below `root` by their extensions.
pub fn detect_media_type_in(registry: &ExtensionRegistry, root: &Path) -> MediaType {
    let counts = scan_extensions(root);
    if counts.is_empty() {
        info!("No files with extensions found in '{}'", root.display());
        return MediaType::UNKNOWN;
    }

    let mut found = MediaType::empty();
    for (ext, count) in &counts {
        match registry.lookup(ext) {
            Some(media_type) => {
                debug!(ext = %ext, count, media = %media_type, "extension matched");
                for part in media_type.constituents() {
                    found |= part;
                }
            }
            None => debug!(ext = %ext, count, "unregistered extension"),
        }
    }

    if found.is_empty() {
        MediaType::UNKNOWN
    } else {
        found
    }
}

/// Counts lowercase file extensions below `root`.
fn scan_extensions(root: &Path) -> HashMap<String, usize> {
    let mut counts = HashMap::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = entry.path().extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            *counts.entry(ext).or_insert(0) += 1;
        }
    }

    counts
}

/// `/dev/rdisk2`, `/dev/disk2` and `disk2` all name `disk2`.
fn bsd_node_name(path: &str) -> &str {
    let leaf = path.strip_prefix("/dev/").unwrap_or(path);
    match leaf.strip_prefix('r') {
        Some(block) if block.starts_with("disk") => block,
        _ => leaf,
    }
}
