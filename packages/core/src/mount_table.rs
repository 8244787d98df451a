//! Live mount table scanning.
//!
//! This module reads the system mount table, either the canonical
//! `/proc/mounts` file or the free-form output of the `mount` command on
//! platforms without one, and maps a device path to its current mount point.
//!
//! A mount table entry matches a device when any name along the symlink
//! chain of its device token equals the device path or its resolved real
//! device.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, error};

use crate::error::{Error, IoResultExt, Result};
use crate::executor::CommandRunner;

/// Default mount table path.
pub const PROC_MOUNTS_PATH: &str = "/proc/mounts";

/// Upper bound on symlink hops when resolving a device name.
const MAX_SYMLINK_DEPTH: usize = 32;

/// ` type <fstype> (options)` suffix of Linux `mount` output.
static TYPE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" type \w.*$").expect("valid type suffix regex"));

/// ` (options)` suffix of BSD/macOS `mount` output.
static OPTIONS_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" \(\w.*$").expect("valid options suffix regex"));

/// Where the live mount table comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountTableSource {
    /// A `/proc/mounts` style file.
    File { path: PathBuf },
    /// The output of running the given `mount` binary without arguments.
    Command { program: PathBuf },
}

impl Default for MountTableSource {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from(PROC_MOUNTS_PATH),
        }
    }
}

impl MountTableSource {
    /// Reads and parses the current mount table.
    pub fn read_entries(&self, runner: &dyn CommandRunner) -> Result<Vec<MountEntry>> {
        match self {
            Self::File { path } => {
                let content = fs::read_to_string(path).mount_table_context(path)?;
                Ok(parse_proc_mounts(&content))
            }
            Self::Command { program } => {
                let program = program.to_string_lossy();
                let output = runner.run(&program, &[])?;
                if !output.success() {
                    return Err(Error::CommandExit {
                        command: program.into_owned(),
                        code: output.code,
                        stderr: output.stderr,
                    });
                }
                Ok(parse_mount_output(&output.stdout))
            }
        }
    }
}

/// One device/mount point pair from the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device token as listed (e.g. "/dev/sr0").
    pub device: String,
    /// Mount point with escape sequences decoded.
    pub mount_point: PathBuf,
}

impl MountEntry {
    /// Parses a `/proc/mounts` line: `<device> <mountpoint> <fstype> <options> <dump> <pass>`.
    ///
    /// Returns None for blank lines and lines without a mount point.
    pub fn from_proc_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let device = parts.next()?;
        let mount_point = parts.next()?;

        Some(Self {
            device: device.to_string(),
            mount_point: PathBuf::from(unescape_mount_path(mount_point)),
        })
    }

    /// Parses a line of `mount` command output.
    ///
    /// Handles both of:
    /// - `/dev/disk0s3 on / (hfs, local, journaled)` (macOS)
    /// - `/dev/hdd on /tmp/AAA BBB type udf (ro)` (Linux)
    pub fn from_mount_output_line(line: &str) -> Option<Self> {
        let line = line.trim_end();
        let (device, rest) = match line.split_once(char::is_whitespace) {
            Some((device, rest)) => (device, rest),
            None => (line, ""),
        };
        if device.is_empty() {
            return None;
        }

        let rest = format!(" {}", rest.trim_start());
        let rest = rest.strip_prefix(" on ").unwrap_or(&rest);
        let rest = TYPE_SUFFIX.replace(rest, "");
        let mount_point = OPTIONS_SUFFIX.replace(&rest, "");

        Some(Self {
            device: device.to_string(),
            mount_point: PathBuf::from(unescape_mount_path(mount_point.trim())),
        })
    }
}

/// Parses the full content of a `/proc/mounts` style file.
pub fn parse_proc_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(MountEntry::from_proc_line)
        .collect()
}

/// Parses the full output of the `mount` command.
pub fn parse_mount_output(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(MountEntry::from_mount_output_line)
        .collect()
}

/// Decodes octal escape sequences (`\040` for space, `\011` for tab, ...)
/// used in mount table paths.
///
/// Escapes stand for raw bytes, so a multi-byte UTF-8 name survives; bytes
/// that do not form valid UTF-8 are replaced.
pub fn unescape_mount_path(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|d| (b'0'..=b'7').contains(d))
            && let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 4], 8)
        {
            result.push(byte);
            i += 4;
            continue;
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Returns the names along the symlink chain starting at `path`.
///
/// The first element is `path` itself, followed by each link target in turn.
/// Relative targets are resolved against the directory of the link.
pub fn symlink_chain(path: &Path) -> Vec<PathBuf> {
    let mut chain = vec![path.to_path_buf()];
    let mut current = path.to_path_buf();

    for _ in 0..MAX_SYMLINK_DEPTH {
        let Ok(target) = fs::read_link(&current) else {
            break;
        };
        let next = if target.is_absolute() {
            target
        } else {
            current
                .parent()
                .map(|parent| parent.join(&target))
                .unwrap_or(target)
        };
        if chain.contains(&next) {
            break;
        }
        chain.push(next.clone());
        current = next;
    }

    chain
}

/// Resolves a path through its symlink chain to the final target.
pub fn resolve_symlink(path: &Path) -> PathBuf {
    symlink_chain(path)
        .pop()
        .unwrap_or_else(|| path.to_path_buf())
}

/// The identity of the device being looked up.
#[derive(Debug, Clone, Copy)]
pub struct MountQuery<'a> {
    /// Device path the caller is bound to.
    pub device_path: &'a str,
    /// Symlink target of `device_path`.
    pub real_device: &'a str,
    /// Also match short BSD node names (`disk2s1` for `/dev/disk2s1`).
    pub short_names: bool,
}

impl MountQuery<'_> {
    fn matches(&self, entry: &MountEntry) -> bool {
        let mut names: Vec<String> = symlink_chain(Path::new(&entry.device))
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        if self.short_names
            && self.device_path.starts_with("disk")
            && let Some(short) = entry.device.strip_prefix("/dev/")
        {
            names.push(short.to_string());
        }

        names
            .iter()
            .any(|name| name == self.device_path || name == self.real_device)
    }
}

/// Searches `entries` for the mount point of the queried device.
///
/// Only entries whose device token starts with `/dev/` are considered.
pub fn find_mount_path(entries: &[MountEntry], query: &MountQuery<'_>) -> Result<PathBuf> {
    if query.device_path.is_empty() {
        error!("find_mount_path() - logic error, no device path");
        return Err(Error::NoDevicePath);
    }

    let debug_enabled = tracing::enabled!(Level::DEBUG);
    let mut table = String::new();

    for entry in entries {
        if !entry.device.starts_with("/dev/") {
            continue;
        }

        if query.matches(entry) {
            return Ok(entry.mount_point.clone());
        }

        if debug_enabled {
            let _ = writeln!(
                table,
                "                 {:>16} | {}",
                entry.device,
                entry.mount_point.display()
            );
        }
    }

    if debug_enabled {
        debug!(
            "find_mount_path() - mount of '{}' not found.\n\
             \x20                Device name/type | Current mountpoint\n\
             \x20                -----------------+-------------------\n\
             {table}\
             \x20                =================+===================",
            query.device_path
        );
    }

    Err(Error::NotMounted {
        device: query.device_path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const SAMPLE_PROC_MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sr0 /media/My\\040Movie udf ro,nosuid,nodev,relatime 0 0
/dev/sdb1 /media/usb vfat rw,nosuid,nodev 0 0
";

    fn query<'a>(device_path: &'a str) -> MountQuery<'a> {
        MountQuery {
            device_path,
            real_device: device_path,
            short_names: false,
        }
    }

    #[test]
    fn test_parse_proc_mounts() {
        let entries = parse_proc_mounts(SAMPLE_PROC_MOUNTS);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[2].device, "/dev/nvme0n1p2");
        assert_eq!(entries[2].mount_point, PathBuf::from("/"));
    }

    #[test]
    fn test_escaped_spaces_are_decoded() {
        let entry = MountEntry::from_proc_line("/dev/sr0 /media/My\\040Movie udf ro 0 0").unwrap();
        assert_eq!(entry.mount_point, PathBuf::from("/media/My Movie"));

        assert_eq!(unescape_mount_path("/a\\040b\\040c"), "/a b c");
        assert_eq!(unescape_mount_path("/tab\\011x"), "/tab\tx");
        assert_eq!(unescape_mount_path("/no\\9escape"), "/no\\9escape");
    }

    #[test]
    fn test_escaped_bytes_form_utf8() {
        // "é" is 0xc3 0xa9.
        assert_eq!(unescape_mount_path("/media/caf\\303\\251"), "/media/caf\u{e9}");
        assert_eq!(unescape_mount_path("/media/\\377x"), "/media/\u{fffd}x");
        assert_eq!(unescape_mount_path("/media/\\400"), "/media/\\400");
    }

    #[test]
    fn test_from_proc_line_skips_incomplete() {
        assert!(MountEntry::from_proc_line("").is_none());
        assert!(MountEntry::from_proc_line("   ").is_none());
        assert!(MountEntry::from_proc_line("/dev/sr0").is_none());
    }

    #[test]
    fn test_parse_linux_mount_output() {
        let entry = MountEntry::from_mount_output_line(
            "/dev/hdd on /tmp/AAA BBB type udf (ro,nosuid)",
        )
        .unwrap();
        assert_eq!(entry.device, "/dev/hdd");
        assert_eq!(entry.mount_point, PathBuf::from("/tmp/AAA BBB"));
    }

    #[test]
    fn test_parse_darwin_mount_output() {
        let entries = parse_mount_output(
            "/dev/disk0s3 on / (hfs, local, journaled)\n\
             /dev/disk2 on /Volumes/MY DVD (udf, local, nodev, nosuid, read-only)\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[1].device, "/dev/disk2");
        assert_eq!(entries[1].mount_point, PathBuf::from("/Volumes/MY DVD"));
    }

    #[test]
    fn test_find_mount_path() {
        let entries = parse_proc_mounts(SAMPLE_PROC_MOUNTS);

        let found = find_mount_path(&entries, &query("/dev/sr0")).unwrap();
        assert_eq!(found, PathBuf::from("/media/My Movie"));

        let found = find_mount_path(&entries, &query("/dev/sdb1")).unwrap();
        assert_eq!(found, PathBuf::from("/media/usb"));
    }

    #[test]
    fn test_find_mount_path_not_found() {
        let entries = parse_proc_mounts(SAMPLE_PROC_MOUNTS);

        assert!(matches!(
            find_mount_path(&entries, &query("/dev/sr1")),
            Err(Error::NotMounted { .. })
        ));
        // Non-/dev tokens are never matched.
        assert!(find_mount_path(&entries, &query("proc")).is_err());
        assert!(matches!(
            find_mount_path(&entries, &query("")),
            Err(Error::NoDevicePath)
        ));
    }

    #[test]
    fn test_find_mount_path_by_real_device() {
        let entries = parse_proc_mounts(SAMPLE_PROC_MOUNTS);
        let q = MountQuery {
            device_path: "/dev/cdrom",
            real_device: "/dev/sr0",
            short_names: false,
        };
        assert_eq!(
            find_mount_path(&entries, &q).unwrap(),
            PathBuf::from("/media/My Movie")
        );
    }

    #[test]
    fn test_find_mount_path_through_symlinked_token() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("sr0");
        fs::write(&target, b"").unwrap();
        let link = dir.path().join("cdrom");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        // The mount table lists the link, the caller knows the target.
        let entries = vec![MountEntry {
            device: format!("/dev/../{}", link.display()),
            mount_point: PathBuf::from("/media/cdrom"),
        }];
        let chain = symlink_chain(Path::new(&entries[0].device));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], target);

        let target_str = target.to_string_lossy();
        let found = find_mount_path(&entries, &query(&target_str)).unwrap();
        assert_eq!(found, PathBuf::from("/media/cdrom"));
    }

    #[test]
    fn test_short_node_names() {
        let entries = parse_mount_output("/dev/disk2s1 on /Volumes/USB (msdos, local)\n");
        let q = MountQuery {
            device_path: "disk2s1",
            real_device: "disk2s1",
            short_names: true,
        };
        assert_eq!(
            find_mount_path(&entries, &q).unwrap(),
            PathBuf::from("/Volumes/USB")
        );

        let q = MountQuery {
            short_names: false,
            ..q
        };
        assert!(find_mount_path(&entries, &q).is_err());
    }

    #[test]
    fn test_resolve_symlink_relative_target() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("sr0"), b"").unwrap();
        let link = dir.path().join("dvd");
        std::os::unix::fs::symlink("sr0", &link).unwrap();

        assert_eq!(resolve_symlink(&link), dir.path().join("sr0"));
        // Plain files resolve to themselves.
        assert_eq!(
            resolve_symlink(&dir.path().join("sr0")),
            dir.path().join("sr0")
        );
    }

    struct FakeMount(&'static str);

    impl CommandRunner for FakeMount {
        fn run(&self, _program: &str, _args: &[&str]) -> Result<CommandOutput> {
            Ok(CommandOutput {
                code: 0,
                stdout: self.0.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_read_entries_from_file_and_command() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_PROC_MOUNTS.as_bytes()).unwrap();

        let runner = FakeMount("/dev/disk2 on /Volumes/DVD (udf, local)\n");

        let source = MountTableSource::File {
            path: file.path().to_path_buf(),
        };
        assert_eq!(source.read_entries(&runner).unwrap().len(), 5);

        let source = MountTableSource::Command {
            program: PathBuf::from("/sbin/mount"),
        };
        let entries = source.read_entries(&runner).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, PathBuf::from("/Volumes/DVD"));
    }

    #[test]
    fn test_read_entries_missing_file() {
        let source = MountTableSource::File {
            path: PathBuf::from("/nonexistent/mounts"),
        };
        assert!(matches!(
            source.read_entries(&FakeMount("")),
            Err(Error::MountTableRead { .. })
        ));
    }
}
