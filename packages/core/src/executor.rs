//! Command execution abstraction for mount and unmount tools.
//!
//! Mounting is done by shelling out to one of two tool pairs, chosen by
//! availability: the unprivileged `pmount`/`pumount` helpers or the standard
//! `mount`/`umount` binaries. Commands run through a [`CommandRunner`] so the
//! device state machine can be driven by a scripted runner in tests.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Exit code a successful command reports.
pub const EXIT_OK: i32 = 0;

/// How long a mount tool may run before it is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 if the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == EXIT_OK
    }
}

/// Runs external programs to completion.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, blocking until it exits.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands with `std::process::Command`, stdin detached.
///
/// A command still running after `timeout` is killed and reported as
/// [`Error::CommandTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    pub timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SystemRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .command_context(program)?;

        // Drain both pipes while waiting so a chatty child cannot block.
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.timeout).command_context(program)?;
        let Some(status) = status else {
            warn!(program, timeout = ?self.timeout, "command timed out, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::CommandTimeout {
                command: program.to_string(),
                timeout: self.timeout,
            });
        };

        Ok(CommandOutput {
            code: status.code().unwrap_or(-1),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Waits for `child`; `None` if it is still running after `timeout`.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Absolute paths of the mount and unmount tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountTools {
    pub pmount: PathBuf,
    pub pumount: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
}

impl Default for MountTools {
    fn default() -> Self {
        Self {
            pmount: PathBuf::from("/usr/bin/pmount"),
            pumount: PathBuf::from("/usr/bin/pumount"),
            mount: PathBuf::from(if cfg!(target_os = "macos") {
                "/sbin/mount"
            } else {
                "/bin/mount"
            }),
            umount: PathBuf::from("/bin/umount"),
        }
    }
}

impl MountTools {
    /// Returns true if both `pmount` and `pumount` are installed.
    pub fn has_pmount(&self) -> bool {
        self.pmount.exists() && self.pumount.exists()
    }

    /// Picks the program for a mount (`do_mount`) or unmount.
    ///
    /// The `pmount` pair is preferred when both halves are installed.
    pub fn program(&self, do_mount: bool) -> &Path {
        match (self.has_pmount(), do_mount) {
            (true, true) => &self.pmount,
            (true, false) => &self.pumount,
            (false, true) => &self.mount,
            (false, false) => &self.umount,
        }
    }
}

/// A mount or unmount invocation addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCommand {
    program: String,
    device: String,
}

impl MountCommand {
    pub fn new(tools: &MountTools, do_mount: bool, device: &str) -> Self {
        Self {
            program: tools.program(do_mount).to_string_lossy().into_owned(),
            device: device.to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the command; returns true when it exits with [`EXIT_OK`].
    ///
    /// Spawn failures count as a failed run.
    pub fn execute(&self, runner: &dyn CommandRunner) -> bool {
        match runner.run(&self.program, &[&self.device]) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                debug!(
                    command = %self,
                    code = output.code,
                    stderr = %output.stderr.trim(),
                    "command failed"
                );
                false
            }
            Err(e) => {
                debug!(command = %self, error = %e, "command could not be run");
                false
            }
        }
    }
}

impl std::fmt::Display for MountCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tools_in(dir: &Path) -> MountTools {
        MountTools {
            pmount: dir.join("pmount"),
            pumount: dir.join("pumount"),
            mount: PathBuf::from("/bin/mount"),
            umount: PathBuf::from("/bin/umount"),
        }
    }

    #[test]
    fn test_falls_back_to_system_mount() {
        let dir = TempDir::new().unwrap();
        let tools = tools_in(dir.path());

        assert!(!tools.has_pmount());
        assert_eq!(tools.program(true), Path::new("/bin/mount"));
        assert_eq!(tools.program(false), Path::new("/bin/umount"));
    }

    #[test]
    fn test_prefers_pmount_pair() {
        let dir = TempDir::new().unwrap();
        let tools = tools_in(dir.path());

        // Only one half installed is not enough.
        std::fs::write(&tools.pmount, b"").unwrap();
        assert!(!tools.has_pmount());

        std::fs::write(&tools.pumount, b"").unwrap();
        assert!(tools.has_pmount());
        assert_eq!(tools.program(true), tools.pmount.as_path());
        assert_eq!(tools.program(false), tools.pumount.as_path());
    }

    #[test]
    fn test_mount_command_display() {
        let dir = TempDir::new().unwrap();
        let cmd = MountCommand::new(&tools_in(dir.path()), true, "/dev/sr0");
        assert_eq!(cmd.to_string(), "/bin/mount /dev/sr0");
    }

    #[test]
    fn test_system_runner_reports_exit_code() {
        let output = SystemRunner::default()
            .run("sh", &["-c", "echo hi; exit 3"])
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout.trim(), "hi");
        assert!(!output.success());
    }

    #[test]
    fn test_system_runner_missing_program() {
        assert!(SystemRunner::default().run("/nonexistent/program", &[]).is_err());
    }

    #[test]
    fn test_system_runner_kills_on_timeout() {
        let runner = SystemRunner::with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        assert!(matches!(
            runner.run("sleep", &["5"]),
            Err(Error::CommandTimeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
