//! Supervises the child UML process (spec.md §4.8 / SPEC_FULL.md §4.8).
//! Sockets are bound before the child is spawned so the guest kernel's
//! virtio-mmio/virtio-pci probes never race an unbound vhost-user listener;
//! the child's stdout/stderr are redirected to `uml.txt` the same way the
//! original redirects before `execvpe`.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::info;

use crate::error::FatalError;

pub struct Supervisor {
    child: Child,
}

impl Supervisor {
    /// Fork and exec the UML binary with `args`, redirecting its stdio to
    /// `$work_dir/uml.txt` in append mode.
    pub fn spawn(binary: &str, args: &[String], work_dir: &Path) -> Result<Self, FatalError> {
        let log_path = work_dir.join("uml.txt");
        let stdout_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(FatalError::Spawn)?;
        let stderr_file = stdout_file.try_clone().map_err(FatalError::Spawn)?;

        info!(binary, ?args, log = %log_path.display(), "spawning UML child process");

        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .spawn()
            .map_err(FatalError::Spawn)?;

        Ok(Self { child })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the child exits, reaping it. Called from `main` after all
    /// three device daemons have accepted a connection and are serving
    /// requests.
    pub fn wait(&mut self) -> Result<std::process::ExitStatus, FatalError> {
        self.child.wait().map_err(FatalError::Spawn)
    }

    /// Kill the child without waiting for it.
    pub fn terminate(&mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Best-effort: don't leave a UML process running past the backend's
        // own lifetime if `wait` was never reached (e.g. a fatal error on
        // another device's thread).
        let _ = self.child.try_wait();
    }
}
