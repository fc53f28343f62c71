//! The harness control channel (SPEC_FULL.md §4.9): a line-oriented FIFO at
//! `$ROADTEST_WORK_DIR/control`, read nonblocking so it can sit on the script
//! thread's epoll loop next to the job doorbell.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde_json::Value;
use tracing::warn;

use crate::error::FatalError;
use crate::script::job::ModelSurface;

/// A parsed line from the control channel, ready to become a `ScriptJob`
/// (the `ping` line has no reply to thread through and is handled inline).
pub enum ControlLine {
    Load { surface: ModelSurface, path: String },
    Call { surface: ModelSurface, method: String, args: Value },
    Ping,
}

impl ControlLine {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.trim().splitn(3, ' ');
        match words.next()? {
            "ping" => Some(Self::Ping),
            "load" => {
                let surface = ModelSurface::parse(words.next()?)?;
                let path = words.next()?.to_string();
                Some(Self::Load { surface, path })
            }
            "call" => {
                let target = words.next()?;
                let (surface, method) = target.split_once('.')?;
                let surface = ModelSurface::parse(surface)?;
                let args_str = words.next().unwrap_or("{}");
                let args: Value = serde_json::from_str(args_str).ok()?;
                Some(Self::Call {
                    surface,
                    method: method.to_string(),
                    args,
                })
            }
            _ => None,
        }
    }

}

/// Nonblocking reader over the control FIFO, buffering partial lines across
/// reads the way a raw byte stream from a pipe requires.
pub struct ControlChannel {
    file: File,
    buf: Vec<u8>,
}

impl ControlChannel {
    /// Create the FIFO at `path` (if it doesn't already exist) and open it
    /// nonblocking for reading. The harness (out of scope) opens its own end
    /// for writing; `O_NONBLOCK` on our side means `open()` doesn't block
    /// waiting for that writer to show up.
    pub fn open(path: &Path) -> Result<Self, FatalError> {
        if !path.exists() {
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| FatalError::ControlFifo {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| FatalError::SocketBind {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(Self { file, buf: Vec::new() })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Drain whatever bytes are currently available and return the complete
    /// lines found, leaving any trailing partial line buffered for next
    /// time. Malformed lines are logged and dropped, never surfaced as an
    /// error (SPEC_FULL.md §4.9).
    pub fn poll_lines(&mut self) -> Vec<ControlLine> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            match ControlLine::parse(line) {
                Some(parsed) => lines.push(parsed),
                None => warn!(%line, "malformed control channel line"),
            }
        }
        lines
    }
}
