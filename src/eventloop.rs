//! The script thread's reactor: the realization of spec.md §4.6's epoll loop
//! for script cooperation (SPEC_FULL.md REDESIGN FLAGS). Watches exactly two
//! things — the job doorbell and the control-channel FIFO — drains the
//! control channel into jobs, then drains the job queue, one job at a time,
//! through the single `ScriptEngine` this thread owns.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::{debug, error};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::control::ControlChannel;
use crate::script::{ScriptEngine, ScriptJob};

const TOKEN_DOORBELL: u64 = 1;
const TOKEN_CONTROL: u64 = 2;

/// Run until `shutdown` observes every device thread has exited (checked via
/// `exit_event`-style eventfd rather than a boolean flag, consistent with
/// `VhostUserBackend::exit_event` plumbing used throughout the device
/// modules). Blocks the calling thread; spawn this on its own OS thread.
pub fn run(
    mut engine: ScriptEngine,
    jobs: Arc<SegQueue<ScriptJob>>,
    doorbell: Arc<EventFd>,
    mut control: ControlChannel,
    shutdown: Arc<EventFd>,
) {
    let epoll = match Epoll::new() {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to create script thread epoll instance");
            return;
        }
    };

    if let Err(e) = epoll.ctl(
        ControlOperation::Add,
        doorbell.as_raw_fd(),
        EpollEvent::new(EventSet::IN, TOKEN_DOORBELL),
    ) {
        error!(error = %e, "failed to register job doorbell on script thread epoll");
        return;
    }

    if let Err(e) = epoll.ctl(
        ControlOperation::Add,
        control.raw_fd(),
        EpollEvent::new(EventSet::IN, TOKEN_CONTROL),
    ) {
        error!(error = %e, "failed to register control channel on script thread epoll");
        return;
    }

    const TOKEN_SHUTDOWN: u64 = 3;
    if let Err(e) = epoll.ctl(
        ControlOperation::Add,
        shutdown.as_raw_fd(),
        EpollEvent::new(EventSet::IN, TOKEN_SHUTDOWN),
    ) {
        error!(error = %e, "failed to register shutdown eventfd on script thread epoll");
        return;
    }

    let mut events = vec![EpollEvent::default(); 8];
    loop {
        let n = match epoll.wait(-1, &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "script thread epoll wait failed");
                return;
            }
        };

        let mut should_exit = false;
        for ev in &events[..n] {
            match ev.data() {
                TOKEN_DOORBELL => {
                    let _ = doorbell.read();
                }
                TOKEN_CONTROL => {
                    for line in control.poll_lines() {
                        process_control_line(&mut engine, line);
                    }
                }
                TOKEN_SHUTDOWN => {
                    should_exit = true;
                }
                _ => {}
            }
        }

        // Drain the job queue once per wake, after the control channel, as
        // SPEC_FULL.md §4.9 specifies ("calls `process_control()` once per
        // wake before draining jobs").
        while let Some(job) = jobs.pop() {
            crate::script::dispatch(&mut engine, job);
        }

        if should_exit {
            debug!("script thread observed shutdown, exiting");
            return;
        }
    }
}

fn process_control_line(engine: &mut ScriptEngine, line: crate::control::ControlLine) {
    use crate::control::ControlLine;
    match line {
        ControlLine::Ping => {
            debug!("control channel ping");
        }
        ControlLine::Load { surface, path } => {
            if let Err(e) = engine.reload(surface, &path) {
                tracing::warn!(%path, error = %e, "control channel load failed");
            }
        }
        ControlLine::Call { surface, method, args } => {
            if let Err(e) = engine.call(surface, &method, &args.to_string()) {
                tracing::warn!(%method, error = %e, "control channel call failed");
            }
        }
    }
}
