//! The embedded scripting runtime: one interpreter, one owning thread, and a
//! job queue that every device thread posts to instead of calling the
//! interpreter directly (spec.md §3 `Model`, §5 concurrency model).

pub mod engine;
pub mod host_api;
pub mod job;

pub use engine::ScriptEngine;
pub use host_api::HostApi;
pub use job::{ModelSurface, ScriptJob};

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use vmm_sys_util::eventfd::EventFd;

use crate::error::RequestError;

/// Producer-side handle device threads hold to reach the script thread:
/// push the job, then ring the doorbell — the same
/// enqueue-then-signal-an-eventfd shape as `VhostNetBackend`'s
/// `rx_queue: SegQueue<RxItem>` plus `signal_reactor()` in
/// `dataplane/vhost.rs`/`vhost_user.rs`, generalized from "inject an RX
/// packet" to "run any script job".
#[derive(Clone)]
pub struct ScriptBridge {
    jobs: Arc<SegQueue<ScriptJob>>,
    doorbell: Arc<EventFd>,
}

impl ScriptBridge {
    pub fn new(jobs: Arc<SegQueue<ScriptJob>>, doorbell: Arc<EventFd>) -> Self {
        Self { jobs, doorbell }
    }

    pub fn jobs(&self) -> &Arc<SegQueue<ScriptJob>> {
        &self.jobs
    }

    pub fn doorbell(&self) -> &Arc<EventFd> {
        &self.doorbell
    }

    fn submit(&self, job: ScriptJob) {
        self.jobs.push(job);
        // A doorbell write failing means the script thread is gone; the
        // caller learns this when its reply channel disconnects instead.
        let _ = self.doorbell.write(1);
    }

    /// Submit a job and block for its reply. Used by device handlers, which
    /// already run on their own OS thread and are free to park while the
    /// script thread works through the queue in order.
    pub fn call<T>(&self, build: impl FnOnce(crossbeam_channel::Sender<Result<T, RequestError>>) -> ScriptJob) -> Result<T, RequestError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(build(tx));
        rx.recv().map_err(|_| RequestError::Malformed("script thread gone".into()))?
    }
}

/// Run one `ScriptJob` against the engine and send its result back,
/// swallowing a closed reply channel (the device thread gave up waiting,
/// e.g. because the vhost-user connection dropped mid-request).
pub fn dispatch(engine: &mut ScriptEngine, job: ScriptJob) {
    match job {
        ScriptJob::I2cRead { addr, len, reply } => {
            let result = engine.i2c_read(addr, len).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::I2cWrite { addr, data, reply } => {
            let result = engine.i2c_write(addr, &data).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::GpioSetValue { pin, value, reply } => {
            let result = engine.gpio_set_value(pin, value).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::GpioSetIrqType { pin, irq_type, reply } => {
            let result = engine.gpio_set_irq_type(pin, irq_type).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::GpioUnmask { pin, reply } => {
            let result = engine.gpio_unmask(pin).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::PlatformRead { offset, len, reply } => {
            let result = engine.platform_read(offset, len).map_err(RequestError::from);
            let _ = reply.send(result);
        }
        ScriptJob::PlatformWrite {
            offset,
            len,
            value,
            reply,
        } => {
            let result = engine.platform_write(offset, len, value).map_err(RequestError::from);
            let _ = reply.send(result);
        }
    }
}
