//! Spawns one `VhostUserDaemon` thread per device, the same shape as
//! `run_vhost_daemon`/`ReactorManager::start` in `dataplane/manager.rs`,
//! generalized from one function per vNIC to one generic function shared by
//! all three roadtest devices.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::libc;
use tracing::{debug, info, warn};
use vhost::vhost_user::Listener;
use vhost_user_backend::{VhostUserBackend, VhostUserDaemon};
use vm_memory::GuestMemoryAtomic;

/// Bind `socket_path` and serve `backend` until `shutdown` is set, polling
/// the listener fd with a timeout so the shutdown flag is checked even while
/// idle.
pub fn run_device_daemon<B>(name: &str, socket_path: &Path, backend: Arc<B>, shutdown: Arc<AtomicBool>)
where
    B: VhostUserBackend<Bitmap = ()> + Send + Sync + 'static,
    B::Vring: Clone + Send + Sync,
{
    let mut listener = match Listener::new(socket_path.to_string_lossy().as_ref(), true) {
        Ok(l) => l,
        Err(e) => {
            warn!(name, path = %socket_path.display(), error = %e, "failed to create vhost-user listener");
            return;
        }
    };

    let mut daemon = match VhostUserDaemon::new(
        format!("roadtest-{name}"),
        backend,
        GuestMemoryAtomic::new(vm_memory::GuestMemoryMmap::new()),
    ) {
        Ok(d) => d,
        Err(e) => {
            warn!(name, error = %e, "failed to create VhostUserDaemon");
            return;
        }
    };

    info!(name, path = %socket_path.display(), "vhost-user daemon listening");

    while !shutdown.load(Ordering::SeqCst) {
        let mut pollfd = libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let ret = unsafe { libc::poll(&mut pollfd, 1, 500) };
        if ret <= 0 {
            continue;
        }

        debug!(name, "accepting vhost-user connection");

        if let Err(e) = daemon.start(&mut listener) {
            warn!(name, error = %e, "VhostUserDaemon start error");
            break;
        }

        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        break;
    }

    debug!(name, "vhost-user daemon stopped");
}
