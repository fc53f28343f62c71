//! Guest memory access shared by every device and by the script host
//! callbacks (`dma_read`/`dma_write`, spec.md §3 `MemRegion`). Built on
//! `vm-memory`'s `GuestMemoryAtomic<GuestMemoryMmap>`, the same type
//! `VhostNetBackend` stores as `self.mem` and refreshes on every
//! `update_memory()` call (`dataplane/vhost.rs`).

use std::sync::{Arc, RwLock};

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap};

use crate::error::RequestError;

/// A snapshot of the guest's memory map, refreshed by `VHOST_USER_SET_MEM_TABLE`.
/// Cloning is cheap (an `Arc` bump) and every clone sees every later `update`,
/// mirroring `self.mem: RwLock<GuestMemoryAtomic<GuestMemoryMmap>>` on
/// `VhostNetBackend` (`dataplane/vhost.rs`) so device threads and the script
/// thread all observe the same, latest map.
#[derive(Clone)]
pub struct MemTable {
    inner: Arc<RwLock<GuestMemoryAtomic<GuestMemoryMmap>>>,
}

impl Default for MemTable {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(GuestMemoryAtomic::new(GuestMemoryMmap::new()))),
        }
    }
}

impl MemTable {
    pub fn new(inner: GuestMemoryAtomic<GuestMemoryMmap>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Replace the current map, mirroring `update_memory(&self, mem)` on
    /// `VhostUserBackend` impls in the teacher.
    pub fn update(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) {
        *self.inner.write().unwrap() = mem;
    }

    /// Read `len` bytes starting at `gpa`. Fails with `InvalidGpa` if the
    /// range is unmapped or spans more than one memory region — the script
    /// host callback `dma_read` relies on this to uphold spec.md §3's "no
    /// cross-region splicing" rule for `MemRegion.gpa_to_host_ptr`.
    pub fn dma_read(&self, gpa: u64, len: usize) -> Result<Vec<u8>, RequestError> {
        let mem = self.memory();
        mem.get_slice(GuestAddress(gpa), len)
            .map_err(|_| RequestError::InvalidGpa)?;
        let mut buf = vec![0u8; len];
        mem.read_exact(&mut buf, GuestAddress(gpa))
            .map_err(|_| RequestError::InvalidGpa)?;
        Ok(buf)
    }

    /// Write `data` starting at `gpa`, same single-region constraint as
    /// `dma_read`.
    pub fn dma_write(&self, gpa: u64, data: &[u8]) -> Result<(), RequestError> {
        let mem = self.memory();
        mem.get_slice(GuestAddress(gpa), data.len())
            .map_err(|_| RequestError::InvalidGpa)?;
        mem.write_slice(data, GuestAddress(gpa))
            .map_err(|_| RequestError::InvalidGpa)?;
        Ok(())
    }

    /// Current memory map snapshot, the same pattern `dataplane/vhost.rs`
    /// uses via `mem_guard.memory()` before popping descriptor chains.
    pub fn memory(&self) -> GuestMemoryMmap {
        (*self.inner.read().unwrap().memory()).clone()
    }
}
