//! A minimal vhost-user frontend (guest/driver simulator) used to exercise
//! the backend's device personalities end to end, generalized from the
//! teacher's `VhostUserFrontendDevice` (single memory region, `Frontend`
//! connect/negotiate/set-mem-table/per-queue-setup) to an arbitrary number
//! of queues instead of a fixed RX/TX pair.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::time::Duration;

use nix::libc;
use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost::vhost_user::{Frontend, VhostUserFrontend};
use vhost::{VhostBackend, VhostUserMemoryRegionInfo, VringConfigData};
use vm_memory::{
    Bytes, FileOffset, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MemoryRegionAddress,
};

use super::virtqueue::VirtqueueDriver;

const MEM_SIZE: usize = 4 * 1024 * 1024;
const VIRTIO_F_VERSION_1: u64 = 1 << 32;

pub struct TestFrontend {
    frontend: Frontend,
    mem: GuestMemoryMmap,
    queues: Vec<VirtqueueDriver>,
    buf_region_start: u64,
    next_buf: u64,
}

impl TestFrontend {
    /// Connect to `socket_path` and set up `num_queues` virtqueues of
    /// `queue_size` descriptors each. Queue memory is laid out contiguously
    /// starting at address 0; buffers are allocated from a separate region
    /// starting at `buf_region_start`.
    pub fn connect(socket_path: &str, num_queues: usize, queue_size: u16) -> io::Result<Self> {
        let memfd = unsafe {
            let fd = libc::memfd_create(c"roadtest-backend-test-mem".as_ptr(), libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            File::from_raw_fd(fd)
        };
        memfd.set_len(MEM_SIZE as u64)?;

        let mmap_region = vm_memory::MmapRegion::from_file(FileOffset::new(memfd, 0), MEM_SIZE)
            .map_err(|e| io::Error::other(format!("mmap region: {e:?}")))?;
        let region = GuestRegionMmap::new(mmap_region, GuestAddress(0))
            .ok_or_else(|| io::Error::other("guest region creation failed"))?;
        let mem = GuestMemoryMmap::from_regions(vec![region])
            .map_err(|e| io::Error::other(format!("guest memory creation failed: {e:?}")))?;

        let mut offset = 0u64;
        let mut queues = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            let mut q = VirtqueueDriver::new(queue_size, offset)?;
            q.init(&mem)?;
            offset += VirtqueueDriver::total_size(queue_size);
            queues.push(q);
        }
        // Round the buffer region up well past the last queue's rings.
        let buf_region_start = (offset + 0xffff) & !0xffff;

        let frontend = Frontend::connect(socket_path, num_queues as u64)
            .map_err(|e| io::Error::other(format!("connect: {e:?}")))?;

        Ok(Self {
            frontend,
            mem,
            queues,
            buf_region_start,
            next_buf: 0,
        })
    }

    pub fn setup(&mut self) -> io::Result<()> {
        let features = self
            .frontend
            .get_features()
            .map_err(|e| io::Error::other(format!("get_features: {e:?}")))?;
        let negotiated = features & (VIRTIO_F_VERSION_1 | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits());
        self.frontend
            .set_features(negotiated)
            .map_err(|e| io::Error::other(format!("set_features: {e:?}")))?;
        self.frontend
            .set_owner()
            .map_err(|e| io::Error::other(format!("set_owner: {e:?}")))?;

        let proto_features = self
            .frontend
            .get_protocol_features()
            .map_err(|e| io::Error::other(format!("get_protocol_features: {e:?}")))?;
        self.frontend
            .set_protocol_features(proto_features & VhostUserProtocolFeatures::CONFIG)
            .map_err(|e| io::Error::other(format!("set_protocol_features: {e:?}")))?;

        let region = self.mem.iter().next().unwrap();
        let host_addr = region.get_host_address(MemoryRegionAddress(0)).unwrap() as u64;
        let mem_region = VhostUserMemoryRegionInfo {
            guest_phys_addr: region.start_addr().0,
            memory_size: region.len(),
            userspace_addr: host_addr,
            mmap_offset: 0,
            mmap_handle: region.file_offset().unwrap().file().as_raw_fd(),
        };
        self.frontend
            .set_mem_table(&[mem_region])
            .map_err(|e| io::Error::other(format!("set_mem_table: {e:?}")))?;
        std::thread::sleep(Duration::from_millis(50));

        for idx in 0..self.queues.len() {
            self.setup_queue(idx)?;
            self.frontend
                .set_vring_enable(idx, true)
                .map_err(|e| io::Error::other(format!("set_vring_enable({idx}): {e:?}")))?;
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    fn setup_queue(&self, idx: usize) -> io::Result<()> {
        let queue = &self.queues[idx];
        self.frontend
            .set_vring_num(idx, queue.size())
            .map_err(|e| io::Error::other(format!("set_vring_num: {e:?}")))?;

        let region = self.mem.iter().next().unwrap();
        let host_base = region.get_host_address(MemoryRegionAddress(0)).unwrap() as u64;
        let guest_base = region.start_addr().0;

        let config = VringConfigData {
            queue_max_size: queue.size(),
            queue_size: queue.size(),
            flags: 0,
            desc_table_addr: host_base + (queue.desc_addr() - guest_base),
            used_ring_addr: host_base + (queue.used_addr() - guest_base),
            avail_ring_addr: host_base + (queue.avail_addr() - guest_base),
            log_addr: None,
        };
        self.frontend
            .set_vring_addr(idx, &config)
            .map_err(|e| io::Error::other(format!("set_vring_addr: {e:?}")))?;
        self.frontend
            .set_vring_base(idx, 0)
            .map_err(|e| io::Error::other(format!("set_vring_base: {e:?}")))?;
        self.frontend
            .set_vring_kick(idx, queue.kick_fd())
            .map_err(|e| io::Error::other(format!("set_vring_kick: {e:?}")))?;
        self.frontend
            .set_vring_call(idx, queue.call_fd())
            .map_err(|e| io::Error::other(format!("set_vring_call: {e:?}")))?;
        Ok(())
    }

    /// Allocate `len` bytes in the buffer region and return its guest
    /// address, 64-byte aligned so adjacent allocations never overlap.
    fn alloc_buf(&mut self, len: usize) -> u64 {
        let addr = self.buf_region_start + self.next_buf;
        self.next_buf += ((len as u64) + 63) & !63;
        addr
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<u64> {
        let addr = self.alloc_buf(data.len().max(1));
        self.mem
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| io::Error::other(format!("write_bytes: {e:?}")))?;
        Ok(addr)
    }

    pub fn reserve_in_buf(&mut self, len: usize) -> u64 {
        self.alloc_buf(len)
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.mem
            .read_slice(&mut buf, GuestAddress(addr))
            .map_err(|e| io::Error::other(format!("read_bytes: {e:?}")))?;
        Ok(buf)
    }

    /// Post a descriptor chain on queue `idx` and kick the backend.
    pub fn submit(&mut self, idx: usize, out: &[(u64, u32)], in_: &[(u64, u32)], token: u64) -> io::Result<u16> {
        let head = self.queues[idx].add_chain(&self.mem, out, in_, token)?;
        self.queues[idx].kick()?;
        Ok(head)
    }

    pub fn pop_used(&mut self, idx: usize) -> io::Result<Option<super::virtqueue::UsedBuffer>> {
        self.queues[idx].pop_used(&self.mem)
    }

    pub fn wait_for_used(&self, idx: usize, timeout_ms: u64) -> io::Result<bool> {
        super::virtqueue::wait_for_call(self.queues[idx].call_fd(), timeout_ms)
    }
}
