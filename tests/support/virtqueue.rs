//! Guest-side (driver) split-virtqueue implementation for integration tests,
//! adapted from the Linux kernel's virtqueue_add/get_buf algorithm: a
//! free-list of descriptors, descriptor chaining via `VIRTQ_DESC_F_NEXT`,
//! and used-ring polling.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{fence, Ordering};

use vm_memory::{Bytes, GuestAddress, GuestMemory};
use vmm_sys_util::eventfd::EventFd;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4;
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4;
const USED_RING_ELEM: u64 = 8;

#[derive(Clone, Default)]
struct DescState {
    token: u64,
    chain_len: u16,
}

#[derive(Debug)]
pub struct UsedBuffer {
    pub token: u64,
    pub len: u32,
}

pub struct VirtqueueDriver {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    free_head: u16,
    num_free: u16,
    avail_idx_shadow: u16,
    last_used_idx: u16,
    desc_state: Vec<DescState>,
    kick: EventFd,
    call: EventFd,
}

impl VirtqueueDriver {
    pub fn new(size: u16, base_addr: u64) -> io::Result<Self> {
        let desc_addr = base_addr;
        let avail_addr = desc_addr + (size as u64 * DESC_SIZE);
        let avail_size = AVAIL_RING_HEADER + (size as u64 * AVAIL_RING_ELEM) + 2;
        let used_addr = (avail_addr + avail_size + 3) & !3;

        Ok(Self {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            free_head: 0,
            num_free: size,
            avail_idx_shadow: 0,
            last_used_idx: 0,
            desc_state: vec![DescState::default(); size as usize],
            kick: EventFd::new(0).map_err(io::Error::other)?,
            call: EventFd::new(0).map_err(io::Error::other)?,
        })
    }

    pub fn total_size(size: u16) -> u64 {
        let desc_size = size as u64 * DESC_SIZE;
        let avail_size = AVAIL_RING_HEADER + (size as u64 * AVAIL_RING_ELEM) + 2;
        let used_size = USED_RING_HEADER + (size as u64 * USED_RING_ELEM) + 2;
        desc_size + ((avail_size + 3) & !3) + ((used_size + 3) & !3)
    }

    pub fn init<M: GuestMemory>(&mut self, mem: &M) -> io::Result<()> {
        let total = Self::total_size(self.size);
        let zeros = vec![0u8; total as usize];
        mem.write_slice(&zeros, GuestAddress(self.desc_addr))
            .map_err(|e| io::Error::other(format!("zero queue area: {e:?}")))?;

        for i in 0..self.size {
            let next = if i == self.size - 1 { 0 } else { i + 1 };
            let desc_offset = self.desc_addr + (i as u64 * DESC_SIZE) + 14;
            mem.write_obj(next, GuestAddress(desc_offset))
                .map_err(|e| io::Error::other(format!("init free list: {e:?}")))?;
        }

        self.free_head = 0;
        self.num_free = self.size;
        self.avail_idx_shadow = 0;
        self.last_used_idx = 0;
        Ok(())
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }
    pub fn avail_addr(&self) -> u64 {
        self.avail_addr
    }
    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }
    pub fn size(&self) -> u16 {
        self.size
    }
    pub fn kick_fd(&self) -> &EventFd {
        &self.kick
    }
    pub fn call_fd(&self) -> &EventFd {
        &self.call
    }

    /// Post a descriptor chain: `out_bufs` are device-readable, `in_bufs`
    /// are device-writable, in that order, and `token` is returned verbatim
    /// by `pop_used` for the completing chain.
    pub fn add_chain<M: GuestMemory>(
        &mut self,
        mem: &M,
        out_bufs: &[(u64, u32)],
        in_bufs: &[(u64, u32)],
        token: u64,
    ) -> io::Result<u16> {
        let total = out_bufs.len() + in_bufs.len();
        if total == 0 || total > self.num_free as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad chain length"));
        }

        let head = self.free_head;
        let mut desc_idx = head;
        let mut prev_idx = head;

        for (i, &(addr, len)) in out_bufs.iter().enumerate() {
            let is_last = i == out_bufs.len() - 1 && in_bufs.is_empty();
            self.write_desc(mem, desc_idx, addr, len, false, !is_last)?;
            prev_idx = desc_idx;
            if !is_last {
                desc_idx = self.read_desc_next(mem, desc_idx)?;
            }
        }
        for (i, &(addr, len)) in in_bufs.iter().enumerate() {
            let is_last = i == in_bufs.len() - 1;
            self.write_desc(mem, desc_idx, addr, len, true, !is_last)?;
            prev_idx = desc_idx;
            if !is_last {
                desc_idx = self.read_desc_next(mem, desc_idx)?;
            }
        }

        self.free_head = self.read_desc_next(mem, prev_idx)?;
        self.num_free -= total as u16;
        self.desc_state[head as usize] = DescState {
            token,
            chain_len: total as u16,
        };

        let avail_idx = self.avail_idx_shadow % self.size;
        let ring_offset = self.avail_addr + AVAIL_RING_HEADER + (avail_idx as u64 * AVAIL_RING_ELEM);
        mem.write_obj(head, GuestAddress(ring_offset))
            .map_err(|e| io::Error::other(format!("write avail ring: {e:?}")))?;

        fence(Ordering::SeqCst);
        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        mem.write_obj(self.avail_idx_shadow, GuestAddress(self.avail_addr + 2))
            .map_err(|e| io::Error::other(format!("write avail idx: {e:?}")))?;

        Ok(head)
    }

    fn write_desc<M: GuestMemory>(
        &self,
        mem: &M,
        idx: u16,
        addr: u64,
        len: u32,
        write: bool,
        has_next: bool,
    ) -> io::Result<()> {
        let desc_offset = self.desc_addr + (idx as u64 * DESC_SIZE);
        let mut flags: u16 = 0;
        if write {
            flags |= VIRTQ_DESC_F_WRITE;
        }
        if has_next {
            flags |= VIRTQ_DESC_F_NEXT;
        }
        mem.write_obj(addr, GuestAddress(desc_offset))
            .map_err(|e| io::Error::other(format!("write desc addr: {e:?}")))?;
        mem.write_obj(len, GuestAddress(desc_offset + 8))
            .map_err(|e| io::Error::other(format!("write desc len: {e:?}")))?;
        mem.write_obj(flags, GuestAddress(desc_offset + 12))
            .map_err(|e| io::Error::other(format!("write desc flags: {e:?}")))?;
        Ok(())
    }

    fn read_desc_next<M: GuestMemory>(&self, mem: &M, idx: u16) -> io::Result<u16> {
        let desc_offset = self.desc_addr + (idx as u64 * DESC_SIZE) + 14;
        mem.read_obj(GuestAddress(desc_offset))
            .map_err(|e| io::Error::other(format!("read desc next: {e:?}")))
    }

    pub fn pop_used<M: GuestMemory>(&mut self, mem: &M) -> io::Result<Option<UsedBuffer>> {
        let used_idx: u16 = mem
            .read_obj(GuestAddress(self.used_addr + 2))
            .map_err(|e| io::Error::other(format!("read used idx: {e:?}")))?;
        if used_idx == self.last_used_idx {
            return Ok(None);
        }

        fence(Ordering::SeqCst);
        let ring_idx = self.last_used_idx % self.size;
        let elem_offset = self.used_addr + USED_RING_HEADER + (ring_idx as u64 * USED_RING_ELEM);
        let id: u32 = mem
            .read_obj(GuestAddress(elem_offset))
            .map_err(|e| io::Error::other(format!("read used id: {e:?}")))?;
        let len: u32 = mem
            .read_obj(GuestAddress(elem_offset + 4))
            .map_err(|e| io::Error::other(format!("read used len: {e:?}")))?;

        let head = id as u16;
        let state = self.desc_state[head as usize].clone();
        self.return_chain(mem, head, state.chain_len)?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        Ok(Some(UsedBuffer { token: state.token, len }))
    }

    fn return_chain<M: GuestMemory>(&mut self, mem: &M, head: u16, count: u16) -> io::Result<()> {
        let mut tail = head;
        for _ in 0..count - 1 {
            tail = self.read_desc_next(mem, tail)?;
        }
        let tail_next_offset = self.desc_addr + (tail as u64 * DESC_SIZE) + 14;
        mem.write_obj(self.free_head, GuestAddress(tail_next_offset))
            .map_err(|e| io::Error::other(format!("write free link: {e:?}")))?;
        self.free_head = head;
        self.num_free += count;
        Ok(())
    }

    pub fn kick(&self) -> io::Result<()> {
        self.kick.write(1).map_err(io::Error::other)
    }
}

/// Block on `call`'s eventfd, with a timeout, for the guest-visible
/// notification the device sends after pushing a used buffer.
pub fn wait_for_call(call: &EventFd, timeout_ms: u64) -> io::Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::unix::io::BorrowedFd;

    let borrowed = unsafe { BorrowedFd::borrow_raw(call.as_raw_fd()) };
    let poll_fd = PollFd::new(borrowed, PollFlags::POLLIN);
    let result = poll(&mut [poll_fd], PollTimeout::try_from(timeout_ms).unwrap()).map_err(io::Error::other)?;
    if result > 0 {
        let _ = call.read();
        Ok(true)
    } else {
        Ok(false)
    }
}
