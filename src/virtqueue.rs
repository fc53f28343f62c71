//! Drained virtqueue requests, independent of which device queue produced
//! them. Device handlers (`devices::i2c`, `devices::gpio`,
//! `devices::platform`) pop a descriptor chain via `virtio_queue::QueueT`,
//! classify it into this module's `VqElement`, hand the element's payload to
//! the script bridge, and push the result back — mirroring the
//! pop/process/push shape of `VhostNetBackend::process_tx`/`process_rx` in
//! the teacher, generalized from a packet to an arbitrary out/in
//! scatter-gather request (spec.md §4.2).

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::error::RequestError;

/// One descriptor: its guest address and length.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub addr: GuestAddress,
    pub len: u32,
}

/// A single request drained from a virtqueue's available ring, split into
/// device-readable (`out`, guest→host) and device-writable (`in_`,
/// host→guest) scatter-gather lists. Chain order within each group is
/// preserved, per spec.md §4.2.
#[derive(Debug, Clone)]
pub struct VqElement {
    pub head_index: u16,
    pub out: Vec<IoVec>,
    pub in_: Vec<IoVec>,
}

impl VqElement {
    pub fn out_num(&self) -> usize {
        self.out.len()
    }

    pub fn in_num(&self) -> usize {
        self.in_.len()
    }

    pub fn out_len(&self) -> usize {
        self.out.iter().map(|v| v.len as usize).sum()
    }

    pub fn in_len(&self) -> usize {
        self.in_.iter().map(|v| v.len as usize).sum()
    }

    /// Read all `out` vectors concatenated into one buffer.
    pub fn read_out(&self, mem: &GuestMemoryMmap) -> Result<Vec<u8>, RequestError> {
        let mut buf = vec![0u8; self.out_len()];
        let mut offset = 0;
        for iov in &self.out {
            let len = iov.len as usize;
            mem.read_exact(&mut buf[offset..offset + len], iov.addr)
                .map_err(|_| RequestError::InvalidGpa)?;
            offset += len;
        }
        Ok(buf)
    }

    /// Read a single `out` vector by index (I2C's header lives in
    /// `out_sg[0]`, platform's in `out_sg[0]`/`out_sg[1]`).
    pub fn read_out_at(&self, mem: &GuestMemoryMmap, index: usize) -> Result<Vec<u8>, RequestError> {
        let iov = self
            .out
            .get(index)
            .ok_or_else(|| RequestError::Malformed(format!("missing out vector {index}")))?;
        let mut buf = vec![0u8; iov.len as usize];
        mem.read_exact(&mut buf, iov.addr)
            .map_err(|_| RequestError::InvalidGpa)?;
        Ok(buf)
    }

    /// Write `data` across the `in` vectors in order, stopping once `data`
    /// is exhausted. Returns the number of bytes actually written.
    pub fn write_in(&self, mem: &GuestMemoryMmap, data: &[u8]) -> Result<usize, RequestError> {
        let mut written = 0;
        for iov in &self.in_ {
            if written >= data.len() {
                break;
            }
            let take = std::cmp::min(iov.len as usize, data.len() - written);
            mem.write_slice(&data[written..written + take], iov.addr)
                .map_err(|_| RequestError::InvalidGpa)?;
            written += take;
        }
        Ok(written)
    }

    /// Write a single status byte into the `in` vector at `index`.
    pub fn write_status_at(
        &self,
        mem: &GuestMemoryMmap,
        index: usize,
        status: u8,
    ) -> Result<(), RequestError> {
        let iov = self
            .in_
            .get(index)
            .ok_or_else(|| RequestError::Malformed(format!("missing in vector {index}")))?;
        mem.write_slice(&[status], iov.addr)
            .map_err(|_| RequestError::InvalidGpa)?;
        Ok(())
    }

    /// Write `data` into the `in` vector at `index` only (used for platform
    /// MMIO reads, which have exactly one `in` vector of 4 bytes).
    pub fn write_in_at(
        &self,
        mem: &GuestMemoryMmap,
        index: usize,
        data: &[u8],
    ) -> Result<(), RequestError> {
        let iov = self
            .in_
            .get(index)
            .ok_or_else(|| RequestError::Malformed(format!("missing in vector {index}")))?;
        if (iov.len as usize) < data.len() {
            return Err(RequestError::Malformed("in vector too small".into()));
        }
        mem.write_slice(data, iov.addr)
            .map_err(|_| RequestError::InvalidGpa)?;
        Ok(())
    }
}
