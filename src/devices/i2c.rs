//! virtio-i2c backend (spec.md §4.3). One request virtqueue; each request is
//! an out header (7-bit address + flags), an optional out payload (write
//! data), an optional in payload (read data), and a trailing in status byte.
//! Structurally this is `VhostNetBackend`'s TX/RX pop-process-push loop
//! (`dataplane/vhost.rs`) collapsed onto a single queue, with the "process"
//! step being a blocking round trip to the script thread instead of a
//! routing callback.

use std::io;
use std::sync::RwLock;

use tracing::{debug, trace, warn};
use vhost::vhost_user::message::VhostUserProtocolFeatures;
use vhost_user_backend::{VhostUserBackend, VringRwLock, VringT};
use virtio_queue::QueueT;
use vm_memory::{ByteValued, GuestMemoryAtomic, GuestMemoryMmap, Le16, Le32};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::event::{new_event_consumer_and_notifier, EventConsumer, EventFlag, EventNotifier};

use crate::error::RequestError;
use crate::mem::MemTable;
use crate::script::{ScriptBridge, ScriptJob};
use crate::virtqueue::IoVec;

const REQUEST_QUEUE: u16 = 0;

const VIRTIO_I2C_FLAGS_READ: u32 = 1 << 0;

const VIRTIO_F_VERSION_1: u64 = 1 << 32;
const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;
const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 1 << 30;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct I2cOutHdr {
    addr: Le16,
    padding: Le16,
    flags: Le32,
}

// SAFETY: I2cOutHdr contains only POD types.
unsafe impl ByteValued for I2cOutHdr {}

pub struct I2cBackend {
    mem: RwLock<GuestMemoryAtomic<GuestMemoryMmap>>,
    mem_table: MemTable,
    event_idx: RwLock<bool>,
    script: ScriptBridge,
    exit_event: (EventConsumer, EventNotifier),
}

impl I2cBackend {
    pub fn new(mem_table: MemTable, script: ScriptBridge) -> io::Result<Self> {
        let exit_event = new_event_consumer_and_notifier(EventFlag::NONBLOCK)?;
        Ok(Self {
            mem: RwLock::new(GuestMemoryAtomic::new(GuestMemoryMmap::new())),
            mem_table,
            event_idx: RwLock::new(false),
            script,
            exit_event,
        })
    }

    fn process_requests(&self, vring: &VringRwLock) -> io::Result<bool> {
        let mem_guard = self.mem.read().unwrap();
        let mem = mem_guard.memory();
        let mut processed = 0u32;

        loop {
            let mut vring_state = vring.get_mut();
            let queue = vring_state.get_queue_mut();

            let avail_desc = match queue.pop_descriptor_chain(mem.clone()) {
                Some(desc) => desc,
                None => break,
            };
            let head_index = avail_desc.head_index();

            let mut out = Vec::new();
            let mut in_ = Vec::new();
            for desc in avail_desc.clone() {
                let iov = IoVec {
                    addr: desc.addr(),
                    len: desc.len(),
                };
                if desc.is_write_only() {
                    in_.push(iov);
                } else {
                    out.push(iov);
                }
            }
            drop(vring_state);

            let used_len = self.process_one(&mem, head_index, &out, &in_);

            let mut vring_state = vring.get_mut();
            let queue = vring_state.get_queue_mut();
            queue
                .add_used(&mem, head_index, used_len)
                .map_err(|e| io::Error::other(format!("failed to add used: {e}")))?;
            processed += 1;

            let more_work = queue
                .enable_notification(&mem)
                .map_err(|e| io::Error::other(format!("failed to enable notification: {e}")))?;
            if !more_work {
                break;
            }
        }

        if processed == 0 {
            return Ok(false);
        }

        let mut vring_state = vring.get_mut();
        let needs_notification = vring_state
            .get_queue_mut()
            .needs_notification(&mem)
            .map_err(|e| io::Error::other(format!("failed to check needs_notification: {e}")))?;
        Ok(needs_notification)
    }

    /// Run one I2C request end to end, returning the number of bytes written
    /// into the `in` descriptors (including the trailing status byte).
    fn process_one(&self, mem: &GuestMemoryMmap, head_index: u16, out: &[IoVec], in_: &[IoVec]) -> u32 {
        let elem = crate::virtqueue::VqElement {
            head_index,
            out: out.to_vec(),
            in_: in_.to_vec(),
        };

        let hdr_bytes = match elem.read_out_at(mem, 0) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "i2c request missing header");
                return write_status_only(mem, &elem, RequestError::Malformed("missing header".into()).status_byte());
            }
        };
        if hdr_bytes.len() < std::mem::size_of::<I2cOutHdr>() {
            return write_status_only(mem, &elem, RequestError::STATUS_ERR);
        }
        let addr = u16::from_le_bytes([hdr_bytes[0], hdr_bytes[1]]) & 0x7f;
        let flags = u32::from_le_bytes([hdr_bytes[4], hdr_bytes[5], hdr_bytes[6], hdr_bytes[7]]);
        let is_read = flags & VIRTIO_I2C_FLAGS_READ != 0;

        debug!(addr, is_read, "dispatching i2c request to script");

        let result: Result<Vec<u8>, RequestError> = if is_read {
            let read_len = elem.in_len().saturating_sub(1);
            self.script
                .call(|reply| ScriptJob::I2cRead { addr, len: read_len, reply })
        } else {
            let data = match elem.read_out_at(mem, 1) {
                Ok(d) => d,
                Err(_) => Vec::new(),
            };
            self.script
                .call(|reply| ScriptJob::I2cWrite { addr, data, reply })
                .map(|_| Vec::new())
        };

        match result {
            Ok(payload) if is_read => {
                let written = elem.write_in(mem, &payload).unwrap_or(0);
                let status_index = elem.in_num().saturating_sub(1);
                let _ = elem.write_status_at(mem, status_index, RequestError::STATUS_OK);
                (written + 1) as u32
            }
            Ok(_) => write_status_only(mem, &elem, RequestError::STATUS_OK),
            Err(e) => {
                warn!(addr, error = %e, "i2c request failed");
                write_status_only(mem, &elem, e.status_byte())
            }
        }
    }
}

fn write_status_only(mem: &GuestMemoryMmap, elem: &crate::virtqueue::VqElement, status: u8) -> u32 {
    let index = elem.in_num().saturating_sub(1);
    let _ = elem.write_status_at(mem, index, status);
    1
}

impl VhostUserBackend for I2cBackend {
    type Bitmap = ();
    type Vring = VringRwLock;

    fn num_queues(&self) -> usize {
        1
    }

    fn max_queue_size(&self) -> usize {
        256
    }

    fn features(&self) -> u64 {
        VIRTIO_F_VERSION_1
            | VIRTIO_F_RING_INDIRECT_DESC
            | VIRTIO_RING_F_EVENT_IDX
            | VHOST_USER_F_PROTOCOL_FEATURES
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::REPLY_ACK
    }

    fn set_event_idx(&self, enabled: bool) {
        *self.event_idx.write().unwrap() = enabled;
    }

    fn update_memory(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> io::Result<()> {
        self.mem_table.update(mem.clone());
        *self.mem.write().unwrap() = mem;
        Ok(())
    }

    fn handle_event(
        &self,
        device_event: u16,
        evset: EventSet,
        vrings: &[Self::Vring],
        _thread_id: usize,
    ) -> io::Result<()> {
        if evset != EventSet::IN {
            return Ok(());
        }
        trace!(device_event, "i2c queue kick");
        if device_event == REQUEST_QUEUE && self.process_requests(&vrings[REQUEST_QUEUE as usize])? {
            vrings[REQUEST_QUEUE as usize]
                .signal_used_queue()
                .map_err(|e| io::Error::other(format!("failed to signal: {e}")))?;
        }
        Ok(())
    }

    fn get_config(&self, _offset: u32, _size: u32) -> Vec<u8> {
        Vec::new()
    }

    fn exit_event(&self, _thread_index: usize) -> Option<(EventConsumer, EventNotifier)> {
        Some((
            self.exit_event.0.try_clone().expect("failed to clone EventConsumer"),
            self.exit_event.1.try_clone().expect("failed to clone EventNotifier"),
        ))
    }
}
