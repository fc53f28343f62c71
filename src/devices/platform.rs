//! Platform/PCI-MMIO backend (spec.md §4.2). A single request queue carries
//! MMIO read/write traps from the in-kernel platform driver: an out header
//! of `{offset: u64, len: u8, is_write: u8, value: u64}` and a trailing in
//! status byte, with a 8-byte in payload for reads. Same pop/process/push
//! shape as `devices::i2c`, generalized to an address/length/value triple
//! instead of a fixed I2C header.

use std::io;
use std::sync::RwLock;

use tracing::{trace, warn};
use vhost::vhost_user::message::VhostUserProtocolFeatures;
use vhost_user_backend::{VhostUserBackend, VringRwLock, VringT};
use virtio_queue::QueueT;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::event::{new_event_consumer_and_notifier, EventConsumer, EventFlag, EventNotifier};

use crate::error::RequestError;
use crate::mem::MemTable;
use crate::script::{ScriptBridge, ScriptJob};
use crate::virtqueue::{IoVec, VqElement};

const REQUEST_QUEUE: u16 = 0;

pub struct PlatformBackend {
    mem: RwLock<GuestMemoryAtomic<GuestMemoryMmap>>,
    mem_table: MemTable,
    event_idx: RwLock<bool>,
    script: ScriptBridge,
    exit_event: (EventConsumer, EventNotifier),
}

impl PlatformBackend {
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

    fn process_one(&self, mem: &GuestMemoryMmap, head_index: u16, out: &[IoVec], in_: &[IoVec]) -> u32 {
        let elem = VqElement {
            head_index,
            out: out.to_vec(),
            in_: in_.to_vec(),
        };

        let hdr = match elem.read_out_at(mem, 0) {
            Ok(h) if h.len() >= 18 => h,
            _ => return write_status_only(mem, &elem, RequestError::STATUS_ERR),
        };
        let offset = u64::from_le_bytes(hdr[0..8].try_into().unwrap());
        let len = hdr[8];
        let is_write = hdr[9] != 0;
        let value = u64::from_le_bytes(hdr[10..18].try_into().unwrap());

        if is_write {
            match self
                .script
                .call(|reply| ScriptJob::PlatformWrite { offset, len, value, reply })
            {
                Ok(()) => write_status_only(mem, &elem, RequestError::STATUS_OK),
                Err(e) => {
                    warn!(offset, error = %e, "platform write failed");
                    write_status_only(mem, &elem, e.status_byte())
                }
            }
        } else {
            match self.script.call(|reply| ScriptJob::PlatformRead { offset, len, reply }) {
                Ok(read_value) => {
                    let _ = elem.write_status_at(mem, 0, RequestError::STATUS_OK);
                    let _ = elem.write_in_at(mem, 1, &read_value.to_le_bytes());
                    1 + 8
                }
                Err(e) => {
                    warn!(offset, error = %e, "platform read failed");
                    write_status_only(mem, &elem, e.status_byte())
                }
            }
        }
    }
}

fn write_status_only(mem: &GuestMemoryMmap, elem: &VqElement, status: u8) -> u32 {
    let _ = elem.write_status_at(mem, 0, status);
    1
}

impl VhostUserBackend for PlatformBackend {
    type Bitmap = ();
    type Vring = VringRwLock;

    fn num_queues(&self) -> usize {
        1
    }

    fn max_queue_size(&self) -> usize {
        256
    }

    fn features(&self) -> u64 {
        const VIRTIO_F_VERSION_1: u64 = 1 << 32;
        const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
        const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;
        const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 1 << 30;
        VIRTIO_F_VERSION_1 | VIRTIO_F_RING_INDIRECT_DESC | VIRTIO_RING_F_EVENT_IDX | VHOST_USER_F_PROTOCOL_FEATURES
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
        trace!(device_event, "platform queue kick");
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
