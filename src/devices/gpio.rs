//! virtio-gpio backend (spec.md §4.4). Two queues: a request queue for
//! `IRQ_TYPE`/`GET_DIRECTION`/`SET_VALUE` commands (round trip through the
//! script, same shape as `devices::i2c`) and an interrupt queue the guest
//! parks buffers on ahead of time, completed out-of-band by
//! `devices::irq::IrqRegistry` when the chip model raises an edge or the
//! driver disarms the line (`IRQ_TYPE=NONE`).

use std::io;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace, warn};
use vhost::vhost_user::message::VhostUserProtocolFeatures;
use vhost_user_backend::{VhostUserBackend, VringRwLock, VringT};
use virtio_queue::QueueT;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::event::{new_event_consumer_and_notifier, EventConsumer, EventFlag, EventNotifier};

use crate::devices::irq::{IrqRegistry, ParkedIrq};
use crate::error::RequestError;
use crate::mem::MemTable;
use crate::script::{ScriptBridge, ScriptJob};
use crate::virtqueue::{IoVec, VqElement};

const REQUEST_QUEUE: u16 = 0;
const IRQ_QUEUE: u16 = 1;

/// `virtio_gpio_request.type` values (upstream UAPI), spec.md §4.4.
/// `GET_LINE_NAMES`/`SET_DIRECTION`/`GET_VALUE` exist upstream but aren't in
/// the recognized-type list this device implements.
const VIRTIO_GPIO_MSG_GET_DIRECTION: u16 = 0x0002;
const VIRTIO_GPIO_MSG_SET_VALUE: u16 = 0x0005;
const VIRTIO_GPIO_MSG_IRQ_TYPE: u16 = 0x0006;

/// All lines are emulated as inputs; there is no `SET_DIRECTION` request.
const VIRTIO_GPIO_DIRECTION_IN: u8 = 0x02;

const VIRTIO_GPIO_IRQ_TYPE_NONE: u32 = 0x00;

const NGPIO: u16 = 64;

pub struct GpioBackend {
    mem: RwLock<GuestMemoryAtomic<GuestMemoryMmap>>,
    mem_table: MemTable,
    event_idx: RwLock<bool>,
    script: ScriptBridge,
    irqs: Arc<IrqRegistry>,
    exit_event: (EventConsumer, EventNotifier),
}

impl GpioBackend {
    pub fn new(mem_table: MemTable, script: ScriptBridge, irqs: Arc<IrqRegistry>) -> io::Result<Self> {
        let exit_event = new_event_consumer_and_notifier(EventFlag::NONBLOCK)?;
        Ok(Self {
            mem: RwLock::new(GuestMemoryAtomic::new(GuestMemoryMmap::new())),
            mem_table,
            event_idx: RwLock::new(false),
            script,
            irqs,
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

            let (out, in_) = split_chain(avail_desc);
            drop(vring_state);

            let used_len = self.process_one_request(&mem, head_index, &out, &in_);

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

    /// Parse `virtio_gpio_request { type: u16, gpio: u16, value: u32 }` (8
    /// bytes, upstream UAPI) and dispatch it, replying with
    /// `virtio_gpio_response { status: u8, value: u8 }` (2 bytes).
    fn process_one_request(&self, mem: &GuestMemoryMmap, head_index: u16, out: &[IoVec], in_: &[IoVec]) -> u32 {
        let elem = VqElement {
            head_index,
            out: out.to_vec(),
            in_: in_.to_vec(),
        };

        let hdr = match elem.read_out_at(mem, 0) {
            Ok(h) if h.len() >= 8 => h,
            _ => return write_response(mem, &elem, RequestError::STATUS_ERR, 0),
        };
        let msg_type = u16::from_le_bytes([hdr[0], hdr[1]]);
        let pin = u32::from(u16::from_le_bytes([hdr[2], hdr[3]]));
        let value = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);

        match msg_type {
            VIRTIO_GPIO_MSG_IRQ_TYPE => {
                match self.script.call(|reply| ScriptJob::GpioSetIrqType {
                    pin,
                    irq_type: value,
                    reply,
                }) {
                    Ok(()) => {
                        if value == VIRTIO_GPIO_IRQ_TYPE_NONE {
                            if let Err(e) = self.irqs.fail_invalid(pin) {
                                warn!(pin, error = %e, "failed to complete parked gpio irq as invalid");
                            }
                        }
                        write_response(mem, &elem, RequestError::STATUS_OK, 0)
                    }
                    Err(e) => {
                        warn!(pin, error = %e, "gpio set_irq_type failed");
                        write_response(mem, &elem, e.status_byte(), 0)
                    }
                }
            }
            VIRTIO_GPIO_MSG_SET_VALUE => {
                match self
                    .script
                    .call(|reply| ScriptJob::GpioSetValue { pin, value: value != 0, reply })
                {
                    Ok(()) => write_response(mem, &elem, RequestError::STATUS_OK, 0),
                    Err(e) => {
                        warn!(pin, error = %e, "gpio set_value failed");
                        write_response(mem, &elem, e.status_byte(), 0)
                    }
                }
            }
            VIRTIO_GPIO_MSG_GET_DIRECTION => {
                // Direction is fixed; the model is never consulted.
                write_response(mem, &elem, RequestError::STATUS_OK, VIRTIO_GPIO_DIRECTION_IN)
            }
            _ => write_response(mem, &elem, RequestError::STATUS_ERR, 0),
        }
    }

    /// Park descriptors posted on the interrupt queue, one per watched pin
    /// (spec.md §3 `IrqSlot`). The kernel driver keeps these outstanding
    /// until an edge completes them, so this never calls `add_used` itself —
    /// `IrqRegistry::trigger` does, from the script thread.
    fn process_irq_queue(&self, vring: &VringRwLock) {
        let mem_guard = self.mem.read().unwrap();
        let mem = mem_guard.memory();

        loop {
            let mut vring_state = vring.get_mut();
            let queue = vring_state.get_queue_mut();
            let avail_desc = match queue.pop_descriptor_chain(mem.clone()) {
                Some(desc) => desc,
                None => break,
            };
            let head_index = avail_desc.head_index();
            let (out, in_) = split_chain(avail_desc);
            drop(vring_state);

            let elem = VqElement {
                head_index,
                out,
                in_,
            };
            // virtio_gpio_irq_request { gpio: u16 } (upstream UAPI, 2 bytes).
            let hdr = match elem.read_out_at(&mem, 0) {
                Ok(h) if h.len() >= 2 => h,
                _ => {
                    warn!("malformed gpio irq-queue descriptor, dropping");
                    continue;
                }
            };
            let pin = u32::from(u16::from_le_bytes([hdr[0], hdr[1]]));
            let Some(in_vec) = elem.in_.first().copied() else {
                warn!(pin, "gpio irq-queue descriptor has no writable buffer");
                continue;
            };

            // The driver posting a descriptor here is re-arming the line for
            // its next edge; tell the model so it can clear any latched
            // state (spec.md §4.5 `unmask(pin)`).
            match self.script.call(|reply| ScriptJob::GpioUnmask { pin, reply }) {
                Ok(()) => {}
                Err(e) => warn!(pin, error = %e, "gpio unmask failed"),
            }

            debug!(pin, "parking gpio irq descriptor");
            if let Some(displaced) = self.irqs.park(
                pin,
                ParkedIrq {
                    vring: vring.clone(),
                    mem: self.mem_table.clone(),
                    head_index,
                    in_vec,
                },
            ) {
                // A second descriptor for the same pin displaces the first;
                // fail the displaced one back to the guest rather than lose
                // it silently.
                let mut vring_state = displaced.vring.get_mut();
                let _ = vring_state.get_queue_mut().add_used(&mem, displaced.head_index, 0);
            }
        }
    }
}

fn split_chain<M: vm_memory::GuestMemory + Clone>(
    chain: virtio_queue::DescriptorChain<M>,
) -> (Vec<IoVec>, Vec<IoVec>) {
    let mut out = Vec::new();
    let mut in_ = Vec::new();
    for desc in chain {
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
    (out, in_)
}

/// Write `virtio_gpio_response { status: u8, value: u8 }` (2 bytes,
/// upstream UAPI) into the request's single `in` vector.
fn write_response(mem: &GuestMemoryMmap, elem: &VqElement, status: u8, value: u8) -> u32 {
    let _ = elem.write_in(mem, &[status, value]);
    2
}

impl VhostUserBackend for GpioBackend {
    type Bitmap = ();
    type Vring = VringRwLock;

    fn num_queues(&self) -> usize {
        2
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
        VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::MQ | VhostUserProtocolFeatures::REPLY_ACK
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
        trace!(device_event, "gpio queue kick");
        match device_event {
            REQUEST_QUEUE => {
                if self.process_requests(&vrings[REQUEST_QUEUE as usize])? {
                    vrings[REQUEST_QUEUE as usize]
                        .signal_used_queue()
                        .map_err(|e| io::Error::other(format!("failed to signal: {e}")))?;
                }
            }
            IRQ_QUEUE => {
                self.process_irq_queue(&vrings[IRQ_QUEUE as usize]);
            }
            _ => {}
        }
        Ok(())
    }

    /// `virtio_gpio_config { ngpio: u16, padding: [u8; 2], gpio_names_size: u32 }`
    /// (upstream UAPI, 8 bytes). Line names aren't modeled, so
    /// `gpio_names_size` is always zero.
    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        let mut config = [0u8; 8];
        config[..2].copy_from_slice(&NGPIO.to_le_bytes());

        let start = offset as usize;
        let end = std::cmp::min(start + size as usize, config.len());
        if start < config.len() {
            config[start..end].to_vec()
        } else {
            vec![]
        }
    }

    fn exit_event(&self, _thread_index: usize) -> Option<(EventConsumer, EventNotifier)> {
        Some((
            self.exit_event.0.try_clone().expect("failed to clone EventConsumer"),
            self.exit_event.1.try_clone().expect("failed to clone EventNotifier"),
        ))
    }
}
