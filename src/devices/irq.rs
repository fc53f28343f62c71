//! Parked GPIO interrupt descriptors (spec.md §3 `IrqSlot`).
//!
//! The guest driver posts one descriptor per watched line on the event
//! virtqueue and then waits; nothing completes it until the chip model raises
//! an edge. When `trigger_gpio_irq(pin)` runs on the script thread, it needs
//! to complete that descriptor directly, without bouncing back through the
//! GPIO device's own I/O thread. `VhostNetBackend` solves the identical
//! problem for injected packets by keeping `vrings: RwLock<Option<Vec<VringRwLock>>>`
//! alongside a `SegQueue<RxItem>` and calling `inject_buffer_and_deliver`
//! straight from the reactor (`dataplane/vhost.rs`); this module is that
//! pattern, scoped to one descriptor per GPIO line instead of a packet queue.

use std::collections::HashMap;
use std::sync::Mutex;

use vhost_user_backend::{VringRwLock, VringT};
use virtio_queue::QueueT;

use crate::error::FatalError;
use crate::mem::MemTable;
use crate::virtqueue::IoVec;

/// `virtio_gpio_irq_response.status` values (upstream UAPI), spec.md §8
/// scenario 3.
pub const IRQ_STATUS_INVALID: u8 = 0x0;
pub const IRQ_STATUS_VALID: u8 = 0x1;

/// One guest descriptor parked on the GPIO event queue, waiting for an edge.
pub struct ParkedIrq {
    pub vring: VringRwLock,
    pub mem: MemTable,
    pub head_index: u16,
    pub in_vec: IoVec,
}

/// Registry of parked IRQ descriptors, keyed by GPIO line number. Shared
/// between the GPIO device thread (which parks/unparks on queue activity)
/// and the script thread (which completes a parked descriptor when the
/// model raises an edge).
#[derive(Default)]
pub struct IrqRegistry {
    parked: Mutex<HashMap<u32, ParkedIrq>>,
}

impl IrqRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a descriptor for `pin`. A line can have only one descriptor
    /// parked at a time; parking over an existing one replaces it and
    /// returns the displaced entry so the caller can fail it back to the
    /// guest instead of silently losing it.
    pub fn park(&self, pin: u32, parked: ParkedIrq) -> Option<ParkedIrq> {
        self.parked.lock().unwrap().insert(pin, parked)
    }

    pub fn is_parked(&self, pin: u32) -> bool {
        self.parked.lock().unwrap().contains_key(&pin)
    }

    /// Complete the parked descriptor for `pin` with an edge event, writing
    /// `VIRTIO_GPIO_IRQ_STATUS_VALID` into its single `in` descriptor and
    /// notifying the guest. Returns `Ok(false)` if nothing was parked for
    /// `pin` — the model raised an edge on a line the guest isn't watching,
    /// which is not an error (spec.md §4.4: unmasked-but-unwatched lines drop
    /// the event).
    pub fn trigger(&self, pin: u32) -> Result<bool, FatalError> {
        self.complete(pin, IRQ_STATUS_VALID)
    }

    /// Complete the parked descriptor for `pin` (if any) with
    /// `VIRTIO_GPIO_IRQ_STATUS_INVALID`, per spec.md §4.4/§8: the driver
    /// disarming a line (`IRQ_TYPE=NONE`) must get its parked descriptor
    /// back rather than have it dropped. A no-op when nothing is parked.
    pub fn fail_invalid(&self, pin: u32) -> Result<bool, FatalError> {
        self.complete(pin, IRQ_STATUS_INVALID)
    }

    fn complete(&self, pin: u32, status: u8) -> Result<bool, FatalError> {
        let parked = match self.parked.lock().unwrap().remove(&pin) {
            Some(p) => p,
            None => return Ok(false),
        };

        let mem = parked.mem.memory();

        {
            use vm_memory::Bytes;
            mem.write_slice(&[status], parked.in_vec.addr)
                .map_err(|e| FatalError::MalformedVirtqueue(e.to_string()))?;
        }

        {
            let mut vring_state = parked.vring.get_mut();
            vring_state
                .get_queue_mut()
                .add_used(&mem, parked.head_index, 1)
                .map_err(|e| FatalError::MalformedVirtqueue(e.to_string()))?;
        }

        parked
            .vring
            .signal_used_queue()
            .map_err(|e| FatalError::MalformedVirtqueue(e.to_string()))?;

        Ok(true)
    }
}
