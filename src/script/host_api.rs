//! Host callbacks exposed into the embedded interpreter as the `host`
//! object chip models call out through: `host.trigger_gpio_irq(pin)`,
//! `host.dma_read(gpa, len)`, `host.dma_write(gpa, data)` (spec.md §3 `Model`
//! entity, "models call back into the host for DMA and IRQ injection"). None
//! of the teacher's crates touch an embedded language, so this module's
//! shape is grounded in `pyo3`'s own `#[pyclass]`/`#[pymethods]` idiom rather
//! than any one file in the pack; the cross-thread IRQ completion it wraps
//! reuses `devices::irq::IrqRegistry`, which is itself grounded in
//! `VhostNetBackend`'s `inject_buffer_and_deliver`.

use std::sync::Arc;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::devices::irq::IrqRegistry;
use crate::mem::MemTable;

/// Injected into the script's globals as `host`. Cheap to clone: both fields
/// are already `Arc`-backed shared handles.
#[pyclass]
#[derive(Clone)]
pub struct HostApi {
    mem: MemTable,
    gpio_irqs: Arc<IrqRegistry>,
}

impl HostApi {
    pub fn new(mem: MemTable, gpio_irqs: Arc<IrqRegistry>) -> Self {
        Self { mem, gpio_irqs }
    }
}

#[pymethods]
impl HostApi {
    /// Raise a GPIO line's interrupt, completing its parked descriptor with
    /// status VALID. Delivers immediately if the guest has a descriptor
    /// parked for `pin`; otherwise the edge is dropped, per spec.md §4.4.
    fn trigger_gpio_irq(&self, pin: u32) -> PyResult<bool> {
        self.gpio_irqs
            .trigger(pin)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    /// Read `len` bytes of guest memory at guest physical address `gpa`.
    fn dma_read(&self, gpa: u64, len: usize) -> PyResult<Vec<u8>> {
        self.mem
            .dma_read(gpa, len)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    /// Write `data` into guest memory at guest physical address `gpa`.
    fn dma_write(&self, gpa: u64, data: Vec<u8>) -> PyResult<()> {
        self.mem
            .dma_write(gpa, &data)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }
}
