//! Shared integration-test scaffolding: a guest-side virtqueue driver and a
//! vhost-user frontend connecting to the real device backends, plus the chip
//! model fixture every test loads the script engine with.

pub mod frontend;
pub mod virtqueue;

pub use frontend::TestFrontend;

use std::io::Write;
use std::path::PathBuf;

/// A model script exercising all three device surfaces, matching the
/// literal end-to-end scenarios: I2C register 0x80 on address 0x42 reads
/// back `0x50`, any other I2C write is recorded, GPIO lines read back
/// whatever they were last set to (default low), and platform MMIO echoes
/// back the last value written to a given offset.
pub const MODEL_SCRIPT: &str = r#"
import json


class I2cModel:
    def __init__(self):
        self.writes = []
        self.registers = {}

    def write(self, addr, data):
        self.writes.append((addr, bytes(data)))
        if len(data) >= 1:
            self.registers[(addr, "selected")] = data[0]
        return True

    def read(self, addr, length):
        selected = self.registers.get((addr, "selected"))
        if addr == 0x42 and selected == 0x80:
            return b"\x50" * length
        return bytes(length)


class GpioModel:
    def __init__(self):
        self.values = {}

    def set_value(self, pin, value):
        self.values[pin] = bool(value)
        return True

    def set_irq_type(self, pin, irq_type):
        return True

    def unmask(self, pin):
        return True

    def raise_irq(self, args_json):
        args = json.loads(args_json)
        host.trigger_gpio_irq(args["pin"])
        return True


class PlatformModel:
    def __init__(self):
        self.regs = {}

    def read(self, addr, size):
        return self.regs.get(addr, 0)

    def write(self, addr, size, value):
        self.regs[addr] = value
        return True


class Backend:
    def __init__(self):
        self.i2c = I2cModel()
        self.gpio = GpioModel()
        self.platform = PlatformModel()


backend = Backend()
"#;

/// Write `MODEL_SCRIPT` to a fresh temp file and return its path, keeping
/// the owning `TempDir` alive alongside it.
pub fn write_model_script(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("model.py");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(MODEL_SCRIPT.as_bytes()).unwrap();
    path
}

/// A fresh socket path inside `dir`, not yet bound.
pub fn socket_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}
