//! `ScriptJob` — the unit of cooperative re-entry into the interpreter
//! (SPEC_FULL.md §3). Device threads build one of these per request and
//! block on `reply` for the result; the script thread is the only thread
//! that ever calls into `script::engine::ScriptEngine`.

use crossbeam_channel::Sender;

use crate::error::RequestError;

/// Which loaded model surface a control-channel `load`/`call` line targets
/// (SPEC_FULL.md §4.9). Also used to pick the surface for device-originated
/// `ScriptJob`s below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSurface {
    I2c,
    Gpio,
    Platform,
}

impl ModelSurface {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "i2c" => Some(Self::I2c),
            "gpio" => Some(Self::Gpio),
            "platform" => Some(Self::Platform),
            _ => None,
        }
    }

}

pub enum ScriptJob {
    I2cRead {
        addr: u16,
        len: usize,
        reply: Sender<Result<Vec<u8>, RequestError>>,
    },
    I2cWrite {
        addr: u16,
        data: Vec<u8>,
        reply: Sender<Result<(), RequestError>>,
    },
    GpioSetValue {
        pin: u32,
        value: bool,
        reply: Sender<Result<(), RequestError>>,
    },
    GpioSetIrqType {
        pin: u32,
        irq_type: u32,
        reply: Sender<Result<(), RequestError>>,
    },
    GpioUnmask {
        pin: u32,
        reply: Sender<Result<(), RequestError>>,
    },
    PlatformRead {
        offset: u64,
        len: u8,
        reply: Sender<Result<u64, RequestError>>,
    },
    PlatformWrite {
        offset: u64,
        len: u8,
        value: u64,
        reply: Sender<Result<(), RequestError>>,
    },
}
