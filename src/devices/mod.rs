//! The three vhost-user device personalities (spec.md §2 components), each a
//! `VhostUserBackend` impl running on its own OS thread via
//! `vhost_user_backend::VhostUserDaemon`, mirroring `run_vhost_daemon` in
//! `dataplane/manager.rs`.

pub mod gpio;
pub mod i2c;
pub mod irq;
pub mod platform;

pub use gpio::GpioBackend;
pub use i2c::I2cBackend;
pub use platform::PlatformBackend;
