//! Command-line surface (SPEC_FULL.md §2 "CLI parsing"), modeled on the
//! `clap::Parser` derive struct in `mvirt-cp/src/main.rs`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "roadtest-backend")]
#[command(about = "vhost-user backend emulating I2C, GPIO, and platform devices for UML driver testing")]
pub struct Cli {
    /// Chip model script defining `backend.i2c`, `backend.gpio`,
    /// `backend.platform`, and optionally `backend.process_control`.
    #[arg(long)]
    pub main_script: PathBuf,

    /// vhost-user socket path for the virtio-i2c device.
    #[arg(long)]
    pub i2c_socket: PathBuf,

    /// vhost-user socket path for the virtio-gpio device.
    #[arg(long)]
    pub gpio_socket: PathBuf,

    /// vhost-user socket path for the platform/PCI-MMIO device.
    #[arg(long)]
    pub pci_socket: PathBuf,

    /// UML kernel binary and its argv, everything after `--`.
    #[arg(last = true, required = true)]
    pub uml_command: Vec<String>,
}

impl Cli {
    pub fn uml_binary(&self) -> &str {
        &self.uml_command[0]
    }

    pub fn uml_args(&self) -> &[String] {
        &self.uml_command[1..]
    }
}
