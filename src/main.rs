//! Entry point: parses CLI args, loads the chip model script, stands up the
//! three vhost-user device daemons and the script thread, then supervises
//! the UML child process until it exits (spec.md §1/§2).

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use crossbeam_queue::SegQueue;
use tracing::{error, info};
use vmm_sys_util::eventfd::EventFd;

use roadtest_backend::cli::Cli;
use roadtest_backend::control::ControlChannel;
use roadtest_backend::daemon::run_device_daemon;
use roadtest_backend::devices::irq::IrqRegistry;
use roadtest_backend::devices::{GpioBackend, I2cBackend, PlatformBackend};
use roadtest_backend::error::FatalError;
use roadtest_backend::eventloop;
use roadtest_backend::mem::MemTable;
use roadtest_backend::script::{HostApi, ScriptBridge, ScriptEngine};
use roadtest_backend::supervisor::Supervisor;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "roadtest backend exiting");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &FatalError) -> u8 {
    match e {
        FatalError::MissingArg(_) | FatalError::MissingWorkDir => 1,
        FatalError::ScriptLoad { .. } | FatalError::MissingSurface(_) | FatalError::MissingCallable { .. } => 2,
        FatalError::Spawn(_) => 3,
        _ => 70,
    }
}

fn run() -> Result<(), FatalError> {
    let cli = Cli::parse();

    let work_dir = std::env::var("ROADTEST_WORK_DIR")
        .map(std::path::PathBuf::from)
        .map_err(|_| FatalError::MissingWorkDir)?;
    std::fs::create_dir_all(&work_dir).map_err(FatalError::Spawn)?;

    let mem_table = MemTable::default();
    let irq_registry = Arc::new(IrqRegistry::new());
    let host = HostApi::new(mem_table.clone(), irq_registry.clone());

    info!(script = %cli.main_script.display(), "loading main script");
    let engine = ScriptEngine::load(&cli.main_script, host)?;

    let jobs = Arc::new(SegQueue::new());
    let doorbell = Arc::new(EventFd::new(vmm_sys_util::eventfd::EFD_NONBLOCK).map_err(FatalError::Spawn)?);
    let bridge = ScriptBridge::new(jobs.clone(), doorbell.clone());

    let control = ControlChannel::open(&work_dir.join("control"))?;
    let script_shutdown = Arc::new(EventFd::new(vmm_sys_util::eventfd::EFD_NONBLOCK).map_err(FatalError::Spawn)?);

    let script_thread = {
        let jobs = jobs.clone();
        let doorbell = doorbell.clone();
        let script_shutdown = script_shutdown.clone();
        std::thread::Builder::new()
            .name("script".to_string())
            .spawn(move || eventloop::run(engine, jobs, doorbell, control, script_shutdown))
            .map_err(FatalError::Spawn)?
    };

    let i2c_backend = Arc::new(I2cBackend::new(mem_table.clone(), bridge.clone()).map_err(FatalError::Spawn)?);
    let gpio_backend = Arc::new(
        GpioBackend::new(mem_table.clone(), bridge.clone(), irq_registry.clone()).map_err(FatalError::Spawn)?,
    );
    let platform_backend = Arc::new(PlatformBackend::new(mem_table.clone(), bridge.clone()).map_err(FatalError::Spawn)?);

    let i2c_shutdown = Arc::new(AtomicBool::new(false));
    let gpio_shutdown = Arc::new(AtomicBool::new(false));
    let platform_shutdown = Arc::new(AtomicBool::new(false));

    let i2c_thread = {
        let socket = cli.i2c_socket.clone();
        let shutdown = i2c_shutdown.clone();
        std::thread::Builder::new()
            .name("vhost-i2c".to_string())
            .spawn(move || run_device_daemon("i2c", &socket, i2c_backend, shutdown))
            .map_err(FatalError::Spawn)?
    };
    let gpio_thread = {
        let socket = cli.gpio_socket.clone();
        let shutdown = gpio_shutdown.clone();
        std::thread::Builder::new()
            .name("vhost-gpio".to_string())
            .spawn(move || run_device_daemon("gpio", &socket, gpio_backend, shutdown))
            .map_err(FatalError::Spawn)?
    };
    let platform_thread = {
        let socket = cli.pci_socket.clone();
        let shutdown = platform_shutdown.clone();
        std::thread::Builder::new()
            .name("vhost-platform".to_string())
            .spawn(move || run_device_daemon("platform", &socket, platform_backend, shutdown))
            .map_err(FatalError::Spawn)?
    };

    let mut supervisor = Supervisor::spawn(cli.uml_binary(), cli.uml_args(), &work_dir)?;
    info!(pid = supervisor.pid(), "UML child process running");

    let status = supervisor.wait()?;
    info!(?status, "UML child process exited, shutting down devices");

    i2c_shutdown.store(true, Ordering::SeqCst);
    gpio_shutdown.store(true, Ordering::SeqCst);
    platform_shutdown.store(true, Ordering::SeqCst);
    let _ = script_shutdown.write(1);

    let _ = i2c_thread.join();
    let _ = gpio_thread.join();
    let _ = platform_thread.join();
    let _ = script_thread.join();

    Ok(())
}
