//! CLI entry point (spec §6): `webserv [config_path]`, defaulting to
//! `default.conf` in the current directory. SIGINT/SIGTERM/SIGQUIT are
//! observed through a self-pipe registered with the poller rather than a
//! global mutable flag, since the only thing safe to do from inside a
//! signal handler is write a byte to an already-open fd.

use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use proxy_log::{error, info};
use webserv::config;
use webserv::error::{Result, WebservError, EXIT_CONFIG_ERROR};
use webserv::server::Server;

static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn install_signal_handlers(fd: RawFd) {
    SIGNAL_FD.store(fd, Ordering::Relaxed);
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
        libc::signal(libc::SIGQUIT, handle_shutdown_signal as usize);
    }
}

fn run() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("default.conf"));

    let http_rule = config::load(&config_path)?;
    config::display::print_summary(&http_rule);

    let session_store_path = PathBuf::from("session_manager.sm");
    let (mut server, signal_write) = Server::new(http_rule, session_store_path)?;
    install_signal_handlers(signal_write.as_raw_fd());
    std::mem::forget(signal_write);

    info!("webserv ready");
    server.run().map_err(WebservError::from)?;
    info!("shutdown complete");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(EXIT_CONFIG_ERROR);
    }
}
