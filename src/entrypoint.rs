use crate::app::{exit_code_for, run};
use crate::cli;
use crate::driver::CancelToken;
use clap::Parser;
use std::process::ExitCode;
#[cfg(unix)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn cli_entrypoint() -> ExitCode {
    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);
    cli_entrypoint_from(std::env::args_os(), &cancel)
}

pub(crate) fn cli_entrypoint_from<I, T>(args: I, cancel: &CancelToken) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Cli::parse_from(args);
    exit_code_for(run(cli, cancel))
}

/// Trips the cancellation token on SIGINT. The handler only flips an atomic;
/// a watcher thread propagates it to the token so the run winds down at its
/// next suspension point and the process exits 130.
#[cfg(unix)]
fn install_interrupt_handler(cancel: &CancelToken) {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    let cancel = cancel.clone();
    std::thread::spawn(move || {
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                cancel.cancel();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}

#[cfg(not(unix))]
fn install_interrupt_handler(_cancel: &CancelToken) {}

#[cfg(unix)]
extern "C" fn handle_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}
