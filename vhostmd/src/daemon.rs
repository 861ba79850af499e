//! Process-level plumbing the original C daemon handled inline in
//! `vhostmd.c`'s `main()`: double-fork daemonization, pid-file handling,
//! privilege drop, and signal-driven shutdown. None of this belongs in
//! `vhostmd-metrics` — it's how *this* binary runs, not what it publishes.

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::fcntl::{open, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Gid, Pid, Uid, User};

/// The flag `sigaction`'s handler flips. A `static` because the handler is
/// a bare `extern "C" fn` with no captured state; [`install_signal_handlers`]
/// publishes the same `Arc` it returns here so callers and the handler
/// agree on one flag.
static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    if let Some(flag) = SHUTDOWN_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Installs handlers for `SIGINT`, `SIGTERM`, and `SIGQUIT` that flip a
/// shared shutdown flag, matching `vhostmd.c`'s `sig_handler`. Returns an
/// `Arc` the publication loop and virtio reactor both poll.
///
/// # Safety
///
/// Installs a process-wide signal handler via `sigaction`; must be called
/// before any other thread that cares about these signals is spawned, and
/// must not be called more than once per process.
pub fn install_signal_handlers() -> Result<Arc<AtomicBool>, nix::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    let _ = SHUTDOWN_FLAG.set(Arc::clone(&flag));

    let action = SigAction::new(SigHandler::Handler(on_shutdown_signal), SaFlags::empty(), SigSet::empty());
    // SAFETY: `on_shutdown_signal` only reads an already-initialized
    // `OnceLock` and performs an atomic store, both async-signal-safe; no
    // other thread installs handlers for these signals.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGQUIT, &action)?;
    }
    Ok(flag)
}

/// Double-forks into the background, detaches from the controlling
/// terminal, and redirects stdio to `/dev/null`, matching `daemonize()` in
/// `vhostmd.c`. The parent (and the intermediate child) exit via
/// `std::process::exit`; only the grandchild returns from this function.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: single-threaded at this point in `main`, before any other
    // thread (the virtio reactor) has been spawned.
    match unsafe { unistd::fork() }.map_err(to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().map_err(to_io)?;
    unistd::chdir("/").map_err(to_io)?;

    // SAFETY: still single-threaded; the intermediate child's only job is
    // to fork once more and exit, mirroring the original's double fork.
    match unsafe { unistd::fork() }.map_err(to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_devnull()?;
    Ok(())
}

fn redirect_stdio_to_devnull() -> io::Result<()> {
    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty()).map_err(to_io)?;
    for target in [0, 1, 2] {
        unistd::dup2(devnull.as_raw_fd(), target).map_err(to_io)?;
    }
    Ok(())
}

/// Writes this process's pid to `path`, failing if the file already exists
/// and names a still-running process, matching `write_pid_file`'s
/// claim-or-exit behavior.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Ok(existing) = fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if process_alive(Pid::from_raw(pid)) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("pid file {} claims live pid {pid}", path.display()),
                ));
            }
        }
    }
    fs::write(path, format!("{}\n", unistd::getpid()))
}

fn process_alive(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

/// Removes the pid file on shutdown. Errors are not fatal — the process is
/// already exiting.
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Drops from root to `user` by name: resolves uid/gid via the password
/// database, calls `setgid`/`initgroups`/`setuid` in that order, and
/// refuses to switch *to* uid/gid 0, matching `vhostmd.c`'s guard.
pub fn drop_privileges(user: &str) -> io::Result<()> {
    let Some(entry) = User::from_name(user).map_err(to_io)? else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no entry in password file for user {user}"),
        ));
    };

    if entry.uid == Uid::from_raw(0) || entry.gid == Gid::from_raw(0) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "cannot switch to root using the -u/--user flag",
        ));
    }

    unistd::setgid(entry.gid).map_err(to_io)?;
    unistd::initgroups(
        &std::ffi::CString::new(user).expect("user name must not contain a NUL byte"),
        entry.gid,
    )
    .map_err(to_io)?;
    unistd::setuid(entry.uid).map_err(to_io)?;
    Ok(())
}

fn to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trips_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhostmd.pid");
        write_pid_file(&path).unwrap();
        let written: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, unistd::getpid().as_raw());
    }

    #[test]
    fn remove_pid_file_is_best_effort_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.pid");
        remove_pid_file(&path); // must not panic
    }
}
