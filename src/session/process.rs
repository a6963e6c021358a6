//! OS process signalling and probing

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{Result, WatchdogError};

/// Signals the watchdog sends to a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit
    Terminate,
    /// Kill the process outright
    Kill,
    /// Stop scheduling the process
    Suspend,
    /// Continue a suspended process
    Resume,
}

impl ProcessSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Suspend => Signal::SIGSTOP,
            Self::Resume => Signal::SIGCONT,
        }
    }
}

/// Something a [`ProcessSignal`] can be delivered to
pub trait ProcessControl: Send + Sync {
    /// OS process id
    fn process_id(&self) -> u32;

    /// Deliver a signal
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered
    fn signal(&self, signal: ProcessSignal) -> Result<()>;
}

/// A real OS process addressed by pid
#[derive(Debug, Clone, Copy)]
pub struct OsProcess {
    pid: u32,
}

impl OsProcess {
    /// Address the process with the given pid
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessControl for OsProcess {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: ProcessSignal) -> Result<()> {
        send_signal(self.pid, signal)
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and values that wrap negative would address process groups
    i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
}

/// Deliver `signal` to `pid`
///
/// # Errors
/// Returns `Process` if the pid is invalid or the signal cannot be delivered
pub fn send_signal(pid: u32, signal: ProcessSignal) -> Result<()> {
    let target = to_pid(pid).ok_or_else(|| WatchdogError::process(format!("invalid pid {pid}"), None))?;
    log::debug!("Sending {:?} to pid {}", signal, pid);
    signal::kill(target, signal.as_nix())
        .map_err(|e| WatchdogError::process(format!("failed to signal pid {pid}: {e}"), None))
}

/// Whether a process with `pid` exists
#[must_use]
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the process exists
    match signal::kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `port` can currently be bound on loopback
#[must_use]
pub fn port_is_free(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
}
