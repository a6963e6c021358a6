//! Runtime handle to one worker process
//!
//! A [`GameSession`] exposes three signals the watchdog waits on:
//! - the lifetime, resolved exactly once when the process exits
//! - the reboot notification, fired each time the worker re-initialises
//! - the launch result, resolved when the worker reports startup
//!
//! Whoever observes the process exit reports it through the [`ExitSender`]
//! returned with the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use crate::artifacts::{ArtifactLease, CompiledArtifact};
use crate::bridge::BridgeRegistration;
use crate::error::{Result, WatchdogError};
use crate::reattach::ReattachStore;
use crate::types::identifiers::{AccessKey, ArtifactId};
use crate::types::launch::LaunchParameters;
use crate::types::reattach::ReattachInformation;

use super::process::{ProcessControl, ProcessSignal};

/// How a session's process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    /// Exit code, when the process exited normally and was our child
    pub exit_code: Option<i32>,
    /// Whether the watchdog asked for the exit
    pub expected: bool,
}

impl SessionExit {
    /// Whether the exit counts as a crash
    #[must_use]
    pub fn is_crash(&self) -> bool {
        !self.expected
    }
}

/// Reports the exit of a session's process
#[derive(Clone)]
pub struct ExitSender {
    lifetime: Arc<watch::Sender<Option<SessionExit>>>,
    expected: Arc<AtomicBool>,
}

impl ExitSender {
    /// Record the exit; only the first report counts
    pub fn exited(&self, exit_code: Option<i32>) {
        let expected = self.expected.load(Ordering::SeqCst);
        let recorded = self.lifetime.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(SessionExit { exit_code, expected });
            true
        });
        if recorded {
            log::debug!("Session exit recorded: code {:?}, expected {}", exit_code, expected);
        }
    }

    /// Whether the session handle is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lifetime.is_closed()
    }
}

/// Handle to one launched or reattached worker process
pub struct GameSession {
    control: Arc<dyn ProcessControl>,
    reattached: bool,
    launched_at: Instant,
    parameters: Mutex<LaunchParameters>,
    reattach: Mutex<ReattachInformation>,
    store: Arc<dyn ReattachStore>,
    lease: Mutex<Option<ArtifactLease>>,
    registration: Mutex<Option<BridgeRegistration>>,
    lifetime: watch::Receiver<Option<SessionExit>>,
    expected_exit: Arc<AtomicBool>,
    reboot: Notify,
    started: watch::Sender<Option<Duration>>,
    startup_began: Mutex<Instant>,
}

impl GameSession {
    /// Create a session handle.
    ///
    /// `info` must describe the process behind `control`; the returned
    /// [`ExitSender`] resolves the lifetime signal.
    pub fn new(
        info: ReattachInformation,
        parameters: LaunchParameters,
        lease: ArtifactLease,
        store: Arc<dyn ReattachStore>,
        control: Arc<dyn ProcessControl>,
        reattached: bool,
    ) -> (Self, ExitSender) {
        let (lifetime_tx, lifetime_rx) = watch::channel(None);
        let expected = Arc::new(AtomicBool::new(false));
        let (started, _) = watch::channel(None);
        let now = Instant::now();

        let session = Self {
            control,
            reattached,
            launched_at: now,
            parameters: Mutex::new(parameters),
            reattach: Mutex::new(info),
            store,
            lease: Mutex::new(Some(lease)),
            registration: Mutex::new(None),
            lifetime: lifetime_rx,
            expected_exit: Arc::clone(&expected),
            reboot: Notify::new(),
            started,
            startup_began: Mutex::new(now),
        };
        let exit = ExitSender {
            lifetime: Arc::new(lifetime_tx),
            expected,
        };
        (session, exit)
    }

    /// Keep `registration` alive for as long as the session is attached
    #[must_use]
    pub fn with_registration(self, registration: BridgeRegistration) -> Self {
        *self.registration.lock() = Some(registration);
        self
    }

    /// OS process id
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.control.process_id()
    }

    /// Whether supervision resumed on an existing process
    #[must_use]
    pub fn is_reattached(&self) -> bool {
        self.reattached
    }

    /// Access key the worker presents on bridge calls
    #[must_use]
    pub fn access_key(&self) -> AccessKey {
        self.reattach.lock().interop_access_key.clone()
    }

    /// Current reattach record
    #[must_use]
    pub fn reattach_information(&self) -> ReattachInformation {
        self.reattach.lock().clone()
    }

    /// Parameters the process runs with
    #[must_use]
    pub fn parameters(&self) -> LaunchParameters {
        self.parameters.lock().clone()
    }

    /// Artifact the process runs
    #[must_use]
    pub fn artifact(&self) -> Option<Arc<CompiledArtifact>> {
        self.lease.lock().as_ref().map(|lease| Arc::clone(lease.primary()))
    }

    /// Time since the process was launched or reattached
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.launched_at.elapsed()
    }

    /// Persist the current reattach record
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn persist(&self) -> Result<()> {
        let info = self.reattach_information();
        self.store.save(&info).await
    }

    /// Record a port move and persist it
    ///
    /// # Errors
    /// Returns error if the store fails; the in-memory change is kept
    pub async fn set_port(&self, port: u16) -> Result<()> {
        self.parameters.lock().port = port;
        self.reattach.lock().listening_port = port;
        self.persist().await
    }

    /// Run `lease`'s primary artifact from now on, releasing the previous lease.
    ///
    /// # Errors
    /// Returns error if the store fails; the swap itself is kept
    pub async fn replace_lease(&self, lease: ArtifactLease) -> Result<()> {
        let id: ArtifactId = lease.primary().id.clone();
        let previous = self.lease.lock().replace(lease);
        drop(previous);
        self.reattach.lock().artifact_id = id;
        self.persist().await
    }

    /// Drop the bridge route and artifact locks
    pub fn detach(&self) {
        self.registration.lock().take();
        self.lease.lock().take();
    }

    /// Exit of the process, if it already happened
    #[must_use]
    pub fn exited(&self) -> Option<SessionExit> {
        *self.lifetime.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait_exit(&self) -> SessionExit {
        let mut lifetime = self.lifetime.clone();
        match lifetime.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or(SessionExit {
                exit_code: None,
                expected: true,
            }),
            // Nobody can report the exit any more
            Err(_) => SessionExit {
                exit_code: None,
                expected: self.expected_exit.load(Ordering::SeqCst),
            },
        }
    }

    /// Classify the next exit as requested by the watchdog
    pub fn mark_expected_exit(&self) {
        self.expected_exit.store(true, Ordering::SeqCst);
    }

    /// Whether the next exit is classified as requested
    #[must_use]
    pub fn exit_expected(&self) -> bool {
        self.expected_exit.load(Ordering::SeqCst)
    }

    /// Announce a soft restart of the worker
    pub fn signal_reboot(&self) {
        self.reboot.notify_one();
    }

    /// Wait for the next soft restart; re-armed after every fire
    pub async fn rebooted(&self) {
        self.reboot.notified().await;
    }

    /// Record that the worker reported startup, returning the startup latency.
    ///
    /// Repeated reports keep the first latency.
    pub fn mark_started(&self) -> Duration {
        let elapsed = self.startup_began.lock().elapsed();
        let mut latency = elapsed;
        self.started.send_if_modified(|slot| match slot {
            Some(first) => {
                latency = *first;
                false
            }
            None => {
                *slot = Some(elapsed);
                true
            }
        });
        latency
    }

    /// Expect a fresh startup report, as after a soft restart
    pub fn reset_started(&self) {
        *self.startup_began.lock() = Instant::now();
        self.started.send_replace(None);
    }

    /// Startup latency, once reported
    #[must_use]
    pub fn startup_time(&self) -> Option<Duration> {
        *self.started.borrow()
    }

    /// Wait for the startup report
    pub async fn wait_started(&self) -> Duration {
        let mut started = self.started.subscribe();
        match started.wait_for(Option::is_some).await {
            Ok(latency) => latency.unwrap_or_default(),
            Err(_) => Duration::ZERO,
        }
    }

    /// Deliver a signal to the process
    ///
    /// # Errors
    /// Returns error if the process has exited or cannot be signalled
    pub fn signal(&self, signal: ProcessSignal) -> Result<()> {
        if let Some(exit) = self.exited() {
            return Err(WatchdogError::process("process already exited", exit.exit_code));
        }
        self.control.signal(signal)
    }

    /// Kill the process, marking the exit as requested
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub fn kill(&self) -> Result<()> {
        self.mark_expected_exit();
        self.signal(ProcessSignal::Kill)
    }

    /// Suspend the process
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub fn suspend(&self) -> Result<()> {
        self.signal(ProcessSignal::Suspend)
    }

    /// Resume a suspended process
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub fn resume(&self) -> Result<()> {
        self.signal(ProcessSignal::Resume)
    }
}

impl std::fmt::Debug for GameSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSession")
            .field("process_id", &self.process_id())
            .field("reattached", &self.reattached)
            .field("exited", &self.exited())
            .field("started", &self.startup_time())
            .finish()
    }
}
