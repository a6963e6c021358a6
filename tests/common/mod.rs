//! Shared fakes for the integration tests
//!
//! `FakeController` stands in for real engine processes: every launch
//! registers a bridge route, creates a session over a `FakeProcess`, and
//! (when `auto_start` is on) reports startup through the dispatcher like a
//! real worker would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use worker_watchdog::session::{ExitSender, ProcessControl, ProcessSignal, WorkerCommand};
use worker_watchdog::{
    AccessKey, ArtifactLease, ArtifactMetadata, ArtifactSlotManager, BackoffPolicy,
    BridgeCommandType, BridgeDispatcher, BridgeHandler, BridgeRequest, ChatChannel, ChatMessage,
    ChatRelay, CompiledArtifact, EventConsumer, EventType, GameSession, INTEROP_API_VERSION,
    LaunchParameters, MemoryReattachStore, ReattachInformation, SessionController,
    TokioJobManager, Watchdog, WatchdogConfig, WatchdogError, WatchdogServices, WatchdogStatus,
    WorkerClient,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with short timeouts suitable for tests
pub fn test_config() -> WatchdogConfig {
    WatchdogConfig::builder()
        .instance_name("test")
        .bridge_port(0)
        .startup_timeout(Duration::from_secs(3))
        .graceful_shutdown_timeout(Duration::from_millis(500))
        .probe_timeout(Duration::from_secs(1))
        .event_timeout(Duration::from_secs(1))
        .launch_attempts(2)
        .backoff(BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
        })
        .max_consecutive_crashes(3)
        .stable_uptime(Duration::from_secs(3600))
        .build()
}

pub fn artifact(name: &str) -> CompiledArtifact {
    CompiledArtifact::new(
        std::env::temp_dir().join(name),
        "server.dmb",
        ArtifactMetadata::default(),
    )
}

// ============================================================================
// Fake worker processes
// ============================================================================

/// Process stand-in; kill and terminate report an exit through the session
pub struct FakeProcess {
    pid: u32,
    exit: OnceLock<ExitSender>,
    signals: Mutex<Vec<ProcessSignal>>,
}

impl FakeProcess {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            exit: OnceLock::new(),
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Make the process exit on its own
    pub fn exit_with(&self, code: Option<i32>) {
        if let Some(exit) = self.exit.get() {
            exit.exited(code);
        }
    }

    pub fn signals(&self) -> Vec<ProcessSignal> {
        self.signals.lock().clone()
    }
}

impl ProcessControl for FakeProcess {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: ProcessSignal) -> worker_watchdog::Result<()> {
        self.signals.lock().push(signal);
        match signal {
            ProcessSignal::Kill => self.exit_with(None),
            ProcessSignal::Terminate => self.exit_with(Some(0)),
            ProcessSignal::Suspend | ProcessSignal::Resume => {}
        }
        Ok(())
    }
}

/// One launched fake worker
#[derive(Clone)]
pub struct FakeWorker {
    pub key: AccessKey,
    pub port: u16,
    pub process: Arc<FakeProcess>,
}

/// Every worker the fake controller launched, shared with the fake client
#[derive(Default)]
pub struct Fleet {
    workers: Mutex<Vec<FakeWorker>>,
}

impl Fleet {
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn get(&self, index: usize) -> FakeWorker {
        self.workers.lock()[index].clone()
    }

    pub fn latest(&self) -> FakeWorker {
        let workers = self.workers.lock();
        workers[workers.len() - 1].clone()
    }

    fn by_key(&self, key: &AccessKey) -> Option<FakeWorker> {
        self.workers.lock().iter().find(|w| &w.key == key).cloned()
    }
}

// ============================================================================
// Fake session controller
// ============================================================================

pub struct FakeController {
    pub dispatcher: BridgeDispatcher,
    pub store: Arc<MemoryReattachStore>,
    pub fleet: Arc<Fleet>,
    pub auto_start: AtomicBool,
    pub failures_left: AtomicU32,
    next_pid: AtomicU32,
}

impl FakeController {
    pub fn new(dispatcher: BridgeDispatcher, store: Arc<MemoryReattachStore>, fleet: Arc<Fleet>) -> Self {
        Self {
            dispatcher,
            store,
            fleet,
            auto_start: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            next_pid: AtomicU32::new(40_000),
        }
    }
}

#[async_trait]
impl SessionController for FakeController {
    async fn launch_new(
        &self,
        lease: ArtifactLease,
        _reattach: Option<ReattachInformation>,
        parameters: LaunchParameters,
        handler: Weak<dyn BridgeHandler>,
        _cancel: &CancellationToken,
    ) -> worker_watchdog::Result<GameSession> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WatchdogError::launch("engine refused to start"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let key = AccessKey::generate();
        let registration = self.dispatcher.register(key.clone(), handler);
        let process = Arc::new(FakeProcess::new(pid));
        let info = ReattachInformation {
            process_id: pid,
            listening_port: parameters.port,
            interop_access_key: key.clone(),
            interop_api_version: INTEROP_API_VERSION.to_string(),
            artifact_id: lease.primary().id.clone(),
        };
        let port = parameters.port;
        let (session, exit) = GameSession::new(
            info,
            parameters,
            lease,
            self.store.clone(),
            process.clone(),
            false,
        );
        let _ = process.exit.set(exit);
        self.fleet.workers.lock().push(FakeWorker {
            key: key.clone(),
            port,
            process,
        });
        session.persist().await?;

        if self.auto_start.load(Ordering::SeqCst) {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let request = BridgeRequest::new(BridgeCommandType::Startup).with_access(key);
                dispatcher
                    .process_bridge_request(request, &CancellationToken::new())
                    .await;
            });
        }
        Ok(session.with_registration(registration))
    }
}

// ============================================================================
// Fake worker client
// ============================================================================

/// Answers worker commands on behalf of the fleet
#[derive(Default)]
pub struct FakeClient {
    pub fleet: Arc<Fleet>,
    pub refuse: AtomicBool,
    pub sent: Mutex<Vec<(AccessKey, WorkerCommand)>>,
}

impl FakeClient {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self {
            fleet,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.sent.lock().iter().map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl WorkerClient for FakeClient {
    async fn send(
        &self,
        _port: u16,
        key: &AccessKey,
        command: WorkerCommand,
        _timeout: Duration,
    ) -> worker_watchdog::Result<()> {
        self.sent.lock().push((key.clone(), command.clone()));
        if self.refuse.load(Ordering::SeqCst) {
            return Err(WatchdogError::bridge("worker refused"));
        }
        if command == WorkerCommand::GracefulShutdown
            && let Some(worker) = self.fleet.by_key(key)
        {
            worker.process.exit_with(Some(0));
        }
        Ok(())
    }
}

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<(EventType, Vec<String>)>>,
    pub chat: Mutex<Vec<ChatMessage>>,
}

impl RecordingEvents {
    pub fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|(t, _)| *t).collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events.lock().iter().filter(|(t, _)| *t == event_type).count()
    }
}

#[async_trait]
impl EventConsumer for RecordingEvents {
    async fn handle_event(
        &self,
        event_type: EventType,
        parameters: Vec<String>,
    ) -> worker_watchdog::Result<()> {
        self.events.lock().push((event_type, parameters));
        Ok(())
    }
}

#[async_trait]
impl ChatRelay for RecordingEvents {
    async fn send_message(&self, message: ChatMessage) -> worker_watchdog::Result<()> {
        self.chat.lock().push(message);
        Ok(())
    }

    async fn channels(&self) -> Vec<ChatChannel> {
        vec![ChatChannel {
            id: 7,
            friendly_name: "ops".to_string(),
            is_admin_channel: true,
            is_watchdog_channel: true,
        }]
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub watchdog: Watchdog,
    pub controller: Arc<FakeController>,
    pub client: Arc<FakeClient>,
    pub dispatcher: BridgeDispatcher,
    pub store: Arc<MemoryReattachStore>,
    pub events: Arc<RecordingEvents>,
    pub fleet: Arc<Fleet>,
    pub slots: ArtifactSlotManager,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(config: WatchdogConfig) -> Self {
        init_logging();
        let dispatcher = BridgeDispatcher::new();
        let store = Arc::new(MemoryReattachStore::new());
        let fleet = Arc::new(Fleet::default());
        let controller = Arc::new(FakeController::new(
            dispatcher.clone(),
            store.clone(),
            fleet.clone(),
        ));
        let client = Arc::new(FakeClient::new(fleet.clone()));
        let events = Arc::new(RecordingEvents::default());
        let cancel = CancellationToken::new();

        let slots = ArtifactSlotManager::new();
        slots.stage(artifact("initial"));
        slots.promote_staged();

        let watchdog = Watchdog::new(
            Arc::new(config),
            WatchdogServices {
                controller: controller.clone(),
                worker_client: client.clone(),
                reattach_store: store.clone(),
                slots: slots.clone(),
                events: events.clone(),
                chat: events.clone(),
                jobs: Arc::new(TokioJobManager::new(cancel.child_token())),
            },
        );

        Self {
            watchdog,
            controller,
            client,
            dispatcher,
            store,
            events,
            fleet,
            slots,
            cancel,
        }
    }

    /// Send a bridge request as the given worker
    pub async fn bridge(&self, worker: &FakeWorker, request: BridgeRequest) -> Option<worker_watchdog::BridgeResponse> {
        self.dispatcher
            .process_bridge_request(request.with_access(worker.key.clone()), &self.cancel)
            .await
    }

    pub async fn wait_for_status(&self, status: WatchdogStatus) {
        let mut stream = Box::pin(self.watchdog.status_stream());
        let reached = tokio::time::timeout(WAIT, async {
            while let Some(current) = stream.next().await {
                if current == status {
                    return;
                }
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "watchdog never reached {status:?}, stuck at {:?}",
            self.watchdog.status()
        );
    }

    pub async fn wait_for_launches(&self, count: usize) {
        let reached = tokio::time::timeout(WAIT, async {
            while self.fleet.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "expected {count} launches, saw {}", self.fleet.len());
    }

    /// Wait until the session with the latest worker is installed and online
    pub async fn wait_for_worker_online(&self, count: usize) {
        self.wait_for_launches(count).await;
        let key = self.fleet.get(count - 1).key;
        let installed = tokio::time::timeout(WAIT, async {
            loop {
                let current = self.watchdog.session().map(|s| s.access_key());
                if current.as_ref() == Some(&key) && self.watchdog.status() == WatchdogStatus::Online {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(installed.is_ok(), "worker {count} never came online");
    }
}

/// Map of the event types seen so far to their counts
pub fn event_counts(events: &RecordingEvents) -> HashMap<EventType, usize> {
    let mut counts = HashMap::new();
    for event in events.types() {
        *counts.entry(event).or_insert(0) += 1;
    }
    counts
}
