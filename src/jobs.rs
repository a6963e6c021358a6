//! Cancellable, progress-reporting jobs
//!
//! Long operations triggered by bridge or administrative actions are not run
//! inline; they are registered with a [`JobManager`], which hands back a
//! [`JobHandle`] for observing progress and cancelling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Future run by a job
pub type JobFuture = BoxFuture<'static, Result<()>>;

/// Constructor of a job's future
pub type JobFn = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// Progress of a running job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    /// Completion percentage, 0-100
    pub percent: u8,
    /// What the job is doing now
    pub stage: String,
}

/// Lifecycle of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still running
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed(String),
    /// Stopped through its cancellation token
    Cancelled,
}

impl JobState {
    /// Whether the job is finished
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Handed to the job's future
pub struct JobContext {
    /// Cancelled when the job is cancelled
    pub cancel: CancellationToken,
    progress: watch::Sender<JobProgress>,
}

impl JobContext {
    /// Publish progress
    pub fn report(&self, percent: u8, stage: impl Into<String>) {
        self.progress.send_replace(JobProgress {
            percent: percent.min(100),
            stage: stage.into(),
        });
    }
}

/// Observer of one registered job
#[derive(Clone)]
pub struct JobHandle {
    /// Job id
    pub id: Uuid,
    /// Human-readable description
    pub description: String,
    /// When the job was registered
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    progress: watch::Receiver<JobProgress>,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    /// Ask the job to stop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Latest progress
    #[must_use]
    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Wait until the job finishes and return its final state
    pub async fn wait(&self) -> JobState {
        let mut state = self.state.clone();
        match state.wait_for(JobState::is_terminal).await {
            Ok(final_state) => final_state.clone(),
            Err(_) => JobState::Cancelled,
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("state", &self.state())
            .finish()
    }
}

/// Registers long-running operations
pub trait JobManager: Send + Sync {
    /// Start `job` in the background and return a handle to it
    fn register(&self, description: String, job: JobFn) -> JobHandle;
}

/// Job manager running every job on the tokio runtime
pub struct TokioJobManager {
    root: CancellationToken,
    jobs: Arc<Mutex<HashMap<Uuid, JobHandle>>>,
}

impl TokioJobManager {
    /// Create a job manager; cancelling `root` cancels every job
    #[must_use]
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handles of jobs that have not finished
    #[must_use]
    pub fn running(&self) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .values()
            .filter(|job| !job.state().is_terminal())
            .cloned()
            .collect()
    }

    /// Cancel every job
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl JobManager for TokioJobManager {
    fn register(&self, description: String, job: JobFn) -> JobHandle {
        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        let (progress_tx, progress_rx) = watch::channel(JobProgress::default());
        let (state_tx, state_rx) = watch::channel(JobState::Running);

        let handle = JobHandle {
            id,
            description: description.clone(),
            started_at: Utc::now(),
            cancel: cancel.clone(),
            progress: progress_rx,
            state: state_rx,
        };
        self.jobs.lock().insert(id, handle.clone());

        let ctx = JobContext {
            cancel: cancel.clone(),
            progress: progress_tx,
        };
        let future = job(ctx);
        let jobs = Arc::clone(&self.jobs);

        log::info!("Job {} started: {}", id, description);
        tokio::spawn(async move {
            let final_state = tokio::select! {
                result = future => match result {
                    Ok(()) => JobState::Completed,
                    Err(e) => JobState::Failed(e.to_string()),
                },
                () = cancel.cancelled() => JobState::Cancelled,
            };

            match &final_state {
                JobState::Failed(e) => log::warn!("Job {} ({}) failed: {}", id, description, e),
                other => log::info!("Job {} ({}) finished: {:?}", id, description, other),
            }
            state_tx.send_replace(final_state);
            jobs.lock().remove(&id);
        });

        handle
    }
}
