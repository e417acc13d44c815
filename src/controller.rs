// ============================================
// bootsmith - controller.rs
// ============================================
// Orchestrates one installation job from source to bootable media:
//
//   remote ISO:   Idle -> Fetching -> Writing -> Succeeded/Failed
//   build repo:   Idle -> Building -> Writing -> Succeeded/Failed
//   local image:  Idle -> Writing            -> Succeeded/Failed
//
// Exactly one job may be active at a time. A second start() while a
// job runs is rejected with Busy - never queued silently.
//
// The job runs on its own worker thread. Progress and phase changes
// travel back over an mpsc channel as JobEvents; the worker never
// shares mutable progress state with the caller.
//
// Cancellation is cooperative and has a hard boundary: it is accepted
// at any point while fetching or building, but once the destructive
// raw write has started the job is committed - an interrupted raw
// write leaves the device unbootable, so request_cancel() returns
// RefusedWriting and the job runs to its real outcome.
// ============================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::builder::BuildAdapter;
use crate::fetch::{self, FetchOutcome};
use crate::progress::Progress;
use crate::writer;

// ============================================
// JOB PHASES
// ============================================

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    /// Downloading a remote ISO
    Fetching,
    /// Running an external build that produces the ISO
    Building,
    /// Raw-writing the image to the device
    Writing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobPhase {
    /// Terminal phases never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Cancelled
        )
    }

    /// The legal transition matrix. Building follows the same rules
    /// as Fetching - both are acquisition phases.
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        match (self, next) {
            (Idle, Fetching) | (Idle, Building) | (Idle, Writing) => true,
            (Fetching, Writing) | (Fetching, Failed) | (Fetching, Cancelled) => true,
            (Building, Writing) | (Building, Failed) | (Building, Cancelled) => true,
            (Writing, Succeeded) | (Writing, Failed) | (Writing, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPhase::Idle => "idle",
            JobPhase::Fetching => "fetching",
            JobPhase::Building => "building",
            JobPhase::Writing => "writing",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================
// JOB DESCRIPTION & EVENTS
// ============================================

/// Where the image comes from.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Download an ISO, then write it.
    RemoteIso { url: String, dest: PathBuf },
    /// Clone/update a repository, run its build, write the result.
    BuildRepo { repo_url: String },
    /// Write an image that is already on disk.
    LocalImage { path: PathBuf },
}

/// Everything needed to start a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub source: JobSource,
    pub device_path: String,
    /// The user explicitly confirmed writing to a hazardous device.
    pub allow_hazardous: bool,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Stopped on request before the destructive write began.
    /// Deliberately distinct from Failed - logs and UI must never
    /// conflate the two.
    Cancelled,
    Failed {
        error: String,
        /// True when the raw write had already started: the device is
        /// now in an unknown state and may be unusable, which the user
        /// must be told explicitly.
        device_state_unknown: bool,
    },
}

/// Messages the worker sends back while the job runs.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Phase(JobPhase),
    Progress(Progress),
    Finished(JobOutcome),
}

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("another job is already running - cancel it or wait for it to finish")]
    Busy,
}

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResponse {
    /// The flag is raised; the job will stop at its next safe point.
    Accepted,
    /// The destructive write already started - the job is committed
    /// and will finish with its real result.
    RefusedWriting,
    NoActiveJob,
}

// ============================================
// SHARED JOB STATE
// ============================================
// The worker owns the job; the controller only sees these atomics.

struct JobShared {
    cancel: AtomicBool,
    destructive_started: AtomicBool,
    /// Progress within the current phase, 0-100, monotone per phase.
    progress: AtomicU8,
    phase: Mutex<JobPhase>,
}

impl JobShared {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            destructive_started: AtomicBool::new(false),
            progress: AtomicU8::new(0),
            phase: Mutex::new(JobPhase::Idle),
        }
    }

    fn phase(&self) -> JobPhase {
        *self.phase.lock().expect("job phase lock poisoned")
    }
}

/// Caller's handle to a running job: the event stream plus join.
pub struct JobHandle {
    shared: Arc<JobShared>,
    pub events: Receiver<JobEvent>,
    thread: JoinHandle<()>,
}

impl JobHandle {
    /// Drain events until the job finishes, passing each to `on_event`,
    /// and return the outcome.
    pub fn wait(self, mut on_event: impl FnMut(&JobEvent)) -> JobOutcome {
        let mut outcome = None;
        for event in self.events.iter() {
            if let JobEvent::Finished(o) = &event {
                outcome = Some(o.clone());
            }
            on_event(&event);
        }
        let _ = self.thread.join();
        // A worker that died without a Finished event is a failed job,
        // not a succeeded one.
        outcome.unwrap_or_else(|| JobOutcome::Failed {
            error: "job worker exited without reporting an outcome".to_string(),
            device_state_unknown: self.shared.destructive_started.load(Ordering::Relaxed),
        })
    }

    pub fn phase(&self) -> JobPhase {
        self.shared.phase()
    }
}

// ============================================
// CONTROLLER
// ============================================

/// Owns the single active job. Dropping the controller does not stop
/// a running job; the worker finishes on its own.
pub struct InstallationController {
    active: Option<Arc<JobShared>>,
}

impl InstallationController {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Is a job currently in a non-terminal phase?
    pub fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .map(|shared| !shared.phase().is_terminal())
            .unwrap_or(false)
    }

    /// Start a job. Rejected with Busy while another job is active.
    pub fn start(&mut self, spec: JobSpec) -> Result<JobHandle, ControllerError> {
        if self.is_busy() {
            return Err(ControllerError::Busy);
        }

        let shared = Arc::new(JobShared::new());
        let (tx, rx) = mpsc::channel();

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::spawn(move || {
            run_job(&worker_shared, spec, &tx);
        });

        self.active = Some(Arc::clone(&shared));
        Ok(JobHandle {
            shared,
            events: rx,
            thread,
        })
    }

    /// Ask the active job to stop. Accepted while fetching/building;
    /// refused once the destructive write has started.
    pub fn request_cancel(&self) -> CancelResponse {
        match &self.active {
            None => CancelResponse::NoActiveJob,
            Some(shared) => {
                if shared.phase().is_terminal() {
                    return CancelResponse::NoActiveJob;
                }
                if shared.destructive_started.load(Ordering::SeqCst) {
                    log::warn!("cancel refused: raw write already in progress");
                    return CancelResponse::RefusedWriting;
                }
                shared.cancel.store(true, Ordering::SeqCst);
                log::info!("cancellation requested");
                CancelResponse::Accepted
            }
        }
    }

    #[cfg(test)]
    fn inject_active_for_tests(&mut self, phase: JobPhase, destructive: bool) -> Arc<JobShared> {
        let shared = Arc::new(JobShared::new());
        *shared.phase.lock().unwrap() = phase;
        shared.destructive_started.store(destructive, Ordering::SeqCst);
        self.active = Some(Arc::clone(&shared));
        shared
    }
}

impl Default for InstallationController {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// WORKER
// ============================================

/// Move the job to `next`, resetting per-phase progress.
/// Illegal transitions are a bug; they are logged and skipped rather
/// than poisoning the job.
fn set_phase(shared: &JobShared, tx: &Sender<JobEvent>, next: JobPhase) {
    let mut phase = shared.phase.lock().expect("job phase lock poisoned");
    if !phase.can_transition_to(next) {
        log::error!("illegal job transition {} -> {}", *phase, next);
        return;
    }
    log::info!("job: {} -> {}", *phase, next);
    *phase = next;
    shared.progress.store(0, Ordering::Relaxed);
    let _ = tx.send(JobEvent::Phase(next));
}

/// Forward a progress update, enforcing per-phase monotonicity.
fn emit_progress(shared: &JobShared, tx: &Sender<JobEvent>, p: Progress) {
    match p {
        Progress::Percent(pct) => {
            let prev = shared.progress.load(Ordering::Relaxed);
            let clamped = pct.max(prev);
            shared.progress.store(clamped, Ordering::Relaxed);
            let _ = tx.send(JobEvent::Progress(Progress::Percent(clamped)));
        }
        Progress::Indeterminate => {
            let _ = tx.send(JobEvent::Progress(Progress::Indeterminate));
        }
    }
}

fn finish(shared: &JobShared, tx: &Sender<JobEvent>, outcome: JobOutcome) {
    let phase = match &outcome {
        JobOutcome::Succeeded => JobPhase::Succeeded,
        JobOutcome::Cancelled => JobPhase::Cancelled,
        JobOutcome::Failed { .. } => JobPhase::Failed,
    };
    set_phase(shared, tx, phase);
    let _ = tx.send(JobEvent::Finished(outcome));
}

/// The worker body: acquire an image, then write it.
fn run_job(shared: &JobShared, spec: JobSpec, tx: &Sender<JobEvent>) {
    // --- Acquisition ---
    let image: PathBuf = match &spec.source {
        JobSource::RemoteIso { url, dest } => {
            set_phase(shared, tx, JobPhase::Fetching);
            if let Some(dir) = dest.parent() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    finish(
                        shared,
                        tx,
                        JobOutcome::Failed {
                            error: format!("could not create {}: {}", dir.display(), e),
                            device_state_unknown: false,
                        },
                    );
                    return;
                }
            }
            match fetch::fetch(url, dest, &shared.cancel, |p| emit_progress(shared, tx, p)) {
                Ok(FetchOutcome::Completed) => dest.clone(),
                Ok(FetchOutcome::Cancelled) => {
                    finish(shared, tx, JobOutcome::Cancelled);
                    return;
                }
                Err(e) => {
                    finish(
                        shared,
                        tx,
                        JobOutcome::Failed {
                            error: e.to_string(),
                            device_state_unknown: false,
                        },
                    );
                    return;
                }
            }
        }
        JobSource::BuildRepo { repo_url } => {
            set_phase(shared, tx, JobPhase::Building);
            // The external build cannot be interrupted mid-script;
            // cancellation is honored at the phase boundaries.
            if shared.cancel.load(Ordering::SeqCst) {
                finish(shared, tx, JobOutcome::Cancelled);
                return;
            }
            match BuildAdapter::new(repo_url).build(|p| emit_progress(shared, tx, p)) {
                Ok(path) => path,
                Err(e) => {
                    finish(
                        shared,
                        tx,
                        JobOutcome::Failed {
                            error: e.to_string(),
                            device_state_unknown: false,
                        },
                    );
                    return;
                }
            }
        }
        JobSource::LocalImage { path } => path.clone(),
    };

    // --- Destructive write ---
    set_phase(shared, tx, JobPhase::Writing);

    // Last safe point: a cancel raised during acquisition (or before
    // the write) is honored here, with the device untouched.
    if shared.cancel.load(Ordering::SeqCst) {
        finish(shared, tx, JobOutcome::Cancelled);
        return;
    }
    shared.destructive_started.store(true, Ordering::SeqCst);

    match writer::write_image(&image, &spec.device_path, spec.allow_hazardous, |p| {
        emit_progress(shared, tx, p)
    }) {
        Ok(()) => finish(shared, tx, JobOutcome::Succeeded),
        Err(e) => {
            let device_state_unknown = e.device_state_unknown();
            finish(
                shared,
                tx,
                JobOutcome::Failed {
                    error: e.to_string(),
                    device_state_unknown,
                },
            );
        }
    }
}

// ============================================
// TESTS
// ============================================
