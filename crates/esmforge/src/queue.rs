//! The build queue: a bounded-concurrency, single-flight job dispatcher
//! keyed by build identity.
//!
//! At most one job per identity runs at any time; every request for an
//! identity while its job is pending or running attaches a waiter and all
//! waiters receive the same outcome. Finished tasks linger briefly so
//! near-simultaneous arrivals get the cached outcome without requeueing.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use esmforge_core::hash::hash_string;
use esmforge_core::BuildIdentity;
use esmforge_core::BuildResult;
use esmforge_core::ForgeError;

/// How long a finished task stays addressable in the index.
const DONE_RETENTION: Duration = Duration::from_secs(5);
/// Duplicate adds from one requester inside this window don't count as new
/// clients.
const DUPLICATE_ADD_WINDOW: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
  /// Build the module artefact (js/css/map + metadata).
  Module,
  /// Rewrite and persist the type-definition tree.
  Types,
}

#[derive(Clone, Debug)]
pub struct JobSpec {
  pub kind: JobKind,
  pub identity: BuildIdentity,
}

impl JobSpec {
  pub fn module(identity: BuildIdentity) -> Self {
    Self {
      kind: JobKind::Module,
      identity,
    }
  }

  pub fn types(identity: BuildIdentity) -> Self {
    Self {
      kind: JobKind::Types,
      identity,
    }
  }

  pub fn key(&self) -> String {
    match self.kind {
      JobKind::Module => self.identity.url_path(),
      JobKind::Types => format!("types:{}", self.identity.url_path()),
    }
  }
}

pub type JobOutcome = Result<BuildResult, ForgeError>;

/// Write-handle for a job's current pipeline stage, shown in `/status.json`.
#[derive(Clone, Debug, Default)]
pub struct Stage(Arc<Mutex<String>>);

impl Stage {
  pub fn set(&self, stage: &str) {
    *self.0.lock() = stage.to_string();
  }

  pub fn get(&self) -> String {
    self.0.lock().clone()
  }
}

/// Executes one queued job. The queue owns scheduling; the runner owns the
/// actual build semantics.
#[async_trait]
pub trait JobRunner: Send + Sync {
  async fn run(&self, spec: &JobSpec, stage: Stage) -> JobOutcome;
}

struct TaskEntry {
  spec: JobSpec,
  stage: Stage,
  clients: usize,
  created_at: SystemTime,
  started_at: Option<SystemTime>,
  in_process: bool,
  next_waiter_id: u64,
  waiters: HashMap<u64, oneshot::Sender<JobOutcome>>,
  done: Option<JobOutcome>,
}

#[derive(Default)]
struct QueueState {
  tasks: HashMap<String, TaskEntry>,
  pending: VecDeque<String>,
  running: usize,
  /// `hash(requester + key)` → last add time, for the duplicate-add window.
  recent_adds: HashMap<String, Instant>,
}

struct QueueInner {
  runner: Arc<dyn JobRunner>,
  concurrency: usize,
  state: Mutex<QueueState>,
}

pub struct WaitHandle {
  key: String,
  waiter_id: u64,
  rx: oneshot::Receiver<JobOutcome>,
}

/// One task descriptor for `/status.json`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
  pub path: String,
  pub kind: JobKind,
  pub stage: String,
  pub clients: usize,
  pub in_process: bool,
  pub created_at: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deps: Option<String>,
}

#[derive(Clone)]
pub struct BuildQueue {
  inner: Arc<QueueInner>,
}

impl BuildQueue {
  pub fn new(runner: Arc<dyn JobRunner>, concurrency: usize) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        runner,
        concurrency: concurrency.max(1),
        state: Mutex::new(QueueState::default()),
      }),
    }
  }

  pub fn default_concurrency() -> usize {
    2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
  }

  /// Register a request for the job. Attaches to the existing task when one
  /// is in flight, otherwise enqueues a new one.
  pub fn add(&self, spec: JobSpec, requester: &str) -> WaitHandle {
    let key = spec.key();
    let (tx, rx) = oneshot::channel();
    let mut waiter_id = u64::MAX;
    {
      let mut state = self.inner.state.lock();

      let now = Instant::now();
      state
        .recent_adds
        .retain(|_, at| at.elapsed() < DUPLICATE_ADD_WINDOW);
      let dup_key = hash_string(&format!("{requester}\u{0}{key}"));
      let duplicate = state.recent_adds.contains_key(&dup_key);
      state.recent_adds.insert(dup_key, now);

      match state.tasks.get_mut(&key) {
        Some(task) => {
          if let Some(done) = &task.done {
            let _ = tx.send(done.clone());
          } else {
            waiter_id = task.next_waiter_id;
            task.next_waiter_id += 1;
            task.waiters.insert(waiter_id, tx);
          }
          if !duplicate {
            task.clients += 1;
          }
        }
        None => {
          let stage = Stage::default();
          stage.set("pending");
          let mut waiters = HashMap::new();
          waiter_id = 0;
          waiters.insert(waiter_id, tx);
          state.tasks.insert(
            key.clone(),
            TaskEntry {
              spec,
              stage,
              clients: 1,
              created_at: SystemTime::now(),
              started_at: None,
              in_process: false,
              next_waiter_id: 1,
              waiters,
              done: None,
            },
          );
          state.pending.push_back(key.clone());
        }
      }
    }
    self.dispatch();
    WaitHandle { key, waiter_id, rx }
  }

  /// Await a handle, detaching it on timeout. Detaching never cancels the
  /// underlying job; a later request will hit its cached outcome.
  pub async fn wait(&self, handle: WaitHandle, timeout: Duration) -> JobOutcome {
    match tokio::time::timeout(timeout, handle.rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => Err(ForgeError::internal("build task vanished")),
      Err(_) => {
        self.detach(&handle.key, handle.waiter_id);
        Err(ForgeError::timeout(
          "timeout, the build is still running, please retry shortly",
        ))
      }
    }
  }

  fn detach(&self, key: &str, waiter_id: u64) {
    let mut state = self.inner.state.lock();
    if let Some(task) = state.tasks.get_mut(key) {
      task.waiters.remove(&waiter_id);
      task.clients = task.clients.saturating_sub(1);
    }
  }

  fn dispatch(&self) {
    loop {
      let job = {
        let mut state = self.inner.state.lock();
        if state.running >= self.inner.concurrency {
          None
        } else if let Some(key) = state.pending.pop_front() {
          let job = match state.tasks.get_mut(&key) {
            Some(task) => {
              task.in_process = true;
              task.started_at = Some(SystemTime::now());
              Some((key, task.spec.clone(), task.stage.clone()))
            }
            None => continue,
          };
          if job.is_some() {
            state.running += 1;
          }
          job
        } else {
          None
        }
      };
      let Some((key, spec, stage)) = job else {
        break;
      };
      let queue = self.clone();
      tokio::spawn(async move {
        tracing::debug!(key = %key, "job started");
        let outcome = queue.inner.runner.run(&spec, stage).await;
        if let Err(err) = &outcome {
          tracing::warn!(key = %key, error = %err, "job failed");
        }
        queue.complete(&key, outcome);
      });
    }
  }

  fn complete(&self, key: &str, outcome: JobOutcome) {
    let waiters = {
      let mut state = self.inner.state.lock();
      state.running = state.running.saturating_sub(1);
      match state.tasks.get_mut(key) {
        Some(task) => {
          task.in_process = false;
          task.done = Some(outcome.clone());
          task.stage.set("done");
          std::mem::take(&mut task.waiters)
        }
        None => HashMap::new(),
      }
    };
    for (_, tx) in waiters {
      let _ = tx.send(outcome.clone());
    }

    let inner = self.inner.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      tokio::time::sleep(DONE_RETENTION).await;
      let mut state = inner.state.lock();
      if state.tasks.get(&key).map(|t| t.done.is_some()).unwrap_or(false) {
        state.tasks.remove(&key);
      }
    });

    self.dispatch();
  }

  pub fn status(&self) -> Vec<TaskStatus> {
    let state = self.inner.state.lock();
    let mut statuses: Vec<TaskStatus> = state
      .tasks
      .values()
      .filter(|task| task.done.is_none())
      .map(|task| TaskStatus {
        path: task.spec.identity.url_path(),
        kind: task.spec.kind,
        stage: task.stage.get(),
        clients: task.clients,
        in_process: task.in_process,
        created_at: epoch_secs(task.created_at),
        started_at: task.started_at.map(epoch_secs),
        deps: if task.spec.identity.args.deps.is_empty() {
          None
        } else {
          Some(
            task
              .spec
              .identity
              .args
              .deps
              .iter()
              .map(|d| d.to_string())
              .collect::<Vec<_>>()
              .join(","),
          )
        },
      })
      .collect();
    statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    statuses
  }
}

fn epoch_secs(at: SystemTime) -> u64 {
  at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use pretty_assertions::assert_eq;

  use super::*;
  use esmforge_core::Pkg;
  use esmforge_core::Target;

  struct GatedRunner {
    runs: AtomicUsize,
    gate: tokio::sync::Semaphore,
  }

  impl GatedRunner {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        runs: AtomicUsize::new(0),
        gate: tokio::sync::Semaphore::new(0),
      })
    }

    fn release(&self, n: usize) {
      self.gate.add_permits(n);
    }
  }

  #[async_trait]
  impl JobRunner for GatedRunner {
    async fn run(&self, _spec: &JobSpec, stage: Stage) -> JobOutcome {
      stage.set("build");
      let _permit = self.gate.acquire().await.unwrap();
      self.runs.fetch_add(1, Ordering::SeqCst);
      Ok(BuildResult {
        has_default_export: true,
        ..Default::default()
      })
    }
  }

  fn identity(name: &str) -> BuildIdentity {
    BuildIdentity {
      build_version: 2,
      pkg: Pkg::new(name, "1.0.0"),
      target: Target::Es2022,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn multiplexes_concurrent_adds_onto_one_run() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 4);

    let handles: Vec<WaitHandle> = (0..5)
      .map(|i| queue.add(JobSpec::module(identity("react")), &format!("client-{i}")))
      .collect();
    assert_eq!(queue.status().len(), 1);
    assert_eq!(queue.status()[0].clients, 5);

    runner.release(8);
    for handle in handles {
      let result = queue.wait(handle, Duration::from_secs(5)).await.unwrap();
      assert!(result.has_default_export);
    }
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn distinct_identities_run_independently() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 4);
    let a = queue.add(JobSpec::module(identity("react")), "c");
    let b = queue.add(JobSpec::module(identity("preact")), "c");
    runner.release(8);
    queue.wait(a, Duration::from_secs(5)).await.unwrap();
    queue.wait(b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn respects_the_worker_pool_size() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 1);
    let a = queue.add(JobSpec::module(identity("one")), "c");
    let b = queue.add(JobSpec::module(identity("two")), "c");

    // with one slot only the first task may be in process
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = queue.status();
    let in_process: Vec<bool> = status.iter().map(|t| t.in_process).collect();
    assert_eq!(in_process.iter().filter(|b| **b).count(), 1);

    runner.release(8);
    queue.wait(a, Duration::from_secs(5)).await.unwrap();
    queue.wait(b, Duration::from_secs(5)).await.unwrap();
  }

  #[tokio::test]
  async fn timeout_detaches_but_does_not_cancel() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 2);
    let slow = queue.add(JobSpec::module(identity("slow")), "c");

    let outcome = queue.wait(slow, Duration::from_millis(50)).await;
    assert_eq!(outcome.unwrap_err().kind, esmforge_core::ErrorKind::Timeout);

    // the job is still running; release it and a fresh waiter sees success
    let retry = queue.add(JobSpec::module(identity("slow")), "c");
    runner.release(8);
    let result = queue.wait(retry, Duration::from_secs(5)).await.unwrap();
    assert!(result.has_default_export);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn duplicate_adds_within_window_do_not_bump_clients() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 1);
    let _a = queue.add(JobSpec::module(identity("react")), "same-ip");
    let _b = queue.add(JobSpec::module(identity("react")), "same-ip");
    let _c = queue.add(JobSpec::module(identity("react")), "other-ip");
    assert_eq!(queue.status()[0].clients, 2);
    runner.release(8);
  }

  #[tokio::test]
  async fn module_and_types_jobs_do_not_collide() {
    let runner = GatedRunner::new();
    let queue = BuildQueue::new(runner.clone(), 4);
    let a = queue.add(JobSpec::module(identity("react")), "c");
    let b = queue.add(JobSpec::types(identity("react")), "c");
    runner.release(8);
    queue.wait(a, Duration::from_secs(5)).await.unwrap();
    queue.wait(b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn errors_fan_out_to_every_waiter() {
    struct FailingRunner;
    #[async_trait]
    impl JobRunner for FailingRunner {
      async fn run(&self, spec: &JobSpec, _stage: Stage) -> JobOutcome {
        Err(ForgeError::not_found(format!(
          "package \"{}\" not found",
          spec.identity.pkg.name
        )))
      }
    }

    let queue = BuildQueue::new(Arc::new(FailingRunner), 2);
    let a = queue.add(JobSpec::module(identity("ghost")), "x");
    let b = queue.add(JobSpec::module(identity("ghost")), "y");
    let ea = queue.wait(a, Duration::from_secs(5)).await.unwrap_err();
    let eb = queue.wait(b, Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(ea, eb);
    assert_eq!(ea.kind, esmforge_core::ErrorKind::NotFound);
  }
}
