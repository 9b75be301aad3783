/*!
 * Background job queues
 *
 * User-named bounded worker pools for ad-hoc script evaluation. `queue`
 * hands a script to a queue and returns a job id; `wait` blocks until the
 * job is done and yields the captured result and error strings; `cancel`
 * abandons a job, discarding its result if it is already running. Workers
 * are spawned on demand up to the queue's thread cap and exit when their
 * queue drains during shutdown.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{JobError, WaitOutcome};
use crate::script::{ScriptEngine, ScriptOutcome};
use crate::sync::{Cond, NamedMutex};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct JobFlags: u8 {
        const DONE    = 0b001;
        const CANCEL  = 0b010;
        const RUNNING = 0b100;
    }
}

/// One queued script. Shared between the queue's pending list, its id map,
/// and the worker running it; all field access happens under the record's
/// own lock, taken strictly after the queue lock.
struct JobRec {
    script: String,
    flags: JobFlags,
    outcome: Option<ScriptOutcome>,
}

type JobRef = Arc<Mutex<JobRec>>;

struct QueueState {
    pending: VecDeque<JobRef>,
    jobs: HashMap<String, JobRef>,
    next_id: u64,
    nthreads: usize,
    nidle: usize,
    stopping: bool,
}

/// A named job queue.
pub struct JobQueue {
    name: String,
    maxthreads: usize,
    state: NamedMutex<QueueState>,
    cond: Cond,
    engine: Arc<dyn ScriptEngine>,
    /// Workers wait here until the server has finished starting.
    started: Arc<(Mutex<bool>, Condvar)>,
}

impl JobQueue {
    /// Submit a script; returns the job id.
    pub fn queue(self: &Arc<Self>, script: &str) -> Result<String, JobError> {
        let (id, spawn) = {
            let mut state = self.state.lock();
            if state.stopping {
                return Err(JobError::Stopping);
            }
            let job = Arc::new(Mutex::new(JobRec {
                script: script.to_string(),
                flags: JobFlags::empty(),
                outcome: None,
            }));
            state.pending.push_back(job.clone());
            let id = format!("job{}", state.next_id);
            state.next_id += 1;
            state.jobs.insert(id.clone(), job);
            let spawn = state.nidle == 0 && state.nthreads < self.maxthreads;
            if spawn {
                state.nthreads += 1;
            }
            self.cond.broadcast();
            (id, spawn.then_some(state.nthreads))
        };
        if let Some(n) = spawn {
            let queue = self.clone();
            std::thread::Builder::new()
                .name(format!("-job:{}{}-", self.name, n))
                .spawn(move || queue.worker())
                .expect("failed to spawn job worker");
        }
        Ok(id)
    }

    /// Block until the job finishes; yields its outcome. The job is removed
    /// from the queue immediately, so a second wait on the same id fails.
    pub fn wait(&self, id: &str) -> Result<ScriptOutcome, JobError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .remove(id)
            .ok_or_else(|| JobError::NoSuchJob(id.to_string()))?;
        loop {
            if job.lock().unwrap().flags.contains(JobFlags::DONE) {
                break;
            }
            state = self.cond.wait(state);
        }
        drop(state);
        let mut rec = job.lock().unwrap();
        Ok(rec.outcome.take().unwrap_or_default())
    }

    /// Abandon a job. Returns whether it was running; a running job's
    /// result is discarded when the worker finishes.
    pub fn cancel(&self, id: &str) -> Result<bool, JobError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .remove(id)
            .ok_or_else(|| JobError::NoSuchJob(id.to_string()))?;
        let mut rec = job.lock().unwrap();
        rec.flags.insert(JobFlags::CANCEL);
        Ok(rec.flags.contains(JobFlags::RUNNING))
    }

    /// Ids of jobs currently queued, running or unreaped.
    pub fn jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker loop: pop, evaluate via the script engine, capture, repeat.
    fn worker(self: Arc<Self>) {
        {
            let (started, cond) = &*self.started;
            let mut flag = started.lock().unwrap();
            while !*flag {
                flag = cond.wait(flag).unwrap();
            }
        }
        info!(queue = %self.name, "starting");
        let mut state = self.state.lock();
        loop {
            state.nidle += 1;
            while state.pending.is_empty() && !state.stopping {
                state = self.cond.wait(state);
            }
            state.nidle -= 1;
            let Some(job) = state.pending.pop_front() else {
                break; // stopping and drained
            };
            let script = {
                let mut rec = job.lock().unwrap();
                rec.flags.insert(JobFlags::RUNNING);
                if rec.flags.contains(JobFlags::CANCEL) {
                    continue; // cancelled before it ever ran
                }
                rec.script.clone()
            };
            drop(state);

            let mut interp = self.engine.allocate();
            let outcome = self.engine.eval(interp.as_mut(), &script);
            if !outcome.ok() {
                self.engine.log_error(&script, &outcome);
            }
            self.engine.deallocate(interp);

            state = self.state.lock();
            let mut rec = job.lock().unwrap();
            rec.flags.insert(JobFlags::DONE);
            rec.flags.remove(JobFlags::RUNNING);
            rec.outcome = Some(outcome);
            let cancelled = rec.flags.contains(JobFlags::CANCEL);
            drop(rec);
            if cancelled {
                // nobody will wait; the record drops with its last Arc
                debug!(queue = %self.name, "discarding cancelled job result");
            } else {
                self.cond.broadcast();
            }
        }
        state.nthreads -= 1;
        self.cond.broadcast();
        drop(state);
        info!(queue = %self.name, "exiting");
    }

    fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.cond.broadcast();
    }

    fn wait_shutdown(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while state.nthreads > 0 {
            let (guard, outcome) = self.cond.timed_wait(state, Some(deadline));
            state = guard;
            if outcome == WaitOutcome::TimedOut && state.nthreads > 0 {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("maxthreads", &self.maxthreads)
            .finish()
    }
}

/// Registry of named queues.
pub struct JobQueues {
    queues: NamedMutex<HashMap<String, Arc<JobQueue>>>,
    engine: Arc<dyn ScriptEngine>,
    started: Arc<(Mutex<bool>, Condvar)>,
}

impl JobQueues {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Arc<Self> {
        Arc::new(JobQueues {
            queues: NamedMutex::new("ns", "jobqueues", HashMap::new()),
            engine,
            started: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    /// Release workers once the server is up.
    pub fn mark_started(&self) {
        let (started, cond) = &*self.started;
        *started.lock().unwrap() = true;
        cond.notify_all();
    }

    /// Create a queue; fails if the name is taken.
    pub fn create(&self, name: &str, maxthreads: usize) -> Result<Arc<JobQueue>, JobError> {
        let mut queues = self.queues.lock();
        if queues.contains_key(name) {
            return Err(JobError::QueueExists(name.to_string()));
        }
        let queue = Arc::new(JobQueue {
            name: name.to_string(),
            maxthreads: maxthreads.max(1),
            state: NamedMutex::new(
                "job",
                name,
                QueueState {
                    pending: VecDeque::new(),
                    jobs: HashMap::new(),
                    next_id: 0,
                    nthreads: 0,
                    nidle: 0,
                    stopping: false,
                },
            ),
            cond: Cond::new(),
            engine: self.engine.clone(),
            started: self.started.clone(),
        });
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Result<Arc<JobQueue>, JobError> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::NoSuchQueue(name.to_string()))
    }

    /// Names of all queues.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flag every queue as stopping and wake its workers. Workers still
    /// parked on the startup gate are released so they can drain and exit.
    pub fn begin_shutdown(&self) {
        self.mark_started();
        let queues: Vec<Arc<JobQueue>> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.begin_shutdown();
        }
    }

    /// Wait (bounded) for all workers to exit.
    pub fn wait_shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let queues: Vec<Arc<JobQueue>> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            if !queue.wait_shutdown(deadline) {
                warn!(queue = %queue.name(), "timeout waiting for job workers to exit");
                return;
            }
        }
    }
}

impl std::fmt::Debug for JobQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueues").field("queues", &self.names()).finish()
    }
}
