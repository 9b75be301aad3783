/*!
 * Scheduler
 *
 * Timed callbacks on a single background thread: one-shot after a delay,
 * every N seconds, daily at HH:MM, weekly at DOW/HH:MM. Jobs are integer
 * ids; they can be paused, resumed and cancelled. The thread sleeps on a
 * condvar until the earliest next-fire time in a min-heap; non-thread jobs
 * run inline (so two runs of the same job never overlap), jobs registered
 * with the thread option run in a detached worker.
 */

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone};
use tracing::{debug, info, warn};

use crate::error::SchedError;
use crate::sync::{Cond, NamedMutex};

/// The scheduled callback.
pub type SchedProc = Arc<dyn Fn() + Send + Sync>;
/// Invoked once when the job record is dropped (cancel or one-shot done).
pub type SchedCleanup = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Every `interval`, or once after it
    Interval(Duration),
    /// Daily at HH:MM local time
    Daily { hour: u32, minute: u32 },
    /// Weekly at DOW (0 = Sunday) HH:MM local time
    Weekly { day: u32, hour: u32, minute: u32 },
}

struct Job {
    kind: Kind,
    once: bool,
    /// Run in a detached thread instead of inline
    threaded: bool,
    paused: bool,
    running: bool,
    cancelled: bool,
    proc: SchedProc,
    cleanup: Option<SchedCleanup>,
    next: SystemTime,
}

struct SchedState {
    jobs: HashMap<i32, Job>,
    /// Min-heap of (next fire, id); entries go stale on reschedule and are
    /// skipped lazily
    heap: BinaryHeap<Reverse<(SystemTime, i32)>>,
    next_id: i32,
    started: bool,
    stopping: bool,
    running: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// The process scheduler.
pub struct Scheduler {
    state: NamedMutex<SchedState>,
    cond: Cond,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Scheduler {
            state: NamedMutex::new(
                "ns",
                "sched",
                SchedState {
                    jobs: HashMap::new(),
                    heap: BinaryHeap::new(),
                    next_id: 1,
                    started: false,
                    stopping: false,
                    running: false,
                    thread: None,
                },
            ),
            cond: Cond::new(),
        })
    }

    /// Start the scheduler thread.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.started {
            return;
        }
        state.started = true;
        state.running = true;
        let me = self.clone();
        state.thread = Some(
            std::thread::Builder::new()
                .name("-sched-".to_string())
                .spawn(move || me.run())
                .expect("failed to spawn scheduler thread"),
        );
    }

    fn insert(&self, kind: Kind, once: bool, threaded: bool, proc: SchedProc,
              cleanup: Option<SchedCleanup>) -> Result<i32, SchedError> {
        let next = next_fire(kind, SystemTime::now())?;
        let mut state = self.state.lock();
        if state.stopping {
            return Err(SchedError::Shutdown);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(
            id,
            Job {
                kind,
                once,
                threaded,
                paused: false,
                running: false,
                cancelled: false,
                proc,
                cleanup,
                next,
            },
        );
        state.heap.push(Reverse((next, id)));
        self.cond.broadcast();
        debug!(id, "scheduled {:?}", kind);
        Ok(id)
    }

    /// Run `proc` every `interval` seconds.
    pub fn schedule(self: &Arc<Self>, interval: Duration, proc: SchedProc) -> Result<i32, SchedError> {
        self.insert(Kind::Interval(interval), false, false, proc, None)
    }

    /// Run `proc` once after `delay`.
    pub fn after(self: &Arc<Self>, delay: Duration, proc: SchedProc) -> Result<i32, SchedError> {
        self.insert(Kind::Interval(delay), true, false, proc, None)
    }

    /// Full-control registration.
    pub fn schedule_ex(
        self: &Arc<Self>,
        interval: Duration,
        once: bool,
        threaded: bool,
        proc: SchedProc,
        cleanup: Option<SchedCleanup>,
    ) -> Result<i32, SchedError> {
        self.insert(Kind::Interval(interval), once, threaded, proc, cleanup)
    }

    /// Run `proc` daily at HH:MM local time.
    pub fn schedule_daily(
        self: &Arc<Self>,
        hour: u32,
        minute: u32,
        once: bool,
        threaded: bool,
        proc: SchedProc,
    ) -> Result<i32, SchedError> {
        self.insert(Kind::Daily { hour, minute }, once, threaded, proc, None)
    }

    /// Run `proc` weekly at DOW (0 = Sunday) HH:MM local time.
    pub fn schedule_weekly(
        self: &Arc<Self>,
        day: u32,
        hour: u32,
        minute: u32,
        once: bool,
        threaded: bool,
        proc: SchedProc,
    ) -> Result<i32, SchedError> {
        self.insert(Kind::Weekly { day, hour, minute }, once, threaded, proc, None)
    }

    /// Cancel a job. Returns whether it was running at the time; a running
    /// job finishes its current invocation and is then dropped.
    pub fn cancel(&self, id: i32) -> Result<bool, SchedError> {
        let mut cleanup = None;
        let was_running;
        {
            let mut state = self.state.lock();
            let job = state.jobs.get_mut(&id).ok_or(SchedError::NoSuchJob(id))?;
            was_running = job.running;
            if was_running {
                // the scheduler loop drops it after the callback returns
                job.cancelled = true;
            } else {
                let mut job = state.jobs.remove(&id).expect("present above");
                cleanup = job.cleanup.take();
            }
            self.cond.broadcast();
        }
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        Ok(was_running)
    }

    /// Pause a job: it stays registered and keeps advancing its next-fire
    /// time, but the callback is skipped.
    pub fn pause(&self, id: i32) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or(SchedError::NoSuchJob(id))?;
        job.paused = true;
        Ok(())
    }

    /// Resume a paused job, rescheduling from now.
    pub fn resume(&self, id: i32) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        let kind = state
            .jobs
            .get(&id)
            .ok_or(SchedError::NoSuchJob(id))?
            .kind;
        let next = next_fire(kind, SystemTime::now()).expect("validated at registration");
        if let Some(job) = state.jobs.get_mut(&id) {
            job.paused = false;
            job.next = next;
        }
        state.heap.push(Reverse((next, id)));
        self.cond.broadcast();
        Ok(())
    }

    pub fn is_scheduled(&self, id: i32) -> bool {
        self.state.lock().jobs.contains_key(&id)
    }

    /// Scheduler thread main loop.
    fn run(self: Arc<Self>) {
        info!("starting");
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                break;
            }

            // drop stale heap entries (rescheduled or cancelled jobs)
            let head = loop {
                let top = state.heap.peek().map(|Reverse(entry)| *entry);
                match top {
                    None => break None,
                    Some((at, id)) => {
                        if state.jobs.get(&id).is_some_and(|job| job.next == at) {
                            break Some((at, id));
                        }
                        state.heap.pop();
                    }
                }
            };

            let Some((at, id)) = head else {
                state = self.cond.wait(state);
                continue;
            };

            if let Ok(wait) = at.duration_since(SystemTime::now()) {
                if !wait.is_zero() {
                    let deadline = Instant::now() + wait;
                    let (guard, _) = self.cond.timed_wait(state, Some(deadline));
                    state = guard;
                    continue; // re-evaluate: the head may have changed
                }
            }
            state.heap.pop();

            let (cancelled, paused, threaded, kind, proc) = {
                let job = state.jobs.get(&id).expect("validated above");
                (job.cancelled, job.paused, job.threaded, job.kind, job.proc.clone())
            };

            if cancelled {
                state = self.retire(state, id);
                continue;
            }
            if paused {
                // skip the callback, keep the cadence
                if let Ok(next) = next_fire(kind, SystemTime::now()) {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.next = next;
                    }
                    state.heap.push(Reverse((next, id)));
                }
                continue;
            }

            if threaded {
                std::thread::Builder::new()
                    .name(format!("-sched:{}-", id))
                    .spawn(move || proc())
                    .expect("failed to spawn sched job thread");
            } else {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.running = true;
                }
                drop(state);
                proc();
                state = self.state.lock();
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.running = false;
                }
            }

            // reschedule or retire
            let terminal = state.jobs.get(&id).map(|job| job.cancelled || job.once);
            match terminal {
                None => {}
                Some(true) => state = self.retire(state, id),
                Some(false) => {
                    if let Ok(next) = next_fire(kind, SystemTime::now()) {
                        if let Some(job) = state.jobs.get_mut(&id) {
                            job.next = next;
                        }
                        state.heap.push(Reverse((next, id)));
                    }
                }
            }
        }
        state.running = false;
        self.cond.broadcast();
        drop(state);
        info!("exiting");
    }

    /// Drop a job record, running its cleanup outside the lock.
    fn retire<'a>(
        &'a self,
        mut state: crate::sync::MutexGuard<'a, SchedState>,
        id: i32,
    ) -> crate::sync::MutexGuard<'a, SchedState> {
        if let Some(mut job) = state.jobs.remove(&id) {
            if let Some(cleanup) = job.cleanup.take() {
                drop(state);
                cleanup();
                return self.state.lock();
            }
        }
        state
    }

    /// Flag shutdown and wake the thread.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.cond.broadcast();
    }

    /// Wait (bounded) for the scheduler thread to exit.
    pub fn wait_shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.running {
            let (guard, outcome) = self.cond.timed_wait(state, Some(deadline));
            state = guard;
            if outcome.timed_out() && state.running {
                warn!("timeout waiting for scheduler exit");
                return;
            }
        }
        if let Some(handle) = state.thread.take() {
            drop(state);
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Scheduler")
    }
}

/// Compute the next fire time after `now`, validating ranges.
fn next_fire(kind: Kind, now: SystemTime) -> Result<SystemTime, SchedError> {
    match kind {
        Kind::Interval(interval) => Ok(now + interval),
        Kind::Daily { hour, minute } => {
            check_time(hour, minute)?;
            Ok(next_daily(Local::now(), hour, minute))
        }
        Kind::Weekly { day, hour, minute } => {
            if day > 6 {
                return Err(SchedError::InvalidTime(format!("day {day} not in 0..=6")));
            }
            check_time(hour, minute)?;
            Ok(next_weekly(Local::now(), day, hour, minute))
        }
    }
}

fn check_time(hour: u32, minute: u32) -> Result<(), SchedError> {
    if hour > 23 {
        return Err(SchedError::InvalidTime(format!("hour {hour} not in 0..=23")));
    }
    if minute > 59 {
        return Err(SchedError::InvalidTime(format!(
            "minute {minute} not in 0..=59"
        )));
    }
    Ok(())
}

/// Next wall-clock instant at HH:MM strictly after `now`.
fn next_daily(now: DateTime<Local>, hour: u32, minute: u32) -> SystemTime {
    let mut candidate = at_time(now, hour, minute);
    if candidate <= now {
        candidate = at_time(now + ChronoDuration::days(1), hour, minute);
    }
    candidate.into()
}

/// As daily, then advance whole days until the weekday matches (0 = Sunday).
fn next_weekly(now: DateTime<Local>, day: u32, hour: u32, minute: u32) -> SystemTime {
    let mut candidate = at_time(now, hour, minute);
    if candidate <= now {
        candidate = at_time(now + ChronoDuration::days(1), hour, minute);
    }
    while candidate.weekday().num_days_from_sunday() != day {
        candidate = candidate + ChronoDuration::days(1);
    }
    candidate.into()
}

fn at_time(day: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(day.year(), day.month(), day.day(), hour, minute, 0)
        .earliest()
        // a DST gap swallowed HH:MM; the hour after is the convention
        .unwrap_or_else(|| {
            Local
                .with_ymd_and_hms(day.year(), day.month(), day.day(), hour + 1, minute, 0)
                .earliest()
                .expect("hour after a DST gap exists")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use chrono::{NaiveDate, Timelike};

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn test_next_daily_same_day_and_rollover() {
        let now = local(2024, 3, 4, 2, 0, 0);
        let next: DateTime<Local> = DateTime::from(next_daily(now, 3, 15));
        assert_eq!((next.day(), next.hour(), next.minute()), (4, 3, 15));

        let now = local(2024, 3, 4, 4, 0, 0);
        let next: DateTime<Local> = DateTime::from(next_daily(now, 3, 15));
        assert_eq!((next.day(), next.hour(), next.minute()), (5, 3, 15));
    }

    #[test]
    fn test_next_daily_just_before_is_same_day() {
        // 03:14:59 -> today 03:15:00
        let now = local(2024, 3, 4, 3, 14, 59);
        let next: DateTime<Local> = DateTime::from(next_daily(now, 3, 15));
        assert_eq!((next.day(), next.hour(), next.minute(), next.second()), (4, 3, 15, 0));
    }

    #[test]
    fn test_next_weekly_advances_to_dow() {
        // 2024-03-04 is a Monday (dow 1); next Sunday (dow 0) is 03-10
        let now = local(2024, 3, 4, 12, 0, 0);
        let next: DateTime<Local> = DateTime::from(next_weekly(now, 0, 3, 15));
        assert_eq!((next.month(), next.day()), (3, 10));
        assert_eq!(next.weekday().num_days_from_sunday(), 0);
    }

    #[test]
    fn test_weekly_same_dow_later_today() {
        // Monday noon, weekly Monday 23:00 fires today
        let now = local(2024, 3, 4, 12, 0, 0);
        let next: DateTime<Local> = DateTime::from(next_weekly(now, 1, 23, 0));
        assert_eq!(next.day(), 4);
    }

    #[test]
    fn test_invalid_times_fail_registration() {
        let sched = Scheduler::new();
        let noop: SchedProc = Arc::new(|| {});
        assert!(matches!(
            sched.schedule_daily(24, 0, false, false, noop.clone()),
            Err(SchedError::InvalidTime(_))
        ));
        assert!(matches!(
            sched.schedule_daily(1, 60, false, false, noop.clone()),
            Err(SchedError::InvalidTime(_))
        ));
        assert!(matches!(
            sched.schedule_weekly(7, 1, 0, false, false, noop),
            Err(SchedError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_one_shot_fires_exactly_once() {
        let sched = Scheduler::new();
        sched.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = sched
            .after(Duration::ZERO, Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!sched.is_scheduled(id), "one-shot retires after firing");
        sched.begin_shutdown();
        sched.wait_shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_periodic_fires_repeatedly_and_cancels() {
        let sched = Scheduler::new();
        sched.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = sched
            .schedule(Duration::from_millis(30), Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "expected several fires, got {count}");

        sched.cancel(id).unwrap();
        let settled = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) <= settled + 1, "no fires after cancel");
        assert!(matches!(sched.cancel(id), Err(SchedError::NoSuchJob(_))));
        sched.begin_shutdown();
        sched.wait_shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_pause_skips_resume_restores() {
        let sched = Scheduler::new();
        sched.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = sched
            .schedule(Duration::from_millis(30), Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        sched.pause(id).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) <= 1, "paused job must not fire");

        sched.resume(id).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) >= 1, "resumed job fires again");
        sched.begin_shutdown();
        sched.wait_shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_nonoverlapping_inline_runs() {
        // a slow periodic job: the second run starts only after the first
        // returns
        let sched = Scheduler::new();
        sched.start();
        let overlap = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let (overlap2, active2) = (overlap.clone(), active.clone());
        sched
            .schedule(Duration::from_millis(10), Arc::new(move || {
                let n = active2.fetch_add(1, Ordering::SeqCst);
                overlap2.fetch_max(n + 1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(40));
                active2.fetch_sub(1, Ordering::SeqCst);
            }))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        sched.begin_shutdown();
        sched.wait_shutdown(Duration::from_secs(2));
        assert_eq!(overlap.load(Ordering::SeqCst), 1, "inline runs never overlap");
    }

    #[test]
    fn test_cleanup_runs_on_cancel() {
        let sched = Scheduler::new();
        let cleaned = Arc::new(Mutex::new(false));
        let cleaned2 = cleaned.clone();
        let id = sched
            .schedule_ex(
                Duration::from_secs(3600),
                false,
                false,
                Arc::new(|| {}),
                Some(Box::new(move || {
                    *cleaned2.lock().unwrap() = true;
                })),
            )
            .unwrap();
        sched.cancel(id).unwrap();
        assert!(*cleaned.lock().unwrap());
    }

    #[test]
    fn test_threaded_job_runs_detached() {
        let sched = Scheduler::new();
        sched.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        sched
            .schedule_ex(
                Duration::ZERO,
                true,
                true,
                Arc::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        sched.begin_shutdown();
        sched.wait_shutdown(Duration::from_secs(2));
    }
}
