// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cooperative multi-policy scheduler (§4.F): fixed worker threads draining
//! per-worker and global runqueues, with `notify`/`stop`/`shutdown` as the
//! only ways anything outside a worker thread touches a coroutine.
//!
//! Grounded on the teacher's `engine::router::Router` worker-thread
//! lifecycle (`Arc<AtomicBool>` stop flag, `JoinHandle`, a `Drop` that
//! joins) and its hot-path polling shape (fast check, then a short
//! `spin_loop` phase, then a parked wait) in `router_loop_with_transport`;
//! the per-policy runqueue texture is grounded in
//! `transport::lowbw::scheduler::Scheduler`'s `VecDeque`-backed queues and
//! `SchedulerStats`-style accounting. Runqueues are per-worker
//! `parking_lot::Mutex`es plus one global lock for migrations, matching
//! the concurrency model's "stealing uses try-lock only" rule.

pub mod policy;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::coroutine::{Coroutine, CoroutineId, Context, ResumeOutcome, Shared, State};
use crate::signal::{Connection, Signal};
use policy::{from_config, Policy, WorkerLoad};

const SPIN_ITERATIONS: usize = 200;
const PARK_TIMEOUT: Duration = Duration::from_micros(200);

struct WorkerState {
    local: Mutex<VecDeque<Coroutine>>,
    queue_len: AtomicUsize,
    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            local: Mutex::new(VecDeque::new()),
            queue_len: AtomicUsize::new(0),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
        }
    }

    fn load(&self) -> WorkerLoad {
        WorkerLoad {
            queue_len: self.queue_len.load(Ordering::Relaxed),
        }
    }

    fn push(&self, coro: Coroutine) {
        self.local.lock().push_back(coro);
        self.queue_len.fetch_add(1, Ordering::Relaxed);
        self.unpark();
    }

    fn unpark(&self) {
        self.park_cv.notify_one();
    }
}

/// Shared state referenced by every worker thread plus by the `Scheduler`
/// handle the application holds.
struct Inner {
    workers: Vec<WorkerState>,
    global: Mutex<VecDeque<Coroutine>>,
    policy: Box<dyn Policy>,
    starvation_ns: u64,
    /// Home worker assigned at spawn time, used for notify routing and by
    /// policies that pin affinity (classic/choreography).
    homes: DashMap<CoroutineId, usize>,
    /// Coroutines parked outside any runqueue (DATA_WAIT/IO_WAIT/SLEEP),
    /// reachable by `notify` regardless of which worker last ran them.
    /// Wrapped in a `Mutex` purely so the entry is `Sync` for `DashMap`'s
    /// bounds; each entry is only ever touched by a single `remove`.
    waiting: DashMap<CoroutineId, Mutex<Coroutine>>,
    /// `Shared` cells cloned at spawn time, kept independent of wherever
    /// the owning `Coroutine` currently lives, so `stop` always works.
    shared_table: DashMap<CoroutineId, Arc<Shared>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    /// Emits a coroutine's id every time this scheduler force-wakes it out
    /// of `waiting` — `notify`, `stop`, `shutdown`'s sweep, and the sleep
    /// deadline sweep all go through this one signal (§4.G "Used by ...
    /// F to wake waiters"), so anything observing scheduler activity
    /// (tests, instrumentation) connects in one place rather than hooking
    /// each wake path individually.
    woken: Signal<CoroutineId>,
}

impl Inner {
    fn loads(&self) -> Vec<WorkerLoad> {
        self.workers.iter().map(WorkerState::load).collect()
    }

    fn all_queues_empty(&self) -> bool {
        self.global.lock().is_empty() && self.workers.iter().all(|w| w.queue_len.load(Ordering::Relaxed) == 0)
    }

    /// Pull `id` out of `waiting` and back onto its home runqueue, emitting
    /// `woken` (§4.G). Returns `false` if `id` was not parked.
    fn force_wake(&self, id: CoroutineId) -> bool {
        let Some((_, mutex)) = self.waiting.remove(&id) else {
            return false;
        };
        let coro = mutex.into_inner();
        coro.mark_ready();
        let home = self.homes.get(&id).map(|r| *r).unwrap_or(0);
        self.workers[home].push(coro);
        self.woken.emit(id);
        true
    }
}

/// The scheduler (§4.F): owns `num_workers` OS threads, each draining its
/// own runqueue under the configured [`policy::Policy`].
pub struct Scheduler {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the scheduler's worker threads per `config`.
    #[must_use]
    pub fn start(config: &RuntimeConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let inner = Arc::new(Inner {
            workers: (0..num_workers).map(|_| WorkerState::new()).collect(),
            global: Mutex::new(VecDeque::new()),
            policy: from_config(config.sched_policy, num_workers),
            starvation_ns: crate::config::DEFAULT_STARVATION_NS,
            homes: DashMap::new(),
            waiting: DashMap::new(),
            shared_table: DashMap::new(),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            woken: Signal::new(),
        });

        let handles = (0..num_workers)
            .map(|id| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("corobus-worker-{id}"))
                    .spawn(move || worker_loop(inner, id))
                    .expect("failed to spawn scheduler worker thread")
            })
            .collect();

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Spawn a coroutine and place it on a worker chosen by the active
    /// policy (§4.F "fixed affinity at creation").
    pub fn spawn<F>(&self, priority: u32, group_id: u64, weight: u32, stack_size_kb: usize, body: F) -> CoroutineId
    where
        F: for<'y> FnOnce(&Context<'y>) + Send + 'static,
    {
        let id = CoroutineId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let coro = Coroutine::spawn(id, priority, group_id, weight, stack_size_kb, body);
        self.inner.shared_table.insert(id, coro.shared().clone());

        let loads = self.inner.loads();
        let home = self.inner.policy.home_worker(coro.shared(), &loads) % self.inner.workers.len();
        self.inner.homes.insert(id, home);
        self.inner.workers[home].push(coro);
        id
    }

    /// Move a coroutine parked in a wait state back onto its home
    /// worker's runqueue. Idempotent: a no-op if the coroutine is not
    /// currently parked (already READY, RUNNING, or unknown).
    pub fn notify(&self, id: CoroutineId) {
        self.inner.force_wake(id);
    }

    /// Request cooperative cancellation of `id`. Reaches the coroutine
    /// regardless of whether it is queued, parked, or mid-run, since
    /// `Shared` is independent of wherever the `Coroutine` object itself
    /// currently lives.
    pub fn stop(&self, id: CoroutineId) {
        if let Some(shared) = self.inner.shared_table.get(&id) {
            shared.request_stop();
        }
        // Parked coroutines only observe stop at their next resume; give
        // them one by moving them back onto a runqueue.
        self.inner.force_wake(id);
    }

    /// Connect a callback to this scheduler's wake events: fired with a
    /// coroutine's id every time `notify`, `stop`, `shutdown`, or the
    /// sleep-deadline sweep pulls it out of `waiting` (§4.G).
    pub fn on_wake<F>(&self, callback: F) -> Connection
    where
        F: Fn(CoroutineId) + Send + Sync + 'static,
    {
        self.inner.woken.connect(callback)
    }

    /// Stop accepting new work, request cancellation on everything still
    /// registered, and join every worker thread once their queues drain.
    ///
    /// Takes `&self` (not `self`) so the scheduler can live behind an
    /// `Arc` shared with wakeup callbacks registered by readers.
    ///
    /// A coroutine that is mid-`run_once` at the moment `stop_requested`
    /// is set still yields into `waiting` one more time before it can
    /// observe the flag on its next resume, so a single one-shot sweep of
    /// `waiting` can miss it — force-waking it is what lets it actually
    /// reach that check. So this sweeps and force-wakes repeatedly, not
    /// once, until a pass finds both runqueues and `waiting` empty.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for entry in self.inner.shared_table.iter() {
            entry.value().request_stop();
        }

        loop {
            let parked: Vec<_> = self.inner.waiting.iter().map(|e| *e.key()).collect();
            for id in parked {
                self.inner.force_wake(id);
            }
            for worker in &self.inner.workers {
                worker.unpark();
            }
            if self.inner.all_queues_empty() && self.inner.waiting.is_empty() {
                break;
            }
            std::thread::sleep(PARK_TIMEOUT);
        }

        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn pick_next(inner: &Inner, id: usize) -> Option<Coroutine> {
    if let Some(coro) = inner.policy.select_from_local(&mut *inner.workers[id].local.lock(), inner.starvation_ns) {
        inner.workers[id].queue_len.fetch_sub(1, Ordering::Relaxed);
        return Some(coro);
    }

    if let Some(coro) = inner.global.lock().pop_front() {
        return Some(coro);
    }

    let own_load = inner.workers[id].load();
    for (other_id, other) in inner.workers.iter().enumerate() {
        if other_id == id {
            continue;
        }
        if !inner.policy.may_steal(own_load, other.load()) {
            continue;
        }
        if let Some(mut guard) = other.local.try_lock() {
            if let Some(coro) = guard.pop_back() {
                other.queue_len.fetch_sub(1, Ordering::Relaxed);
                return Some(coro);
            }
        }
    }
    None
}

fn run_once(inner: &Inner, id: usize, mut coro: Coroutine) {
    let started = Instant::now();
    let outcome = coro.resume();
    inner.policy.record_service(id, started.elapsed());

    match outcome {
        ResumeOutcome::Finished => {
            let coro_id = coro.id();
            inner.shared_table.remove(&coro_id);
            inner.homes.remove(&coro_id);
        }
        ResumeOutcome::Yielded => match coro.state() {
            State::Ready => inner.workers[id].push(coro),
            State::DataWait | State::IoWait | State::Sleep => {
                let coro_id = coro.id();
                inner.waiting.insert(coro_id, Mutex::new(coro));
            }
            State::Running | State::Finished => unreachable!("resume() never yields in these states"),
        },
    }
}

/// Promote any `waiting` coroutine whose `sleep_until` deadline has
/// elapsed back onto its home runqueue (§4.E "RUNNING -> SLEEP(until)",
/// §5 "`sleep(duration)`... honored with +/-1 scheduler tick resolution").
///
/// Unlike `notify`/`stop`, nothing external calls this — every worker
/// sweeps for its own expired sleepers each time it finds no other work,
/// which is what gives sleepers a self-contained wakeup instead of
/// depending on some other coroutine's `notify`.
fn wake_expired_sleepers(inner: &Inner) {
    let now = Instant::now();
    let expired: Vec<CoroutineId> = inner
        .shared_table
        .iter()
        .filter(|entry| entry.value().wake_at().is_some_and(|at| at <= now))
        .map(|entry| *entry.key())
        .collect();
    for id in expired {
        inner.force_wake(id);
    }
}

fn park_briefly(worker: &WorkerState) {
    for _ in 0..SPIN_ITERATIONS {
        if worker.queue_len.load(Ordering::Relaxed) > 0 {
            return;
        }
        std::hint::spin_loop();
    }
    let mut guard = worker.park_lock.lock();
    worker.park_cv.wait_for(&mut guard, PARK_TIMEOUT);
}

fn worker_loop(inner: Arc<Inner>, id: usize) {
    loop {
        match pick_next(&inner, id) {
            Some(coro) => run_once(&inner, id, coro),
            None => {
                wake_expired_sleepers(&inner);
                if inner.shutdown.load(Ordering::Acquire) && inner.all_queues_empty() && inner.waiting.is_empty() {
                    return;
                }
                park_briefly(&inner.workers[id]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn config(policy: crate::config::SchedPolicy, workers: usize) -> RuntimeConfig {
        RuntimeConfig {
            num_workers: workers,
            sched_policy: policy,
            stack_size_kb: 64,
            channel_default_depth: 4,
        }
    }

    #[test]
    fn spawned_coroutine_runs_to_completion() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 2));
        let (tx, rx) = mpsc::channel();
        scheduler.spawn(0, 0, 1, 64, move |_ctx| {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("coroutine should run and finish");
        scheduler.shutdown();
    }

    #[test]
    fn notify_wakes_a_parked_coroutine() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let id = scheduler.spawn(0, 0, 1, 64, move |ctx| {
            ready_tx.send(()).unwrap();
            ctx.yield_with(State::DataWait);
            done_tx.send(()).unwrap();
        });

        ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Give the worker a moment to park the coroutine in `waiting`.
        std::thread::sleep(Duration::from_millis(20));

        scheduler.notify(id);
        done_rx.recv_timeout(Duration::from_secs(5)).expect("notify should resume the parked coroutine");

        scheduler.shutdown();
    }

    #[test]
    fn stop_causes_a_waiting_coroutine_to_finish() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_clone = finished.clone();

        let id = scheduler.spawn(0, 0, 1, 64, move |ctx| {
            ready_tx.send(()).unwrap();
            loop {
                if ctx.stop_requested() {
                    finished_clone.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                ctx.yield_with(State::DataWait);
            }
        });

        ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.stop(id);

        // shutdown() joins every worker, so by the time it returns the
        // stopped coroutine must have observed cancellation.
        scheduler.shutdown();
        assert_eq!(finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sleeping_coroutine_wakes_itself_without_an_external_notify() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        scheduler.spawn(0, 0, 1, 64, move |ctx| {
            ready_tx.send(()).unwrap();
            ctx.sleep_until(Instant::now() + Duration::from_millis(20));
            done_tx.send(()).unwrap();
        });

        ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Nobody calls `notify` here; the scheduler must wake the sleeper
        // on its own once the deadline passes.
        done_rx.recv_timeout(Duration::from_secs(5)).expect("sleeping coroutine should self-wake after its deadline");

        scheduler.shutdown();
    }

    #[test]
    fn shutdown_reaps_coroutines_still_looping_through_wait_states() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 3));
        let (ready_tx, ready_rx) = mpsc::channel();

        for _ in 0..5 {
            let ready_tx = ready_tx.clone();
            scheduler.spawn(0, 0, 1, 64, move |ctx| {
                ready_tx.send(()).unwrap();
                // Keeps re-entering DataWait, exactly like a reader
                // coroutine's body, until it observes stop_requested.
                loop {
                    if ctx.stop_requested() {
                        return;
                    }
                    ctx.yield_with(State::DataWait);
                }
            });
        }

        for _ in 0..5 {
            ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        // No `notify` call here: shutdown alone must be able to chase
        // these coroutines out of `waiting` without anything external
        // waking them up first.
        scheduler.shutdown();
    }

    #[test]
    fn notify_emits_on_wake_signal() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Classic, 1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (woke_tx, woke_rx) = mpsc::channel();

        let id = scheduler.spawn(0, 0, 1, 64, move |ctx| {
            ready_tx.send(()).unwrap();
            ctx.yield_with(State::DataWait);
        });

        scheduler.on_wake(move |woken_id| {
            woke_tx.send(woken_id).unwrap();
        });

        ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.notify(id);

        let woken = woke_rx.recv_timeout(Duration::from_secs(5)).expect("notify should emit on_wake");
        assert_eq!(woken, id);

        scheduler.shutdown();
    }

    #[test]
    fn choreography_keeps_same_group_coroutines_on_one_worker() {
        let scheduler = Scheduler::start(&config(crate::config::SchedPolicy::Choreography, 4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let seen = seen.clone();
            let tx = tx.clone();
            scheduler.spawn(0, 11, 1, 64, move |_ctx| {
                seen.lock().push(std::thread::current().id());
                tx.send(()).unwrap();
            });
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let threads = seen.lock();
        assert!(threads.windows(2).all(|w| w[0] == w[1]), "same group_id must run on one worker thread");
        drop(threads);
        scheduler.shutdown();
    }
}
