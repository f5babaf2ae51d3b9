#![forbid(unsafe_code)]
//! Cooperative task pool and task-aware locks.
//!
//! The crawl pipeline runs as small self-rescheduling work units on a
//! fixed set of worker threads. Two pieces live here:
//!
//! - **`TaskPool` / `Task`**: a re-runnable work item. `run()` enqueues
//!   the task unless it is already queued; running it again while it
//!   executes re-queues it after completion. `Task::current()` names
//!   the executing task and `append` chains work behind it.
//! - **`TaskMutex`**: a try-lock whose waiters are tasks, not threads.
//!   A contender is parked on the waiter queue and re-run when the
//!   guard drops, so no worker thread ever blocks on the lock.
//!
//! Lock ordering: the pool's queue mutex and each task's state mutex
//! are leaf locks; `TaskMutex` never acquires either while holding its
//! own state.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, trace};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK: RefCell<Option<Task>> = const { RefCell::new(None) };
}

// ── Task ────────────────────────────────────────────────────────────────────

struct TaskState {
    queued: bool,
    running: bool,
    /// Tasks to run after the current execution completes.
    post: Vec<Task>,
}

struct TaskInner {
    id: u64,
    title: String,
    pool: Weak<PoolInner>,
    work: Mutex<Box<dyn FnMut() + Send>>,
    state: Mutex<TaskState>,
}

/// Handle to a re-runnable work item on a [`TaskPool`].
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("title", &self.inner.title)
            .finish()
    }
}

impl Task {
    /// Create a task on `pool`. The closure runs once per `run()` call.
    pub fn new(pool: &TaskPool, title: impl Into<String>, work: impl FnMut() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                title: title.into(),
                pool: Arc::downgrade(&pool.inner),
                work: Mutex::new(Box::new(work)),
                state: Mutex::new(TaskState {
                    queued: false,
                    running: false,
                    post: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.inner.title
    }

    /// The task executing on this worker thread, if any.
    #[must_use]
    pub fn current() -> Option<Task> {
        CURRENT_TASK.with(|t| t.borrow().clone())
    }

    /// Enqueue this task for execution.
    ///
    /// No-op if already queued. If the task is executing right now it is
    /// queued again after the current execution completes.
    pub fn run(&self) {
        let enqueue = {
            let mut st = self.inner.state.lock();
            if st.running {
                if !st.post.iter().any(|t| t.id() == self.id()) {
                    st.post.push(self.clone());
                }
                false
            } else if st.queued {
                false
            } else {
                st.queued = true;
                true
            }
        };
        if enqueue {
            if let Some(pool) = self.inner.pool.upgrade() {
                pool.enqueue(self.clone());
            } else {
                let mut st = self.inner.state.lock();
                st.queued = false;
            }
        }
    }

    /// Run `other` after this task's current execution completes.
    ///
    /// If this task is idle, `other` runs immediately.
    pub fn append(&self, other: &Task) {
        let run_now = {
            let mut st = self.inner.state.lock();
            if st.running || st.queued {
                if !st.post.iter().any(|t| t.id() == other.id()) {
                    st.post.push(other.clone());
                }
                false
            } else {
                true
            }
        };
        if run_now {
            other.run();
        }
    }

    fn execute(&self) {
        {
            let mut st = self.inner.state.lock();
            st.queued = false;
            st.running = true;
        }
        trace!(task = self.inner.id, title = %self.inner.title, "task start");
        CURRENT_TASK.with(|t| *t.borrow_mut() = Some(self.clone()));
        {
            let mut work = self.inner.work.lock();
            (work)();
        }
        CURRENT_TASK.with(|t| *t.borrow_mut() = None);
        let post = {
            let mut st = self.inner.state.lock();
            st.running = false;
            std::mem::take(&mut st.post)
        };
        for task in post {
            task.run();
        }
    }
}

// ── TaskPool ────────────────────────────────────────────────────────────────

struct PoolInner {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    stop: AtomicBool,
}

impl PoolInner {
    fn enqueue(&self, task: Task) {
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.available.notify_one();
    }
}

/// Fixed-size pool of worker threads executing [`Task`]s.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Spawn `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let pool = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("fbs-task-{n}"))
                .spawn(move || worker_loop(&pool))
                .expect("spawn task pool worker");
            workers.push(handle);
        }
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Stop accepting work, discard the queue, and join all workers.
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("task pool shutting down");
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
            self.inner.available.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(pool: &PoolInner) {
    loop {
        let task = {
            let mut queue = pool.queue.lock();
            loop {
                if pool.stop.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                pool.available.wait(&mut queue);
            }
        };
        task.execute();
    }
}

// ── TaskMutex ───────────────────────────────────────────────────────────────

struct TaskMutexState {
    locked: bool,
    waiters: Vec<Task>,
}

/// A mutual-exclusion lock whose contenders are tasks.
///
/// `try_lock` either acquires the lock or parks the given task on the
/// waiter queue; dropping the guard re-runs every parked task. Waiters
/// re-contend, so exactly one wins each release and the rest re-park.
pub struct TaskMutex {
    state: Mutex<TaskMutexState>,
}

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMutex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TaskMutexState {
                locked: false,
                waiters: Vec::new(),
            }),
        }
    }

    /// Acquire the lock, or park `waiter` for a re-run on release.
    pub fn try_lock(self: &Arc<Self>, waiter: &Task) -> Option<TaskMutexGuard> {
        let mut st = self.state.lock();
        if st.locked {
            if !st.waiters.iter().any(|t| t.id() == waiter.id()) {
                st.waiters.push(waiter.clone());
            }
            None
        } else {
            st.locked = true;
            Some(TaskMutexGuard {
                mutex: Arc::clone(self),
            })
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}

/// Guard returned by [`TaskMutex::try_lock`]; releases on drop.
pub struct TaskMutexGuard {
    mutex: Arc<TaskMutex>,
}

impl Drop for TaskMutexGuard {
    fn drop(&mut self) {
        let waiters = {
            let mut st = self.mutex.state.lock();
            st.locked = false;
            std::mem::take(&mut st.waiters)
        };
        for task in waiters {
            task.run();
        }
    }
}

// ── LockSet ─────────────────────────────────────────────────────────────────

/// Lazily created shared [`TaskMutex`]es keyed by `u64`.
///
/// Entries are held weakly; a key's mutex lives exactly as long as some
/// holder keeps the `Arc` alive. Dead entries are pruned as the map
/// grows.
#[derive(Default)]
pub struct LockSet {
    inner: Mutex<HashMap<u64, Weak<TaskMutex>>>,
}

impl LockSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u64) -> Arc<TaskMutex> {
        let mut map = self.inner.lock();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(TaskMutex::new());
        map.insert(key, Arc::downgrade(&fresh));
        if map.len() % 1024 == 0 {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        fresh
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn task_runs_once_per_run_call() {
        let pool = TaskPool::new(2);
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        let task = Task::new(&pool, "count", move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        task.run();
        wait_until(|| hits.load(Ordering::SeqCst) == 1);
        task.run();
        wait_until(|| hits.load(Ordering::SeqCst) == 2);
        pool.shutdown();
    }

    #[test]
    fn run_while_queued_does_not_duplicate() {
        let pool = TaskPool::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocker = Task::new(&pool, "blocker", move || {
            gate_rx.recv().ok();
        });
        blocker.run();

        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        let task = Task::new(&pool, "once", move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        // The single worker is blocked, so all three run() calls land
        // while the task is still queued.
        task.run();
        task.run();
        task.run();
        gate_tx.send(()).unwrap();
        wait_until(|| hits.load(Ordering::SeqCst) >= 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn self_append_reschedules_until_done() {
        let pool = TaskPool::new(2);
        let steps = Arc::new(AtomicU64::new(0));
        let steps2 = Arc::clone(&steps);
        let task = Task::new(&pool, "stepper", move || {
            let n = steps2.fetch_add(1, Ordering::SeqCst);
            if n < 4 {
                let current = Task::current().expect("running inside pool");
                current.append(&current);
            }
        });
        task.run();
        wait_until(|| steps.load(Ordering::SeqCst) == 5);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(steps.load(Ordering::SeqCst), 5);
        pool.shutdown();
    }

    #[test]
    fn task_mutex_defers_and_requeues() {
        let pool = TaskPool::new(2);
        let mutex = Arc::new(TaskMutex::new());
        let (locked_tx, locked_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder_mutex = Arc::clone(&mutex);
        let holder = Task::new(&pool, "holder", move || {
            let me = Task::current().unwrap();
            let guard = holder_mutex.try_lock(&me).expect("uncontended");
            locked_tx.send(()).unwrap();
            release_rx.recv().ok();
            drop(guard);
        });
        holder.run();
        locked_rx.recv().unwrap();

        let attempts = Arc::new(AtomicU64::new(0));
        let acquired = Arc::new(AtomicU64::new(0));
        let attempts2 = Arc::clone(&attempts);
        let acquired2 = Arc::clone(&acquired);
        let contender_mutex = Arc::clone(&mutex);
        let contender = Task::new(&pool, "contender", move || {
            let me = Task::current().unwrap();
            attempts2.fetch_add(1, Ordering::SeqCst);
            if contender_mutex.try_lock(&me).is_some() {
                acquired2.fetch_add(1, Ordering::SeqCst);
            }
            // No self-reschedule: the mutex re-runs us on release.
        });
        contender.run();
        wait_until(|| attempts.load(Ordering::SeqCst) == 1);
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        wait_until(|| acquired.load(Ordering::SeqCst) == 1);
        pool.shutdown();
    }

    #[test]
    fn lock_set_shares_and_expires() {
        let set = LockSet::new();
        let a = set.get(300);
        let b = set.get(300);
        assert!(Arc::ptr_eq(&a, &b));
        drop(a);
        drop(b);
        let c = set.get(300);
        assert!(!c.is_locked());
    }
}
