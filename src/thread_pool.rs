use crossbeam_deque::{Injector, Stealer, Worker};
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Returned by [`ThreadPool::try_execute`] when the pending queue is at
/// capacity; the caller decides how to shed the load.
#[derive(Debug)]
pub struct PoolFull;

impl fmt::Display for PoolFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread pool queue is full")
    }
}

impl std::error::Error for PoolFull {}

struct Shared {
    injector: Injector<Job>,
    pending: AtomicUsize,
    idle: Mutex<usize>,
    wakeup: Condvar,
}

impl Shared {
    fn notify_one(&self) {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if *idle > 0 {
            self.wakeup.notify_one();
        }
    }

    fn park(&self) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        *idle += 1;
        // re-check under the lock so a job pushed between the failed
        // steal and this point cannot be lost
        while self.pending.load(Ordering::SeqCst) == 0 {
            idle = self.wakeup.wait(idle).unwrap_or_else(|e| e.into_inner());
        }
        *idle -= 1;
    }
}

/// Fixed-size work-stealing pool with a bounded pending queue. One job
/// is submitted per accepted connection; a panicking job takes down
/// neither its worker thread nor the pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
    queue_size: usize,
}

impl ThreadPool {
    pub fn new(size: usize, queue_size: usize) -> Self {
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            pending: AtomicUsize::new(0),
            idle: Mutex::new(0),
            wakeup: Condvar::new(),
        });

        let workers: Vec<Worker<Job>> = (0..size).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = workers.iter().map(Worker::stealer).collect();

        for local in workers {
            let shared = Arc::clone(&shared);
            let stealers = stealers.clone();
            thread::spawn(move || worker_loop(&local, &stealers, &shared));
        }

        Self { shared, queue_size }
    }

    pub fn try_execute<F>(&self, f: F) -> Result<(), PoolFull>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.pending.load(Ordering::Relaxed) >= self.queue_size {
            return Err(PoolFull);
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.injector.push(Box::new(f));
        self.shared.notify_one();
        Ok(())
    }
}

fn worker_loop(local: &Worker<Job>, stealers: &[Stealer<Job>], shared: &Shared) {
    loop {
        let job = local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                shared
                    .injector
                    .steal_batch_and_pop(local)
                    .or_else(|| stealers.iter().map(Stealer::steal).collect())
            })
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        });

        match job {
            Some(job) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                let _ = catch_unwind(AssertUnwindSafe(job));
            }
            None => shared.park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_executes_submitted_jobs() {
        let pool = ThreadPool::new(4, 64);
        let (tx, rx) = mpsc::channel();

        for i in 0..32 {
            let tx = tx.clone();
            pool.try_execute(move || tx.send(i).unwrap()).unwrap();
        }

        let mut seen: Vec<i32> = (0..32)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_survives_panicking_job() {
        let pool = ThreadPool::new(1, 16);
        let (tx, rx) = mpsc::channel();

        pool.try_execute(|| panic!("job blew up")).unwrap();
        pool.try_execute(move || tx.send(()).unwrap()).unwrap();

        rx.recv_timeout(Duration::from_secs(5))
            .expect("worker should keep running after a panic");
    }
}
