//! Worker pool backing the derivation cascade.
//!
//! Derived-tile encodes are issued as boxed tasks onto an unbounded
//! channel drained by a fixed set of worker threads. Tasks may issue
//! further tasks (a completed parent enqueues its own parent), so the
//! pending counter tracks queued *and* in-flight work: a task increments
//! it before sending and decrements after running, which keeps the count
//! nonzero across the enqueue-from-within-a-task window.
//!
//! Draining is cooperative: [`TaskPool::wait_until_complete`] blocks
//! until the counter reaches zero, after which the pool still accepts
//! new tasks until [`TaskPool::terminate_execution`] closes the channel.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Cloneable handle for issuing tasks, usable from inside tasks.
#[derive(Clone)]
pub struct TaskHandle {
    sender: Sender<Task>,
    pending: Arc<Pending>,
}

impl TaskHandle {
    /// Enqueue a task for execution on the pool.
    pub fn issue_task(&self, task: impl FnOnce() + Send + 'static) {
        *self.pending.count.lock() += 1;
        // A send only fails after terminate_execution; the pending
        // increment is rolled back so waiters are not stranded.
        if self.sender.send(Box::new(task)).is_err() {
            let mut count = self.pending.count.lock();
            *count -= 1;
            if *count == 0 {
                self.pending.drained.notify_all();
            }
        }
    }
}

/// A fixed-size worker pool with cooperative drain semantics.
pub struct TaskPool {
    sender: Option<Sender<Task>>,
    pending: Arc<Pending>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn `workers` threads servicing the task queue.
    pub fn new(workers: usize) -> TaskPool {
        let (sender, receiver) = unbounded::<Task>();
        let pending = Arc::new(Pending::default());

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                std::thread::Builder::new()
                    .name(format!("iris-derive-{index}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                            let mut count = pending.count.lock();
                            *count -= 1;
                            if *count == 0 {
                                pending.drained.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn task pool worker")
            })
            .collect();

        TaskPool {
            sender: Some(sender),
            pending,
            workers,
        }
    }

    /// A handle tasks can clone to enqueue follow-up work.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            sender: self
                .sender
                .clone()
                .expect("task pool already terminated"),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Enqueue a task.
    pub fn issue_task(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().issue_task(task);
    }

    /// Block until the queue is empty and no task is in flight.
    pub fn wait_until_complete(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.drained.wait(&mut count);
        }
    }

    /// Close the queue and join all workers. Queued tasks still run.
    pub fn terminate_execution(&mut self) {
        // Dropping the last sender ends each worker's recv loop. Handles
        // held by in-flight tasks keep the channel open until they drop.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.terminate_execution();
    }
}

// =============================================================================
// Tests
// =============================================================================
