//! Serial work queue.
//!
//! The driver serializes every mutation of its state through one named
//! worker thread. Jobs run in submission order; deferred jobs run when
//! their deadline passes. A job receives the owned state and a
//! [`Scheduler`] with which it can submit follow-up work — the polling
//! watchers reschedule themselves this way.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job<S> = Box<dyn FnOnce(&mut S, &Scheduler<S>) + Send>;

enum Message<S> {
    Run(Job<S>),
    After(Duration, Job<S>),
    Shutdown,
}

/// Handle for submitting work from inside a job.
pub struct Scheduler<S> {
    sender: Sender<Message<S>>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Scheduler {
            sender: self.sender.clone(),
        }
    }
}

impl<S> Scheduler<S> {
    /// Submit a job to run as soon as the queue drains.
    pub fn run(&self, job: impl FnOnce(&mut S, &Scheduler<S>) + Send + 'static) {
        let _ = self.sender.send(Message::Run(Box::new(job)));
    }

    /// Submit a job to run once `delay` has passed.
    pub fn after(&self, delay: Duration, job: impl FnOnce(&mut S, &Scheduler<S>) + Send + 'static) {
        let _ = self.sender.send(Message::After(delay, Box::new(job)));
    }
}

/// One worker thread owning a state value, fed through a [`Scheduler`].
pub struct WorkQueue<S> {
    scheduler: Scheduler<S>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> WorkQueue<S> {
    pub fn spawn(name: &str, state: S) -> io::Result<WorkQueue<S>> {
        let (sender, receiver) = mpsc::channel();
        let scheduler = Scheduler {
            sender: sender.clone(),
        };
        let thread_scheduler = Scheduler { sender };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_loop(state, receiver, thread_scheduler))?;
        Ok(WorkQueue {
            scheduler,
            handle: Some(handle),
        })
    }

    pub fn scheduler(&self) -> Scheduler<S> {
        self.scheduler.clone()
    }

    /// Submit a job without waiting for it.
    pub fn run(&self, job: impl FnOnce(&mut S, &Scheduler<S>) + Send + 'static) {
        self.scheduler.run(job);
    }

    /// Run `job` on the worker and block for its result.
    ///
    /// Returns `None` when the worker is no longer running the job — it has
    /// shut down, or died before replying — so callers can surface the
    /// condition instead of panicking.
    pub fn call<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S, &Scheduler<S>) -> R + Send + 'static,
    ) -> Option<R> {
        let (sender, receiver) = mpsc::channel();
        self.scheduler.run(move |state, scheduler| {
            let _ = sender.send(job(state, scheduler));
        });
        receiver.recv().ok()
    }
}

impl<S> Drop for WorkQueue<S> {
    fn drop(&mut self) {
        let _ = self.scheduler.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop<S>(mut state: S, receiver: Receiver<Message<S>>, scheduler: Scheduler<S>) {
    let mut timers: Vec<(Instant, Job<S>)> = Vec::new();
    loop {
        // run whatever has come due, earliest first
        loop {
            let now = Instant::now();
            let due = timers
                .iter()
                .enumerate()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .min_by_key(|(_, (deadline, _))| *deadline)
                .map(|(index, _)| index);
            match due {
                Some(index) => {
                    let (_, job) = timers.remove(index);
                    job(&mut state, &scheduler);
                }
                None => break,
            }
        }

        let timeout = timers
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
            .min();
        let message = match timeout {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match receiver.recv() {
                Ok(message) => Some(message),
                Err(_) => return,
            },
        };
        match message {
            Some(Message::Run(job)) => job(&mut state, &scheduler),
            Some(Message::After(delay, job)) => timers.push((Instant::now() + delay, job)),
            Some(Message::Shutdown) => return,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = WorkQueue::spawn("test-order", Vec::new()).unwrap();
        for n in 0..8 {
            queue.run(move |state: &mut Vec<i32>, _| state.push(n));
        }
        let seen = queue.call(|state, _| state.clone()).unwrap();
        assert_eq!(seen, &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn call_returns_the_job_result() {
        let queue = WorkQueue::spawn("test-call", 41u32).unwrap();
        let answer = queue.call(|state, _| {
            *state += 1;
            *state
        });
        assert_eq!(answer, Some(42));
    }

    #[test]
    fn deferred_jobs_wait_their_delay() {
        let queue = WorkQueue::spawn("test-defer", Instant::now()).unwrap();
        let fired = Arc::new(Mutex::new(None));
        let report = fired.clone();
        queue.scheduler().after(Duration::from_millis(20), move |started, _| {
            *report.lock().unwrap() = Some(started.elapsed());
        });
        thread::sleep(Duration::from_millis(60));
        queue.call(|_, _| ()).unwrap();
        let elapsed = fired.lock().unwrap().expect("deferred job ran");
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn jobs_can_reschedule_themselves() {
        let queue = WorkQueue::spawn("test-tick", 0u32).unwrap();
        fn tick(state: &mut u32, scheduler: &Scheduler<u32>) {
            *state += 1;
            if *state < 3 {
                scheduler.after(Duration::from_millis(1), tick);
            }
        }
        queue.run(tick);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.call(|state, _| *state), Some(3));
    }

    #[test]
    fn drop_joins_the_worker() {
        let queue = WorkQueue::spawn("test-drop", ()).unwrap();
        queue.run(|_, _| thread::sleep(Duration::from_millis(5)));
        drop(queue);
    }

    #[test]
    fn call_reports_a_dead_worker_instead_of_panicking() {
        let queue = WorkQueue::spawn("test-dead", ()).unwrap();
        queue.run(|_, _| panic!("worker gone"));
        assert_eq!(queue.call(|_, _| 1), None);
    }
}
