// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background progress thread.
//!
//! ## Loop
//!
//! - Sweep: for every worker whose event fd fired (or every worker after a
//!   timeout, and on the first iteration) drain `progress()` and re-arm the
//!   worker, repeating while the arm reports `Busy`.
//! - Wait: `poll(2)` across all worker event fds plus the control fd, bounded
//!   by the configured timeout. Interrupted waits are retried.
//! - Stop: the control fd becomes readable.
//!
//! A worker that cannot be armed leaves the loop without a way to wake up, so
//! it aborts the process.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use parking_lot::{Condvar, Mutex};

use crate::error::{BackendError, Result};
use crate::transport::{ArmStatus, TransportError};
use crate::wake::WakeFd;

const THREAD_NAME: &str = "ucx-progress";

/// What the progress thread drives.
pub trait ProgressSource: Send + Sync + 'static {
    fn worker_count(&self) -> usize;

    fn event_fd(&self, worker: usize) -> std::result::Result<RawFd, TransportError>;

    fn progress(&self, worker: usize) -> usize;

    fn arm(&self, worker: usize) -> std::result::Result<ArmStatus, TransportError>;

    /// Runs on the progress thread before it reports itself active.
    fn on_thread_start(&self) {}

    /// Worker 0 made progress during a sweep.
    fn on_primary_progress(&self) {}

    /// Runs on the progress thread right before it exits.
    fn on_thread_exit(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Starting,
    Active,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct StateCell {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl StateCell {
    fn set(&self, state: ProgressState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

/// Handle to the engine's progress thread.
pub struct ProgressThread {
    source: Arc<dyn ProgressSource>,
    timeout_ms: i32,
    control: Arc<WakeFd>,
    state: Arc<StateCell>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressThread {
    /// Create a stopped progress thread for `source` that waits at most
    /// `timeout_ms` between sweeps.
    pub fn new(source: Arc<dyn ProgressSource>, timeout_ms: i32) -> Result<Self> {
        let control = WakeFd::new().map_err(|e| {
            BackendError::Backend(format!("failed to create progress control channel: {e}"))
        })?;
        Ok(Self {
            source,
            timeout_ms: timeout_ms.max(1),
            control: Arc::new(control),
            state: Arc::new(StateCell {
                state: Mutex::new(ProgressState::Stopped),
                changed: Condvar::new(),
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ProgressState {
        *self.state.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Spawn the thread and block until it is active. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let fds = (0..self.source.worker_count())
            .map(|worker| self.source.event_fd(worker))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BackendError::Backend(format!("failed to get worker event fd: {e}")))?;

        // a stop signal that raced a previous exit must not stop the new thread
        self.control.drain();
        self.state.set(ProgressState::Starting);

        let ctx = LoopContext {
            source: self.source.clone(),
            control: self.control.clone(),
            state: self.state.clone(),
            fds,
            timeout_ms: self.timeout_ms,
        };
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || ctx.run())
            .map_err(|e| {
                self.state.set(ProgressState::Stopped);
                BackendError::Backend(format!("failed to spawn progress thread: {e}"))
            })?;

        let mut state = self.state.state.lock();
        while *state == ProgressState::Starting {
            self.state.changed.wait(&mut state);
        }
        let started = *state == ProgressState::Active;
        drop(state);

        if !started {
            if spawned.join().is_err() {
                tracing::error!("progress thread panicked during startup");
            }
            return Err(BackendError::Backend(
                "progress thread exited during startup".to_string(),
            ));
        }

        *handle = Some(spawned);
        tracing::debug!(timeout_ms = self.timeout_ms, "progress thread started");
        Ok(())
    }

    /// Signal the thread and join it. No-op if not running.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.state.set(ProgressState::Stopping);
        self.control.signal();
        if handle.join().is_err() {
            tracing::error!("progress thread panicked");
        }
        self.state.set(ProgressState::Stopped);
        tracing::debug!("progress thread stopped");
    }

    /// Tear the thread down and launch a new one.
    pub fn restart(&self) -> Result<()> {
        self.stop();
        self.start()
    }
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Marks the thread stopped however it exits, so a waiting `start` wakes up.
struct ExitGuard(Arc<StateCell>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.set(ProgressState::Stopped);
    }
}

struct LoopContext {
    source: Arc<dyn ProgressSource>,
    control: Arc<WakeFd>,
    state: Arc<StateCell>,
    fds: Vec<RawFd>,
    timeout_ms: i32,
}

impl LoopContext {
    fn run(self) {
        let _exit = ExitGuard(self.state.clone());
        self.source.on_thread_start();
        self.state.set(ProgressState::Active);

        let mut poll_fds: Vec<PollFd> = self
            .fds
            .iter()
            .copied()
            .chain(std::iter::once(self.control.fd()))
            .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
            .collect();
        let control = poll_fds.len() - 1;

        // sweep everything on the first pass
        let mut timeout = true;
        loop {
            for worker in 0..self.fds.len() {
                if !timeout && !readable(&poll_fds[worker]) {
                    continue;
                }
                if self.drive(worker) && worker == 0 {
                    self.source.on_primary_progress();
                }
            }
            timeout = false;

            let ready = loop {
                match poll(&mut poll_fds, self.timeout_ms) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => {
                        tracing::trace!("progress poll interrupted, retrying");
                    }
                    Err(e) => {
                        tracing::warn!("progress poll failed: {e}");
                        break 0;
                    }
                }
            };

            if ready == 0 {
                timeout = true;
            } else if readable(&poll_fds[control]) {
                self.control.drain();
                break;
            }
        }

        self.source.on_thread_exit();
    }

    /// Progress one worker until it can be armed. Returns whether any events
    /// were processed.
    fn drive(&self, worker: usize) -> bool {
        let mut made_progress = false;
        loop {
            while self.source.progress(worker) > 0 {
                made_progress = true;
            }
            match self.source.arm(worker) {
                Ok(ArmStatus::Armed) => return made_progress,
                Ok(ArmStatus::Busy) => continue,
                Err(e) => {
                    tracing::error!(worker, "failed to arm worker: {e}");
                    std::process::abort();
                }
            }
        }
    }
}

fn readable(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Source whose workers have `queued` events; each `progress` consumes one.
    struct CountingSource {
        wakes: Vec<WakeFd>,
        queued: Vec<AtomicUsize>,
        progress_calls: Vec<AtomicUsize>,
        starts: AtomicUsize,
        exits: AtomicUsize,
        primary: AtomicUsize,
        fail_start: AtomicBool,
    }

    impl CountingSource {
        fn new(workers: usize) -> Arc<Self> {
            Arc::new(Self {
                wakes: (0..workers).map(|_| WakeFd::new().unwrap()).collect(),
                queued: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
                progress_calls: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
                starts: AtomicUsize::new(0),
                exits: AtomicUsize::new(0),
                primary: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
            })
        }

        fn post(&self, worker: usize, events: usize) {
            self.queued[worker].fetch_add(events, Ordering::SeqCst);
            self.wakes[worker].signal();
        }

        fn calls(&self, worker: usize) -> usize {
            self.progress_calls[worker].load(Ordering::SeqCst)
        }
    }

    impl ProgressSource for CountingSource {
        fn worker_count(&self) -> usize {
            self.wakes.len()
        }

        fn event_fd(&self, worker: usize) -> std::result::Result<RawFd, TransportError> {
            Ok(self.wakes[worker].fd())
        }

        fn progress(&self, worker: usize) -> usize {
            self.progress_calls[worker].fetch_add(1, Ordering::SeqCst);
            let consumed = self.queued[worker]
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            usize::from(consumed)
        }

        fn arm(&self, worker: usize) -> std::result::Result<ArmStatus, TransportError> {
            self.wakes[worker].drain();
            if self.queued[worker].load(Ordering::SeqCst) > 0 {
                Ok(ArmStatus::Busy)
            } else {
                Ok(ArmStatus::Armed)
            }
        }

        fn on_thread_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                panic!("start hook failed");
            }
        }

        fn on_primary_progress(&self) {
            self.primary.fetch_add(1, Ordering::SeqCst);
        }

        fn on_thread_exit(&self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn eventually(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_blocks_until_active() {
        let source = CountingSource::new(2);
        let pt = ProgressThread::new(source.clone(), 10_000).unwrap();
        assert_eq!(pt.state(), ProgressState::Stopped);

        pt.start().unwrap();
        assert_eq!(pt.state(), ProgressState::Active);
        assert!(pt.is_running());
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        // starting twice does not spawn a second thread
        pt.start().unwrap();
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        pt.stop();
        assert_eq!(pt.state(), ProgressState::Stopped);
        assert_eq!(source.exits.load(Ordering::SeqCst), 1);
        assert!(!pt.is_running());
    }

    #[test]
    fn test_first_pass_sweeps_every_worker() {
        let source = CountingSource::new(3);
        let pt = ProgressThread::new(source.clone(), 10_000).unwrap();
        pt.start().unwrap();
        eventually("initial sweep", || (0..3).all(|w| source.calls(w) >= 1));
    }

    #[test]
    fn test_events_are_drained_on_wakeup() {
        let source = CountingSource::new(2);
        let pt = ProgressThread::new(source.clone(), 10_000).unwrap();
        pt.start().unwrap();
        eventually("initial sweep", || source.calls(1) >= 1);

        source.post(1, 5);
        eventually("worker 1 drained", || {
            source.queued[1].load(Ordering::SeqCst) == 0
        });
        // only worker 0 progress is reported as primary
        assert_eq!(source.primary.load(Ordering::SeqCst), 0);

        source.post(0, 2);
        eventually("primary progress", || source.primary.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_timeout_resweeps_idle_workers() {
        let source = CountingSource::new(2);
        let pt = ProgressThread::new(source.clone(), 1).unwrap();
        pt.start().unwrap();
        eventually("repeated sweeps", || source.calls(0) >= 5 && source.calls(1) >= 5);
    }

    #[test]
    fn test_restart_relaunches_thread() {
        let source = CountingSource::new(1);
        let pt = ProgressThread::new(source.clone(), 50).unwrap();
        pt.start().unwrap();
        pt.restart().unwrap();
        assert_eq!(pt.state(), ProgressState::Active);
        assert_eq!(source.starts.load(Ordering::SeqCst), 2);
        assert_eq!(source.exits.load(Ordering::SeqCst), 1);

        drop(pt);
        assert_eq!(source.exits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_restart_leaves_thread_stopped() {
        let source = CountingSource::new(1);
        let pt = ProgressThread::new(source.clone(), 10).unwrap();
        pt.start().unwrap();

        source.fail_start.store(true, Ordering::SeqCst);
        assert_matches!(pt.restart(), Err(BackendError::Backend(_)));
        assert_eq!(pt.state(), ProgressState::Stopped);
        assert_eq!(source.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_fails_when_thread_dies_during_startup() {
        let source = CountingSource::new(1);
        source.fail_start.store(true, Ordering::SeqCst);
        let pt = ProgressThread::new(source.clone(), 10).unwrap();

        assert_matches!(pt.start(), Err(BackendError::Backend(_)));
        assert_eq!(pt.state(), ProgressState::Stopped);
        assert!(!pt.is_running());

        // a later start can still succeed
        source.fail_start.store(false, Ordering::SeqCst);
        pt.start().unwrap();
        assert_eq!(pt.state(), ProgressState::Active);
    }
}
