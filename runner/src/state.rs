/*
 * Copyright 2024 Oxide Computer Company
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use strum::Display;

use crate::error::{illegal_state, RResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum RunnerState {
    Created,
    Initialised,
    Running,
    Stopping,
    Stopped,
    Finished,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Finished)
    }
}

/**
 * What a stop() call should do, as decided by Lifecycle::request_stop().
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /**
     * The job is not running; there is nothing to stop or wait for.
     */
    Idle,
    /**
     * This call moved the runner to STOPPING, and must terminate the job
     * before waiting.
     */
    Begin,
    /**
     * An earlier stop() is already terminating the job; just wait.
     */
    Pending,
}

/**
 * Tracks the lifecycle of one runner.  The state lives behind a mutex so that
 * stop() may be called from another task while execute() is in progress.
 */
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<RunnerState>,
    executed: AtomicBool,
    executing: AtomicBool,
    stop_requested: AtomicBool,
}

/**
 * Held for the duration of an execute() call.  Dropping the guard marks the
 * runner finished, unless a stop request has taken over that transition.
 */
#[derive(Debug)]
pub struct ExecuteGuard<'a> {
    life: &'a Lifecycle,
}

impl Drop for ExecuteGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.life.state.lock().unwrap();
        if !self.life.stop_requested.load(Ordering::SeqCst) {
            *st = RunnerState::Finished;
        }
        self.life.executing.store(false, Ordering::SeqCst);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(RunnerState::Created),
            executed: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock().unwrap()
    }

    pub fn check_created(&self) -> RResult<()> {
        let st = self.state();
        if st != RunnerState::Created {
            illegal_state!("init() called in state {st}");
        }
        Ok(())
    }

    pub fn initialised(&self) -> RResult<()> {
        let mut st = self.state.lock().unwrap();
        if *st != RunnerState::Created {
            illegal_state!("init() called in state {}", *st);
        }
        *st = RunnerState::Initialised;
        Ok(())
    }

    /**
     * Move from INITIALISED to RUNNING.  This may succeed only once for each
     * runner, no matter how the first execution ended.
     */
    pub fn begin_execute(&self) -> RResult<ExecuteGuard<'_>> {
        let mut st = self.state.lock().unwrap();
        if self.executed.load(Ordering::SeqCst) {
            illegal_state!("execute() may only be called once");
        }
        if *st != RunnerState::Initialised {
            illegal_state!("execute() called in state {}", *st);
        }

        self.executed.store(true, Ordering::SeqCst);
        self.executing.store(true, Ordering::SeqCst);
        *st = RunnerState::Running;

        Ok(ExecuteGuard { life: self })
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /**
     * Record a request to stop.  Unless the result is Idle, the caller must
     * then wait_stopped().
     */
    pub fn request_stop(&self) -> RResult<StopRequest> {
        let mut st = self.state.lock().unwrap();
        match *st {
            RunnerState::Created => {
                illegal_state!("stop() called before init()");
            }
            RunnerState::Running => {
                *st = RunnerState::Stopping;
                self.stop_requested.store(true, Ordering::SeqCst);
                Ok(StopRequest::Begin)
            }
            RunnerState::Stopping => Ok(StopRequest::Pending),
            _ => Ok(StopRequest::Idle),
        }
    }

    /**
     * Resolves once stop() has been called.  Used to abandon long waits
     * inside execute().
     */
    pub async fn stop_signalled(&self) {
        while !self.stop_requested() {
            runomat_common::sleep_ms(100).await;
        }
    }

    /**
     * Wait for an in-progress execute() to return, then mark the runner
     * stopped.
     */
    pub async fn wait_stopped(&self) {
        while self.is_executing() {
            runomat_common::sleep_ms(100).await;
        }

        *self.state.lock().unwrap() = RunnerState::Stopped;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn state_names() {
        assert_eq!(RunnerState::Initialised.to_string(), "INITIALISED");
        assert!(RunnerState::Stopped.is_terminal());
        assert!(!RunnerState::Stopping.is_terminal());
    }

    #[test]
    fn execute_once() {
        let l = Lifecycle::new();
        assert!(l.begin_execute().unwrap_err().is_illegal_state());

        l.initialised().unwrap();
        {
            let _g = l.begin_execute().unwrap();
            assert_eq!(l.state(), RunnerState::Running);
            assert!(l.is_executing());
        }
        assert_eq!(l.state(), RunnerState::Finished);
        assert!(!l.is_executing());

        assert!(l.begin_execute().unwrap_err().is_illegal_state());
    }

    #[test]
    fn init_once() {
        let l = Lifecycle::new();
        l.check_created().unwrap();
        l.initialised().unwrap();
        assert!(l.check_created().unwrap_err().is_illegal_state());
        assert!(l.initialised().unwrap_err().is_illegal_state());
    }

    #[test]
    fn stop_outside_execution() {
        let l = Lifecycle::new();
        assert!(l.request_stop().unwrap_err().is_illegal_state());

        l.initialised().unwrap();
        assert_eq!(l.request_stop().unwrap(), StopRequest::Idle);
        assert_eq!(l.state(), RunnerState::Initialised);

        drop(l.begin_execute().unwrap());
        assert_eq!(l.request_stop().unwrap(), StopRequest::Idle);
        assert_eq!(l.state(), RunnerState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_execute() {
        let l = Arc::new(Lifecycle::new());
        l.initialised().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let l0 = Arc::clone(&l);
        let exec = tokio::spawn(async move {
            let _g = l0.begin_execute().unwrap();
            rx.await.ok();
        });
        while !l.is_executing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(l.request_stop().unwrap(), StopRequest::Begin);
        assert_eq!(l.state(), RunnerState::Stopping);
        assert_eq!(l.request_stop().unwrap(), StopRequest::Pending);

        let l1 = Arc::clone(&l);
        let stopper = tokio::spawn(async move { l1.wait_stopped().await });

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(!stopper.is_finished());

        tx.send(()).unwrap();
        exec.await.unwrap();
        stopper.await.unwrap();
        assert_eq!(l.state(), RunnerState::Stopped);
    }
}
