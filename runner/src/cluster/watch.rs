/*
 * Copyright 2024 Oxide Computer Company
 */

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use slog::{error, info, Logger};
use strum::Display;
use tokio::task::JoinHandle;

use super::api::{ClusterApi, ClusterError};
use super::logs::LogCollector;
use super::model::{EventKind, Pod};

/**
 * What we have learned about the job pod so far.  The phase only ever moves
 * forward.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum PodPhase {
    Waiting,
    Starting,
    Running,
    /**
     * The container has stopped, but we have not yet seen its exit code.
     */
    Complete,
    Finished,
}

#[derive(Debug, Clone)]
pub struct PodWatchState {
    pub phase: PodPhase,
    /**
     * Assumed to be success until a terminated container tells us otherwise.
     */
    pub exit_code: i32,
    pub close_error: Option<String>,
}

impl Default for PodWatchState {
    fn default() -> Self {
        PodWatchState {
            phase: PodPhase::Waiting,
            exit_code: 0,
            close_error: None,
        }
    }
}

impl PodWatchState {
    fn advance(&mut self, phase: PodPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /**
     * Update the state from a pod status event.  Returns true if the pod has
     * reached the point at which its log can be collected.
     */
    pub fn apply(&mut self, pod: &Pod) -> bool {
        if pod
            .conditions()
            .iter()
            .any(|c| c.reason.as_deref() == Some("PodCompleted"))
        {
            self.advance(PodPhase::Complete);
        } else if pod.container_states().any(|s| s.running.is_some()) {
            self.advance(PodPhase::Running);
        } else if pod.container_states().any(|s| s.terminated.is_some()) {
            self.advance(PodPhase::Complete);
        }

        for s in pod.container_states() {
            let creating = s.waiting.as_ref().is_some_and(|w| {
                w.reason.as_deref() == Some("ContainerCreating")
            });
            if creating {
                self.advance(PodPhase::Starting);
            }
        }

        if self.phase < PodPhase::Complete {
            return false;
        }

        if self.phase == PodPhase::Complete {
            if let Some(t) =
                pod.container_states().find_map(|s| s.terminated.as_ref())
            {
                self.exit_code = t.exit_code;
                self.advance(PodPhase::Finished);
            }
        }

        true
    }

    /**
     * Record the end of the event stream.  A clean end means the pod is gone
     * and so must have finished; an error leaves the phase alone, as the pod
     * may still be running.
     */
    pub fn closed(&mut self, error: Option<String>) {
        match error {
            None => self.advance(PodPhase::Finished),
            Some(e) => self.close_error = Some(e),
        }
    }
}

/**
 * Follows status events for one pod in a background task, maintaining a
 * PodWatchState that the execute() poll loop can inspect.
 */
pub struct PodWatcher {
    state: Arc<Mutex<PodWatchState>>,
    task: JoinHandle<()>,
}

impl PodWatcher {
    /**
     * Establish the watch.  An error here means no watch exists; errors that
     * occur later are recorded in the state as a close error.
     */
    pub async fn start(
        log: &Logger,
        api: &Arc<dyn ClusterApi>,
        namespace: &str,
        pod: &str,
        logs: Arc<LogCollector>,
    ) -> Result<PodWatcher, ClusterError> {
        let mut events = api.watch_pod(namespace, pod).await?;

        let state: Arc<Mutex<PodWatchState>> = Default::default();
        let st = Arc::clone(&state);
        let log = log.clone();

        let task = tokio::spawn(async move {
            while let Some(ev) = events.next().await {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(e) => {
                        error!(log, "pod watch closed: {e}");
                        st.lock().unwrap().closed(Some(e.to_string()));
                        return;
                    }
                };

                /*
                 * The log collector must be attached before the new phase
                 * becomes visible, or execute() may drain it too early.
                 */
                let phase = {
                    let mut st = st.lock().unwrap();
                    if st.apply(&ev.pod) && ev.kind != EventKind::Deleted {
                        logs.attach();
                    }
                    st.phase
                };
                info!(log, "pod event"; "kind" => %ev.kind, "phase" => %phase);
            }

            info!(log, "pod watch ended");
            st.lock().unwrap().closed(None);
        });

        Ok(PodWatcher { state, task })
    }

    pub fn state(&self) -> PodWatchState {
        self.state.lock().unwrap().clone()
    }

    pub fn finished(&self) -> bool {
        self.state().phase == PodPhase::Finished
    }

    pub fn started(&self) -> bool {
        self.state().phase > PodPhase::Waiting
    }

    pub fn exit_code(&self) -> i32 {
        self.state().exit_code
    }

    pub fn close_error(&self) -> Option<String> {
        self.state().close_error
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for PodWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::api::{LogStream, WatchStream};
    use crate::cluster::model::*;
    use async_trait::async_trait;

    /**
     * Delivers a single event, then holds the watch open.
     */
    struct OneEvent(Pod);

    #[async_trait]
    impl ClusterApi for OneEvent {
        async fn create_pod(
            &self,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn delete_pod(
            &self,
            _: &str,
            _: &str,
        ) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn watch_pod(
            &self,
            _: &str,
            _: &str,
        ) -> Result<WatchStream, ClusterError> {
            let ev = PodEvent::new(EventKind::Modified, self.0.clone());
            Ok(Box::pin(
                futures::stream::iter(vec![Ok::<_, ClusterError>(ev)])
                    .chain(futures::stream::pending()),
            ))
        }

        async fn follow_log(
            &self,
            _: &str,
            _: &str,
        ) -> Result<LogStream, ClusterError> {
            let chunk = bytes::Bytes::from_static(b"done\n");
            Ok(Box::pin(futures::stream::iter(vec![Ok::<_, ClusterError>(
                chunk,
            )])))
        }
    }

    fn pod(state: ContainerState) -> Pod {
        Pod {
            metadata: Default::default(),
            status: Some(PodStatus {
                phase: None,
                conditions: Vec::new(),
                container_statuses: vec![ContainerStatus {
                    name: "job".into(),
                    state: Some(state),
                }],
            }),
        }
    }

    fn waiting(reason: &str) -> Pod {
        pod(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.into()),
                message: None,
            }),
            ..Default::default()
        })
    }

    fn running() -> Pod {
        pod(ContainerState {
            running: Some(Default::default()),
            ..Default::default()
        })
    }

    fn terminated(code: i32) -> Pod {
        pod(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: code,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn full_progression() {
        let mut s = PodWatchState::default();
        assert_eq!(s.phase, PodPhase::Waiting);
        assert_eq!(s.exit_code, 0);

        assert!(!s.apply(&Pod::default()));
        assert_eq!(s.phase, PodPhase::Waiting);

        assert!(!s.apply(&waiting("ContainerCreating")));
        assert_eq!(s.phase, PodPhase::Starting);

        assert!(!s.apply(&running()));
        assert_eq!(s.phase, PodPhase::Running);

        assert!(s.apply(&terminated(1)));
        assert_eq!(s.phase, PodPhase::Finished);
        assert_eq!(s.exit_code, 1);
    }

    #[test]
    fn other_waiting_reasons() {
        let mut s = PodWatchState::default();
        s.apply(&waiting("ErrImagePull"));
        assert_eq!(s.phase, PodPhase::Waiting);
    }

    #[test]
    fn completed_condition_without_status() {
        let mut s = PodWatchState::default();
        let mut p = running();
        p.status.as_mut().unwrap().conditions.push(PodCondition {
            type_: "Ready".into(),
            status: "False".into(),
            reason: Some("PodCompleted".into()),
        });

        assert!(s.apply(&p));
        assert_eq!(s.phase, PodPhase::Complete);
        assert_eq!(s.exit_code, 0);

        assert!(s.apply(&terminated(0)));
        assert_eq!(s.phase, PodPhase::Finished);
    }

    #[test]
    fn phase_never_regresses() {
        let mut s = PodWatchState::default();
        s.apply(&running());
        s.apply(&waiting("ContainerCreating"));
        assert_eq!(s.phase, PodPhase::Running);

        s.apply(&terminated(4));
        s.apply(&terminated(9));
        assert_eq!(s.exit_code, 4);
    }

    #[test]
    fn close_semantics() {
        let mut s = PodWatchState::default();
        s.apply(&running());

        s.closed(Some("too old resource version".into()));
        assert_eq!(s.phase, PodPhase::Running);
        assert!(s.close_error.is_some());

        let mut s = PodWatchState::default();
        s.closed(None);
        assert_eq!(s.phase, PodPhase::Finished);
        assert_eq!(s.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn log_attached_before_finished() -> anyhow::Result<()> {
        let log = runomat_common::discard_log();
        let api: Arc<dyn ClusterApi> = Arc::new(OneEvent(terminated(3)));
        let logs = Arc::new(LogCollector::new(
            &log,
            Arc::clone(&api),
            "ns",
            "p",
            None,
        ));

        let w = PodWatcher::start(&log, &api, "ns", "p", Arc::clone(&logs))
            .await?;
        while !w.finished() {
            tokio::task::yield_now().await;
        }

        assert!(logs.is_attached());
        assert_eq!(w.exit_code(), 3);
        logs.drain(std::time::Duration::from_secs(10)).await;
        assert_eq!(logs.output(), "done\n");
        w.close();
        Ok(())
    }
}
