/*
 * Copyright 2024 Oxide Computer Company
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runomat_types::config::{ConfigFile, ConfigFileCluster};
use serde_json::json;
use slog::{error, info, o, warn, Logger};
use tokio::time::Instant;

use crate::error::{illegal_state, RResult};
use crate::state::{Lifecycle, RunnerState, StopRequest};
use crate::workdir::WorkDir;
use crate::{Runner, RunnerError};

pub mod api;
mod logs;
pub mod model;
mod watch;

pub use api::{ClusterApi, ClusterError, KubeClient};
pub use logs::LogCollector;
pub use watch::{PodPhase, PodWatchState, PodWatcher};

/**
 * How long to wait, once a pod has finished, for the rest of its log.
 */
const LOG_DRAIN: Duration = Duration::from_secs(10);

enum Outcome {
    Finished(i32),
    Stopped,
    NotStarted,
    WatchLost(String),
}

/**
 * Runs a job as a pod on a cluster.  The work directory lives on a volume
 * shared with the cluster, and is mounted into the pod by its sub-path.
 * Completion is detected from pod status events.
 */
pub struct ClusterJobRunner {
    log: Logger,
    api: Arc<dyn ClusterApi>,
    config: ConfigFileCluster,
    image: String,
    workdir: WorkDir,
    life: Lifecycle,
    pod_name: Mutex<Option<String>>,
    watcher: Mutex<Option<PodWatcher>>,
    logs: Mutex<Option<Arc<LogCollector>>>,
}

impl ClusterJobRunner {
    pub fn new(
        log: &Logger,
        api: Arc<dyn ClusterApi>,
        config: &ConfigFile,
        image: &str,
        job_id: Option<&str>,
    ) -> ClusterJobRunner {
        let workdir = WorkDir::new(log, &config.general.work_dir, job_id);
        let log = log.new(o!(
            "backend" => "cluster",
            "job" => workdir.id().to_string(),
        ));

        ClusterJobRunner {
            log,
            api,
            config: config.cluster.clone(),
            image: image.to_string(),
            workdir,
            life: Lifecycle::new(),
            pod_name: Mutex::new(None),
            watcher: Mutex::new(None),
            logs: Mutex::new(None),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn pod_name(&self) -> Option<String> {
        self.pod_name.lock().unwrap().clone()
    }

    /**
     * The name of the work directory within the shared volume.  It becomes
     * part of the pod name unchanged, so it must already be a valid DNS
     * label: lowercase letters, digits and "-", beginning and ending with a
     * letter or digit.
     */
    pub fn sub_path(&self) -> RResult<String> {
        let Some(leaf) = self.workdir.leaf() else {
            illegal_state!(
                "work directory {:?} has no name",
                self.workdir.path()
            );
        };

        let edge = |c: Option<char>| {
            c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        };
        if !edge(leaf.chars().next())
            || !edge(leaf.chars().last())
            || !leaf.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
            })
        {
            illegal_state!("invalid work directory sub-path {leaf:?}");
        }

        Ok(leaf.to_string())
    }

    fn make_pod_name(&self, sub_path: &str) -> String {
        format!("{}-{}", self.config.pod_base_name, sub_path)
    }

    fn environment(&self) -> Vec<serde_json::Value> {
        let mut env = self
            .config
            .environment
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect::<Vec<_>>();

        if let Some(p) = &self.config.workflow_profile {
            env.push(json!({ "name": "NF_PROFILE_NAME", "value": p }));
        }

        env
    }

    pub fn pod_manifest(
        &self,
        pod_name: &str,
        sub_path: &str,
        args: &[String],
    ) -> serde_json::Value {
        let c = &self.config;

        let mut container = json!({
            "name": pod_name,
            "image": &self.image,
            "imagePullPolicy": &c.image_pull_policy,
            "workingDir": &c.mount_path,
            "env": self.environment(),
            "resources": {
                "requests": { "cpu": &c.cpu_request },
                "limits": { "cpu": &c.cpu_limit },
            },
            "volumeMounts": [ {
                "name": "work-dir",
                "mountPath": &c.mount_path,
                "subPath": sub_path,
            } ],
        });
        if !args.is_empty() {
            container["command"] = json!(args);
        }

        /*
         * Files written by the job must remain accessible to us, so the pod
         * joins our group.
         */
        let gid = unsafe { libc::getgid() };

        let mut spec = json!({
            "containers": [ container ],
            "restartPolicy": "Never",
            "serviceAccountName": &c.service_account,
            "securityContext": { "supplementalGroups": [ gid ] },
            "volumes": [ {
                "name": "work-dir",
                "persistentVolumeClaim": {
                    "claimName": &c.pvc_name,
                    "readOnly": false,
                },
            } ],
        });
        if let Some((k, v)) = c.node_selector() {
            let mut ns = serde_json::Map::new();
            ns.insert(k, json!(v));
            spec["nodeSelector"] = serde_json::Value::Object(ns);
        }
        if !c.image_pull_secrets.is_empty() {
            spec["imagePullSecrets"] = c
                .image_pull_secrets
                .iter()
                .map(|s| json!({ "name": s }))
                .collect();
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "namespace": &c.namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "runomat",
                    "runomat.io/job": self.workdir.id(),
                },
            },
            "spec": spec,
        })
    }

    fn watch_state(&self) -> Option<PodWatchState> {
        self.watcher.lock().unwrap().as_ref().map(|w| w.state())
    }

    fn execution_error(&self, message: String) -> RunnerError {
        RunnerError::Execution { message, log: self.log() }
    }

    async fn wait_for_pod(
        &self,
        pod_name: &str,
        logs: &Arc<LogCollector>,
    ) -> Outcome {
        let start = Instant::now();
        let grace = self.config.start_grace();
        let poll = self.config.poll_interval();
        let mut started = false;

        loop {
            if self.life.stop_requested() {
                return Outcome::Stopped;
            }

            let Some(st) = self.watch_state() else {
                return Outcome::WatchLost("no watcher".into());
            };

            if st.phase > PodPhase::Waiting {
                started = true;
            }
            if st.phase == PodPhase::Finished {
                return Outcome::Finished(st.exit_code);
            }
            if !started && start.elapsed() >= grace {
                return Outcome::NotStarted;
            }

            if let Some(e) = st.close_error {
                /*
                 * The watch was interrupted, but the pod is unaffected.
                 * Establish a new watch, which will begin by reporting the
                 * current state of the pod.
                 */
                warn!(self.log, "re-establishing pod watch after: {e}");
                match PodWatcher::start(
                    &self.log,
                    &self.api,
                    &self.config.namespace,
                    pod_name,
                    Arc::clone(logs),
                )
                .await
                {
                    Ok(w) => {
                        self.watcher.lock().unwrap().replace(w);
                    }
                    Err(e) => return Outcome::WatchLost(e.to_string()),
                }
            }

            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl Runner for ClusterJobRunner {
    fn work_dir(&self) -> &WorkDir {
        &self.workdir
    }

    fn state(&self) -> RunnerState {
        self.life.state()
    }

    fn local_work_dir(&self) -> &str {
        &self.config.mount_path
    }

    async fn init(&self) -> RResult<()> {
        self.life.check_created()?;
        self.workdir.create()?;
        self.life.initialised()
    }

    async fn execute(&self, args: &[String]) -> RResult<i32> {
        let _g = self.life.begin_execute()?;

        let sub_path = self.sub_path()?;
        let pod_name = self.make_pod_name(&sub_path);
        let ns = self.config.namespace.clone();
        let manifest = self.pod_manifest(&pod_name, &sub_path, args);
        *self.pod_name.lock().unwrap() = Some(pod_name.clone());

        let logs = Arc::new(LogCollector::new(
            &self.log,
            Arc::clone(&self.api),
            &ns,
            &pod_name,
            self.config.log_history(),
        ));
        *self.logs.lock().unwrap() = Some(Arc::clone(&logs));

        /*
         * Watch before creating the pod, so that no event can be missed.
         */
        info!(self.log, "watching pod"; "pod" => &pod_name);
        match PodWatcher::start(
            &self.log,
            &self.api,
            &ns,
            &pod_name,
            Arc::clone(&logs),
        )
        .await
        {
            Ok(w) => *self.watcher.lock().unwrap() = Some(w),
            Err(e) => {
                self.cleanup().await;
                illegal_state!("watching pod {pod_name}: {e}");
            }
        }

        info!(self.log, "creating pod";
            "pod" => &pod_name, "image" => &self.image);
        if let Err(e) = self.api.create_pod(&ns, &manifest).await {
            self.cleanup().await;
            illegal_state!("creating pod {pod_name}: {e}");
        }

        match self.wait_for_pod(&pod_name, &logs).await {
            Outcome::Finished(code) => {
                logs.drain(LOG_DRAIN).await;
                info!(self.log, "pod finished";
                    "pod" => &pod_name, "code" => code);
                Ok(code)
            }
            Outcome::Stopped => {
                info!(self.log, "stopped waiting for pod"; "pod" => &pod_name);
                Err(self.execution_error(format!("pod {pod_name} was stopped")))
            }
            Outcome::NotStarted => {
                error!(self.log, "pod did not start"; "pod" => &pod_name);
                Err(self.execution_error(format!(
                    "pod {pod_name} did not start within {} minutes",
                    self.config.start_grace().as_secs() / 60
                )))
            }
            Outcome::WatchLost(e) => {
                error!(self.log, "lost watch on pod"; "pod" => &pod_name);
                Err(RunnerError::Resource(format!(
                    "could not watch pod {pod_name}: {e}"
                )))
            }
        }
    }

    async fn stop(&self) -> RResult<()> {
        match self.life.request_stop()? {
            StopRequest::Idle => return Ok(()),
            StopRequest::Pending => {
                info!(self.log, "stop already in progress");
            }
            StopRequest::Begin => {
                /*
                 * The poll loop in execute() sees the request and ends the
                 * wait; the pod is deleted at cleanup().
                 */
                info!(self.log, "stop requested");
            }
        }

        self.life.wait_stopped().await;
        Ok(())
    }

    fn log(&self) -> String {
        self.logs
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.output())
            .unwrap_or_default()
    }

    async fn cleanup(&self) {
        let pod = self.pod_name.lock().unwrap().take();
        if let Some(pod) = pod {
            match self.api.delete_pod(&self.config.namespace, &pod).await {
                Ok(()) => info!(self.log, "deleted pod"; "pod" => &pod),
                Err(ClusterError::NotFound(_)) => {
                    info!(self.log, "pod already gone"; "pod" => &pod);
                }
                Err(e) => error!(self.log, "deleting pod {pod}: {e}"),
            }
        }

        if let Some(w) = self.watcher.lock().unwrap().take() {
            w.close();
        }
        if let Some(l) = self.logs.lock().unwrap().as_ref() {
            l.close();
        }

        self.workdir.remove();
    }

    fn extra_workflow_config(&self, original: &str) -> String {
        let sub_path = self.workdir.leaf().unwrap_or_default();

        format!(
            "{original}\n\
            k8s {{\n  \
              storageClaimName = '{}'\n  \
              storageMountPath = '{}'\n  \
              storageSubPath = '{}'\n  \
              serviceAccount = '{}'\n\
            }}\n",
            self.config.pvc_name,
            self.config.mount_path,
            sub_path,
            self.config.service_account,
        )
    }
}

#[cfg(test)]
mod test {
    use super::model::*;
    use super::*;
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::path::Path;

    enum Step {
        Event(Pod),
        Fail(&'static str),
        Hang,
    }

    #[derive(Default)]
    struct FakeCluster {
        /*
         * Each call to watch_pod() consumes one entry; None means the watch
         * cannot be established.
         */
        watches: Mutex<VecDeque<Option<Vec<Step>>>>,
        watch_calls: Mutex<usize>,
        create_fails: bool,
        created: Mutex<Vec<serde_json::Value>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeCluster {
        fn new(watches: Vec<Option<Vec<Step>>>) -> FakeCluster {
            FakeCluster { watches: Mutex::new(watches.into()), ..Default::default() }
        }

        fn created(&self) -> Vec<serde_json::Value> {
            self.created.lock().unwrap().clone()
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn create_pod(
            &self,
            _: &str,
            manifest: &serde_json::Value,
        ) -> Result<(), ClusterError> {
            if self.create_fails {
                return Err(ClusterError::Api("quota exceeded".into()));
            }
            self.created.lock().unwrap().push(manifest.clone());
            Ok(())
        }

        async fn delete_pod(
            &self,
            _: &str,
            name: &str,
        ) -> Result<(), ClusterError> {
            let exists = self
                .created
                .lock()
                .unwrap()
                .iter()
                .any(|m| m["metadata"]["name"] == name);
            let mut deleted = self.deleted.lock().unwrap();
            let gone = deleted.iter().any(|d| d == name);
            deleted.push(name.to_string());

            if exists && !gone {
                Ok(())
            } else {
                Err(ClusterError::NotFound(name.to_string()))
            }
        }

        async fn watch_pod(
            &self,
            _: &str,
            _: &str,
        ) -> Result<api::WatchStream, ClusterError> {
            *self.watch_calls.lock().unwrap() += 1;
            let steps = self
                .watches
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or_else(|| ClusterError::Api("watch refused".into()))?;

            let s = futures::stream::unfold(
                VecDeque::from(steps),
                |mut steps| async move {
                    match steps.pop_front()? {
                        Step::Event(p) => Some((
                            Ok(PodEvent::new(EventKind::Modified, p)),
                            steps,
                        )),
                        Step::Fail(m) => {
                            Some((Err(ClusterError::Watch(m.into())), steps))
                        }
                        Step::Hang => {
                            std::future::pending::<()>().await;
                            None
                        }
                    }
                },
            );
            Ok(Box::pin(s))
        }

        async fn follow_log(
            &self,
            _: &str,
            _: &str,
        ) -> Result<api::LogStream, ClusterError> {
            let chunks = ["hello ", "from the pod\n"]
                .iter()
                .map(|c| Ok(bytes::Bytes::from(c.to_string())))
                .collect::<Vec<_>>();
            Ok(Box::pin(futures::stream::iter(chunks)))
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

    fn creating() -> Step {
        Step::Event(pod(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".into()),
                message: None,
            }),
            ..Default::default()
        }))
    }

    fn running() -> Step {
        Step::Event(pod(ContainerState {
            running: Some(Default::default()),
            ..Default::default()
        }))
    }

    fn terminated(code: i32) -> Step {
        Step::Event(pod(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: code,
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    fn config(base: &Path) -> ConfigFile {
        let mut c = ConfigFile::default();
        c.general.work_dir = base.to_path_buf();
        c.cluster.start_grace_minutes = 1;
        c.cluster
            .environment
            .insert("HTTP_PROXY".into(), "http://proxy:3128".into());
        c.cluster.image_pull_secrets = vec!["regcred".into()];
        c
    }

    fn runner_with_id(
        api: &Arc<FakeCluster>,
        base: &Path,
        id: &str,
    ) -> ClusterJobRunner {
        ClusterJobRunner::new(
            &runomat_common::discard_log(),
            Arc::clone(api) as Arc<dyn ClusterApi>,
            &config(base),
            "informaticsmatters/rdkit:latest",
            Some(id),
        )
    }

    fn runner(api: &Arc<FakeCluster>, base: &Path) -> ClusterJobRunner {
        runner_with_id(api, base, "01hzjob")
    }

    fn execute_args() -> Vec<String> {
        vec!["/work/execute".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn pod_runs_to_failure() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![Some(vec![
            creating(),
            running(),
            terminated(1),
            Step::Hang,
        ])]));
        let r = runner(&api, base.path());

        r.init().await?;
        assert_eq!(r.log(), "");
        assert_eq!(r.execute(&execute_args()).await?, 1);
        assert_eq!(r.state(), RunnerState::Finished);
        assert_eq!(r.log(), "hello from the pod\n");

        /*
         * Neither a second execution nor a late stop has any effect on the
         * outcome.
         */
        assert!(r.execute(&execute_args()).await.unwrap_err().is_illegal_state());
        r.stop().await?;
        assert_eq!(r.state(), RunnerState::Finished);

        let dir = r.work_dir().path().to_path_buf();
        r.cleanup().await;
        r.cleanup().await;
        assert!(!dir.exists());
        assert_eq!(api.deleted(), vec!["runomat-job-pod-01hzjob"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pod_manifest() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![Some(vec![terminated(0)])]));
        let r = runner(&api, base.path());

        r.init().await?;
        assert_eq!(r.execute(&execute_args()).await?, 0);
        assert_eq!(r.pod_name().as_deref(), Some("runomat-job-pod-01hzjob"));

        let created = api.created();
        assert_eq!(created.len(), 1);
        let m = &created[0];
        assert_eq!(m["metadata"]["name"], "runomat-job-pod-01hzjob");
        assert_eq!(m["metadata"]["namespace"], "runomat");

        let spec = &m["spec"];
        assert_eq!(spec["restartPolicy"], "Never");
        assert_eq!(spec["serviceAccountName"], "runomat");
        assert_eq!(spec["nodeSelector"]["runomat.io/purpose"], "worker");
        assert_eq!(spec["imagePullSecrets"][0]["name"], "regcred");
        assert_eq!(
            spec["securityContext"]["supplementalGroups"][0],
            serde_json::json!(unsafe { libc::getgid() })
        );
        assert_eq!(
            spec["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "runomat-work-dir-pvc"
        );

        let c = &spec["containers"][0];
        assert_eq!(c["image"], "informaticsmatters/rdkit:latest");
        assert_eq!(c["workingDir"], "/work");
        assert_eq!(c["command"][0], "/work/execute");
        assert_eq!(c["imagePullPolicy"], "IfNotPresent");
        assert_eq!(c["resources"]["limits"]["cpu"], "1");
        assert_eq!(c["volumeMounts"][0]["mountPath"], "/work");
        assert_eq!(c["volumeMounts"][0]["subPath"], "01hzjob");

        let env = c["env"].as_array().unwrap();
        assert!(env.contains(&serde_json::json!({
            "name": "HTTP_PROXY", "value": "http://proxy:3128"
        })));
        assert!(env.contains(&serde_json::json!({
            "name": "NF_PROFILE_NAME", "value": "kubernetes"
        })));

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pod_never_starts() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![Some(vec![Step::Hang])]));
        let r = runner(&api, base.path());
        r.init().await?;

        let t0 = Instant::now();
        let e = r.execute(&execute_args()).await.unwrap_err();
        let waited = t0.elapsed();

        assert!(e.is_execution());
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(65));
        assert_eq!(r.log(), "");
        assert_eq!(r.state(), RunnerState::Finished);

        r.cleanup().await;
        assert_eq!(api.deleted().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn watch_reconnects() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![
            Some(vec![running(), Step::Fail("too old resource version")]),
            Some(vec![terminated(3), Step::Hang]),
        ]));
        let r = runner(&api, base.path());

        r.init().await?;
        assert_eq!(r.execute(&execute_args()).await?, 3);
        assert_eq!(*api.watch_calls.lock().unwrap(), 2);

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn watch_cannot_reconnect() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![
            Some(vec![running(), Step::Fail("connection reset")]),
            None,
        ]));
        let r = runner(&api, base.path());

        r.init().await?;
        let e = r.execute(&execute_args()).await.unwrap_err();
        assert!(matches!(e, RunnerError::Resource(_)));

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_means_finished() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![Some(vec![running()])]));
        let r = runner(&api, base.path());

        r.init().await?;
        assert_eq!(r.execute(&execute_args()).await?, 0);

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn watch_failure() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![None]));
        let r = runner(&api, base.path());

        r.init().await?;
        let e = r.execute(&execute_args()).await.unwrap_err();
        assert!(e.is_illegal_state());
        assert!(api.created().is_empty());
        assert!(!r.work_dir().path().exists());

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster {
            create_fails: true,
            ..FakeCluster::new(vec![Some(vec![Step::Hang])])
        });
        let r = runner(&api, base.path());

        r.init().await?;
        let e = r.execute(&execute_args()).await.unwrap_err();
        assert!(e.is_illegal_state());
        assert!(e.to_string().contains("quota exceeded"));

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_execute() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api =
            Arc::new(FakeCluster::new(vec![Some(vec![running(), Step::Hang])]));
        let r = Arc::new(runner(&api, base.path()));

        assert!(r.stop().await.unwrap_err().is_illegal_state());
        r.init().await?;

        let r0 = Arc::clone(&r);
        let exec =
            tokio::spawn(async move { r0.execute(&execute_args()).await });
        while api.created().is_empty() {
            tokio::task::yield_now().await;
        }

        /*
         * The pod has started, so the grace period does not apply.
         */
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(!exec.is_finished());
        assert_eq!(r.state(), RunnerState::Running);

        /*
         * Whichever stop() arrives second must wait just as long as the
         * first.
         */
        let (first, second) = tokio::join!(r.stop(), r.stop());
        first?;
        second?;
        assert!(exec.is_finished());
        assert_eq!(r.state(), RunnerState::Stopped);
        assert!(exec.await?.unwrap_err().is_execution());

        r.cleanup().await;
        assert_eq!(api.deleted(), vec!["runomat-job-pod-01hzjob"]);
        Ok(())
    }

    #[tokio::test]
    async fn bad_sub_path() -> Result<()> {
        let base = tempfile::tempdir()?;
        let api = Arc::new(FakeCluster::new(vec![]));
        let r = runner_with_id(&api, base.path(), "Job_1");

        r.init().await?;
        assert!(r.sub_path().is_err());
        let e = r.execute(&execute_args()).await.unwrap_err();
        assert!(e.is_illegal_state());
        assert_eq!(*api.watch_calls.lock().unwrap(), 0);

        r.cleanup().await;
        Ok(())
    }

    #[test]
    fn pod_names() {
        let api = Arc::new(FakeCluster::default());

        /*
         * Directories that differ only in case or punctuation must not share
         * a pod name, so only names that are already valid are accepted.
         */
        for id in ["Job-1", "job_1", "job.1", "-job1", "job1-"] {
            let r = runner_with_id(&api, Path::new("/tmp"), id);
            assert!(r.sub_path().unwrap_err().is_illegal_state(), "{id:?}");
        }

        let r = runner_with_id(&api, Path::new("/tmp"), "job-1");
        assert_eq!(r.sub_path().unwrap(), "job-1");
        assert_eq!(r.make_pod_name("job-1"), "runomat-job-pod-job-1");
    }

    #[test]
    fn workflow_config() {
        let api = Arc::new(FakeCluster::default());
        let r = runner(&api, Path::new("/tmp"));

        let c = r.extra_workflow_config("docker.enabled = true");
        assert!(c.starts_with("docker.enabled = true\nk8s {\n"));
        assert!(c.contains("  storageClaimName = 'runomat-work-dir-pvc'\n"));
        assert!(c.contains("  storageMountPath = '/work'\n"));
        assert!(c.contains("  storageSubPath = '01hzjob'\n"));
        assert!(c.contains("  serviceAccount = 'runomat'\n"));
        assert!(c.ends_with("}\n"));
    }
}
