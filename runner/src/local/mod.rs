/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runomat_types::config::ConfigFile;
use slog::{error, info, o, warn, Logger};
use thiserror::Error;

use crate::error::RResult;
use crate::logbuf::LogBuffer;
use crate::state::{Lifecycle, RunnerState, StopRequest};
use crate::workdir::WorkDir;
use crate::{Runner, RunnerError};

mod docker;

pub use docker::DockerEngine;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("container engine: {0}")]
    Engine(String),
}

/**
 * Everything needed to create one container.
 */
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub network: String,
    pub volumes: Vec<String>,
    /**
     * Host paths to mount in the container, as "host:container:mode".
     */
    pub binds: Vec<String>,
}

/**
 * The operations we need from a local container engine.
 */
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool, EngineError>;
    async fn pull_image(
        &self,
        name: &str,
        tag: &str,
    ) -> Result<(), EngineError>;
    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    /**
     * Copy container output into the sink until the container exits.
     */
    async fn follow_logs(
        &self,
        id: &str,
        sink: &LogBuffer,
    ) -> Result<(), EngineError>;
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}

/**
 * Split an image reference into name and tag.  A colon that appears before
 * the last slash belongs to a registry port, not a tag.
 */
pub fn split_image(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') && !tag.is_empty() => {
            (name, tag)
        }
        _ => (image, "latest"),
    }
}

#[derive(Default)]
struct Mounts {
    volumes: Vec<String>,
    binds: Vec<String>,
}

/**
 * Runs a job as a single container on a local container engine, with the
 * work directory bind-mounted into it.
 */
pub struct LocalContainerRunner {
    log: Logger,
    engine: Arc<dyn ContainerEngine>,
    image: String,
    network: String,
    mount_path: String,
    pull_timeout: Duration,
    workdir: WorkDir,
    life: Lifecycle,
    mounts: Mutex<Mounts>,
    container: Mutex<Option<String>>,
    output: LogBuffer,
}

impl LocalContainerRunner {
    pub fn new(
        log: &Logger,
        engine: Arc<dyn ContainerEngine>,
        config: &ConfigFile,
        image: &str,
        job_id: Option<&str>,
    ) -> LocalContainerRunner {
        let workdir = WorkDir::new(log, &config.general.work_dir, job_id);
        let log = log.new(o!(
            "backend" => "local",
            "job" => workdir.id().to_string(),
        ));

        LocalContainerRunner {
            log,
            engine,
            image: image.to_string(),
            network: config.docker.network.clone(),
            mount_path: config.docker.mount_path.clone(),
            pull_timeout: config.docker.pull_timeout(),
            workdir,
            life: Lifecycle::new(),
            mounts: Default::default(),
            container: Mutex::new(None),
            output: LogBuffer::unbounded(),
        }
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn add_volume(&self, container_path: &str) {
        self.mounts.lock().unwrap().volumes.push(container_path.to_string());
    }

    pub fn add_bind(&self, host: &Path, container_path: &str, read_only: bool) {
        let mode = if read_only { "ro" } else { "rw" };
        self.mounts.lock().unwrap().binds.push(format!(
            "{}:{}:{}",
            host.display(),
            container_path,
            mode
        ));
    }

    /**
     * Give the job access to the container engine itself; e.g., for a
     * workflow engine that starts containers of its own.
     */
    pub fn include_docker_socket(&self) {
        self.add_bind(Path::new(DOCKER_SOCKET), DOCKER_SOCKET, false);
    }

    fn stopped_error(&self) -> RunnerError {
        RunnerError::Execution {
            message: format!("container for {} was stopped", self.image),
            log: self.output.snapshot(),
        }
    }

    async fn ensure_image(&self) -> RResult<()> {
        let present =
            self.engine.image_present(&self.image).await.map_err(|e| {
                RunnerError::Resource(format!(
                    "checking for image {}: {e}",
                    self.image
                ))
            })?;
        if present {
            return Ok(());
        }

        let (name, tag) = split_image(&self.image);
        info!(self.log, "pulling image"; "name" => name, "tag" => tag);

        let pull = tokio::time::timeout(
            self.pull_timeout,
            self.engine.pull_image(name, tag),
        );
        let res = tokio::select! {
            res = pull => res,
            _ = self.life.stop_signalled() => {
                info!(self.log, "image pull abandoned");
                return Err(self.stopped_error());
            }
        };

        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RunnerError::Execution {
                message: format!("pulling image {}: {e}", self.image),
                log: self.output.snapshot(),
            }),
            Err(_) => Err(RunnerError::Execution {
                message: format!(
                    "pulling image {} took longer than {} seconds",
                    self.image,
                    self.pull_timeout.as_secs()
                ),
                log: self.output.snapshot(),
            }),
        }
    }
}

#[async_trait]
impl Runner for LocalContainerRunner {
    fn work_dir(&self) -> &WorkDir {
        &self.workdir
    }

    fn state(&self) -> RunnerState {
        self.life.state()
    }

    fn local_work_dir(&self) -> &str {
        &self.mount_path
    }

    async fn init(&self) -> RResult<()> {
        self.life.check_created()?;
        self.workdir.create()?;
        self.add_bind(self.workdir.path(), &self.mount_path, false);
        self.life.initialised()
    }

    async fn execute(&self, args: &[String]) -> RResult<i32> {
        let _g = self.life.begin_execute()?;

        self.ensure_image().await?;
        if self.life.stop_requested() {
            return Err(self.stopped_error());
        }

        let spec = {
            let m = self.mounts.lock().unwrap();
            ContainerSpec {
                image: self.image.clone(),
                cmd: args.to_vec(),
                working_dir: self.mount_path.clone(),
                network: self.network.clone(),
                volumes: m.volumes.clone(),
                binds: m.binds.clone(),
            }
        };

        let id =
            self.engine.create_container(&spec).await.map_err(|e| {
                RunnerError::Resource(format!(
                    "creating container for {}: {e}",
                    self.image
                ))
            })?;
        info!(self.log, "created container"; "id" => &id, "cmd" => ?args);

        /*
         * Record the container before checking for a stop request, so that a
         * concurrent stop() will either see the container or have its request
         * seen here.
         */
        *self.container.lock().unwrap() = Some(id.clone());
        if self.life.stop_requested() {
            return Err(self.stopped_error());
        }

        if let Err(e) = self.engine.start_container(&id).await {
            return Err(RunnerError::Resource(format!(
                "starting container for {}: {e}",
                self.image
            )));
        }

        let (logs, code) = tokio::join!(
            self.engine.follow_logs(&id, &self.output),
            self.engine.wait_container(&id),
        );
        if let Err(e) = logs {
            warn!(self.log, "log stream failed: {e}");
        }

        if self.life.stop_requested() {
            return Err(self.stopped_error());
        }

        let code = code.map_err(|e| RunnerError::Execution {
            message: format!("waiting for container {id}: {e}"),
            log: self.output.snapshot(),
        })?;
        info!(self.log, "container exited"; "code" => code);

        Ok(i32::try_from(code).unwrap_or(i32::MAX))
    }

    async fn stop(&self) -> RResult<()> {
        match self.life.request_stop()? {
            StopRequest::Idle => return Ok(()),
            StopRequest::Pending => {
                info!(self.log, "stop already in progress");
            }
            StopRequest::Begin => {
                let id = self.container.lock().unwrap().clone();
                if let Some(id) = id {
                    info!(self.log, "stopping container"; "id" => &id);
                    if let Err(e) = self.engine.stop_container(&id).await {
                        warn!(self.log, "stopping container {id}: {e}");
                    }
                }
            }
        }

        self.life.wait_stopped().await;
        Ok(())
    }

    fn log(&self) -> String {
        self.output.snapshot()
    }

    async fn cleanup(&self) {
        if self.life.is_executing() {
            warn!(self.log, "cleanup while job is still executing");
        }

        let id = self.container.lock().unwrap().take();
        if let Some(id) = id {
            match self.engine.remove_container(&id).await {
                Ok(()) => info!(self.log, "removed container"; "id" => &id),
                Err(EngineError::NotFound(_)) => {
                    info!(self.log, "container already removed"; "id" => &id);
                }
                Err(e) => error!(self.log, "removing container {id}: {e}"),
            }
        }

        self.workdir.remove();
    }
}
