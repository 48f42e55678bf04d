/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use super::{ContainerEngine, ContainerSpec, EngineError};
use crate::logbuf::LogBuffer;

/**
 * A container engine reached over the Docker API on the local socket.
 */
pub struct DockerEngine {
    docker: Docker,
}

fn engine_error(what: &str, e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        } => EngineError::NotFound(what.to_string()),
        e => EngineError::Engine(format!("{what}: {e}")),
    }
}

impl DockerEngine {
    pub fn connect() -> anyhow::Result<DockerEngine> {
        Ok(DockerEngine { docker: Docker::connect_with_local_defaults()? })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_present(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match engine_error(image, e) {
                EngineError::NotFound(_) => Ok(false),
                e => Err(e),
            },
        }
    }

    async fn pull_image(
        &self,
        name: &str,
        tag: &str,
    ) -> Result<(), EngineError> {
        let opts = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut s = self.docker.create_image(Some(opts), None, None);
        while let Some(info) = s.next().await {
            info.map_err(|e| engine_error(&format!("{name}:{tag}"), e))?;
        }

        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };

        let volumes = spec
            .volumes
            .iter()
            .map(|v| (v.clone(), HashMap::new()))
            .collect::<HashMap<_, _>>();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            volumes: (!volumes.is_empty()).then_some(volumes),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let res = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| engine_error(&spec.image, e))?;

        Ok(res.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_error(id, e))
    }

    async fn follow_logs(
        &self,
        id: &str,
        sink: &LogBuffer,
    ) -> Result<(), EngineError> {
        let opts = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut s = self.docker.logs(id, Some(opts));
        while let Some(out) = s.next().await {
            let out = out.map_err(|e| engine_error(id, e))?;
            sink.append_bytes(&out.into_bytes());
        }

        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let opts = WaitContainerOptions { condition: "not-running" };

        let mut code = None;
        let mut s = self.docker.wait_container(id, Some(opts));
        while let Some(res) = s.next().await {
            match res {
                Ok(r) => code = Some(r.status_code),
                Err(bollard::errors::Error::DockerContainerWaitError {
                    code: c,
                    ..
                }) => {
                    /*
                     * A non-zero exit is reported as an error, but it is the
                     * status we were waiting for.
                     */
                    code = Some(c);
                }
                Err(e) => return Err(engine_error(id, e)),
            }
        }

        code.ok_or_else(|| EngineError::Engine(format!("{id}: no exit status")))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            /*
             * 304 means the container was already stopped.
             */
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            }) => Ok(()),
            res => res.map_err(|e| engine_error(id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let opts = RemoveContainerOptions { force: true, ..Default::default() };

        self.docker
            .remove_container(id, Some(opts))
            .await
            .map_err(|e| engine_error(id, e))
    }
}
