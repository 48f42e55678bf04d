/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use runomat_common::DurationExt;
use runomat_types::config::ConfigFile;
use slog::{info, o, warn, Logger};
use tokio::process::Command;

use crate::error::RResult;
use crate::exec::{self, Activity, Killer};
use crate::logbuf::LogBuffer;
use crate::state::{Lifecycle, RunnerState, StopRequest};
use crate::workdir::WorkDir;
use crate::{Runner, RunnerError};

/**
 * Runs a job by invoking the workflow engine on the host, in the work
 * directory, and waiting for it to exit.
 */
pub struct WorkflowEngineRunner {
    log: Logger,
    executable: PathBuf,
    workflow_file: String,
    options: Vec<String>,
    workdir: WorkDir,
    local_work_dir: String,
    life: Lifecycle,
    kill: Mutex<Option<Killer>>,
    output: LogBuffer,
}

impl WorkflowEngineRunner {
    pub fn new(
        log: &Logger,
        config: &ConfigFile,
        job_id: Option<&str>,
    ) -> WorkflowEngineRunner {
        let workdir = WorkDir::new(log, &config.general.work_dir, job_id);
        let log = log.new(o!(
            "backend" => "workflow",
            "job" => workdir.id().to_string(),
        ));
        let local_work_dir = workdir.path().display().to_string();

        WorkflowEngineRunner {
            log,
            executable: config.workflow.executable.clone(),
            workflow_file: config.workflow.workflow_file.clone(),
            options: config.workflow.options.clone(),
            workdir,
            local_work_dir,
            life: Lifecycle::new(),
            kill: Mutex::new(None),
            output: LogBuffer::unbounded(),
        }
    }

    /**
     * The complete argument list for the workflow engine.  Named parameters
     * follow the positional arguments, each as "--name value".
     */
    pub fn command_args(
        &self,
        args: &[String],
        params: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut out = vec!["run".to_string(), self.workflow_file.clone()];
        out.extend(self.options.iter().cloned());
        out.extend(args.iter().cloned());
        for (k, v) in params {
            out.push(format!("--{k}"));
            out.push(v.to_string());
        }
        out
    }

    fn stopped_error(&self) -> RunnerError {
        RunnerError::Execution {
            message: "workflow was stopped".to_string(),
            log: self.output.snapshot(),
        }
    }

    pub async fn run_workflow(
        &self,
        args: &[String],
        params: &BTreeMap<String, String>,
    ) -> RResult<i32> {
        let _g = self.life.begin_execute()?;

        let argv = self.command_args(args, params);
        info!(self.log, "running workflow engine";
            "exe" => self.executable.display().to_string(),
            "args" => ?argv);

        let mut cmd = Command::new(&self.executable);
        cmd.args(&argv);
        cmd.current_dir(self.workdir.path());

        let exec::Running { mut activity, kill } =
            exec::run(cmd).map_err(|e| {
                RunnerError::Resource(format!(
                    "starting {:?}: {e}",
                    self.executable
                ))
            })?;
        *self.kill.lock().unwrap() = Some(kill);

        if self.life.stop_requested() {
            if let Some(mut k) = self.kill.lock().unwrap().take() {
                k.kill();
            }
        }

        let mut exit = None;
        while let Some(a) = activity.recv().await {
            match a {
                Activity::Output(o) => self.output.append_line(&o.msg),
                Activity::Exit(e) => exit = Some(e),
                Activity::Complete => break,
            }
        }
        self.kill.lock().unwrap().take();

        if self.life.stop_requested() {
            return Err(self.stopped_error());
        }

        let Some(exit) = exit else {
            return Err(RunnerError::Execution {
                message: "workflow engine exited without status".to_string(),
                log: self.output.snapshot(),
            });
        };

        info!(self.log, "workflow engine exited";
            "code" => exit.code,
            "duration" => std::time::Duration::from_millis(exit.duration_ms)
                .render());
        Ok(exit.code)
    }
}

#[async_trait]
impl Runner for WorkflowEngineRunner {
    fn work_dir(&self) -> &WorkDir {
        &self.workdir
    }

    fn state(&self) -> RunnerState {
        self.life.state()
    }

    fn local_work_dir(&self) -> &str {
        &self.local_work_dir
    }

    async fn init(&self) -> RResult<()> {
        self.life.check_created()?;
        self.workdir.create()?;
        self.life.initialised()
    }

    async fn execute(&self, args: &[String]) -> RResult<i32> {
        self.run_workflow(args, &BTreeMap::new()).await
    }

    async fn stop(&self) -> RResult<()> {
        match self.life.request_stop()? {
            StopRequest::Idle => return Ok(()),
            StopRequest::Pending => {
                info!(self.log, "stop already in progress");
            }
            StopRequest::Begin => {
                if let Some(mut k) = self.kill.lock().unwrap().take() {
                    info!(self.log, "killing workflow engine");
                    k.kill();
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
        if let Some(mut k) = self.kill.lock().unwrap().take() {
            warn!(self.log, "workflow engine still running at cleanup");
            k.kill();
        }

        self.workdir.remove();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;

    /**
     * Install a stand-in for the workflow engine.
     */
    fn engine(dir: &Path, body: &str) -> Result<PathBuf> {
        let p = dir.join("nextflow");
        std::fs::write(&p, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755))?;
        Ok(p)
    }

    fn runner(base: &Path, exe: PathBuf) -> WorkflowEngineRunner {
        let mut c = ConfigFile::default();
        c.general.work_dir = base.to_path_buf();
        c.workflow.executable = exe;
        WorkflowEngineRunner::new(&runomat_common::discard_log(), &c, None)
    }

    #[tokio::test]
    async fn arguments_and_params() -> Result<()> {
        let base = tempfile::tempdir()?;
        let bin = tempfile::tempdir()?;
        let r = runner(
            base.path(),
            engine(bin.path(), "echo \"$@\"; pwd; cat nextflow.nf")?,
        );

        r.init().await?;
        r.write_input_str("nextflow.nf", "workflow {}\n", false)?;

        let mut params = BTreeMap::new();
        params.insert("greeting".to_string(), "hello".to_string());
        params.insert("count".to_string(), "3".to_string());

        let code = r.run_workflow(&["input.sdf".to_string()], &params).await?;
        assert_eq!(code, 0);

        let log = r.log();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(
            lines[0],
            "run nextflow.nf -with-trace input.sdf --count 3 --greeting hello"
        );
        assert_eq!(
            Path::new(lines[1]).canonicalize()?,
            r.work_dir().path().canonicalize()?
        );
        assert_eq!(lines[2], "workflow {}");
        assert_eq!(r.local_work_dir(), r.work_dir().path().to_str().unwrap());

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test]
    async fn failing_workflow() -> Result<()> {
        let base = tempfile::tempdir()?;
        let bin = tempfile::tempdir()?;
        let r = runner(base.path(), engine(bin.path(), "echo oops >&2; exit 4")?);

        r.init().await?;
        assert_eq!(r.execute(&[]).await?, 4);
        assert!(r.log().contains("oops"));
        assert!(r.execute(&[]).await.unwrap_err().is_illegal_state());
        assert_eq!(r.extra_workflow_config("a = 1"), "a = 1");

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_engine() -> Result<()> {
        let base = tempfile::tempdir()?;
        let r = runner(base.path(), PathBuf::from("/nonexistent/nextflow"));

        r.init().await?;
        let e = r.execute(&[]).await.unwrap_err();
        assert!(matches!(e, RunnerError::Resource(_)));
        assert_eq!(r.state(), RunnerState::Finished);

        r.cleanup().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_kills_engine() -> Result<()> {
        let base = tempfile::tempdir()?;
        let bin = tempfile::tempdir()?;
        let r = Arc::new(runner(
            base.path(),
            engine(bin.path(), "echo waiting; exec sleep 60")?,
        ));

        r.init().await?;
        let r0 = Arc::clone(&r);
        let exec = tokio::spawn(async move { r0.execute(&[]).await });
        while !r.log().contains("waiting") {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let start = std::time::Instant::now();
        r.stop().await?;
        assert!(start.elapsed() < std::time::Duration::from_secs(30));
        assert_eq!(r.state(), RunnerState::Stopped);
        assert!(exec.await?.unwrap_err().is_execution());

        r.cleanup().await;
        Ok(())
    }
}
