/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use slog::{info, o, Logger};

use crate::error::{illegal_state, RResult};
use crate::state::RunnerState;
use crate::{Runner, RunnerError};

/**
 * One stream of bytes produced by a unit of work, with the name and media
 * type it should carry once written to a file.
 */
pub struct DataSource {
    pub name: String,
    pub content_type: String,
    pub reader: Box<dyn Read + Send>,
}

impl DataSource {
    pub fn new<R: Read + Send + 'static>(
        name: &str,
        content_type: &str,
        reader: R,
    ) -> DataSource {
        DataSource {
            name: name.to_string(),
            content_type: content_type.to_string(),
            reader: Box::new(reader),
        }
    }
}

pub enum OutputValue {
    /**
     * A value with no file representation; not collected.
     */
    Plain(serde_json::Value),
    Stream(Vec<DataSource>),
}

/**
 * The computation that a JobResultCollector drives.  It is handed the raw
 * input and option values, and the initialised runner whose work directory
 * it may use.
 */
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn execute(
        &self,
        inputs: &BTreeMap<String, serde_json::Value>,
        options: &BTreeMap<String, serde_json::Value>,
        runner: &dyn Runner,
    ) -> anyhow::Result<BTreeMap<String, OutputValue>>;
}

/**
 * A result file, named relative to the job's work directory.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHandle {
    pub output: String,
    pub name: String,
    pub content_type: String,
    pub path: PathBuf,
    pub size: u64,
}

impl ResultHandle {
    pub fn host_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.path)
    }
}

/**
 * Drives a unit of work against a runner and turns whatever streams it
 * produces into files in the job's work directory.
 */
pub struct JobResultCollector {
    log: Logger,
    runner: Arc<dyn Runner>,
    work: Arc<dyn UnitOfWork>,
    started: AtomicBool,
    ready: AtomicBool,
    results: Mutex<Vec<ResultHandle>>,
}

impl JobResultCollector {
    pub fn new(
        log: &Logger,
        runner: Arc<dyn Runner>,
        work: Arc<dyn UnitOfWork>,
    ) -> JobResultCollector {
        JobResultCollector {
            log: log.new(o!("job" => runner.work_dir().id().to_string())),
            runner,
            work,
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub async fn execute(
        &self,
        inputs: &BTreeMap<String, serde_json::Value>,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> RResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            illegal_state!("collector already executed");
        }

        if self.runner.state() == RunnerState::Created {
            self.runner.init().await?;
        }
        info!(self.log, "executing unit of work"; "inputs" => inputs.len());

        let outputs = self
            .work
            .execute(inputs, options, self.runner.as_ref())
            .await
            .map_err(RunnerError::Other)?;

        let mut results = Vec::new();
        for (output, value) in outputs {
            let OutputValue::Stream(sources) = value else {
                continue;
            };

            for ds in sources {
                let file = format!("{}_{}", output, ds.name);
                let size = self.runner.write_input(&file, ds.reader, false)?;
                info!(self.log, "wrote result";
                    "output" => &output, "file" => &file, "size" => size);

                results.push(ResultHandle {
                    output: output.clone(),
                    name: ds.name,
                    content_type: ds.content_type,
                    path: PathBuf::from(file),
                    size,
                });
            }
        }

        *self.results.lock().unwrap() = results;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_results_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn results(&self) -> RResult<Vec<ResultHandle>> {
        if !self.is_results_ready() {
            illegal_state!("results not ready");
        }
        Ok(self.results.lock().unwrap().clone())
    }

    pub fn host_work_dir(&self) -> &Path {
        self.runner.work_dir().path()
    }

    pub async fn cleanup(&self) {
        self.runner.cleanup().await;
    }
}
