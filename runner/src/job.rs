/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use runomat_common::{guess_mime_type, DurationExt};
use slog::{info, warn, Logger};

use crate::error::RResult;
use crate::state::RunnerState;
use crate::{Runner, RunnerError};

pub const EXECUTE_SCRIPT: &str = "execute";
pub const METRICS_FILE: &str = "output_metrics.txt";
pub const EXECUTION_TIME_METRIC: &str = "ExecutionTime";

/**
 * A declared job output.  If no media type is given, one is guessed from the
 * name of each file that is found.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub media_type: Option<String>,
}

impl OutputSpec {
    /**
     * Parse "NAME" or "NAME:MEDIA/TYPE".
     */
    pub fn parse(s: &str) -> OutputSpec {
        match s.split_once(':') {
            Some((n, m)) if !m.is_empty() => OutputSpec {
                name: n.to_string(),
                media_type: Some(m.to_string()),
            },
            Some((n, _)) => {
                OutputSpec { name: n.to_string(), media_type: None }
            }
            None => OutputSpec { name: s.to_string(), media_type: None },
        }
    }

    /**
     * An output "result" is produced by the file "result" itself, or by any
     * file named "result.<something>".
     */
    fn matches(&self, file: &str) -> bool {
        file == self.name
            || file
                .strip_prefix(self.name.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

pub struct ContainerJob {
    /**
     * Shell text to run inside the job; becomes the body of the "execute"
     * script.
     */
    pub command: String,
    pub inputs: Vec<(String, Box<dyn Read + Send>)>,
    pub outputs: Vec<OutputSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub file: String,
    pub media_type: String,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct JobReport {
    pub duration: Duration,
    pub outputs: BTreeMap<String, Vec<OutputFile>>,
    /**
     * Declared outputs for which the job produced no file.
     */
    pub absent: Vec<String>,
    pub metrics: BTreeMap<String, String>,
    pub log: String,
}

/**
 * Run a shell command as a job on the given runner: write the "execute"
 * script and the inputs, run it, and gather the declared outputs and any
 * metrics the job reported.  The caller remains responsible for calling
 * cleanup() on the runner.
 */
pub async fn run_container_job(
    log: &Logger,
    runner: &dyn Runner,
    job: ContainerJob,
) -> RResult<JobReport> {
    if runner.state() == RunnerState::Created {
        runner.init().await?;
    }

    runner.write_input_str(
        EXECUTE_SCRIPT,
        &format!("#!/bin/sh\n{}\n", job.command),
        true,
    )?;
    for (name, content) in job.inputs {
        let sz = runner.write_input(&name, content, false)?;
        info!(log, "wrote input"; "name" => &name, "size" => sz);
    }

    let script = format!("{}/{}", runner.local_work_dir(), EXECUTE_SCRIPT);
    let start = Instant::now();
    let code = runner.execute(&[script]).await?;
    let duration = start.elapsed();
    info!(log, "job complete";
        "code" => code, "duration" => duration.render());

    if code != 0 {
        return Err(RunnerError::Execution {
            message: format!("job exited with status {code}"),
            log: runner.log(),
        });
    }

    collect_outputs(log, runner, &job.outputs, duration)
}

/**
 * Gather the files a finished job left in its work directory for each
 * declared output, along with any metrics it reported.
 */
pub fn collect_outputs(
    log: &Logger,
    runner: &dyn Runner,
    declared: &[OutputSpec],
    duration: Duration,
) -> RResult<JobReport> {
    let mut files = std::fs::read_dir(runner.work_dir().path())?
        .filter_map(|ent| ent.ok())
        .filter(|ent| ent.file_type().is_ok_and(|ft| ft.is_file()))
        .filter_map(|ent| ent.file_name().into_string().ok())
        .collect::<Vec<_>>();
    files.sort();

    let mut outputs = BTreeMap::new();
    let mut absent = Vec::new();
    for spec in declared.iter() {
        let found = files
            .iter()
            .filter(|f| spec.matches(f))
            .map(|f| OutputFile {
                file: f.to_string(),
                media_type: spec
                    .media_type
                    .clone()
                    .unwrap_or_else(|| guess_mime_type(f)),
                path: runner.work_dir().path().join(f),
            })
            .collect::<Vec<_>>();

        if found.is_empty() {
            warn!(log, "declared output not produced"; "output" => &spec.name);
            absent.push(spec.name.to_string());
        } else {
            outputs.insert(spec.name.to_string(), found);
        }
    }

    let mut metrics =
        runner.file_as_properties(METRICS_FILE)?.unwrap_or_default();
    metrics.insert(
        EXECUTION_TIME_METRIC.to_string(),
        duration.as_secs_f32_rounded(),
    );

    Ok(JobReport { duration, outputs, absent, metrics, log: runner.log() })
}
