/*
 * Copyright 2024 Oxide Computer Company
 */

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use getopts::Options;
use runomat_common::{make_log, read_toml};
use runomat_runner::cluster::{ClusterJobRunner, KubeClient};
use runomat_runner::job::{
    collect_outputs, run_container_job, ContainerJob, JobReport, OutputSpec,
};
use runomat_runner::local::{DockerEngine, LocalContainerRunner};
use runomat_runner::workflow::WorkflowEngineRunner;
use runomat_runner::{RResult, Runner, RunnerError};
use runomat_types::config::ConfigFile;
use slog::{error, info, warn, Logger};

const WORKFLOW_CONFIG: &str = "nextflow.config";

type Inputs = Vec<(String, Box<dyn Read + Send>)>;

fn open_inputs(specs: &[String]) -> Result<Inputs> {
    let mut out: Inputs = Vec::new();
    for s in specs {
        let Some((name, file)) = s.split_once('=') else {
            bail!("input {s:?} should be NAME=FILE");
        };
        let f = std::fs::File::open(file)
            .with_context(|| format!("opening input {file:?}"))?;
        out.push((name.to_string(), Box::new(f)));
    }
    Ok(out)
}

/**
 * A workflow job is the engine run directly with the command-line arguments,
 * rather than a shell script.
 */
async fn run_workflow(
    log: &Logger,
    runner: &dyn Runner,
    args: &[String],
    inputs: Inputs,
    outputs: &[OutputSpec],
) -> RResult<JobReport> {
    runner.init().await?;
    for (name, content) in inputs {
        runner.write_input(&name, content, false)?;
    }

    let mut orig = String::new();
    if let Some(mut f) = runner.read_output(WORKFLOW_CONFIG)? {
        f.read_to_string(&mut orig)?;
    }
    let extra = runner.extra_workflow_config(&orig);
    if extra != orig {
        runner.write_input_str(WORKFLOW_CONFIG, &extra, false)?;
    }

    let start = Instant::now();
    let code = runner.execute(args).await?;
    if code != 0 {
        return Err(RunnerError::Execution {
            message: format!("workflow exited with status {code}"),
            log: runner.log(),
        });
    }

    collect_outputs(log, runner, outputs, start.elapsed())
}

fn report(log: &Logger, rep: &JobReport, dest: Option<&Path>) -> Result<()> {
    print!("{}", rep.log);

    for (k, v) in rep.metrics.iter() {
        println!("metric: {k}={v}");
    }
    for (name, files) in rep.outputs.iter() {
        for f in files {
            println!("output: {name}: {} ({})", f.file, f.media_type);
            if let Some(dest) = dest {
                let target = dest.join(&f.file);
                std::fs::copy(&f.path, &target).with_context(|| {
                    format!("copying {:?} to {target:?}", f.path)
                })?;
                info!(log, "copied output";
                    "to" => target.display().to_string());
            }
        }
    }
    for name in rep.absent.iter() {
        println!("output: {name}: absent");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Options::new();

    opts.optopt("f", "", "configuration file", "CONFIG");
    opts.optopt("b", "", "backend: local, cluster, or workflow", "BACKEND");
    opts.optopt("i", "", "container image", "IMAGE");
    opts.optmulti("I", "", "job input", "NAME=FILE");
    opts.optmulti("O", "", "declared job output", "NAME[:MEDIA]");
    opts.optopt("d", "", "copy outputs into this directory", "DIR");
    opts.optopt("j", "", "job ID (work directory name)", "JOBID");

    let p = match opts.parse(std::env::args().skip(1)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ERROR: usage: {}", e);
            eprintln!("       {}", opts.usage("usage"));
            std::process::exit(1);
        }
    };

    if p.free.is_empty() {
        bail!("must specify a command to run");
    }

    let log = make_log("runomat");

    let mut config: ConfigFile = if let Some(f) = p.opt_str("f").as_deref() {
        read_toml(f)?
    } else {
        ConfigFile::default()
    };
    config.apply_env()?;

    let dest = p.opt_str("d").map(PathBuf::from);
    if let Some(dest) = dest.as_deref() {
        if !dest.is_dir() {
            bail!("{:?} must be a directory", dest);
        }
    }

    let inputs = open_inputs(&p.opt_strs("I"))?;
    let outputs: Vec<OutputSpec> =
        p.opt_strs("O").iter().map(|s| OutputSpec::parse(s)).collect();
    let job_id = p.opt_str("j");
    let image = p.opt_str("i");
    let backend = p.opt_str("b").unwrap_or_else(|| "local".to_string());

    let runner: Arc<dyn Runner> = match (backend.as_str(), image.as_deref()) {
        ("local", Some(image)) => Arc::new(LocalContainerRunner::new(
            &log,
            Arc::new(DockerEngine::connect()?),
            &config,
            image,
            job_id.as_deref(),
        )),
        ("cluster", Some(image)) => Arc::new(ClusterJobRunner::new(
            &log,
            Arc::new(KubeClient::new(&config.cluster)?),
            &config,
            image,
            job_id.as_deref(),
        )),
        ("local" | "cluster", None) => {
            bail!("backend {backend:?} needs an image (-i)");
        }
        ("workflow", _) => Arc::new(WorkflowEngineRunner::new(
            &log,
            &config,
            job_id.as_deref(),
        )),
        (other, _) => bail!("unknown backend {other:?}"),
    };

    /*
     * An interrupt stops the job, which lets us fall through to the usual
     * cleanup path.
     */
    let r0 = Arc::clone(&runner);
    let log0 = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(log0, "interrupted; stopping job");
            if let Err(e) = r0.stop().await {
                error!(log0, "stopping job: {e}");
            }
        }
    });

    info!(log, "starting job";
        "backend" => &backend,
        "work_dir" => runner.work_dir().path().display().to_string());

    let res = if backend == "workflow" {
        run_workflow(&log, runner.as_ref(), &p.free, inputs, &outputs).await
    } else {
        let job = ContainerJob { command: p.free.join(" "), inputs, outputs };
        run_container_job(&log, runner.as_ref(), job).await
    };

    let res = match res {
        Ok(rep) => report(&log, &rep, dest.as_deref()),
        Err(e) => {
            if let Some(out) = e.log() {
                eprint!("{out}");
            }
            Err(e.into())
        }
    };

    runner.cleanup().await;
    res
}
