/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/**
 * The configuration file for job runners.  Every section, and every property
 * within each section, has a default; an empty file is a valid configuration.
 * Values may then be overridden from the environment with apply_env().
 */
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub general: ConfigFileGeneral,
    #[serde(default)]
    pub docker: ConfigFileDocker,
    #[serde(default)]
    pub cluster: ConfigFileCluster,
    #[serde(default)]
    pub workflow: ConfigFileWorkflow,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFileGeneral {
    /**
     * Each job gets a directory beneath this one, named for the job ID.
     */
    pub work_dir: PathBuf,
}

impl Default for ConfigFileGeneral {
    fn default() -> Self {
        ConfigFileGeneral { work_dir: PathBuf::from("/tmp/runomat/work") }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFileDocker {
    pub network: String,
    pub pull_timeout_secs: u64,
    pub mount_path: String,
}

impl Default for ConfigFileDocker {
    fn default() -> Self {
        ConfigFileDocker {
            network: "none".to_string(),
            pull_timeout_secs: 120,
            mount_path: "/work".to_string(),
        }
    }
}

impl ConfigFileDocker {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFileCluster {
    pub api_url: String,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub namespace: String,
    pub service_account: String,
    pub pvc_name: String,
    pub pod_base_name: String,
    /**
     * The number of log chunks to retain from each pod.  Zero, or a negative
     * value, means keep everything.
     */
    pub log_history: i64,
    pub start_grace_minutes: u64,
    pub poll_interval_ms: u64,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub image_pull_policy: String,
    pub image_pull_secrets: Vec<String>,
    /**
     * A "key=value" label that nodes must carry to run job pods.  An empty
     * string removes the constraint.
     */
    pub node_selector: String,
    pub mount_path: String,
    pub workflow_profile: Option<String>,
    pub environment: BTreeMap<String, String>,
}

impl Default for ConfigFileCluster {
    fn default() -> Self {
        ConfigFileCluster {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_file: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_file: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            namespace: "runomat".to_string(),
            service_account: "runomat".to_string(),
            pvc_name: "runomat-work-dir-pvc".to_string(),
            pod_base_name: "runomat-job-pod".to_string(),
            log_history: 0,
            start_grace_minutes: 15,
            poll_interval_ms: 1000,
            cpu_request: "100m".to_string(),
            cpu_limit: "1".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            image_pull_secrets: Vec::new(),
            node_selector: "runomat.io/purpose=worker".to_string(),
            mount_path: "/work".to_string(),
            workflow_profile: Some("kubernetes".to_string()),
            environment: BTreeMap::new(),
        }
    }
}

impl ConfigFileCluster {
    pub fn log_history(&self) -> Option<usize> {
        if self.log_history <= 0 {
            None
        } else {
            Some(self.log_history as usize)
        }
    }

    /**
     * A pod must be given at least a minute to leave the waiting phase.
     */
    pub fn start_grace(&self) -> Duration {
        let minutes = self.start_grace_minutes.max(1);
        Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn node_selector(&self) -> Option<(String, String)> {
        let ns = self.node_selector.trim();
        if ns.is_empty() {
            return None;
        }

        match ns.split_once('=') {
            Some((k, v)) => Some((k.trim().to_string(), v.trim().to_string())),
            None => Some(("runomat.io/purpose".to_string(), ns.to_string())),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFileWorkflow {
    pub executable: PathBuf,
    pub workflow_file: String,
    pub options: Vec<String>,
}

impl Default for ConfigFileWorkflow {
    fn default() -> Self {
        ConfigFileWorkflow {
            executable: PathBuf::from("nextflow"),
            workflow_file: "nextflow.nf".to_string(),
            options: vec!["-with-trace".to_string()],
        }
    }
}

/**
 * Parse the YAML map of environment variables that may be provided for job
 * pods.  Values that are numbers or booleans are passed through as their
 * string rendering.
 */
pub fn parse_environment(yaml: &str) -> Result<BTreeMap<String, String>> {
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let map: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(yaml).context("parsing pod environment")?;

    let mut out = BTreeMap::new();
    for (k, v) in map {
        let v = match v {
            serde_yaml::Value::String(s) => s.trim().to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => bail!("environment value for {k:?} not scalar: {other:?}"),
        };
        out.insert(k.trim().to_string(), v);
    }

    Ok(out)
}

fn parse_num<T: std::str::FromStr>(n: &str, v: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    v.trim().parse::<T>().map_err(|e| anyhow::anyhow!("{n}={v:?}: {e}"))
}

impl ConfigFile {
    /**
     * Override configured values with any that appear in the process
     * environment.
     */
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|n| std::env::var(n).ok())
    }

    pub fn apply_env_with<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("RUNOMAT_WORK_DIR") {
            self.general.work_dir = PathBuf::from(v);
        }

        if let Some(v) = env("RUNOMAT_DOCKER_NETWORK") {
            self.docker.network = v;
        }
        if let Some(v) = env("RUNOMAT_PULL_TIMEOUT_S") {
            self.docker.pull_timeout_secs =
                parse_num("RUNOMAT_PULL_TIMEOUT_S", &v)?;
        }

        let c = &mut self.cluster;
        if let Some(v) = env("RUNOMAT_JOB_NAMESPACE") {
            c.namespace = v;
        }
        if let Some(v) = env("RUNOMAT_SERVICE_ACCOUNT") {
            c.service_account = v;
        }
        if let Some(v) = env("RUNOMAT_WORK_DIR_PVC_NAME") {
            c.pvc_name = v;
        }
        if let Some(v) = env("RUNOMAT_POD_BASE_NAME") {
            c.pod_base_name = v;
        }
        if let Some(v) = env("RUNOMAT_POD_LOG_HISTORY") {
            c.log_history = parse_num("RUNOMAT_POD_LOG_HISTORY", &v)?;
        }
        if let Some(v) = env("RUNOMAT_POD_START_GRACE_PERIOD_M") {
            c.start_grace_minutes =
                parse_num("RUNOMAT_POD_START_GRACE_PERIOD_M", &v)?;
        }
        if let Some(v) = env("RUNOMAT_POD_CPU_REQUEST") {
            c.cpu_request = v;
        }
        if let Some(v) = env("RUNOMAT_POD_CPU_LIMIT") {
            c.cpu_limit = v;
        }
        if let Some(v) = env("RUNOMAT_POD_IMAGE_PULL_POLICY") {
            c.image_pull_policy = v;
        }
        if let Some(v) = env("RUNOMAT_POD_IMAGE_PULL_SECRET") {
            c.image_pull_secrets = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env("RUNOMAT_POD_NODE_SELECTOR") {
            c.node_selector = v;
        }
        if let Some(v) = env("RUNOMAT_POD_ENVIRONMENT") {
            /*
             * Variables from the environment are merged over any that appear
             * in the configuration file.
             */
            c.environment.extend(parse_environment(&v)?);
        }

        if let Some(v) = env("RUNOMAT_NEXTFLOW") {
            self.workflow.executable = PathBuf::from(v);
        }
        if let Some(v) = env("RUNOMAT_NEXTFLOW_OPTIONS") {
            self.workflow.options =
                v.split_whitespace().map(str::to_string).collect();
        }

        Ok(())
    }
}
