/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;

use async_trait::async_trait;

mod error;
mod exec;
mod props;

pub mod cluster;
pub mod collector;
pub mod job;
pub mod local;
pub mod logbuf;
pub mod state;
pub mod workdir;
pub mod workflow;

pub use error::{RResult, RunnerError};
pub use props::parse as parse_properties;
pub use state::RunnerState;
pub use workdir::WorkDir;

/**
 * The lifecycle shared by every execution backend.  A runner is used for
 * exactly one job: init() once, write inputs, execute() once, read outputs
 * and the log, then cleanup(), which must happen whatever else went wrong.
 */
#[async_trait]
pub trait Runner: Send + Sync {
    fn work_dir(&self) -> &WorkDir;

    fn state(&self) -> RunnerState;

    /**
     * The path at which the work directory appears to the job itself.
     */
    fn local_work_dir(&self) -> &str;

    async fn init(&self) -> RResult<()>;

    /**
     * Run the job to completion, returning its exit status.
     */
    async fn execute(&self, args: &[String]) -> RResult<i32>;

    /**
     * Request that an in-progress execute() end early, and wait for it to
     * return.  Does nothing if the job is not running.
     */
    async fn stop(&self) -> RResult<()>;

    fn log(&self) -> String;

    async fn cleanup(&self);

    /**
     * Append any configuration the workflow engine needs to run on this
     * backend.
     */
    fn extra_workflow_config(&self, original: &str) -> String {
        original.to_string()
    }

    fn write_input(
        &self,
        name: &str,
        content: Box<dyn Read + Send>,
        executable: bool,
    ) -> RResult<u64> {
        self.work_dir().write_input(name, content, executable)
    }

    fn write_input_str(
        &self,
        name: &str,
        content: &str,
        executable: bool,
    ) -> RResult<u64> {
        self.work_dir().write_input_str(name, content, executable)
    }

    fn read_output(&self, name: &str) -> RResult<Option<File>> {
        self.work_dir().read_output(name)
    }

    fn file_as_properties(
        &self,
        name: &str,
    ) -> RResult<Option<BTreeMap<String, String>>> {
        self.work_dir().file_as_properties(name)
    }
}
