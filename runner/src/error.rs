/*
 * Copyright 2024 Oxide Computer Company
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    /**
     * A work directory, container, pod, or watcher could not be created.
     */
    #[error("resource error: {0}")]
    Resource(String),
    /**
     * The job ran but did not succeed, or could not be started in time.  The
     * captured output is attached for diagnosis.
     */
    #[error("execution failed: {message}")]
    Execution { message: String, log: String },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RResult<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, RunnerError::IllegalState(_))
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, RunnerError::Execution { .. })
    }

    /**
     * The output captured from the job, if this error carries any.
     */
    pub fn log(&self) -> Option<&str> {
        match self {
            RunnerError::Execution { log, .. } => Some(log.as_str()),
            _ => None,
        }
    }
}

macro_rules! illegal_state {
    ($($arg:tt)*) => {
        return Err($crate::RunnerError::IllegalState(format!($($arg)*)))
    };
}

macro_rules! resource_error {
    ($($arg:tt)*) => {
        return Err($crate::RunnerError::Resource(format!($($arg)*)))
    };
}

pub(crate) use illegal_state;
pub(crate) use resource_error;
