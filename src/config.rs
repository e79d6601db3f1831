use std::{
    path::PathBuf,
    time::Duration,
};

use crate::{
    DEFAULT_FRAGMENT_SIZE,
    error::PipelineError,
};

/// Settings for one pipeline.  Handed to [`crate::pipeline::Pipeline::new`] by value.
#[derive(Debug, Clone)]
pub struct Config {
    pub fragment_size: usize,
    /// upper bound on any single put or get
    pub timeout: Duration,
    /// tries per fragment, including the first one
    pub attempts: u32,
    /// wait before the first retry; doubles after each further failure
    pub retry_backoff: Duration,
    /// where fragments get spooled; the system temp dir if unset
    pub workdir: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            timeout: Duration::from_secs(30 * 60),
            attempts: 1,
            retry_backoff: Duration::from_secs(1),
            workdir: None,
            manifest_path: None,
            progress: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.fragment_size == 0 {
            return Err(PipelineError::InvalidFragmentSize);
        }
        if self.timeout.is_zero() {
            return Err(PipelineError::InvalidConfig("timeout must be greater than zero"));
        }
        if self.attempts == 0 {
            return Err(PipelineError::InvalidConfig("at least one attempt is required"));
        }
        Ok(())
    }
}
