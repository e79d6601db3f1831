use std::{
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

/// A single put or get against the object store failed.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Everything that can abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fragment size must be greater than zero")]
    InvalidFragmentSize,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to read source {path:?}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer of fragment {index} failed")]
    Transfer {
        index: usize,
        #[source]
        source: TransferError,
    },
    #[error("manifest is incomplete: expected {expected} fragments but found {found}")]
    ManifestIncomplete { expected: usize, found: usize },
    #[error("integrity check failed: expected digest {expected} but found {found}")]
    IntegrityMismatch { expected: String, found: String },
    #[error("failed to write output {path:?}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("failed to access manifest {path:?}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// The fragment the error is about, if there is one.
    pub fn fragment_index(&self) -> Option<usize> {
        match self {
            PipelineError::Transfer { index, .. } => Some(*index),
            _ => None,
        }
    }
}
