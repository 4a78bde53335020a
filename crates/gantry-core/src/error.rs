//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Simulation errors
    #[error("No runner compatible with tags {tags:?} (images: {requires_image})")]
    NoCompatibleRunner {
        tags: Vec<String>,
        requires_image: bool,
    },

    // Pipeline construction errors
    #[error("Cycle detected in job dependencies involving: {0}")]
    DependencyCycle(String),

    #[error("Job {job} depends on unknown job: {need}")]
    UnknownDependency { job: String, need: String },

    #[error("Job {job} declares unknown stage: {stage}")]
    UnknownStage { job: String, stage: String },

    #[error("Job listed but not resolvable: {0}")]
    JobNotFound(String),

    #[error("Empty pipeline")]
    EmptyPipeline,

    // Profile errors
    #[error("Invalid resource profile: {0}")]
    InvalidProfile(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
