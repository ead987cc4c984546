//! Shared vocabulary for the process pool: commands, submissions,
//! configuration, and the public error enums.

pub mod command;
pub mod config;
pub mod error;
pub mod submission;

pub use command::{Command, LinePredicate, OutputCapture, StreamSource};
pub use config::PoolConfig;
pub use error::{
    BatchError, ConfigError, ExecutionFailure, FailedCommand, PoolError, SubmitError, WaitError,
};
pub use submission::{Submission, Work};
