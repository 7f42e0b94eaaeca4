//! Encoder command construction and process supervision.

pub mod command;
pub mod executor;

pub use command::{
    encoder_for, output_path_for, staging_path_for, BuildError, CommandBuilder, EncodeCommand,
};
pub use executor::{EncodeRunner, ExitOutcome, ProcessExecutor, ProgressFn, ProgressParser};
