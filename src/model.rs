use core::fmt;
use std::process::{ExitCode, Termination};

use log::error;

/// Top-level error classification: configuration problems are caught before
/// any file is touched, everything else surfaces from the conversion itself.
#[derive(Debug)]
pub enum AppError {
    Config(String),
    Conversion(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "{}", msg),
            AppError::Conversion(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<Box<dyn std::error::Error>> for AppError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        AppError::Conversion(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Lets `main` return a `Result` while still logging the failure through the
/// configured logger and mapping it to a non-zero exit code.
pub struct TermResult(pub AppResult<()>);

impl Termination for TermResult {
    fn report(self) -> ExitCode {
        match self.0 {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::FAILURE
            }
        }
    }
}
