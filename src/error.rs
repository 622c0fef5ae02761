use axum::{http::StatusCode, response::IntoResponse};
use std::{fmt::Display, time::Duration};

use crate::protocol::OutputEvent;

pub type AppResult<T> = Result<T, AppErr>;

/* ------------ HTTP 邊界 ------------ */
#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("Config: {0}")]
    Config(String),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let (code, body) = match self {
            AppErr::Bad(msg) => (StatusCode::BAD_REQUEST, msg),
            other            => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        (code, body).into_response()
    }
}

pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }

/* ------------ 房間 / 檔案樹 ------------ */
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("parent folder {0} does not exist")]
    NotFound(String),

    #[error("a node with id {0} already exists in this room")]
    DuplicateId(String),

    #[error("{0} is a file, not a folder")]
    NotAFolder(String),

    #[error("{0}")]
    Protocol(String),
}

/* ------------ 程式執行 ------------ */
/// Failures of one execution job. None of these cross the orchestrator
/// boundary as `Err`; each becomes a single terminal event for the room.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("{language} was not found. {hint}")]
    ToolchainNotFound { language: &'static str, hint: &'static str },

    #[error("Could not prepare the working directory: {0}")]
    Environment(String),

    #[error("Compilation error:\n{0}")]
    Compile(String),

    #[error("Error installing dependencies: {0}. Will attempt to run without them.")]
    DependencyInstall(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Execution timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),

    #[error("Unsupported file type: {0}. Currently supporting JavaScript, Python, C, and C++.")]
    Unsupported(String),

    #[error("A program is already running in this room")]
    JobAlreadyRunning,
}

impl ExecError {
    pub fn to_event(&self) -> OutputEvent {
        match self {
            ExecError::DependencyInstall(_) => OutputEvent::warning(self.to_string()),
            _                               => OutputEvent::error(self.to_string()),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self { ExecError::Environment(e.to_string()) }
}
