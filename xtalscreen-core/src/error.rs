use thiserror::Error;

#[derive(Error, Debug)]
pub enum XtalscreenError {
    #[error("Could not launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("{tool} failed with exit code {exitcode}")]
    ToolFailed { tool: String, exitcode: i32 },

    #[error("Import error: {0}")]
    Import(String),

    #[error("Giving up: {0}")]
    GaveUp(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, XtalscreenError>;
