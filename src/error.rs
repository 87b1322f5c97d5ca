use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvergeError>;

#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Root is not a directory: {}", .0.display())]
    InvalidRoot(PathBuf),

    #[error("Filesystem is not mounted")]
    NotMounted,

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ConvergeError {
    fn from(err: serde_json::Error) -> Self {
        ConvergeError::Json(err.to_string())
    }
}

impl From<std::io::Error> for ConvergeError {
    fn from(err: std::io::Error) -> Self {
        ConvergeError::Io(err)
    }
}
