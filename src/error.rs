use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PathfuseError>;

#[derive(Error, Debug)]
pub enum PathfuseError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Mount point is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
