use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("layout load failed for {path}: {reason}")]
    LayoutLoad { path: PathBuf, reason: String },

    #[error("spacecraft config error: {0}")]
    SpacecraftConfig(String),

    #[error("queue persist error: {0}")]
    QueuePersist(String),

    #[error("frame protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
