use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker {0} already exists")]
    AlreadyRunning(String),

    #[error("no worker {0}")]
    NotFound(String),

    #[error("failed to launch worker {exchange_id}: {reason}")]
    Launch { exchange_id: String, reason: String },

    #[error("worker {0} reached its restart limit")]
    RestartLimit(String),

    #[error("control channel to {0} is closed")]
    ChannelClosed(String),

    #[error(transparent)]
    Protocol(#[from] bookfeed_core::error::BookfeedError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
