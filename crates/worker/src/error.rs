use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Failed to initialize the worker")]
    Initializing,
    #[error("Could not connect to the manager")]
    Connect,
    #[error("The manager sent an unexpected message")]
    UnexpectedMessage,
    #[error("Lost the connection to the manager")]
    ConnectionLost,
    #[error("Artifact cache operation failed")]
    Cache,
    #[error("Failed to prepare the task sandbox")]
    Sandbox,
    #[error("Failed to start the task command")]
    Launch,
    #[error("Failed to collect task outputs")]
    CollectOutput,
}

impl WorkerError {
    /// Whether retrying the operation that failed could reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, WorkerError::Connect | WorkerError::ConnectionLost)
    }
}
