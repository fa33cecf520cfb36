use thiserror::Error;

/// A declaration or submission was rejected. These are always returned synchronously and the
/// offending artifact or task never enters the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("Artifact source is not valid")]
    InvalidSource,
    #[error("Unknown artifact handle")]
    UnknownArtifact,
    #[error("Remote name must be a relative path inside the task sandbox")]
    InvalidRemoteName,
    #[error("Remote name is bound more than once")]
    DuplicateRemoteName,
    #[error("Task command is empty")]
    EmptyCommand,
    #[error("Artifact can not receive task output")]
    InvalidOutput,
    #[error("Unknown task")]
    UnknownTask,
}

/// An artifact could not be loaded for transfer or stored back after a task ran.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Failed to load artifact")]
    Load,
    #[error("Failed to store task output")]
    Store,
    #[error("Worker could not cache artifact")]
    Worker,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Failed to bind listening socket")]
    Bind,
}
