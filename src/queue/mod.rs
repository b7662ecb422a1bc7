pub mod coordinator;
pub mod delivery;
pub mod inbox;
pub mod item;
pub mod retry;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorStats, QueueEntry, ShutdownReport, WorkRunner,
};
pub use delivery::{
    outbox_filename, write_outbox_message, Delivery, DeliveryOutcome, OutboxDelivery, OutboxKind,
    OutboxMessage,
};
pub use inbox::{claim_next, complete, recover_processing, submit, Claim};
pub use item::{WorkItem, WorkKind};
pub use retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid queue payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn parse_err(path: &std::path::Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}
