use rcx_core::types::{TransferProgress, TransferStatus};
use rcx_core::ErrorKind;

use crate::writer::SinkOutput;

/// Broadcast to every subscriber of an orchestrator.
///
/// A user cancel shows up as `StatusChanged { status: Cancelled }`, never as
/// `Failed`.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StatusChanged {
        id: String,
        status: TransferStatus,
    },
    Progress {
        id: String,
        progress: TransferProgress,
    },
    Completed {
        id: String,
        bytes: u64,
        /// `None` for uploads.
        output: Option<SinkOutput>,
    },
    Failed {
        id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl TransferEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::StatusChanged { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }
}
