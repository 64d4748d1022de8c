use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of a transfer record, outgoing or incoming.
///
/// Outgoing transfers walk `Initiated → Ongoing → Staged → Completed`;
/// incoming transfers walk `Initiated → Staged → Ingesting → Completed`.
/// Either side may drop to `Failed` at any point. `Failed` outgoing
/// transfers can be re-initiated by an operator; `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Initiated,
    Ongoing,
    Staged,
    Ingesting,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Whether the transfer has reached a state it can never leave
    /// (other than the operator re-initiating a failure).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Valid next states for a source-side (outgoing) transfer.
    pub fn outgoing_successors(self) -> &'static [TransferStatus] {
        match self {
            TransferStatus::Initiated => &[TransferStatus::Ongoing, TransferStatus::Failed],
            TransferStatus::Ongoing => &[TransferStatus::Staged, TransferStatus::Failed],
            TransferStatus::Staged => &[TransferStatus::Completed, TransferStatus::Failed],
            TransferStatus::Failed => &[TransferStatus::Initiated],
            _ => &[],
        }
    }

    /// Valid next states for a destination-side (incoming) transfer.
    pub fn incoming_successors(self) -> &'static [TransferStatus] {
        match self {
            TransferStatus::Initiated => &[TransferStatus::Staged, TransferStatus::Failed],
            TransferStatus::Staged => &[TransferStatus::Ingesting, TransferStatus::Failed],
            TransferStatus::Ingesting => &[TransferStatus::Completed, TransferStatus::Failed],
            _ => &[],
        }
    }

    /// Stable string encoding used in the database and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Initiated => "INITIATED",
            TransferStatus::Ongoing => "ONGOING",
            TransferStatus::Staged => "STAGED",
            TransferStatus::Ingesting => "INGESTING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "INITIATED" => Some(TransferStatus::Initiated),
            "ONGOING" => Some(TransferStatus::Ongoing),
            "STAGED" => Some(TransferStatus::Staged),
            "INGESTING" => Some(TransferStatus::Ingesting),
            "COMPLETED" => Some(TransferStatus::Completed),
            "FAILED" => Some(TransferStatus::Failed),
            "CANCELLED" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encoding_round_trips() {
        for status in [
            TransferStatus::Initiated,
            TransferStatus::Ongoing,
            TransferStatus::Staged,
            TransferStatus::Ingesting,
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
        ] {
            assert_eq!(TransferStatus::from_str_opt(status.as_str()), Some(status));
        }
    }

    #[test]
    fn outgoing_machine_is_monotonic() {
        assert!(TransferStatus::Initiated
            .outgoing_successors()
            .contains(&TransferStatus::Ongoing));
        assert!(!TransferStatus::Staged
            .outgoing_successors()
            .contains(&TransferStatus::Ongoing));
        assert!(TransferStatus::Completed.outgoing_successors().is_empty());
        // Operator retry is the one backward edge.
        assert_eq!(
            TransferStatus::Failed.outgoing_successors(),
            &[TransferStatus::Initiated]
        );
    }

    #[test]
    fn incoming_machine_has_no_ongoing() {
        assert!(!TransferStatus::Initiated
            .incoming_successors()
            .contains(&TransferStatus::Ongoing));
        assert!(TransferStatus::Staged
            .incoming_successors()
            .contains(&TransferStatus::Ingesting));
    }
}
