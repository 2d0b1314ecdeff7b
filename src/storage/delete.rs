//! Results of batch message deletion.

use serde::{Deserialize, Serialize};

/// Largest number of ids deleted by one script call
pub const DELETE_BATCH_SIZE: usize = 100;

/// Overall outcome of a batch deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteStatus {
    /// Every id was deleted
    Ok,
    /// Some ids were deleted
    PartialSuccess,
    /// Nothing was deleted
    MessageNotDeleted,
}

/// Per-item counts of a batch deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagesStats {
    /// Ids looked at
    pub processed: u64,
    /// Ids deleted
    pub success: u64,
    /// Ids that did not exist
    pub not_found: u64,
    /// Ids held by a consumer, left untouched
    pub in_process: u64,
}

impl DeleteMessagesStats {
    /// Build stats from the `{success, notFound, inProcess}` script reply
    pub fn from_counts(success: u64, not_found: u64, in_process: u64) -> Self {
        Self {
            processed: success + not_found + in_process,
            success,
            not_found,
            in_process,
        }
    }

    /// Add up the stats of another batch
    pub fn merge(&mut self, other: DeleteMessagesStats) {
        self.processed += other.processed;
        self.success += other.success;
        self.not_found += other.not_found;
        self.in_process += other.in_process;
    }

    /// Overall status of the batch
    pub fn status(&self) -> DeleteStatus {
        if self.success == 0 {
            DeleteStatus::MessageNotDeleted
        } else if self.success == self.processed {
            DeleteStatus::Ok
        } else {
            DeleteStatus::PartialSuccess
        }
    }
}

/// Reply of a batch deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessagesReply {
    pub status: DeleteStatus,
    pub stats: DeleteMessagesStats,
}

impl From<DeleteMessagesStats> for DeleteMessagesReply {
    fn from(stats: DeleteMessagesStats) -> Self {
        Self {
            status: stats.status(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_stats() {
        assert_eq!(
            DeleteMessagesStats::from_counts(3, 0, 0).status(),
            DeleteStatus::Ok
        );
        assert_eq!(
            DeleteMessagesStats::from_counts(2, 1, 0).status(),
            DeleteStatus::PartialSuccess
        );
        assert_eq!(
            DeleteMessagesStats::from_counts(0, 2, 1).status(),
            DeleteStatus::MessageNotDeleted
        );
        // an empty batch deleted nothing
        assert_eq!(
            DeleteMessagesStats::default().status(),
            DeleteStatus::MessageNotDeleted
        );
    }

    #[test]
    fn test_merge_batches() {
        let mut total = DeleteMessagesStats::from_counts(100, 0, 0);
        total.merge(DeleteMessagesStats::from_counts(1, 2, 3));
        assert_eq!(total.processed, 106);
        assert_eq!(total.success, 101);
        assert_eq!(total.not_found, 2);
        assert_eq!(total.in_process, 3);

        let reply = DeleteMessagesReply::from(total);
        assert_eq!(reply.status, DeleteStatus::PartialSuccess);
        let json = serde_json::to_value(reply).unwrap();
        assert_eq!(json["status"], "PARTIAL_SUCCESS");
        assert_eq!(json["stats"]["notFound"], 2);
    }
}
