use dxram_types::{chunk_id::to_hex_string, BackupRange, NodeId};
use tracing::info;

/// Restores the chunks of a failed peer from one of its backup peers.
pub trait RecoveryTrigger: Send + Sync {
    /// Asks `backup_peer` to restore `range` of `owner`. Returns whether it
    /// took over; the next backup peer is asked otherwise.
    fn recover(&self, owner: NodeId, range: &BackupRange, backup_peer: NodeId) -> bool;
}

/// Only records what would be recovered.
pub struct LoggingRecovery;

impl RecoveryTrigger for LoggingRecovery {
    fn recover(&self, owner: NodeId, range: &BackupRange, backup_peer: NodeId) -> bool {
        info!(
            "recover range {} of 0x{owner:04X} on 0x{backup_peer:04X}",
            to_hex_string(range.range_id)
        );
        true
    }
}
