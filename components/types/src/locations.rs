use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Where a chunk lives: its primary peer and the peers holding its
/// backups. Migrated chunks carry no backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locations {
    pub primary: NodeId,
    pub backups: Vec<NodeId>,
}

impl Locations {
    pub fn new(primary: NodeId, backups: Vec<NodeId>) -> Self { Self { primary, backups } }
}

/// The replica set of one contiguous run of chunks. For ranges of a creator's
/// own chunks `range_id` is the first local id of the run; for migration
/// ranges it is the migration range index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRange {
    pub range_id: u64,
    pub backup_peers: Vec<NodeId>,
}

impl BackupRange {
    pub fn new(range_id: u64, backup_peers: Vec<NodeId>) -> Self {
        Self {
            range_id,
            backup_peers,
        }
    }
}
