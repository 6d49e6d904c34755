use bytes::Bytes;
use dxram_common::AppId;
use dxram_types::{chunk_id::ChunkId, BackupRange, Locations, NodeId};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    cid_tree::{CidTree, RangeStart},
    err::{CodecSnafu, Result},
    network::Envelope,
};

/// Message type of everything the lookup component exchanges.
pub const LOOKUP_MESSAGE_TYPE: u8 = 10;

/// State a superpeer hands to a node it accepts into the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinState {
    pub predecessor: Option<NodeId>,
    pub successor: Option<NodeId>,
    pub superpeers: Vec<NodeId>,
    pub peers: Vec<NodeId>,
    pub trees: Vec<CidTree>,
    pub mappings: Vec<(AppId, ChunkId)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinReply {
    /// Ask this superpeer instead.
    Redirect(NodeId),
    Accepted(JoinState),
}

/// Everything a peer needs to take a place in the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionState {
    pub predecessor: NodeId,
    pub successor: NodeId,
    pub replacement: Option<NodeId>,
    pub superpeers: Vec<NodeId>,
    pub peers: Vec<NodeId>,
    pub trees: Vec<CidTree>,
    pub mappings: Vec<(AppId, ChunkId)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LookupMessage {
    JoinRequest { node: NodeId, is_superpeer: bool },
    JoinResponse(Box<JoinReply>),
    InitRangeRequest { start: RangeStart, locations: Locations, backup: bool },
    InitRangeResponse { success: bool },
    LookupRequest { chunk_id: ChunkId },
    LookupResponse { locations: Option<Locations> },
    GetBackupRangesRequest { node: NodeId },
    GetBackupRangesResponse { ranges: Option<Vec<BackupRange>> },
    UpdateAllMessage { owner: NodeId },
    MigrateRequest { chunk_id: ChunkId, node: NodeId, backup: bool },
    MigrateResponse { success: bool },
    MigrateRangeRequest { start: ChunkId, end: ChunkId, node: NodeId, backup: bool },
    MigrateRangeResponse { success: bool },
    RemoveRequest { chunk_ids: Vec<ChunkId>, backup: bool },
    RemoveResponse { success: bool },
    SendBackupsMessage { trees: Vec<CidTree>, mappings: Vec<(AppId, ChunkId)> },
    SendSuperpeersMessage { superpeers: Vec<NodeId> },
    AskAboutBackupsRequest { peers: Vec<NodeId> },
    AskAboutBackupsResponse { trees: Vec<CidTree>, mappings: Vec<(AppId, ChunkId)> },
    AskAboutSuccessorRequest,
    AskAboutSuccessorResponse { successor: Option<NodeId> },
    NotifyAboutNewPredecessorMessage { predecessor: NodeId },
    NotifyAboutNewSuccessorMessage { successor: NodeId },
    PingSuperpeerMessage,
    SearchForPeerRequest,
    SearchForPeerResponse { peer: Option<NodeId> },
    PromotePeerRequest(Box<PromotionState>),
    PromotePeerResponse { success: bool },
    DelegatePromotePeerMessage { hops: u16 },
    NotifyAboutFailedPeerMessage { failed: NodeId },
    InsertIdRequest { id: AppId, chunk_id: ChunkId, backup: bool },
    InsertIdResponse { success: bool },
    GetChunkIdRequest { id: AppId },
    GetChunkIdResponse { responsible: bool, chunk_id: Option<ChunkId> },
    GetMappingCountRequest,
    GetMappingCountResponse { count: u64 },
}

/// Subtypes a node dispatches to its lookup component. Responses travel
/// back as the return value of a synchronous send.
pub const INCOMING_SUBTYPES: &[u8] = &[1, 3, 5, 7, 9, 10, 12, 14, 16, 17, 18, 20, 22, 23, 24, 25, 27, 29, 30, 31, 33, 35];

impl LookupMessage {
    pub fn subtype(&self) -> u8 {
        match self {
            LookupMessage::JoinRequest { .. } => 1,
            LookupMessage::JoinResponse(_) => 2,
            LookupMessage::InitRangeRequest { .. } => 3,
            LookupMessage::InitRangeResponse { .. } => 4,
            LookupMessage::LookupRequest { .. } => 5,
            LookupMessage::LookupResponse { .. } => 6,
            LookupMessage::GetBackupRangesRequest { .. } => 7,
            LookupMessage::GetBackupRangesResponse { .. } => 8,
            LookupMessage::UpdateAllMessage { .. } => 9,
            LookupMessage::MigrateRequest { .. } => 10,
            LookupMessage::MigrateResponse { .. } => 11,
            LookupMessage::MigrateRangeRequest { .. } => 12,
            LookupMessage::MigrateRangeResponse { .. } => 13,
            LookupMessage::RemoveRequest { .. } => 14,
            LookupMessage::RemoveResponse { .. } => 15,
            LookupMessage::SendBackupsMessage { .. } => 16,
            LookupMessage::SendSuperpeersMessage { .. } => 17,
            LookupMessage::AskAboutBackupsRequest { .. } => 18,
            LookupMessage::AskAboutBackupsResponse { .. } => 19,
            LookupMessage::AskAboutSuccessorRequest => 20,
            LookupMessage::AskAboutSuccessorResponse { .. } => 21,
            LookupMessage::NotifyAboutNewPredecessorMessage { .. } => 22,
            LookupMessage::NotifyAboutNewSuccessorMessage { .. } => 23,
            LookupMessage::PingSuperpeerMessage => 24,
            LookupMessage::SearchForPeerRequest => 25,
            LookupMessage::SearchForPeerResponse { .. } => 26,
            LookupMessage::PromotePeerRequest(_) => 27,
            LookupMessage::PromotePeerResponse { .. } => 28,
            LookupMessage::DelegatePromotePeerMessage { .. } => 29,
            LookupMessage::NotifyAboutFailedPeerMessage { .. } => 30,
            LookupMessage::InsertIdRequest { .. } => 31,
            LookupMessage::InsertIdResponse { .. } => 32,
            LookupMessage::GetChunkIdRequest { .. } => 33,
            LookupMessage::GetChunkIdResponse { .. } => 34,
            LookupMessage::GetMappingCountRequest => 35,
            LookupMessage::GetMappingCountResponse { .. } => 36,
        }
    }

    /// Short variant name for logs and errors.
    pub fn name(&self) -> String {
        let debug = format!("{self:?}");
        debug
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self).context(CodecSnafu)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> { bincode::deserialize(payload).context(CodecSnafu) }

    pub fn into_envelope(self, source: NodeId, destination: NodeId) -> Result<Envelope> {
        Ok(Envelope {
            source,
            destination,
            msg_type: LOOKUP_MESSAGE_TYPE,
            subtype: self.subtype(),
            payload: self.encode()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use dxram_types::chunk_id::chunk_id;

    use super::*;

    #[test]
    fn incoming_subtypes_are_requests_and_messages() {
        let incoming = [
            LookupMessage::JoinRequest {
                node: 1,
                is_superpeer: true,
            },
            LookupMessage::UpdateAllMessage { owner: 1 },
            LookupMessage::AskAboutSuccessorRequest,
            LookupMessage::PingSuperpeerMessage,
            LookupMessage::DelegatePromotePeerMessage { hops: 1 },
            LookupMessage::GetMappingCountRequest,
        ];
        for message in incoming {
            assert!(INCOMING_SUBTYPES.contains(&message.subtype()), "{}", message.name());
        }
        let responses = [
            LookupMessage::InitRangeResponse { success: true },
            LookupMessage::AskAboutSuccessorResponse { successor: None },
            LookupMessage::GetMappingCountResponse { count: 0 },
        ];
        for message in responses {
            assert!(!INCOMING_SUBTYPES.contains(&message.subtype()), "{}", message.name());
        }
    }

    #[test]
    fn envelope_carries_the_payload() {
        let message = LookupMessage::MigrateRangeRequest {
            start: chunk_id(3, 10),
            end: chunk_id(3, 20),
            node: 9,
            backup: false,
        };
        let envelope = message.into_envelope(1, 2).unwrap();
        assert_eq!((envelope.source, envelope.destination), (1, 2));
        assert_eq!(envelope.subtype, 12);
        match LookupMessage::decode(&envelope.payload).unwrap() {
            LookupMessage::MigrateRangeRequest { start, end, node, backup } => {
                assert_eq!((start, end, node, backup), (chunk_id(3, 10), chunk_id(3, 20), 9, false));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(LookupMessage::PingSuperpeerMessage.name(), "PingSuperpeerMessage");
        assert!(LookupMessage::decode(&[0xFF, 0xFF]).is_err());
    }
}
