//! Gossip protocol messages.
//!
//! Encoding is left to the transport; messages carry the gossip value
//! behind an `Arc` so fanning one view out to several peers doesn't copy it.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::gossip::Gossip;
use crate::{ClusterNode, ClusterNodeId};

/// Why a join request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejectKind {
    /// The receiver can't accept joins right now. Try again later.
    Temporary,
    /// The receiver belongs to a different cluster. Never try it again.
    Permanent,
    /// Another live member already uses the joiner's address.
    Conflict,
}

impl std::fmt::Display for JoinRejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRejectKind::Temporary => write!(f, "temporary"),
            JoinRejectKind::Permanent => write!(f, "permanent"),
            JoinRejectKind::Conflict => write!(f, "conflict"),
        }
    }
}

/// Messages exchanged by gossip managers.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    /// A node asks a seed to let it into the cluster.
    JoinRequest {
        cluster: String,
        node: ClusterNode,
    },

    /// The seed added the joiner as JOINING.
    JoinAccept {
        sender: ClusterNodeId,
        gossip: Arc<Gossip>,
    },

    /// The seed refused the join.
    JoinReject {
        sender: ClusterNodeId,
        kind: JoinRejectKind,
        reason: String,
    },

    /// Periodic exchange of the full membership view.
    Update {
        sender: ClusterNodeId,
        gossip: Arc<Gossip>,
    },

    HeartbeatRequest {
        sender: ClusterNodeId,
    },

    HeartbeatReply {
        sender: ClusterNodeId,
    },
}

impl GossipMessage {
    /// Id of the sending node.
    pub fn sender(&self) -> ClusterNodeId {
        match self {
            GossipMessage::JoinRequest { node, .. } => node.id,
            GossipMessage::JoinAccept { sender, .. }
            | GossipMessage::JoinReject { sender, .. }
            | GossipMessage::Update { sender, .. }
            | GossipMessage::HeartbeatRequest { sender }
            | GossipMessage::HeartbeatReply { sender } => *sender,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::JoinRequest { .. } => "join-request",
            GossipMessage::JoinAccept { .. } => "join-accept",
            GossipMessage::JoinReject { .. } => "join-reject",
            GossipMessage::Update { .. } => "update",
            GossipMessage::HeartbeatRequest { .. } => "heartbeat-request",
            GossipMessage::HeartbeatReply { .. } => "heartbeat-reply",
        }
    }
}

/// A message in flight between two gossip endpoints.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub message: GossipMessage,
}
