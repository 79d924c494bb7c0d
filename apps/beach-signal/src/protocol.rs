use serde::{Deserialize, Serialize};

use crate::pool::Session;

/// Which side of a session produced an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateRole {
    Offerer,
    Answerer,
}

impl CandidateRole {
    pub fn from_is_offerer(is_offerer: bool) -> Self {
        if is_offerer {
            CandidateRole::Offerer
        } else {
            CandidateRole::Answerer
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateRole::Offerer => "offerer",
            CandidateRole::Answerer => "answerer",
        }
    }
}

/// Messages sent from a browser peer to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate when the upgrade request carried no credentials
    Connect {
        identity: String,
        credential: String,
    },
    /// Publish a new offer to the pool
    NewOffer {
        offerer_identity: String,
        offer: serde_json::Value,
    },
    /// Turn down a pending offer
    DeclineOffer { offerer_identity: String },
    /// Answer a pending offer; acknowledged with `AnswerAck`
    NewAnswer {
        offerer_identity: String,
        answerer_identity: String,
        answer: serde_json::Value,
    },
    /// Trickle an ICE candidate towards the other side of a session
    IceCandidate {
        owner_identity: String,
        is_offerer: bool,
        candidate: serde_json::Value,
    },
    /// Heartbeat to keep the connection alive
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::NewOffer { .. } => "new_offer",
            ClientMessage::DeclineOffer { .. } => "decline_offer",
            ClientMessage::NewAnswer { .. } => "new_answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the relay to a browser peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current offer pool, in creation order
    AvailableOffers { offers: Vec<Session> },
    /// The caller's offer was declined
    OfferDeclined { by: String },
    /// Reply to `NewAnswer` carrying the offerer's buffered candidates
    AnswerAck {
        offerer_identity: String,
        candidates: Vec<serde_json::Value>,
    },
    /// The caller's offer was answered
    AnswerResponse { session: Session },
    /// Candidate trickled by the other side of the session
    ReceivedIceCandidate { candidate: serde_json::Value },
    /// Response to ping
    Pong,
}

/// Credentials carried on the websocket upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeQuery {
    pub identity: Option<String>,
    pub credential: Option<String>,
}

impl HandshakeQuery {
    pub fn credentials(self) -> Option<(String, String)> {
        match (self.identity, self.credential) {
            (Some(identity), Some(credential)) => Some((identity, credential)),
            _ => None,
        }
    }
}
