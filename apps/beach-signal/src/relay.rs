//! ICE candidate relay.
//!
//! Candidates trickle in whenever the browsers gather them, which is usually
//! before the other side of the session is known. Every candidate is recorded
//! on its session first. The offerer's early candidates reach the answerer as
//! one batch in the `answer_ack`; anything gathered afterwards is pushed to
//! the counterpart as soon as it can be resolved.

use metrics::counter;
use tracing::debug;

use crate::pool::OfferPool;
use crate::protocol::{CandidateRole, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateRoute {
    /// Recorded and sent to the counterpart's connection.
    Forwarded(ConnectionId),
    /// Recorded; the counterpart is unknown or not connected.
    Buffered,
    /// No session matched the owner in that role.
    Dropped,
}

impl CandidateRoute {
    fn label(self) -> &'static str {
        match self {
            CandidateRoute::Forwarded(_) => "forwarded",
            CandidateRoute::Buffered => "buffered",
            CandidateRoute::Dropped => "dropped",
        }
    }
}

pub fn relay_candidate(
    pool: &mut OfferPool,
    registry: &ConnectionRegistry,
    owner: &str,
    role: CandidateRole,
    candidate: serde_json::Value,
) -> CandidateRoute {
    let route = match pool.append_candidate(owner, candidate.clone(), role) {
        None => CandidateRoute::Dropped,
        Some(session) => match session
            .counterpart(role)
            .and_then(|peer| registry.lookup_by_identity(peer))
        {
            Some(handle) => {
                handle.send(ServerMessage::ReceivedIceCandidate { candidate });
                CandidateRoute::Forwarded(handle.id)
            }
            None => CandidateRoute::Buffered,
        },
    };

    debug!(
        owner,
        role = role.as_str(),
        route = route.label(),
        "ice candidate relayed"
    );
    counter!("beach_signal_candidates_total", 1, "route" => route.label());
    route
}
