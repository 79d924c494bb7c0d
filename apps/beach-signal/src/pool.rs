//! The offer pool: every signaling session the relay is currently brokering.
//!
//! The pool is a flat vector scanned linearly. Session counts are human-scale
//! (one per pending or running call) and the relay spends its time on socket
//! I/O, so an index would buy nothing. Insertion order is the order clients
//! see in `available_offers`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LookupMiss;
use crate::protocol::CandidateRole;

pub type SessionId = Uuid;

/// One offer/answer negotiation between two identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub offerer_identity: String,
    pub offer: serde_json::Value,
    pub offer_ice_candidates: Vec<serde_json::Value>,
    pub answerer_identity: Option<String>,
    pub answer: Option<serde_json::Value>,
    pub answerer_ice_candidates: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(offerer_identity: String, offer: serde_json::Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            offerer_identity,
            offer,
            offer_ice_candidates: Vec::new(),
            answerer_identity: None,
            answer: None,
            answerer_ice_candidates: Vec::new(),
            created_at,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answerer_identity.is_some()
    }

    pub fn involves(&self, identity: &str) -> bool {
        self.offerer_identity == identity || self.answerer_identity.as_deref() == Some(identity)
    }

    /// The identity on the other side from `role`, if known yet.
    pub fn counterpart(&self, role: CandidateRole) -> Option<&str> {
        match role {
            CandidateRole::Offerer => self.answerer_identity.as_deref(),
            CandidateRole::Answerer => Some(self.offerer_identity.as_str()),
        }
    }

    fn is_pending_from(&self, offerer: &str) -> bool {
        self.offerer_identity == offerer && !self.is_answered()
    }
}

#[derive(Debug, Default)]
pub struct OfferPool {
    sessions: Vec<Session>,
}

impl OfferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, offerer: &str, offer: serde_json::Value) -> SessionId {
        self.create_at(offerer, offer, Utc::now())
    }

    pub(crate) fn create_at(
        &mut self,
        offerer: &str,
        offer: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> SessionId {
        let session = Session::new(offerer.to_string(), offer, created_at);
        let id = session.id;
        self.sessions.push(session);
        id
    }

    pub fn list(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    /// Removes the first unanswered session offered by `offerer`.
    pub fn decline(&mut self, offerer: &str) -> Option<Session> {
        let index = self
            .sessions
            .iter()
            .position(|session| session.is_pending_from(offerer))?;
        Some(self.sessions.remove(index))
    }

    /// Binds `answerer` to the first unanswered session offered by
    /// `offerer` and returns a copy of the updated record.
    pub fn answer(
        &mut self,
        offerer: &str,
        answerer: &str,
        answer: serde_json::Value,
    ) -> Result<Session, LookupMiss> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.is_pending_from(offerer))
            .ok_or_else(|| LookupMiss::OfferNotFound(offerer.to_string()))?;

        session.answerer_identity = Some(answerer.to_string());
        session.answer = Some(answer);
        Ok(session.clone())
    }

    /// Drops every session `identity` takes part in, on either side.
    pub fn remove_all_for(&mut self, identity: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| !session.involves(identity));
        self.sessions.len() != before
    }

    /// Appends to the candidate list of the first session where `identity`
    /// plays `role`.
    pub fn append_candidate(
        &mut self,
        identity: &str,
        candidate: serde_json::Value,
        role: CandidateRole,
    ) -> Option<&Session> {
        let session = self.sessions.iter_mut().find(|session| match role {
            CandidateRole::Offerer => session.offerer_identity == identity,
            CandidateRole::Answerer => session.answerer_identity.as_deref() == Some(identity),
        })?;

        match role {
            CandidateRole::Offerer => session.offer_ice_candidates.push(candidate),
            CandidateRole::Answerer => session.answerer_ice_candidates.push(candidate),
        }
        Some(session)
    }

    /// Drops unanswered sessions created before `cutoff`. Answered sessions
    /// belong to a running call and are left to disconnect cleanup.
    pub fn expire_unanswered(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|session| session.is_answered() || session.created_at >= cutoff);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
