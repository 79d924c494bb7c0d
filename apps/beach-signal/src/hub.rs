use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::pool::{OfferPool, Session};
use crate::protocol::{CandidateRole, ClientMessage, ServerMessage};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::relay::relay_candidate;

/// Everything the relay knows. Registry and pool sit behind one lock because
/// most messages read one and mutate the other.
#[derive(Debug)]
pub struct RelayState {
    registry: ConnectionRegistry,
    pool: OfferPool,
}

impl RelayState {
    pub fn new(shared_secret: &str) -> Self {
        Self {
            registry: ConnectionRegistry::new(shared_secret),
            pool: OfferPool::new(),
        }
    }

    fn broadcast_offers(&self) {
        let message = ServerMessage::AvailableOffers {
            offers: self.pool.list().to_vec(),
        };
        for handle in self.registry.handles() {
            handle.send(message.clone());
        }
        gauge!("beach_signal_pooled_offers", self.pool.len() as f64);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub connections: usize,
    pub offers: Vec<Session>,
}

/// Dispatches protocol messages against the shared relay state.
///
/// Each entry point holds the state lock for its whole lookup, mutation and
/// fan-out. Sends only enqueue onto per-connection channels, so nothing here
/// waits on a socket.
#[derive(Clone)]
pub struct SignalingHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    state: Mutex<RelayState>,
    next_connection_id: AtomicU64,
}

impl SignalingHub {
    pub fn new(state: RelayState) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(state),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Admits a connection and sends it the current pool.
    pub fn connect(
        &self,
        handle: ConnectionHandle,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let mut state = self.inner.state.lock();

        if let Err(err) = state.registry.admit(handle.clone(), identity, credential) {
            counter!("beach_signal_auth_failures_total", 1);
            warn!(connection_id = handle.id, identity, error = %err, "rejecting connection");
            return Err(err);
        }

        handle.send(ServerMessage::AvailableOffers {
            offers: state.pool.list().to_vec(),
        });

        counter!("beach_signal_connections_total", 1);
        gauge!("beach_signal_active_connections", state.registry.len() as f64);
        info!(
            connection_id = handle.id,
            identity,
            active = state.registry.len(),
            "client connected"
        );
        Ok(())
    }

    pub fn handle_message(&self, id: ConnectionId, message: ClientMessage) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let Some(identity) = state.registry.identity_of(id).map(str::to_owned) else {
            debug!(connection_id = id, kind = message.kind(), "message before admission ignored");
            return;
        };

        match message {
            ClientMessage::Connect { .. } => {
                debug!(connection_id = id, %identity, "already admitted, ignoring connect");
            }

            ClientMessage::NewOffer {
                offerer_identity,
                offer,
            } => {
                warn_if_spoofed(id, &identity, &offerer_identity);
                let session_id = state.pool.create(&identity, offer);
                counter!("beach_signal_offers_created_total", 1);
                info!(%identity, %session_id, pooled = state.pool.len(), "new offer");
                state.broadcast_offers();
            }

            ClientMessage::DeclineOffer { offerer_identity } => {
                let Some(declined) = state.pool.decline(&offerer_identity) else {
                    debug!(%identity, offerer = %offerer_identity, "no pending offer to decline");
                    return;
                };

                match state.registry.resolve(&offerer_identity) {
                    Ok(offerer) => {
                        offerer.send(ServerMessage::OfferDeclined {
                            by: identity.clone(),
                        });
                    }
                    Err(miss) => debug!(%miss, "decline notice not delivered"),
                }

                counter!("beach_signal_offers_declined_total", 1);
                info!(%identity, offerer = %offerer_identity, session_id = %declined.id, "offer declined");
                state.broadcast_offers();
            }

            ClientMessage::NewAnswer {
                offerer_identity,
                answerer_identity,
                answer,
            } => {
                warn_if_spoofed(id, &identity, &answerer_identity);
                if offerer_identity == identity {
                    warn!(connection_id = id, %identity, "client is answering its own offer");
                }

                let session = match state.pool.answer(&offerer_identity, &identity, answer) {
                    Ok(session) => session,
                    Err(miss) => {
                        debug!(connection_id = id, %miss, "answer dropped");
                        return;
                    }
                };

                if let Some(answerer) = state.registry.handle_of(id) {
                    answerer.send(ServerMessage::AnswerAck {
                        offerer_identity: offerer_identity.clone(),
                        candidates: session.offer_ice_candidates.clone(),
                    });
                }

                counter!("beach_signal_answers_total", 1);
                info!(
                    %identity,
                    offerer = %offerer_identity,
                    session_id = %session.id,
                    batched_candidates = session.offer_ice_candidates.len(),
                    "offer answered"
                );

                match state.registry.resolve(&offerer_identity) {
                    Ok(offerer) => {
                        offerer.send(ServerMessage::AnswerResponse { session });
                    }
                    Err(miss) => debug!(%miss, "answer response not delivered"),
                }
            }

            ClientMessage::IceCandidate {
                owner_identity,
                is_offerer,
                candidate,
            } => {
                warn_if_spoofed(id, &identity, &owner_identity);
                relay_candidate(
                    &mut state.pool,
                    &state.registry,
                    &identity,
                    CandidateRole::from_is_offerer(is_offerer),
                    candidate,
                );
            }

            ClientMessage::Ping => {
                if let Some(handle) = state.registry.handle_of(id) {
                    handle.send(ServerMessage::Pong);
                }
            }
        }
    }

    /// Transport closed: purge the identity's sessions and its binding, then
    /// broadcast once if the pool changed.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut state = self.inner.state.lock();

        let Some(identity) = state.registry.remove(id) else {
            return;
        };

        let changed = state.pool.remove_all_for(&identity);
        if changed {
            state.broadcast_offers();
        }

        gauge!("beach_signal_active_connections", state.registry.len() as f64);
        info!(
            connection_id = id,
            %identity,
            pool_changed = changed,
            active = state.registry.len(),
            "client disconnected"
        );
    }

    /// Drops unanswered offers older than `ttl`, broadcasting if any went.
    pub fn expire_offers(&self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            warn!(?ttl, "offer ttl out of range, skipping expiry");
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };

        let mut state = self.inner.state.lock();
        let expired = state.pool.expire_unanswered(cutoff);
        if expired > 0 {
            counter!("beach_signal_offers_expired_total", expired as u64);
            info!(expired, pooled = state.pool.len(), "expired idle offers");
            state.broadcast_offers();
        }
        expired
    }

    pub fn spawn_offer_sweeper(&self, ttl: Duration, every: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                hub.expire_offers(ttl);
            }
        })
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let state = self.inner.state.lock();
        HubSnapshot {
            connections: state.registry.len(),
            offers: state.pool.list().to_vec(),
        }
    }
}

fn warn_if_spoofed(id: ConnectionId, identity: &str, claimed: &str) {
    if claimed != identity {
        warn!(
            connection_id = id,
            identity,
            claimed,
            "message names another identity; using the admitted one"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn hub() -> SignalingHub {
        SignalingHub::new(RelayState::new("x"))
    }

    fn join(
        hub: &SignalingHub,
        identity: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = hub.next_connection_id();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(ConnectionHandle::new(id, tx), identity, "x")
            .unwrap();
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn offer(identity: &str) -> ClientMessage {
        ClientMessage::NewOffer {
            offerer_identity: identity.into(),
            offer: json!({ "type": "offer", "sdp": "v=0" }),
        }
    }

    fn answer(offerer: &str, answerer: &str) -> ClientMessage {
        ClientMessage::NewAnswer {
            offerer_identity: offerer.into(),
            answerer_identity: answerer.into(),
            answer: json!({ "type": "answer", "sdp": "v=0" }),
        }
    }

    fn pool_broadcasts(messages: &[ServerMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::AvailableOffers { .. }))
            .count()
    }

    #[test_timeout::timeout]
    fn admission_sends_current_pool() {
        let hub = hub();
        let (alice, _alice_rx) = join(&hub, "alice");
        hub.handle_message(alice, offer("alice"));

        let (_bob, mut bob_rx) = join(&hub, "bob");
        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::AvailableOffers { offers }] => {
                assert_eq!(offers.len(), 1);
                assert_eq!(offers[0].offerer_identity, "alice");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn wrong_credential_is_rejected_and_not_registered() {
        let hub = hub();
        let id = hub.next_connection_id();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = hub.connect(ConnectionHandle::new(id, tx), "mallory", "guess");
        assert_eq!(result, Err(AuthError::InvalidCredential));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(hub.snapshot().connections, 0);

        hub.handle_message(id, offer("mallory"));
        assert!(hub.snapshot().offers.is_empty());
    }

    #[test_timeout::timeout]
    fn new_offer_broadcasts_to_everyone() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        let (_bob, mut bob_rx) = join(&hub, "bob");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(alice, offer("alice"));

        assert_eq!(pool_broadcasts(&drain(&mut alice_rx)), 1);
        assert_eq!(pool_broadcasts(&drain(&mut bob_rx)), 1);
    }

    #[test_timeout::timeout]
    fn offer_is_filed_under_admitted_identity() {
        let hub = hub();
        let (alice, _rx) = join(&hub, "alice");
        hub.handle_message(alice, offer("someone-else"));

        assert_eq!(hub.snapshot().offers[0].offerer_identity, "alice");
    }

    #[test_timeout::timeout]
    fn offerer_disconnect_removes_session() {
        let hub = hub();
        let (alice, _alice_rx) = join(&hub, "alice");
        hub.handle_message(alice, offer("alice"));
        assert_eq!(hub.snapshot().offers.len(), 1);

        hub.disconnect(alice);
        assert!(hub.snapshot().offers.is_empty());
        assert_eq!(hub.snapshot().connections, 0);
    }

    #[test_timeout::timeout]
    fn second_answer_is_dropped() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        let (bob, mut bob_rx) = join(&hub, "bob");
        let (carol, mut carol_rx) = join(&hub, "carol");
        hub.handle_message(alice, offer("alice"));
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        hub.handle_message(bob, answer("alice", "bob"));
        hub.handle_message(carol, answer("alice", "carol"));

        assert_eq!(drain(&mut alice_rx).len(), 1);
        assert!(drain(&mut carol_rx).is_empty());
        assert_eq!(
            hub.snapshot().offers[0].answerer_identity.as_deref(),
            Some("bob")
        );
    }

    #[test_timeout::timeout]
    fn early_candidates_ride_the_answer_ack() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        let (bob, mut bob_rx) = join(&hub, "bob");
        hub.handle_message(alice, offer("alice"));
        for n in 0..3 {
            hub.handle_message(
                alice,
                ClientMessage::IceCandidate {
                    owner_identity: "alice".into(),
                    is_offerer: true,
                    candidate: json!(format!("c{n}")),
                },
            );
        }
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(bob, answer("alice", "bob"));

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::AnswerAck {
                offerer_identity: "alice".into(),
                candidates: vec![json!("c0"), json!("c1"), json!("c2")],
            }]
        );
        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::AnswerResponse { session }] => {
                assert_eq!(session.answerer_identity.as_deref(), Some("bob"));
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn late_candidates_are_forwarded_both_ways() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        let (bob, mut bob_rx) = join(&hub, "bob");
        hub.handle_message(alice, offer("alice"));
        hub.handle_message(bob, answer("alice", "bob"));
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(
            alice,
            ClientMessage::IceCandidate {
                owner_identity: "alice".into(),
                is_offerer: true,
                candidate: json!("a1"),
            },
        );
        hub.handle_message(
            bob,
            ClientMessage::IceCandidate {
                owner_identity: "bob".into(),
                is_offerer: false,
                candidate: json!("b1"),
            },
        );

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::ReceivedIceCandidate { candidate: json!("a1") }]
        );
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::ReceivedIceCandidate { candidate: json!("b1") }]
        );
    }

    #[test_timeout::timeout]
    fn decline_notifies_connected_offerer() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        let (bob, mut bob_rx) = join(&hub, "bob");
        hub.handle_message(alice, offer("alice"));
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(
            bob,
            ClientMessage::DeclineOffer {
                offerer_identity: "alice".into(),
            },
        );

        let to_alice = drain(&mut alice_rx);
        assert!(to_alice.contains(&ServerMessage::OfferDeclined { by: "bob".into() }));
        assert_eq!(pool_broadcasts(&to_alice), 1);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::AvailableOffers { offers: vec![] }]
        );
    }

    #[test_timeout::timeout]
    fn decline_of_missing_offer_is_silent() {
        let hub = hub();
        let (_alice, mut alice_rx) = join(&hub, "alice");
        let (bob, mut bob_rx) = join(&hub, "bob");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(
            bob,
            ClientMessage::DeclineOffer {
                offerer_identity: "alice".into(),
            },
        );

        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test_timeout::timeout]
    fn disconnect_purges_both_roles_with_one_broadcast() {
        let hub = hub();
        let (alice, _alice_rx) = join(&hub, "alice");
        let (bob, _bob_rx) = join(&hub, "bob");
        let (carol, mut carol_rx) = join(&hub, "carol");

        hub.handle_message(alice, offer("alice"));
        hub.handle_message(bob, offer("bob"));
        hub.handle_message(alice, answer("bob", "alice"));
        hub.handle_message(carol, offer("carol"));
        drain(&mut carol_rx);

        hub.disconnect(alice);

        let seen = drain(&mut carol_rx);
        assert_eq!(pool_broadcasts(&seen), 1);
        let remaining: Vec<_> = hub
            .snapshot()
            .offers
            .into_iter()
            .map(|s| s.offerer_identity)
            .collect();
        assert_eq!(remaining, vec!["carol".to_string()]);
    }

    #[test_timeout::timeout]
    fn disconnect_without_sessions_does_not_broadcast() {
        let hub = hub();
        let (alice, _alice_rx) = join(&hub, "alice");
        let (_bob, mut bob_rx) = join(&hub, "bob");
        drain(&mut bob_rx);

        hub.disconnect(alice);
        hub.disconnect(alice);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test_timeout::timeout]
    fn duplicate_identity_routes_to_first_admitted_connection() {
        let hub = hub();
        let slow_id = hub.next_connection_id();
        let fast_id = hub.next_connection_id();
        let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();

        hub.connect(ConnectionHandle::new(fast_id, fast_tx), "alice", "x")
            .unwrap();
        hub.connect(ConnectionHandle::new(slow_id, slow_tx), "alice", "x")
            .unwrap();
        let (bob, mut bob_rx) = join(&hub, "bob");

        hub.handle_message(fast_id, offer("alice"));
        hub.handle_message(bob, answer("alice", "bob"));
        drain(&mut bob_rx);

        let answered = |messages: Vec<ServerMessage>| {
            messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::AnswerResponse { .. }))
                .count()
        };
        assert_eq!(answered(drain(&mut fast_rx)), 1);
        assert_eq!(answered(drain(&mut slow_rx)), 0);
    }

    #[test_timeout::timeout]
    fn ping_gets_pong() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        drain(&mut alice_rx);

        hub.handle_message(alice, ClientMessage::Ping);
        assert_eq!(drain(&mut alice_rx), vec![ServerMessage::Pong]);
    }

    #[test_timeout::timeout]
    fn expiry_with_generous_ttl_keeps_fresh_offers() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        hub.handle_message(alice, offer("alice"));
        drain(&mut alice_rx);

        assert_eq!(hub.expire_offers(Duration::from_secs(3600)), 0);
        assert!(drain(&mut alice_rx).is_empty());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(hub.expire_offers(Duration::from_millis(1)), 1);
        assert_eq!(pool_broadcasts(&drain(&mut alice_rx)), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweeper_expires_idle_offers() {
        let hub = hub();
        let (alice, mut alice_rx) = join(&hub, "alice");
        hub.handle_message(alice, offer("alice"));

        let sweeper = hub.spawn_offer_sweeper(Duration::from_millis(10), Duration::from_millis(5));
        while !hub.snapshot().offers.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sweeper.abort();

        let seen = drain(&mut alice_rx);
        assert!(seen.contains(&ServerMessage::AvailableOffers { offers: vec![] }));
    }
}
