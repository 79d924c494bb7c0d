use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{AuthError, LookupMiss};
use crate::protocol::ServerMessage;

/// Monotonic id assigned to each websocket at upgrade time.
pub type ConnectionId = u64;

/// Outbound side of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, outbox }
    }

    /// Fire-and-forget. Returns false once the writer task has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbox.send(message).is_ok()
    }
}

#[derive(Debug)]
struct Binding {
    identity: String,
    handle: ConnectionHandle,
}

/// Connection-to-identity bindings for every admitted connection.
///
/// Bindings are keyed by an admission sequence number, so iteration follows
/// admission order rather than upgrade order. Identities are not unique: a
/// later admission with a name already in use coexists with the earlier one,
/// and identity lookups resolve to the earliest admitted.
#[derive(Debug)]
pub struct ConnectionRegistry {
    secret_digest: String,
    next_admission: u64,
    bindings: BTreeMap<u64, Binding>,
    admissions: HashMap<ConnectionId, u64>,
}

impl ConnectionRegistry {
    pub fn new(shared_secret: &str) -> Self {
        Self {
            secret_digest: hash_credential(shared_secret),
            next_admission: 0,
            bindings: BTreeMap::new(),
            admissions: HashMap::new(),
        }
    }

    fn binding(&self, id: ConnectionId) -> Option<&Binding> {
        self.admissions
            .get(&id)
            .and_then(|seq| self.bindings.get(seq))
    }

    pub fn admit(
        &mut self,
        handle: ConnectionHandle,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        if !verify_credential(credential, &self.secret_digest) {
            return Err(AuthError::InvalidCredential);
        }
        if identity.trim().is_empty() {
            return Err(AuthError::MissingIdentity);
        }

        // Re-admitting a live connection moves it to the back of the order.
        self.remove(handle.id);
        let seq = self.next_admission;
        self.next_admission += 1;

        debug!(connection_id = handle.id, admission = seq, identity, "connection admitted");
        self.admissions.insert(handle.id, seq);
        self.bindings.insert(
            seq,
            Binding {
                identity: identity.to_string(),
                handle,
            },
        );
        Ok(())
    }

    pub fn lookup_by_identity(&self, identity: &str) -> Option<&ConnectionHandle> {
        self.bindings
            .values()
            .find(|binding| binding.identity == identity)
            .map(|binding| &binding.handle)
    }

    pub fn resolve(&self, identity: &str) -> Result<&ConnectionHandle, LookupMiss> {
        self.lookup_by_identity(identity)
            .ok_or_else(|| LookupMiss::IdentityUnresolved(identity.to_string()))
    }

    pub fn handle_of(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.binding(id).map(|binding| &binding.handle)
    }

    pub fn identity_of(&self, id: ConnectionId) -> Option<&str> {
        self.binding(id).map(|binding| binding.identity.as_str())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<String> {
        let seq = self.admissions.remove(&id)?;
        self.bindings.remove(&seq).map(|binding| binding.identity)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.bindings.values().map(|binding| &binding.handle)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Hash a credential using SHA-256
pub fn hash_credential(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify if a credential matches a hash
pub fn verify_credential(credential: &str, hash: &str) -> bool {
    hash_credential(credential) == hash
}
