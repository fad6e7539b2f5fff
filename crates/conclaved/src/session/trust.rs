//! Trust session state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use conclave_common::constants::MAX_FAILED_ATTEMPTS;
use conclave_common::{JoinIntent, SessionRole};

use super::SessionError;
use super::passphrase::generate_passphrase;
use crate::certs::Certificate;
use crate::context::Cause;
use crate::discovery::Discovery;
use crate::gateway::Gateway;

/// A published intent and the signal that someone took it
struct IntentDelivery {
    intent: JoinIntent,
    taken: oneshot::Sender<()>,
}

struct SessionState {
    passphrase: String,
    /// Address this host advertises for the session; empty for the default
    address: String,
    trust_store: HashMap<String, Certificate>,
    join_intent_fingerprints: HashSet<String>,
    failed_attempts: u32,
    responder: Option<Arc<Discovery>>,
    expires_at: Option<DateTime<Utc>>,
    stopped: bool,
}

/// One trust establishment attempt.
///
/// `created -> active -> stopped`; a stopped session rejects every
/// mutation and never becomes active again.
pub struct Session {
    role: SessionRole,
    gateway: Arc<Gateway>,
    state: RwLock<SessionState>,
    intents_tx: std::sync::Mutex<Option<mpsc::Sender<IntentDelivery>>>,
    intents_rx: Mutex<mpsc::Receiver<IntentDelivery>>,
    exit: CancellationToken,
    exit_cause: OnceLock<Option<Cause>>,
}

impl Session {
    /// Start a session. A passphrase is generated when none is given.
    pub fn new(
        role: SessionRole,
        passphrase: Option<String>,
        gateway: Arc<Gateway>,
    ) -> Result<Self, SessionError> {
        let passphrase = match passphrase.filter(|p| !p.is_empty()) {
            Some(p) => p,
            None => generate_passphrase()?,
        };

        let (tx, rx) = mpsc::channel(1);

        Ok(Self {
            role,
            gateway,
            state: RwLock::new(SessionState {
                passphrase,
                address: String::new(),
                trust_store: HashMap::new(),
                join_intent_fingerprints: HashSet::new(),
                failed_attempts: 0,
                responder: None,
                expires_at: None,
                stopped: false,
            }),
            intents_tx: std::sync::Mutex::new(Some(tx)),
            intents_rx: Mutex::new(rx),
            exit: CancellationToken::new(),
            exit_cause: OnceLock::new(),
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Empty once stopped
    pub async fn passphrase(&self) -> String {
        self.state.read().await.passphrase.clone()
    }

    pub async fn address(&self) -> String {
        self.state.read().await.address.clone()
    }

    pub async fn set_address(&self, address: &str) {
        self.state.write().await.address = address.to_string();
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.read().await.stopped
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.expires_at
    }

    pub async fn set_expiry(&self, expires_at: DateTime<Utc>) {
        self.state.write().await.expires_at = Some(expires_at);
    }

    /// Trust `cert` for requests made by `name`
    pub async fn allow(&self, name: &str, cert: Certificate) -> Result<(), SessionError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Err(SessionError::Stopped);
        }

        tracing::info!(peer = %name, fingerprint = %cert.short_fingerprint(), "🤝 Peer trusted");
        state.trust_store.insert(name.to_string(), cert);
        Ok(())
    }

    /// Copy of the provisional trust store
    pub async fn temporary_trust_store(&self) -> HashMap<String, Certificate> {
        self.state.read().await.trust_store.clone()
    }

    /// Record that `fingerprint` asked to join. A second request from the
    /// same certificate is rejected.
    pub async fn register_intent(&self, fingerprint: &str) -> Result<(), SessionError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Err(SessionError::Stopped);
        }

        if !state.join_intent_fingerprints.insert(fingerprint.to_string()) {
            return Err(SessionError::DuplicateIntent);
        }

        Ok(())
    }

    /// Count one failed join attempt; fails once the ceiling is reached
    pub async fn register_failed_attempt(&self) -> Result<(), SessionError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Err(SessionError::Stopped);
        }

        if state.failed_attempts >= MAX_FAILED_ATTEMPTS {
            return Err(SessionError::TooManyFailedAttempts);
        }

        state.failed_attempts += 1;
        tracing::warn!(attempts = state.failed_attempts, "Failed session join attempt");
        Ok(())
    }

    /// Hand `intent` to the session's consumer, waiting at most `timeout`
    /// for one to take it.
    pub async fn publish_intent(&self, intent: JoinIntent, timeout: Duration) -> Result<(), SessionError> {
        let tx = self
            .intents_tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(SessionError::Stopped)?;

        let (taken, taken_rx) = oneshot::channel();
        let delivery = async {
            tx.send(IntentDelivery { intent, taken })
                .await
                .map_err(|_| SessionError::Stopped)?;
            taken_rx.await.map_err(|_| SessionError::Stopped)
        };

        tokio::time::timeout(timeout, delivery)
            .await
            .map_err(|_| SessionError::NoConsumer)?
    }

    /// Next published intent; `None` once the session is stopped.
    /// Intents whose publisher already gave up are skipped.
    pub async fn next_intent(&self) -> Option<JoinIntent> {
        let mut rx = self.intents_rx.lock().await;
        loop {
            let delivery = rx.recv().await?;
            if delivery.taken.send(()).is_ok() {
                return Some(delivery.intent);
            }
        }
    }

    /// Discovery responder to shut down with the session
    pub async fn set_responder(&self, responder: Arc<Discovery>) {
        let mut state = self.state.write().await;
        if state.stopped {
            responder.stop_responder();
            return;
        }
        state.responder = Some(responder);
    }

    /// Signal the serving logic that the session is over. `None` means it
    /// ended successfully. Only the first signal counts.
    pub fn signal_exit(&self, cause: Option<Cause>) {
        let _ = self.exit_cause.set(cause);
        self.exit.cancel();
    }

    /// Resolves once the session exits, with the failure cause if any
    pub async fn exited(&self) -> Option<Cause> {
        self.exit.cancelled().await;
        self.exit_cause.get().cloned().flatten()
    }

    /// Tear the session down. Repeated calls are no-ops.
    pub async fn stop(&self, cause: Option<Cause>) {
        let responder = {
            let mut state = self.state.write().await;
            if state.stopped {
                return;
            }

            state.stopped = true;
            state.passphrase.clear();
            state.trust_store.clear();
            state.join_intent_fingerprints.clear();
            state.failed_attempts = 0;
            state.responder.take()
        };

        if let Some(responder) = responder {
            responder.stop_responder();
        }

        // Dropping the only sender closes the intent handoff.
        if let Ok(mut tx) = self.intents_tx.lock() {
            tx.take();
        }

        self.signal_exit(cause.clone());

        if let Some(cause) = cause {
            tracing::info!(role = %self.role, cause = %cause, "🛑 Session stopped");
            self.gateway.context().cancel(cause);
        } else {
            tracing::info!(role = %self.role, "Session finished");
        }
    }
}

impl std::fmt::Debug for Session {
    /// Never prints the passphrase. State is skipped while it is locked.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("Session");
        out.field("role", &self.role);
        if let Ok(state) = self.state.try_read() {
            out.field("trusted", &state.trust_store.keys().collect::<Vec<_>>())
                .field("failed_attempts", &state.failed_attempts)
                .field("expires_at", &state.expires_at)
                .field("stopped", &state.stopped);
        }
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::tests::test_certificate;
    use crate::context::Context;
    use crate::gateway::tests::gateway_pair;

    async fn test_session(role: SessionRole) -> (Session, Arc<Gateway>) {
        let ctx = Context::new();
        let (server, client) = gateway_pair(&ctx).await;
        let session = Session::new(role, None, server).unwrap();
        (session, client)
    }

    #[tokio::test]
    async fn test_generates_passphrase_when_missing() {
        let (session, _peer) = test_session(SessionRole::Initiating).await;
        let passphrase = session.passphrase().await;

        assert_eq!(passphrase.split(' ').count(), 4);
    }

    #[tokio::test]
    async fn test_debug_hides_passphrase() {
        let (session, _peer) = test_session(SessionRole::Joining).await;
        session.allow("node1", test_certificate("node1")).await.unwrap();
        let passphrase = session.passphrase().await;

        let printed = format!("{session:?}");
        assert!(printed.contains("Joining"), "{printed}");
        assert!(printed.contains("node1"), "{printed}");
        for word in passphrase.split(' ') {
            assert!(!printed.contains(word), "{printed}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_intent_rejected() {
        let (session, _peer) = test_session(SessionRole::Initiating).await;

        for fingerprint in ["abc123", "def456"] {
            session.register_intent(fingerprint).await.unwrap();
            let err = session.register_intent(fingerprint).await.unwrap_err();
            assert_eq!(err.to_string(), "Fingerprint already exists");
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_ceiling() {
        let (session, _peer) = test_session(SessionRole::Initiating).await;

        for _ in 0..MAX_FAILED_ATTEMPTS {
            session.register_failed_attempt().await.unwrap();
        }

        let err = session.register_failed_attempt().await.unwrap_err();
        assert!(matches!(err, SessionError::TooManyFailedAttempts));
        assert!(session.register_failed_attempt().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_failed_attempts_respect_ceiling() {
        let (session, _peer) = test_session(SessionRole::Initiating).await;
        let session = Arc::new(session);

        let mut tasks = Vec::new();
        for _ in 0..(MAX_FAILED_ATTEMPTS + 10) {
            let session = session.clone();
            tasks.push(tokio::spawn(async move { session.register_failed_attempt().await.is_ok() }));
        }

        let mut succeeded = 0;
        for task in tasks {
            if task.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, MAX_FAILED_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_trust_store_is_a_copy() {
        let (session, _peer) = test_session(SessionRole::Joining).await;
        session.allow("node2", test_certificate("node2")).await.unwrap();

        let mut copy = session.temporary_trust_store().await;
        copy.clear();

        assert!(session.temporary_trust_store().await.contains_key("node2"));
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let (session, peer) = test_session(SessionRole::Initiating).await;
        session.allow("node2", test_certificate("node2")).await.unwrap();

        session.stop(Some(Cause::new("Operator aborted"))).await;
        session.stop(Some(Cause::new("Second stop"))).await;
        session.stop(None).await;

        assert!(session.is_stopped().await);
        assert!(session.passphrase().await.is_empty());
        assert!(session.temporary_trust_store().await.is_empty());
        assert!(session.next_intent().await.is_none());
        assert_eq!(session.exited().await, Some(Cause::new("Operator aborted")));
        assert!(matches!(session.register_intent("abc").await, Err(SessionError::Stopped)));

        peer.context().cancelled().await;
        assert_eq!(peer.context().cause(), Some(Cause::new("Operator aborted")));
    }

    #[tokio::test]
    async fn test_publish_waits_for_consumer() {
        let (session, _peer) = test_session(SessionRole::Initiating).await;

        let err = session
            .publish_intent(JoinIntent::default(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoConsumer));

        let session = Arc::new(session);
        let consumer = {
            let session = session.clone();
            tokio::spawn(async move { session.next_intent().await })
        };

        let intent = JoinIntent {
            name: "node2".to_string(),
            ..Default::default()
        };
        session
            .publish_intent(intent.clone(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(consumer.await.unwrap(), Some(intent));
    }
}
