//! Scripted transport for tests.
//!
//! A connector that behaves like the real network closely enough to drive
//! the session state machine: bound credentials open immediately, anything
//! else gets a pairing code, and tests push further events by hand.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{
    CloseSignal, OutgoingContent, SendReceipt, Transport, TransportConnector, TransportEvent,
    TransportSession,
};
use crate::error::TransportError;
use crate::vault::CredentialMaterial;
use crate::vault::fixtures::sample_material;

pub(crate) struct ScriptedTransport {
    sent: Mutex<Vec<(String, OutgoingContent)>>,
    sequence: AtomicU32,
    probe_healthy: AtomicBool,
    logged_out: AtomicBool,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new(probe_healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(0),
            probe_healthy: AtomicBool::new(probe_healthy),
            logged_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn sent(&self) -> Vec<(String, OutgoingContent)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn set_probe_healthy(&self, healthy: bool) {
        self.probe_healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        target: &str,
        content: &OutgoingContent,
    ) -> Result<SendReceipt, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), content.clone()));
        Ok(SendReceipt {
            message_id: format!("SENT-{}", n),
            timestamp: Utc::now(),
        })
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.probe_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ProbeFailed {
                reason: "no pong".to_string(),
            })
        }
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    connects: u32,
    codes_issued: u32,
    fail_next: Option<CloseSignal>,
    last_credentials: Option<Option<CredentialMaterial>>,
    probe_unhealthy: bool,
    current: Option<(Arc<ScriptedTransport>, mpsc::Sender<TransportEvent>)>,
}

#[derive(Default)]
pub(crate) struct ScriptedConnector {
    state: Mutex<ConnectorState>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Credentials passed to the most recent `connect`.
    pub(crate) fn last_credentials(&self) -> Option<Option<CredentialMaterial>> {
        self.state.lock().unwrap().last_credentials.clone()
    }

    pub(crate) fn transport(&self) -> Option<Arc<ScriptedTransport>> {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(t, _)| Arc::clone(t))
    }

    /// Fail the next handshake with `signal`.
    pub(crate) fn fail_next_connect(&self, signal: CloseSignal) {
        self.state.lock().unwrap().fail_next = Some(signal);
    }

    pub(crate) fn set_probe_healthy(&self, healthy: bool) {
        let mut state = self.state.lock().unwrap();
        state.probe_unhealthy = !healthy;
        if let Some((transport, _)) = &state.current {
            transport.set_probe_healthy(healthy);
        }
    }

    /// Push an event on the current transport's stream.
    pub(crate) async fn emit(&self, event: TransportEvent) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(_, tx)| tx.clone());
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }

    pub(crate) async fn issue_code(&self) {
        let code = self.next_code();
        self.emit(TransportEvent::PairingCodeIssued(code)).await;
    }

    /// Finish pairing: persist bound credentials, then open.
    pub(crate) async fn complete_pairing(&self, identity: &str) {
        self.emit(TransportEvent::CredentialUpdated(sample_material(Some(
            identity,
        ))))
        .await;
        self.emit(TransportEvent::Opened {
            identity: identity.to_string(),
        })
        .await;
    }

    pub(crate) async fn close(&self, signal: CloseSignal) {
        self.emit(TransportEvent::Closed(signal)).await;
    }

    fn next_code(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.codes_issued += 1;
        format!("Q-{:04}", state.codes_issued)
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(
        &self,
        _agent_id: &str,
        credentials: Option<CredentialMaterial>,
    ) -> Result<TransportSession, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        let opening = {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            state.last_credentials = Some(credentials.clone());
            if let Some(signal) = state.fail_next.take() {
                return Err(TransportError::Handshake {
                    reason: signal.reason.clone(),
                    signal: Some(signal),
                });
            }
            let transport = ScriptedTransport::new(!state.probe_unhealthy);
            state.current = Some((Arc::clone(&transport), tx.clone()));
            transport
        };

        let first = match credentials.as_ref().and_then(|c| c.identity()) {
            Some(identity) if credentials.as_ref().is_some_and(|c| c.is_bound()) => {
                TransportEvent::Opened {
                    identity: identity.to_string(),
                }
            }
            _ => TransportEvent::PairingCodeIssued(self.next_code()),
        };
        let _ = tx.try_send(first);

        Ok(TransportSession {
            handle: opening,
            events: rx,
        })
    }
}
