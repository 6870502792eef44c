//! Async driver for the [`Authenticator`].
//!
//! The state machine runs inside one tokio task and is reached through a
//! cloneable [`AuthHandle`]. The service carries out the effects that need a
//! clock or a collaborator itself: it arms and cancels the completion wait
//! timer and runs the [`AttestationSigner`], feeding their results back in
//! as events. Everything else is returned to the caller of
//! [`AuthHandle::dispatch`].
//!
//! ```ignore
//! let handle = AuthService::new(authenticator, Arc::new(signer))
//!     .with_observer(Arc::new(observer))
//!     .start();
//! let effects = handle.dispatch(AuthEvent::Load { params }).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::attestation::AttestationOutcome;
use crate::authenticator::{AuthEffect, AuthEvent, Authenticator};
use crate::error::{BridgeError, Result};
use crate::messages::Secret;

/// Capacity of the request queue.
const SERVICE_QUEUE_DEPTH: usize = 64;

/// Computes the device attestation response for a challenge.
#[async_trait]
pub trait AttestationSigner: Send + Sync {
    async fn sign(&self, url: &str, challenge: &str) -> Result<Secret>;
}

/// Receives effects produced without a caller waiting for them, i.e. those
/// caused by an elapsed timer or a finished signature.
pub trait AuthObserver: Send + Sync {
    fn on_effects(&self, effects: &[AuthEffect]);
}

impl AuthObserver for () {
    fn on_effects(&self, _effects: &[AuthEffect]) {}
}

enum ServiceRequest {
    Dispatch {
        event: AuthEvent,
        reply: oneshot::Sender<Vec<AuthEffect>>,
    },
    /// Timer or signer result re-entering the state machine.
    Internal(AuthEvent),
    Shutdown,
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch { .. } => f.debug_struct("Dispatch").finish_non_exhaustive(),
            Self::Internal(_) => write!(f, "Internal"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Cloneable handle to a running [`AuthService`].
#[derive(Clone, Debug)]
pub struct AuthHandle {
    tx: mpsc::Sender<ServiceRequest>,
}

impl AuthHandle {
    /// Feed one event and wait for the effects it produced.
    pub async fn dispatch(&self, event: AuthEvent) -> Result<Vec<AuthEffect>> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(ServiceRequest::Dispatch { event, reply })
            .await
            .map_err(|_| BridgeError::ServiceStopped)?;
        reply_rx.await.map_err(|_| BridgeError::ServiceStopped)
    }

    /// Stop the service; outstanding timers and signatures are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ServiceRequest::Shutdown)
            .await
            .map_err(|_| BridgeError::ServiceStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Owns the [`Authenticator`] and its background work.
pub struct AuthService {
    authenticator: Authenticator,
    signer: Arc<dyn AttestationSigner>,
    observer: Arc<dyn AuthObserver>,
    timers: HashMap<u64, JoinHandle<()>>,
    signatures: HashMap<u64, JoinHandle<()>>,
}

impl AuthService {
    pub fn new(authenticator: Authenticator, signer: Arc<dyn AttestationSigner>) -> Self {
        Self {
            authenticator,
            signer,
            observer: Arc::new(()),
            timers: HashMap::new(),
            signatures: HashMap::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AuthObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Spawn the service on the current tokio runtime.
    pub fn start(self) -> AuthHandle {
        let (tx, rx) = mpsc::channel(SERVICE_QUEUE_DEPTH);
        // Background tasks only hold a weak sender so dropping every handle
        // still ends the loop.
        let requests = tx.downgrade();
        tokio::spawn(self.run(requests, rx));
        info!("Authentication service started");
        AuthHandle { tx }
    }

    async fn run(
        mut self,
        requests: mpsc::WeakSender<ServiceRequest>,
        mut rx: mpsc::Receiver<ServiceRequest>,
    ) {
        while let Some(request) = rx.recv().await {
            match request {
                ServiceRequest::Dispatch { event, reply } => {
                    let effects = self.process(event, &requests);
                    if reply.send(effects).is_err() {
                        debug!("Dispatch caller went away before the reply");
                    }
                }
                ServiceRequest::Internal(event) => {
                    let effects = self.process(event, &requests);
                    if !effects.is_empty() {
                        self.observer.on_effects(&effects);
                    }
                }
                ServiceRequest::Shutdown => break,
            }
        }

        for (_, task) in self.timers.drain().chain(self.signatures.drain()) {
            task.abort();
        }
        info!("Authentication service stopped");
    }

    fn process(
        &mut self,
        event: AuthEvent,
        requests: &mpsc::WeakSender<ServiceRequest>,
    ) -> Vec<AuthEffect> {
        match &event {
            AuthEvent::DoneTimeout { generation } => {
                self.timers.remove(generation);
            }
            AuthEvent::AttestationResolved { cycle, .. } => {
                self.signatures.remove(cycle);
            }
            _ => {}
        }
        let effects = self.authenticator.handle(event);
        for effect in &effects {
            self.execute(effect, requests);
        }
        effects
    }

    fn execute(&mut self, effect: &AuthEffect, requests: &mpsc::WeakSender<ServiceRequest>) {
        match effect {
            AuthEffect::ArmDoneTimer {
                generation,
                delay_ms,
            } => {
                let task = spawn_done_timer(
                    requests.clone(),
                    *generation,
                    Duration::from_millis(*delay_ms),
                );
                if let Some(previous) = self.timers.insert(*generation, task) {
                    previous.abort();
                }
            }
            AuthEffect::CancelDoneTimer { generation } => {
                if let Some(task) = self.timers.remove(generation) {
                    task.abort();
                }
            }
            AuthEffect::ComputeAttestation {
                cycle,
                url,
                challenge,
            } => {
                let task = spawn_signature(
                    requests.clone(),
                    Arc::clone(&self.signer),
                    *cycle,
                    url.clone(),
                    challenge.clone(),
                );
                self.signatures.insert(*cycle, task);
            }
            _ => {}
        }
    }
}

impl fmt::Debug for AuthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("authenticator", &self.authenticator)
            .field("timers", &self.timers.len())
            .field("signatures", &self.signatures.len())
            .finish_non_exhaustive()
    }
}

fn spawn_done_timer(
    requests: mpsc::WeakSender<ServiceRequest>,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        reenter(&requests, AuthEvent::DoneTimeout { generation }).await;
    })
}

#[instrument(skip(requests, signer, challenge))]
fn spawn_signature(
    requests: mpsc::WeakSender<ServiceRequest>,
    signer: Arc<dyn AttestationSigner>,
    cycle: u64,
    url: String,
    challenge: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = match signer.sign(&url, &challenge).await {
            Ok(response) => AttestationOutcome::Success { response },
            Err(err) => {
                warn!(cycle, error = %err, "Attestation signer failed");
                AttestationOutcome::Failure {
                    reason: err.to_string(),
                }
            }
        };
        reenter(&requests, AuthEvent::AttestationResolved { cycle, outcome }).await;
    })
}

async fn reenter(requests: &mpsc::WeakSender<ServiceRequest>, event: AuthEvent) {
    let Some(tx) = requests.upgrade() else {
        debug!("Service stopped before background result arrived");
        return;
    };
    if tx.send(ServiceRequest::Internal(event)).await.is_err() {
        debug!("Service stopped before background result arrived");
    }
}
