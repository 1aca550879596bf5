use crate::executor::{Action, ActionError, ActionExecutor};
use crate::model::ConnectOutcome;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Unauthorized,
    Connected,
    TimedOut,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected | Unauthorized | TimedOut | Connected, Connecting)
                | (Connecting, Connected | Unauthorized | TimedOut)
                | (Connected, Disconnected)
        )
    }
}

/// What the debug bridge reports for one device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Device,
    Unauthorized,
    Offline,
    Absent,
}

/// The debug-bridge transport a session runs over.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Tears the bridge down and brings it back up.
    async fn reset(&self) -> Result<(), ActionError>;
    async fn request_connect(&self, address: &str) -> Result<(), ActionError>;
    async fn request_disconnect(&self, address: &str) -> Result<(), ActionError>;
    async fn status(&self, address: &str) -> Result<DeviceStatus, ActionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("ADB not connected. Connect first.")]
    NotConnected,
    #[error("{0}")]
    ActionFailed(#[from] ActionError),
}

impl SessionError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotConnected => 500,
            Self::ActionFailed(err) => err.status_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub target_address: Option<String>,
    pub state: SessionState,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Session {
    target: Option<String>,
    state: SessionState,
    last_error: Option<String>,
}

struct InFlight {
    address: String,
    done: watch::Receiver<Option<ConnectOutcome>>,
}

/// Owns the single process-wide device session.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn ActionExecutor>,
    session: Mutex<Session>,
    inflight: Mutex<Option<InFlight>>,
    poll_interval: Duration,
    poll_attempts: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn ActionExecutor>,
        poll_interval: Duration,
        poll_attempts: u32,
    ) -> Self {
        Self {
            transport,
            executor,
            session: Mutex::new(Session {
                target: None,
                state: SessionState::Disconnected,
                last_error: None,
            }),
            inflight: Mutex::new(None),
            poll_interval,
            poll_attempts: poll_attempts.max(1),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = lock(&self.session);
        SessionSnapshot {
            target_address: session.target.clone(),
            state: session.state,
            last_error: session.last_error.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.session).state == SessionState::Connected
    }

    fn connected_address(&self) -> Option<String> {
        let session = lock(&self.session);
        match session.state {
            SessionState::Connected => session.target.clone(),
            _ => None,
        }
    }

    fn transition(&self, next: SessionState, target: Option<&str>, last_error: Option<String>) {
        let mut session = lock(&self.session);
        if !session.state.can_transition_to(next) {
            tracing::warn!(from = ?session.state, to = ?next, "rejected session transition");
            return;
        }
        tracing::info!(
            from = ?session.state,
            to = ?next,
            address = target.or(session.target.as_deref()).unwrap_or("-"),
            "session transition"
        );
        session.state = next;
        if let Some(target) = target {
            session.target = Some(target.to_string());
        }
        session.last_error = last_error;
    }

    /// Connects to `address`, or joins the attempt already in flight.
    ///
    /// Only one attempt runs at a time. Callers asking for the address being
    /// attempted get that attempt's outcome; callers asking for another
    /// address wait for it to finish and then start their own.
    pub async fn connect(self: &Arc<Self>, address: &str) -> ConnectOutcome {
        let address = address.trim();
        loop {
            let (joined, mut done) = {
                let mut slot = lock(&self.inflight);
                match slot.as_ref() {
                    Some(inflight) => (inflight.address == address, inflight.done.clone()),
                    None => {
                        if self.connected_address().as_deref() == Some(address) {
                            return ConnectOutcome::AlreadyConnected;
                        }
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(InFlight {
                            address: address.to_string(),
                            done: rx.clone(),
                        });
                        let manager = Arc::clone(self);
                        let target = address.to_string();
                        tokio::spawn(async move {
                            let outcome = manager.run_attempt(&target).await;
                            *lock(&manager.inflight) = None;
                            let _ = tx.send(Some(outcome));
                        });
                        (true, rx)
                    }
                }
            };

            let outcome = match done.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };
            match (joined, outcome) {
                (true, Some(outcome)) => return outcome,
                (false, Some(_)) => continue,
                (joined, None) => {
                    self.abandon_attempt(&done);
                    if joined {
                        return ConnectOutcome::InternalError(
                            "connect attempt aborted".to_string(),
                        );
                    }
                }
            }
        }
    }

    fn abandon_attempt(&self, done: &watch::Receiver<Option<ConnectOutcome>>) {
        let mut slot = lock(&self.inflight);
        if slot
            .as_ref()
            .is_some_and(|inflight| inflight.done.same_channel(done))
        {
            *slot = None;
            drop(slot);
            tracing::error!("connect attempt ended without an outcome");
            self.transition(
                SessionState::TimedOut,
                None,
                Some("connect attempt aborted".to_string()),
            );
        }
    }

    async fn run_attempt(&self, address: &str) -> ConnectOutcome {
        self.transition(SessionState::Connecting, Some(address), None);

        if let Ok(DeviceStatus::Device) = self.transport.status(address).await {
            tracing::info!(address, "device already attached to bridge");
            self.transition(SessionState::Connected, None, None);
            return ConnectOutcome::AlreadyConnected;
        }

        if let Err(err) = self.transport.reset().await {
            tracing::warn!(error = %err, "bridge reset failed");
        }
        if let Err(err) = self.transport.request_connect(address).await {
            tracing::warn!(address, error = %err, "bridge connect request failed");
        }

        for attempt in 1..=self.poll_attempts {
            match self.transport.status(address).await {
                Ok(DeviceStatus::Device) => {
                    self.transition(SessionState::Connected, None, None);
                    return ConnectOutcome::Connected;
                }
                Ok(DeviceStatus::Unauthorized) => {
                    let outcome = ConnectOutcome::Unauthorized;
                    self.transition(SessionState::Unauthorized, None, Some(outcome.message()));
                    return outcome;
                }
                Ok(status) => tracing::debug!(address, attempt, ?status, "device not ready"),
                Err(err) => tracing::debug!(address, attempt, error = %err, "status poll failed"),
            }
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        let outcome = ConnectOutcome::TimedOut;
        self.transition(SessionState::TimedOut, None, Some(outcome.message()));
        outcome
    }

    /// Runs `action` on the connected device.
    pub async fn execute(&self, action: &Action) -> Result<String, SessionError> {
        let Some(address) = self.connected_address() else {
            return Err(SessionError::NotConnected);
        };
        match self.executor.perform(action).await {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::warn!(%action, error = %err, "action failed");
                self.verify_link(&address).await;
                Err(SessionError::ActionFailed(err))
            }
        }
    }

    /// Runs `action` whatever the session state. A failure while connected
    /// still checks whether the device went away.
    pub async fn execute_ungated(&self, action: &Action) -> Result<String, SessionError> {
        match self.executor.perform(action).await {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::warn!(%action, error = %err, "ungated action failed");
                if let Some(address) = self.connected_address() {
                    self.verify_link(&address).await;
                }
                Err(SessionError::ActionFailed(err))
            }
        }
    }

    async fn verify_link(&self, address: &str) {
        match self.transport.status(address).await {
            Ok(DeviceStatus::Device) => {}
            Ok(status) => self.mark_disconnected(address, &format!("device is {status:?}")),
            Err(err) => tracing::debug!(address, error = %err, "link check failed"),
        }
    }

    /// Records that the connected device went away.
    pub fn mark_disconnected(&self, address: &str, reason: &str) {
        let mut session = lock(&self.session);
        if session.state == SessionState::Connected && session.target.as_deref() == Some(address) {
            tracing::info!(address, reason, "session disconnected");
            session.state = SessionState::Disconnected;
            session.last_error = Some(reason.to_string());
        }
    }

    /// Drops the current connection. Returns false when nothing was connected.
    pub async fn disconnect(&self) -> bool {
        let Some(address) = self.connected_address() else {
            return false;
        };
        if let Err(err) = self.transport.request_disconnect(&address).await {
            tracing::warn!(address = %address, error = %err, "bridge disconnect request failed");
        }
        self.mark_disconnected(&address, "disconnected by request");
        true
    }
}
