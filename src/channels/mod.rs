//! The two realtime channels: raw remote keys and free text.
//!
//! Both loops are written against [`ChannelIo`] so they run the same over a
//! websocket or an in-memory pipe.

use crate::catalog::Catalog;
use crate::commands;
use crate::executor::Action;
use crate::model::{RawCommandReply, TextReply, TextRequest};
use crate::resolver::{self, Resolution};
use crate::session::{SessionError, SessionManager};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

pub const RAW_GREETING: &str = "ADB WebSocket connection established. Send a command to execute.";
pub const RAW_NOT_CONNECTED: &str = "ADB not connected. Connect first using /devices/connect.";
pub const CATALOG_BUILDING: &str = "Fetching installed apps from the device. This may take some time as it is only required during the first connection. Please keep the app open and avoid shutting down your system until the process completes...";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// One duplex text channel.
#[async_trait]
pub trait ChannelIo: Send {
    /// Next inbound text frame, `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;
    async fn send(&mut self, frame: String) -> Result<(), ChannelError>;
}

/// Frames a connection may have queued before new ones are turned away.
const QUEUE_DEPTH: usize = 32;

/// Bounds how many device actions run at once across all channel
/// connections.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Starts a worker for one connection.
    ///
    /// Jobs run one at a time in the order they were queued, each holding a
    /// pool permit, and their replies come back in that same order. The
    /// worker stops once the reply receiver is dropped, leaving any queued
    /// jobs unrun.
    pub fn ordered<J, R, F, Fut>(&self, handler: F) -> (mpsc::Sender<J>, mpsc::Receiver<R>)
    where
        J: Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (job_tx, mut job_rx) = mpsc::channel::<J>(QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel::<R>(QUEUE_DEPTH);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                if reply_tx.is_closed() {
                    break;
                }
                let reply = {
                    let Ok(_permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    handler(job).await
                };
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
        });
        (job_tx, reply_rx)
    }
}

/// Everything a channel loop needs from the rest of the process.
#[derive(Clone)]
pub struct ChannelContext {
    pub session: Arc<SessionManager>,
    pub catalog: Arc<Catalog>,
    pub pool: WorkerPool,
    pub threshold: f64,
    /// Route free-text launches and commands through the connected check.
    pub gate_text_commands: bool,
}

impl ChannelContext {
    /// Runs an action requested by free text or a direct app launch.
    pub async fn dispatch(&self, action: &Action) -> Result<String, SessionError> {
        if self.gate_text_commands {
            self.session.execute(action).await
        } else {
            self.session.execute_ungated(action).await
        }
    }
}

async fn send_json<T: Serialize>(io: &mut dyn ChannelIo, value: &T) -> Result<(), ChannelError> {
    let frame = serde_json::to_string(value)
        .map_err(|err| ChannelError::Transport(format!("encode failed: {err}")))?;
    io.send(frame).await
}

/// Pumps frames into a connection's worker and its replies back out, until
/// the peer disconnects or the transport fails. Receiving never waits on a
/// running job.
async fn serve_ordered<R: Serialize>(
    io: &mut dyn ChannelIo,
    connection: Uuid,
    jobs: mpsc::Sender<String>,
    mut replies: mpsc::Receiver<R>,
    busy: impl Fn() -> R,
) {
    loop {
        tokio::select! {
            frame = io.recv() => {
                let frame = match frame {
                    None => break,
                    Some(Err(err)) => {
                        tracing::warn!(%connection, error = %err, "channel transport error");
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };
                match jobs.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(%connection, "channel queue full, frame rejected");
                        if send_json(io, &busy()).await.is_err() {
                            break;
                        }
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Some(reply) = replies.recv() => {
                if let Err(err) = send_json(io, &reply).await {
                    tracing::debug!(%connection, error = %err, "reply not delivered");
                    break;
                }
            }
        }
    }
}

async fn run_raw_token(session: &SessionManager, token: &str) -> RawCommandReply {
    let Some(entry) = commands::lookup_raw_token(token) else {
        tracing::debug!(token, "unknown raw token");
        return RawCommandReply::invalid_command();
    };
    match session.execute(&entry.action).await {
        Ok(_) => RawCommandReply::ok(),
        Err(err) => RawCommandReply::failed(err.status_code(), err.to_string()),
    }
}

/// Raw key-command loop. Tokens reach the device in the order they were
/// sent, and replies follow that order.
pub async fn run_raw_command_channel(io: &mut dyn ChannelIo, ctx: &ChannelContext) {
    let connection = Uuid::new_v4();
    if !ctx.session.is_connected() {
        tracing::info!(%connection, "raw channel refused, session not connected");
        let _ = send_json(io, &serde_json::json!({ "error": RAW_NOT_CONNECTED })).await;
        return;
    }
    if io.send(RAW_GREETING.to_string()).await.is_err() {
        return;
    }
    tracing::info!(%connection, "raw channel opened");

    let session = Arc::clone(&ctx.session);
    let (jobs, replies) = ctx.pool.ordered(move |token: String| {
        let session = Arc::clone(&session);
        async move { run_raw_token(&session, &token).await }
    });
    serve_ordered(io, connection, jobs, replies, || {
        RawCommandReply::failed(429, "Too many pending commands.")
    })
    .await;
    tracing::info!(%connection, "raw channel closed");
}

fn no_match_message(text: &str, catalog_loaded: bool) -> String {
    if catalog_loaded {
        format!("No matches found for '{text}'")
    } else {
        CATALOG_BUILDING.to_string()
    }
}

/// Answers one free-text frame.
pub async fn handle_text_frame(ctx: &ChannelContext, frame: &str) -> TextReply {
    let request: TextRequest = match serde_json::from_str(frame) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(error = %err, "malformed text frame");
            return TextReply::error("Invalid message. Expected {\"text\": \"...\"}.");
        }
    };
    let text = request.text.trim().to_string();
    if text.is_empty() {
        return TextReply::error("No text provided.");
    }

    let catalog = ctx.catalog.snapshot();
    match resolver::resolve_command(&text, catalog.as_deref(), ctx.threshold) {
        Resolution::LaunchApp { app_id, matches } => {
            match ctx.dispatch(&Action::LaunchApp(app_id)).await {
                Ok(message) => TextReply::Launched {
                    text,
                    matches,
                    message,
                },
                Err(err) => TextReply::LaunchFailed {
                    text,
                    matches,
                    error: err.to_string(),
                },
            }
        }
        Resolution::Command { phrase, action } => match ctx.dispatch(&action).await {
            Ok(output) => TextReply::Command {
                text,
                command: phrase,
                output,
            },
            Err(err) => TextReply::CommandFailed {
                text,
                command: phrase,
                error: err.to_string(),
            },
        },
        Resolution::NoMatch {
            extracted,
            catalog_loaded,
        } => {
            let building = ctx.catalog.is_building();
            tracing::debug!(extracted = %extracted, catalog_loaded, building, "no match for text");
            let message = no_match_message(&text, !building);
            TextReply::NoMatch {
                text,
                matches: Vec::new(),
                message,
            }
        }
    }
}

/// Free-text loop. Every frame gets exactly one reply, in arrival order.
pub async fn run_text_channel(io: &mut dyn ChannelIo, ctx: &ChannelContext) {
    let connection = Uuid::new_v4();
    tracing::info!(%connection, "text channel opened");
    let worker_ctx = ctx.clone();
    let (jobs, replies) = ctx.pool.ordered(move |frame: String| {
        let ctx = worker_ctx.clone();
        async move { handle_text_frame(&ctx, &frame).await }
    });
    serve_ordered(io, connection, jobs, replies, || {
        TextReply::error("Too many pending requests.")
    })
    .await;
    tracing::info!(%connection, "text channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::FakeInspector;
    use crate::catalog::{spawn_population, PopulationOptions};
    use crate::model::{CatalogEntry, ConnectOutcome};
    use crate::resolver::DEFAULT_THRESHOLD;
    use crate::session::tests::{manager_with, FakeBridge};
    use crate::session::DeviceStatus;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    struct MemoryChannel {
        inbound: UnboundedReceiver<String>,
        outbound: UnboundedSender<String>,
    }

    #[async_trait]
    impl ChannelIo for MemoryChannel {
        async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
            self.outbound.send(frame).map_err(|_| ChannelError::Transport("peer gone".to_string()))
        }
    }

    struct Peer {
        to_server: UnboundedSender<String>,
        from_server: UnboundedReceiver<String>,
    }

    impl Peer {
        fn say(&self, frame: &str) {
            self.to_server.send(frame.to_string()).unwrap();
        }

        async fn next(&mut self) -> String {
            timeout(Duration::from_secs(2), self.from_server.recv())
                .await
                .expect("reply in time")
                .expect("channel open")
        }

        async fn next_json(&mut self) -> serde_json::Value {
            serde_json::from_str(&self.next().await).unwrap()
        }
    }

    fn pipe() -> (MemoryChannel, Peer) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        (
            MemoryChannel { inbound, outbound },
            Peer {
                to_server,
                from_server,
            },
        )
    }

    fn context(
        bridge: Arc<FakeBridge>,
        dir: &tempfile::TempDir,
        apps: &[(&str, &str)],
        gate: bool,
    ) -> ChannelContext {
        let catalog = Catalog::open(dir.path().join("app_labels.csv")).unwrap();
        for (id, name) in apps {
            catalog
                .append(CatalogEntry {
                    app_id: id.to_string(),
                    app_name: name.to_string(),
                })
                .unwrap();
        }
        ChannelContext {
            session: manager_with(bridge, 30),
            catalog: Arc::new(catalog),
            pool: WorkerPool::new(4),
            threshold: DEFAULT_THRESHOLD,
            gate_text_commands: gate,
        }
    }

    fn connected_bridge() -> Arc<FakeBridge> {
        Arc::new(FakeBridge::new(&[DeviceStatus::Device], DeviceStatus::Device))
    }

    #[tokio::test]
    async fn raw_channel_refuses_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(connected_bridge(), &dir, &[], false);
        let (mut io, mut peer) = pipe();

        run_raw_command_channel(&mut io, &ctx).await;
        let reply = peer.next_json().await;
        assert_eq!(reply["error"], RAW_NOT_CONNECTED);
        assert!(peer.from_server.try_recv().is_err());
    }

    #[tokio::test]
    async fn raw_channel_rejects_unknown_tokens_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = connected_bridge();
        let ctx = context(bridge.clone(), &dir, &[], false);
        assert_eq!(ctx.session.connect("10.0.0.5:5555").await, ConnectOutcome::Connected);

        let (mut io, mut peer) = pipe();
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move { run_raw_command_channel(&mut io, &loop_ctx).await });

        assert_eq!(peer.next().await, RAW_GREETING);
        peer.say("99");
        assert_eq!(
            peer.next_json().await,
            serde_json::json!({ "status_code": 400, "error_message": "Invalid command." })
        );
        assert!(bridge.performed().is_empty());

        peer.say("keypad:volume_up");
        assert_eq!(peer.next_json().await, serde_json::json!({ "status_code": 200 }));
        assert_eq!(bridge.performed(), vec![Action::KeyEvent("24")]);

        drop(peer);
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_action_does_not_delay_disconnect_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mut bridge = FakeBridge::new(&[DeviceStatus::Device], DeviceStatus::Device);
        bridge.action_delay = Duration::from_secs(30);
        let bridge = Arc::new(bridge);
        let ctx = context(bridge, &dir, &[], false);
        ctx.session.connect("10.0.0.5:5555").await;

        let (mut io, mut peer) = pipe();
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move { run_raw_command_channel(&mut io, &loop_ctx).await });
        assert_eq!(peer.next().await, RAW_GREETING);
        peer.say("home");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop ends while the action is still running")
            .unwrap();
    }

    #[tokio::test]
    async fn raw_tokens_reach_device_in_send_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut bridge = FakeBridge::new(&[DeviceStatus::Device], DeviceStatus::Device);
        bridge.slow_action = Some((Action::KeyEvent("20"), Duration::from_millis(80)));
        let bridge = Arc::new(bridge);
        let ctx = context(bridge.clone(), &dir, &[], false);
        ctx.session.connect("10.0.0.5:5555").await;

        let (mut io, mut peer) = pipe();
        let loop_ctx = ctx.clone();
        tokio::spawn(async move { run_raw_command_channel(&mut io, &loop_ctx).await });
        assert_eq!(peer.next().await, RAW_GREETING);

        peer.say("down");
        peer.say("99");
        peer.say("ok");
        assert_eq!(peer.next_json().await, serde_json::json!({ "status_code": 200 }));
        assert_eq!(peer.next_json().await["status_code"], 400);
        assert_eq!(peer.next_json().await, serde_json::json!({ "status_code": 200 }));
        assert_eq!(
            bridge.performed(),
            vec![Action::KeyEvent("20"), Action::KeyEvent("23")]
        );
    }

    #[tokio::test]
    async fn slow_text_dispatch_does_not_delay_disconnect_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mut bridge = FakeBridge::new(&[DeviceStatus::Device], DeviceStatus::Device);
        bridge.action_delay = Duration::from_secs(30);
        let ctx = context(Arc::new(bridge), &dir, &[("com.netflix.ninja", "Netflix")], false);

        let (mut io, peer) = pipe();
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move { run_text_channel(&mut io, &loop_ctx).await });
        peer.say(r#"{"text": "open netflix"}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop ends while the launch is still running")
            .unwrap();
    }

    #[tokio::test]
    async fn raw_failures_carry_exit_status_and_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = connected_bridge();
        bridge.fail_actions.store(true, std::sync::atomic::Ordering::SeqCst);
        let ctx = context(bridge, &dir, &[], false);
        ctx.session.connect("10.0.0.5:5555").await;

        let (mut io, mut peer) = pipe();
        let loop_ctx = ctx.clone();
        tokio::spawn(async move { run_raw_command_channel(&mut io, &loop_ctx).await });
        peer.next().await;
        peer.say("mute");
        let reply = peer.next_json().await;
        assert_eq!(reply["status_code"], 1);
        assert_eq!(reply["error_message"], "error: device offline");
    }

    #[tokio::test]
    async fn text_channel_survives_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(connected_bridge(), &dir, &[], false);
        let (mut io, mut peer) = pipe();
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move { run_text_channel(&mut io, &loop_ctx).await });

        peer.say(r#"{"text": "   "}"#);
        assert_eq!(peer.next_json().await, serde_json::json!({ "error": "No text provided." }));
        peer.say("not json");
        assert!(peer.next_json().await["error"].is_string());
        peer.say(r#"{"text": "volume up"}"#);
        let reply = peer.next_json().await;
        assert_eq!(reply["command"], "volume up");
        assert_eq!(reply["output"], "ok keyevent 24");

        drop(peer);
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn text_launches_best_match_without_gate() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = connected_bridge();
        let ctx = context(bridge.clone(), &dir, &[("com.netflix.ninja", "Netflix")], false);

        let reply = handle_text_frame(&ctx, r#"{"text": "please open netflix"}"#).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["matches"][0]["app_id"], "com.netflix.ninja");
        assert_eq!(json["matches"][0]["similarity"], 100.0);
        assert_eq!(json["message"], "ok launch com.netflix.ninja");
        assert_eq!(
            bridge.performed(),
            vec![Action::LaunchApp("com.netflix.ninja".to_string())]
        );
    }

    #[tokio::test]
    async fn gated_text_launch_needs_connection() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = connected_bridge();
        let ctx = context(bridge.clone(), &dir, &[("com.netflix.ninja", "Netflix")], true);

        let reply = handle_text_frame(&ctx, r#"{"text": "open netflix"}"#).await;
        match reply {
            TextReply::LaunchFailed { matches, error, .. } => {
                assert_eq!(matches.len(), 1);
                assert_eq!(error, "ADB not connected. Connect first.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(bridge.performed().is_empty());
    }

    #[tokio::test]
    async fn no_match_reports_catalog_state() {
        let dir = tempfile::tempdir().unwrap();
        let empty = context(connected_bridge(), &dir, &[], false);
        let reply = handle_text_frame(&empty, r#"{"text": "open spotify"}"#).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["matches"], serde_json::json!([]));
        assert_eq!(json["message"], CATALOG_BUILDING);

        let dir = tempfile::tempdir().unwrap();
        let loaded = context(connected_bridge(), &dir, &[("com.netflix.ninja", "Netflix")], false);
        let reply = handle_text_frame(&loaded, r#"{"text": "open spotify"}"#).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["message"], "No matches found for 'open spotify'");
    }

    #[tokio::test]
    async fn no_match_reports_building_while_population_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(connected_bridge(), &dir, &[("com.netflix.ninja", "Netflix")], false);
        let mut inspector = FakeInspector::with_labels(&[("com.spotify.tv", "Spotify")]);
        inspector.label_delay = Duration::from_millis(200);
        let options = PopulationOptions {
            work_dir: dir.path().join("apks"),
            deadline: Duration::from_secs(5),
        };
        assert!(spawn_population(
            ctx.catalog.clone(),
            Arc::new(inspector),
            options,
            tokio::sync::watch::channel(false).1,
        ));

        let reply = handle_text_frame(&ctx, r#"{"text": "open spotify"}"#).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["message"], CATALOG_BUILDING);
    }
}
