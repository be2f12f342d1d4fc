//! CanvasCommandBridge: the command/response/event protocol for driving a
//! remote drawing surface (2D or hardware-accelerated) living inside an
//! execution unit.
//!
//! Commands get monotonically increasing ids from the supervisor and are
//! correlated to exactly one response; events are unsolicited and may
//! arrive interleaved with responses at any time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};
use crate::unit::{ExecutionUnit, UnitId};

/// Monotonically increasing id assigned by the supervisor to every command.
pub type CommandId = u64;

/// Command kinds a supervisor may issue to a remote canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Must be the first command issued; transfers surface ownership
    /// exactly once.
    Init,
    /// Idempotent for identical dimensions.
    Resize,
    Clear,
    /// May be issued before prior `Render` responses arrive; the unit may
    /// coalesce and respond only to the most recent.
    Render,
    /// Releases unit-local resources; subsequent commands must fail.
    Dispose,
    StartEffect,
    StopEffect,
    UpdatePosition,
}

/// Supervisor → unit command envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasCommand {
    /// Monotonically increasing id, unique per bridge instance.
    pub id: CommandId,
    /// Command kind.
    pub kind: CommandKind,
    /// Kind-specific parameters.
    pub params: serde_json::Value,
}

/// Unit → supervisor response envelope; correlates 1:1 with a [`CanvasCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasResponse {
    /// Id of the command this responds to.
    pub command_id: CommandId,
    /// Whether the command succeeded.
    pub success: bool,
    /// Result payload on success.
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// Unsolicited unit → supervisor event; not tied to any command id and may
/// arrive at any time, including interleaved with responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CanvasEvent {
    /// Emitted once, after a successful `Init`.
    Ready,
    Resize { width: u32, height: u32 },
    /// `render_id` identifies which (possibly coalesced) `Render` this
    /// completion corresponds to.
    RenderComplete { render_id: CommandId, time_ms: u64 },
    Error { message: String },
    Progress { data: serde_json::Value },
}

/// Envelope wrapping everything a unit may emit while driving a canvas.
/// Distinct from [`CanvasResponse`]/[`CanvasEvent`] so the bridge can
/// dispatch by shape; also tolerates bare liveness pings that don't match
/// the envelope format at all (bare `{timestamp}` or bare
/// `{status: "ready"}` payloads, for instance).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UnitOutput {
    Response(CanvasResponse),
    Event(CanvasEvent),
    /// Any other JSON value; treated as a liveness signal only.
    Opaque(serde_json::Value),
}

struct PendingCommand {
    responded: oneshot::Sender<CanvasResponse>,
}

/// Drives one remote canvas living inside a single [`ExecutionUnit`].
///
/// Correlates outgoing commands with incoming responses by id; forwards
/// events to a broadcast channel callers can subscribe to independently.
pub struct CanvasCommandBridge {
    unit: Arc<dyn ExecutionUnit>,
    next_id: AtomicU64,
    pending: tokio::sync::Mutex<HashMap<CommandId, PendingCommand>>,
    events_tx: tokio::sync::broadcast::Sender<CanvasEvent>,
    disposed: std::sync::atomic::AtomicBool,
    response_timeout: Duration,
}

impl CanvasCommandBridge {
    /// Wrap `unit` as a canvas bridge. `response_timeout` bounds how long
    /// [`CanvasCommandBridge::send`] waits for a correlated response before
    /// failing with [`PoolError::Timeout`]-equivalent behavior (soft:
    /// the command is not retried, the caller decides what to do next).
    pub fn new(unit: Arc<dyn ExecutionUnit>, response_timeout: Duration) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            unit,
            next_id: AtomicU64::new(1),
            pending: tokio::sync::Mutex::new(HashMap::new()),
            events_tx,
            disposed: std::sync::atomic::AtomicBool::new(false),
            response_timeout,
        }
    }

    /// Subscribe to unsolicited canvas events (readiness, resize,
    /// render-complete, errors, progress).
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CanvasEvent> {
        self.events_tx.subscribe()
    }

    /// Issue `kind` with `params` and await its correlated response.
    ///
    /// `Init` is the only kind this bridge does not itself enforce must
    /// come first — the caller (and, ultimately, the unit) owns that
    /// invariant; this method only assigns ids and correlates replies.
    pub async fn send(&self, kind: CommandKind, params: serde_json::Value) -> PoolResult<CanvasResponse> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PoolError::Protocol("bridge disposed; commands no longer accepted".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let command = CanvasCommand { id, kind, params };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingCommand { responded: tx });

        let envelope = serde_json::json!({ "type": "COMMAND", "id": id, "data": command });
        self.unit.post_message(crate::unit::UnitMessage::Custom(envelope)).await?;

        if kind == CommandKind::Dispose {
            self.disposed.store(true, Ordering::SeqCst);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(PoolError::Protocol(format!("unit dropped before responding to command {id}"))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PoolError::Protocol(format!("command {id} timed out waiting for a response")))
            }
        }
    }

    /// Feed one message received from the unit into the bridge. Resolves
    /// the matching pending command on a [`UnitOutput::Response`], forwards
    /// [`UnitOutput::Event`]s to subscribers, and logs-and-ignores anything
    /// else (bare liveness signals, malformed envelopes). Protocol errors
    /// like these are recovered locally and never surfaced to callers
    /// awaiting a specific command.
    pub async fn dispatch_incoming(&self, raw: serde_json::Value) {
        match serde_json::from_value::<UnitOutput>(raw) {
            Ok(UnitOutput::Response(response)) => {
                if let Some(pending) = self.pending.lock().await.remove(&response.command_id) {
                    let _ = pending.responded.send(response);
                } else {
                    warn!(command_id = response.command_id, "response to unknown or already-resolved command");
                }
            }
            Ok(UnitOutput::Event(event)) => {
                let _ = self.events_tx.send(event);
            }
            Ok(UnitOutput::Opaque(value)) => {
                debug!(?value, "treating non-envelope unit message as liveness signal");
            }
            Err(e) => {
                warn!(error = %e, "malformed canvas envelope from unit, ignoring");
            }
        }
    }

    /// Id of the unit this bridge drives.
    pub fn unit_id(&self) -> UnitId {
        self.unit.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_deserializes_from_envelope_json() {
        let raw = serde_json::json!({ "command_id": 3, "success": true, "data": {"ok": true}, "error": null });
        let out: UnitOutput = serde_json::from_value(raw).unwrap();
        assert!(matches!(out, UnitOutput::Response(r) if r.command_id == 3 && r.success));
    }

    #[test]
    fn bare_liveness_ping_parses_as_opaque() {
        let raw = serde_json::json!({ "status": "ready" });
        let out: UnitOutput = serde_json::from_value(raw).unwrap();
        assert!(matches!(out, UnitOutput::Opaque(_)));
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_pending_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let unit = crate::unit::SimulatedUnit::spawn("canvas", tx);
        let bridge = CanvasCommandBridge::new(unit, Duration::from_millis(200));

        let id = 1u64;
        bridge.pending.lock().await.insert(id, PendingCommand { responded: oneshot::channel().0 });
        // Replace with a channel we can observe.
        let (resp_tx, resp_rx) = oneshot::channel();
        bridge.pending.lock().await.insert(id, PendingCommand { responded: resp_tx });

        bridge
            .dispatch_incoming(serde_json::json!({ "command_id": id, "success": true, "data": null, "error": null }))
            .await;

        let response = resp_rx.await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn event_is_broadcast_to_subscribers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let unit = crate::unit::SimulatedUnit::spawn("canvas", tx);
        let bridge = CanvasCommandBridge::new(unit, Duration::from_millis(200));
        let mut sub = bridge.subscribe_events();

        bridge.dispatch_incoming(serde_json::json!("Ready")).await;
        let ev = sub.recv().await.unwrap();
        assert!(matches!(ev, CanvasEvent::Ready));
    }
}
