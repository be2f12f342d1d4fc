//! UnitManager: owns the pool of [`ExecutionUnit`]s, grouped by kind.
//!
//! Per-kind pools bounded by `min_units`/`idle_timeout`, with creation,
//! idle-unit lookup, failure bookkeeping, and reaping of expired idle units
//! all kept separate from circuit-breaker-lite tripping (consecutive
//! failures past a threshold open the breaker for a cooldown window).
//!
//! Like [`crate::queue::TaskQueue`], this is data owned and mutated
//! exclusively by [`crate::pool::WorkerPool`]'s single supervisor task; it
//! holds no internal locks over its own bookkeeping (the units it manages
//! are `Arc`-shared because their background tasks outlive any one borrow).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::task::UnitKind;
use crate::unit::{ExecutionUnit, UnitEvent, UnitFactory, UnitId};

/// Bounds governing one kind's pool of units.
#[derive(Debug, Clone)]
pub struct UnitPoolOptions {
    /// Units of this kind never reaped below this count, even if idle.
    pub min_units: usize,
    /// Pool never grows a kind past this count.
    pub max_units: usize,
    /// Idle units beyond `min_units` are terminated after this long idle.
    pub idle_timeout: Duration,
    /// Consecutive failures within `circuit_window` before the kind's
    /// circuit opens.
    pub circuit_failure_threshold: u32,
    /// Window over which `circuit_failure_threshold` is evaluated.
    pub circuit_window: Duration,
    /// How long an open circuit stays open before probing again.
    pub circuit_cooldown: Duration,
}

impl Default for UnitPoolOptions {
    fn default() -> Self {
        Self {
            min_units: 0,
            max_units: 8,
            idle_timeout: Duration::from_secs(60),
            circuit_failure_threshold: 5,
            circuit_window: Duration::from_secs(30),
            circuit_cooldown: Duration::from_secs(15),
        }
    }
}

/// Per-kind failure tracking for the circuit-breaker-lite.
#[derive(Debug, Default)]
struct CircuitState {
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitState {
    fn record_failure(&mut self, now: Instant, window: Duration) {
        self.failures.push(now);
        self.failures.retain(|t| now.duration_since(*t) <= window);
    }

    fn record_success(&mut self) {
        self.failures.clear();
        self.opened_at = None;
    }

    fn is_open(&self, now: Instant, cooldown: Duration) -> bool {
        match self.opened_at {
            Some(at) => now.duration_since(at) < cooldown,
            None => false,
        }
    }

    fn maybe_open(&mut self, now: Instant, threshold: u32) {
        if self.opened_at.is_none() && self.failures.len() as u32 >= threshold {
            self.opened_at = Some(now);
            self.failures.clear();
        }
    }
}

/// Snapshot of one kind's pool for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UnitKindStats {
    /// Kind these stats describe.
    pub kind: UnitKind,
    /// Units currently registered, regardless of state.
    pub total: usize,
    /// Units currently idle.
    pub idle: usize,
    /// Units currently busy.
    pub busy: usize,
    /// Whether the circuit breaker is currently open for this kind.
    pub circuit_open: bool,
}

struct ManagedKind {
    units: Vec<Arc<dyn ExecutionUnit>>,
    options: UnitPoolOptions,
    circuit: CircuitState,
    /// Units reserved for a task within the current dispatch pass, ahead of
    /// the unit's own state actually flipping to `Busy` (that transition
    /// only happens once the unit's worker processes the message, which
    /// never happens synchronously within `try_dispatch`). Without this, a
    /// still-`Idle` unit would be handed a second task before the first one
    /// it was just given had any chance to mark it busy.
    reserved: HashSet<UnitId>,
}

/// Owns every execution unit the pool has spawned, grouped by kind.
pub struct UnitManager {
    kinds: HashMap<UnitKind, ManagedKind>,
    factory: UnitFactory,
    events_tx: mpsc::UnboundedSender<UnitEvent>,
    default_options: UnitPoolOptions,
}

impl UnitManager {
    /// Construct a manager with `factory` producing new units and
    /// `default_options` applied to any kind not explicitly configured via
    /// [`UnitManager::configure_kind`]. Returns the manager together with
    /// the receiving half of the shared unit event channel, which the
    /// caller (the pool's supervisor loop) drains.
    pub fn new(factory: UnitFactory, default_options: UnitPoolOptions) -> (Self, mpsc::UnboundedReceiver<UnitEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self { kinds: HashMap::new(), factory, events_tx, default_options },
            events_rx,
        )
    }

    /// Set explicit pool bounds for `kind`, overriding the default options.
    pub fn configure_kind(&mut self, kind: impl Into<UnitKind>, options: UnitPoolOptions) {
        let kind = kind.into();
        let entry = self.kinds.entry(kind).or_insert_with(|| ManagedKind {
            units: Vec::new(),
            options: options.clone(),
            circuit: CircuitState::default(),
            reserved: HashSet::new(),
        });
        entry.options = options;
    }

    fn kind_entry(&mut self, kind: &str) -> &mut ManagedKind {
        let default_options = self.default_options.clone();
        self.kinds.entry(kind.to_string()).or_insert_with(|| ManagedKind {
            units: Vec::new(),
            options: default_options,
            circuit: CircuitState::default(),
            reserved: HashSet::new(),
        })
    }

    /// Spawn one new unit of `kind` and register it, unless `kind`'s circuit
    /// breaker is open or it is already at `max_units`.
    pub fn create_unit(&mut self, kind: &str) -> PoolResult<Arc<dyn ExecutionUnit>> {
        let now = Instant::now();
        let entry = self.kind_entry(kind);
        if entry.circuit.is_open(now, entry.options.circuit_cooldown) {
            return Err(PoolError::NoUnitAvailable(kind.to_string()));
        }
        if entry.units.len() >= entry.options.max_units {
            return Err(PoolError::NoUnitAvailable(kind.to_string()));
        }
        let unit = (self.factory)(kind, self.events_tx.clone())?;
        info!(kind, unit = %unit.id(), "spawned execution unit");
        entry.units.push(unit.clone());
        Ok(unit)
    }

    /// Spawn units of `kind` until it holds at least `min_units`, per that
    /// kind's configured bound.
    pub fn ensure_min_units(&mut self, kind: &str) {
        let min = self.kind_entry(kind).options.min_units;
        while self.kind_entry(kind).units.len() < min {
            if self.create_unit(kind).is_err() {
                break;
            }
        }
    }

    /// Return an idle unit of `kind`, spawning one if none are idle and
    /// growth is still permitted. `None` when the circuit is open or the
    /// kind is already at `max_units` and all are busy.
    ///
    /// Does not itself reserve the returned unit — callers assigning it a
    /// task must call [`UnitManager::reserve`] synchronously, in the same
    /// pass, or a second call here before the unit's own state catches up
    /// will hand out the same unit twice.
    pub fn get_idle_unit(&mut self, kind: &str) -> Option<Arc<dyn ExecutionUnit>> {
        if let Some(entry) = self.kinds.get(kind) {
            if let Some(unit) = entry.units.iter().find(|u| u.is_idle() && !entry.reserved.contains(&u.id())) {
                return Some(unit.clone());
            }
        }
        self.create_unit(kind).ok()
    }

    /// Mark `unit_id` (of `kind`) reserved, so [`UnitManager::get_idle_unit`]
    /// won't hand it out again until [`UnitManager::release`] is called.
    pub fn reserve(&mut self, kind: &str, unit_id: UnitId) {
        self.kind_entry(kind).reserved.insert(unit_id);
    }

    /// Clear a reservation made by [`UnitManager::reserve`], once the unit
    /// is actually free again (task completed, failed, was cancelled, or
    /// the unit exited).
    pub fn release(&mut self, kind: &str, unit_id: UnitId) {
        if let Some(entry) = self.kinds.get_mut(kind) {
            entry.reserved.remove(&unit_id);
        }
    }

    /// Record the outcome of a task that ran on `unit`, feeding the
    /// circuit breaker.
    pub fn record_outcome(&mut self, kind: &str, success: bool) {
        let now = Instant::now();
        let entry = self.kind_entry(kind);
        if success {
            entry.circuit.record_success();
        } else {
            entry.circuit.record_failure(now, entry.options.circuit_window);
            entry.circuit.maybe_open(now, entry.options.circuit_failure_threshold);
            if entry.circuit.opened_at.is_some() {
                warn!(kind, "circuit breaker open after repeated unit failures");
            }
        }
    }

    /// Remove `unit_id` from its kind's registry, e.g. after an `Exited`
    /// event. Does not call `terminate` — the unit is already gone.
    pub fn forget(&mut self, unit_id: UnitId) {
        for entry in self.kinds.values_mut() {
            entry.units.retain(|u| u.id() != unit_id);
            entry.reserved.remove(&unit_id);
        }
    }

    /// Terminate and remove idle units beyond `min_units` that have been
    /// idle for at least their kind's `idle_timeout`. Never reaps a busy
    /// unit, regardless of how long its pool has been above `min_units`.
    pub async fn reap_idle(&mut self) {
        let now = std::time::SystemTime::now();
        let mut to_terminate = Vec::new();

        for entry in self.kinds.values_mut() {
            let min = entry.options.min_units;
            let idle_timeout = entry.options.idle_timeout;
            let mut idle_indices: Vec<usize> = entry
                .units
                .iter()
                .enumerate()
                .filter(|(_, u)| u.is_idle() && now.duration_since(u.last_active_at()).unwrap_or_default() >= idle_timeout)
                .map(|(i, _)| i)
                .collect();

            let spare = entry.units.len().saturating_sub(min);
            idle_indices.truncate(spare);

            for &i in idle_indices.iter().rev() {
                to_terminate.push(entry.units.remove(i));
            }
        }

        for unit in to_terminate {
            debug!(unit = %unit.id(), "reaping idle execution unit");
            let _ = unit.terminate(false).await;
        }
    }

    /// Terminate every unit across every kind. `force` is forwarded to each
    /// unit's `terminate`.
    pub async fn close_all(&mut self, force: bool) {
        for entry in self.kinds.values_mut() {
            for unit in entry.units.drain(..) {
                let _ = unit.terminate(force).await;
            }
        }
    }

    /// Snapshot stats for every kind currently registered.
    pub fn stats(&self) -> Vec<UnitKindStats> {
        let now = Instant::now();
        self.kinds
            .iter()
            .map(|(kind, entry)| UnitKindStats {
                kind: kind.clone(),
                total: entry.units.len(),
                idle: entry.units.iter().filter(|u| u.is_idle()).count(),
                busy: entry.units.iter().filter(|u| u.is_busy()).count(),
                circuit_open: entry.circuit.is_open(now, entry.options.circuit_cooldown),
            })
            .collect()
    }

    /// Total number of units registered across all kinds.
    pub fn total_units(&self) -> usize {
        self.kinds.values().map(|e| e.units.len()).sum()
    }

    /// Look up a registered unit by id, regardless of kind.
    pub fn find(&self, id: UnitId) -> Option<Arc<dyn ExecutionUnit>> {
        self.kinds.values().find_map(|entry| entry.units.iter().find(|u| u.id() == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::default_unit_factory;

    fn manager() -> (UnitManager, mpsc::UnboundedReceiver<UnitEvent>) {
        UnitManager::new(default_unit_factory(), UnitPoolOptions { max_units: 2, ..Default::default() })
    }

    #[tokio::test]
    async fn creates_units_up_to_max() {
        let (mut mgr, _rx) = manager();
        assert!(mgr.create_unit("calc").is_ok());
        assert!(mgr.create_unit("calc").is_ok());
        assert!(mgr.create_unit("calc").is_err());
        assert_eq!(mgr.total_units(), 2);
    }

    #[tokio::test]
    async fn get_idle_unit_spawns_when_empty() {
        let (mut mgr, mut rx) = manager();
        let unit = mgr.get_idle_unit("calc").expect("should spawn");
        let _ = rx.recv().await; // Ready event
        tokio::task::yield_now().await;
        assert!(unit.is_idle());
    }

    #[tokio::test]
    async fn reserved_unit_is_not_handed_out_twice_before_its_state_catches_up() {
        let (mut mgr, mut rx) = manager();
        let first = mgr.get_idle_unit("calc").expect("should spawn");
        let _ = rx.recv().await; // Ready event
        tokio::task::yield_now().await;
        assert!(first.is_idle());

        // Simulate start_task's synchronous reservation: the unit's own
        // state hasn't flipped to Busy yet (nothing has run its worker),
        // so without reservation tracking a second call would return it again.
        mgr.reserve("calc", first.id());
        let second = mgr.get_idle_unit("calc").expect("should spawn a second unit");
        assert_ne!(first.id(), second.id());
        assert_eq!(mgr.total_units(), 2);

        mgr.release("calc", first.id());
        let _ = rx.recv().await; // second unit's Ready event
        tokio::task::yield_now().await;
        let third = mgr.get_idle_unit("calc").expect("first unit is free again");
        assert_eq!(first.id(), third.id());
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let (mut mgr, _rx) = manager();
        mgr.configure_kind("flaky", UnitPoolOptions { circuit_failure_threshold: 2, max_units: 2, ..Default::default() });
        mgr.record_outcome("flaky", false);
        mgr.record_outcome("flaky", false);
        assert!(mgr.create_unit("flaky").is_err());
    }

    #[tokio::test]
    async fn ensure_min_units_spawns_floor() {
        let (mut mgr, _rx) = manager();
        mgr.configure_kind("calc", UnitPoolOptions { min_units: 2, max_units: 4, ..Default::default() });
        mgr.ensure_min_units("calc");
        assert_eq!(mgr.total_units(), 2);
    }
}
