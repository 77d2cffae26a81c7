//! The perpetual control loop
//!
//! Each cycle: snapshot every point the rules reference, evaluate each
//! causation binding, and drive triggered coils to their safe (off) state.
//! A device that does not answer keeps its last-known values in the
//! snapshot, tagged stale; only an explicit stop or a persistent hardware
//! failure ends the loop.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::modbus::bus::BusError;
use crate::registry::{PointId, PointKind, PointTable, Registry, RegistryError, Value};
use crate::rules::{Rule, Snapshot};

/// A configured link from a rule's boolean result to a coil.
///
/// When the rule holds, the coil is written off. A false result causes no
/// write at all: the output is left as-is, never re-asserted.
pub struct Causation {
    pub rule: Rule,
    pub target: PointId,
}

impl Causation {
    /// The target must be a coil; causations never write to inputs.
    pub fn new(rule: Rule, target: PointId, table: &PointTable) -> Result<Self, RegistryError> {
        if table.point(target).kind != PointKind::Coil {
            return Err(RegistryError::NotACoil(table.name(target).to_string()));
        }
        Ok(Causation { rule, target })
    }
}

/// Requests the scheduler to wind down; cheap to clone and send across
/// threads. The loop observes the request no later than its next sleep.
#[derive(Clone)]
pub struct StopHandle(flume::Sender<()>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(());
    }
}

pub struct Scheduler {
    registry: Registry,
    causations: Vec<Causation>,
    interval: Duration,
    stop_rx: flume::Receiver<()>,
    /// Points any rule reads, gathered once at setup.
    polled_points: Vec<PointId>,
    last_known: HashMap<PointId, Value>,
}

impl Scheduler {
    pub fn new(
        registry: Registry,
        causations: Vec<Causation>,
        interval: Duration,
    ) -> (Self, StopHandle) {
        let mut polled_points = Vec::new();
        for causation in &causations {
            causation.rule.referenced_points(&mut polled_points);
        }
        let mut seen = HashSet::new();
        polled_points.retain(|id| seen.insert(*id));

        let (stop_tx, stop_rx) = flume::bounded(1);
        let scheduler = Scheduler {
            registry,
            causations,
            interval,
            stop_rx,
            polled_points,
            last_known: HashMap::new(),
        };
        (scheduler, StopHandle(stop_tx))
    }

    /// Run until stopped. Returns an error only when the bus has failed
    /// permanently; transient trouble is logged and the loop carries on.
    pub fn run(&mut self) -> Result<(), BusError> {
        log::info!(
            "Control loop started: {} causation(s), {} polled point(s), {:?} interval",
            self.causations.len(),
            self.polled_points.len(),
            self.interval
        );

        loop {
            if self.stop_rx.try_recv().is_ok() {
                break;
            }

            self.cycle()?;

            match self.stop_rx.recv_timeout(self.interval) {
                Ok(()) => break,
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => {
                    // Nobody can stop us any more; keep the cycle cadence.
                    std::thread::sleep(self.interval);
                }
            }
        }

        log::info!("Control loop stopped");
        Ok(())
    }

    /// One poll-evaluate-actuate cycle.
    fn cycle(&mut self) -> Result<(), BusError> {
        let now = Instant::now();
        let snapshot = self.take_snapshot()?;

        let Scheduler {
            causations,
            registry,
            ..
        } = self;
        for causation in causations.iter_mut() {
            if !causation.rule.evaluate(&snapshot, now) {
                continue;
            }

            let target = causation.target;
            log::info!(
                "Cutoff condition met, driving '{}' off",
                registry.name(target)
            );
            match registry.write_coil(target, false) {
                Ok(()) => {}
                Err(RegistryError::Bus(BusError::Fatal(reason))) => {
                    return Err(BusError::Fatal(reason));
                }
                Err(e) => {
                    log::warn!("Could not drive '{}' off: {}", registry.name(target), e);
                }
            }
        }

        Ok(())
    }

    /// Read every rule-referenced point. A slave that fails once this cycle
    /// is not retried for its remaining points; all its samples fall back to
    /// the last known value, tagged stale.
    fn take_snapshot(&mut self) -> Result<Snapshot, BusError> {
        let mut snapshot = Snapshot::new();
        let mut failed_slaves: HashSet<u8> = HashSet::new();

        for id in self.polled_points.clone() {
            let slave = self.registry.point(id).slave;
            if failed_slaves.contains(&slave) {
                self.insert_stale(&mut snapshot, id);
                continue;
            }

            match self.registry.read(id) {
                Ok(value) => {
                    self.last_known.insert(id, value);
                    snapshot.insert(id, value, false);
                }
                Err(RegistryError::Bus(BusError::Fatal(reason))) => {
                    return Err(BusError::Fatal(reason));
                }
                Err(e) => {
                    log::warn!(
                        "Poll of '{}' failed ({}); using stale data for slave {}",
                        self.registry.name(id),
                        e,
                        slave
                    );
                    failed_slaves.insert(slave);
                    self.insert_stale(&mut snapshot, id);
                }
            }
        }

        Ok(snapshot)
    }

    fn insert_stale(&self, snapshot: &mut Snapshot, id: PointId) {
        if let Some(&value) = self.last_known.get(&id) {
            snapshot.insert(id, value, true);
        }
    }
}
