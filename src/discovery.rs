//! Periodic discovery and synchronization scheduling.
//!
//! A single thread owns a linear task list ordered by due time. The
//! recurring bus scan probes a candidate set of addresses with the
//! identify command and drives controller lifecycle; per-controller tasks
//! keep repository mirrors synchronized.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::{Command, GetDeviceId};
use crate::conn::Conn;
use crate::directory::{Controller, Directory};
use crate::error::{Error, Result};
use crate::observe;
use crate::repository::{self, CommandIo, SyncOutcome};
use crate::types::{Address, DeviceId, Message, Notification, RawResponse, RepositoryKind};

/// Scheduler wakeup cadence.
const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Missed probes tolerated for the local interface. It sits on the same
/// board, so a single miss already means it is gone.
const LOCAL_MISS_LIMIT: u32 = 1;

/// Missed probes tolerated for bus controllers, which legitimately drop
/// the occasional probe under load.
const BUS_MISS_LIMIT: u32 = 3;

/// Discovery tuning knobs.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Bus targets to probe even when nothing else mentions them.
    pub scan_targets: Vec<u8>,
    /// Period of the bus scan and of sensor-record re-synchronization.
    pub scan_interval: Duration,
    /// Period of event-log synchronization.
    pub event_log_interval: Duration,
    /// Transmission budget for every command discovery sends.
    pub retry_budget: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_targets: Vec::new(),
            scan_interval: Duration::from_secs(10),
            event_log_interval: Duration::from_secs(5),
            retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    ScanBus,
    SyncRecords { target: u8 },
    ReadEventLog { target: u8 },
}

impl TaskKind {
    fn target(self) -> Option<u8> {
        match self {
            TaskKind::ScanBus => None,
            TaskKind::SyncRecords { target } | TaskKind::ReadEventLog { target } => Some(target),
        }
    }
}

#[derive(Debug)]
struct Task {
    due: Instant,
    kind: TaskKind,
}

/// Linear list kept ordered by due time; the list is short (one entry per
/// controller repository plus the scan), so insertion scans are fine.
#[derive(Debug, Default)]
struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    /// Insert keeping due-time order; equal due times run in insertion
    /// order.
    fn insert(&mut self, due: Instant, kind: TaskKind) {
        let at = self
            .tasks
            .iter()
            .position(|t| t.due > due)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(at, Task { due, kind });
    }

    fn pop_due(&mut self, now: Instant) -> Option<TaskKind> {
        if self.tasks.first().is_some_and(|t| t.due <= now) {
            Some(self.tasks.remove(0).kind)
        } else {
            None
        }
    }

    fn remove_target(&mut self, target: u8) {
        self.tasks.retain(|t| t.kind.target() != Some(target));
    }
}

/// Adapter giving the repository synchronizer a command path through a
/// connection to one controller.
pub(crate) struct ConnIo<'a> {
    pub(crate) conn: &'a Conn,
    pub(crate) addr: Address,
    pub(crate) retry_budget: u32,
}

impl CommandIo for ConnIo<'_> {
    fn exchange(&self, msg: Message) -> Result<RawResponse> {
        Ok(self.conn.submit(self.addr, msg, self.retry_budget)?.response)
    }
}

pub(crate) struct Discovery {
    conn: Arc<Conn>,
    directory: Arc<Directory>,
    notifications: mpsc::Sender<Notification>,
    shutdown: Arc<AtomicBool>,
    config: DiscoveryConfig,
    local_target: u8,
    missed: HashMap<u8, u32>,
    tasks: TaskList,
}

impl Discovery {
    pub(crate) fn new(
        conn: Arc<Conn>,
        directory: Arc<Directory>,
        notifications: mpsc::Sender<Notification>,
        shutdown: Arc<AtomicBool>,
        config: DiscoveryConfig,
        local_target: u8,
    ) -> Self {
        let mut discovery = Self {
            conn,
            directory,
            notifications,
            shutdown,
            config,
            local_target,
            missed: HashMap::new(),
            tasks: TaskList::default(),
        };

        // Controllers placed in the directory before the thread starts
        // (the local interface) get their repository tasks up front.
        let now = Instant::now();
        discovery.tasks.insert(now, TaskKind::ScanBus);
        for controller in discovery.directory.controllers() {
            if let Some(target) = controller.address().target() {
                discovery.schedule_controller_tasks(target, controller.identity());
            }
        }
        discovery
    }

    pub(crate) fn run(mut self) {
        observe::trace_discovery_thread("started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            while let Some(kind) = self.tasks.pop_due(now) {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                self.run_task(kind);
            }
            thread::sleep(POLL_PERIOD);
        }

        observe::trace_discovery_thread("stopped");
    }

    fn run_task(&mut self, kind: TaskKind) {
        match kind {
            TaskKind::ScanBus => {
                self.scan_bus();
                self.tasks
                    .insert(Instant::now() + self.config.scan_interval, TaskKind::ScanBus);
            }
            TaskKind::SyncRecords { target } => self.sync_records(target),
            TaskKind::ReadEventLog { target } => self.read_event_log(target),
        }
    }

    /// The candidate set is recomputed every cycle: configured targets,
    /// everything the directory already knows, and whatever the local
    /// interface's locator records point at.
    fn candidate_targets(&self) -> Vec<u8> {
        let mut set: BTreeSet<u8> = self.config.scan_targets.iter().copied().collect();
        set.insert(self.local_target);
        set.extend(self.directory.targets());

        if let Some(local) = self.directory.get(self.local_target) {
            let records = local
                .sensor_records()
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .records();
            set.extend(records.iter().filter_map(|r| r.locator_target()));
        }

        set.into_iter().collect()
    }

    fn scan_bus(&mut self) {
        for target in self.candidate_targets() {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let known = self.directory.get(target);
            match self.probe(target, known.is_some()) {
                Ok(identity) => self.handle_probe_reply(target, identity, known),
                Err(Error::Closed) => return,
                Err(_) => self.handle_probe_miss(target, known),
            }
        }
    }

    /// Identify one target. Unknown bus addresses are probed by broadcast,
    /// which reaches controllers that have not finished bus arbitration;
    /// known ones get a direct probe.
    fn probe(&self, target: u8, known: bool) -> Result<DeviceId> {
        let addr = if known || target == self.local_target {
            Address::bus(target)
        } else {
            Address::BusBroadcast {
                channel: 0,
                lun: 0,
                target,
            }
        };
        let reply = self
            .conn
            .submit(addr, GetDeviceId.message(), self.config.retry_budget)?;
        GetDeviceId.parse_response(reply.response)
    }

    fn handle_probe_reply(
        &mut self,
        target: u8,
        identity: DeviceId,
        known: Option<Arc<Controller>>,
    ) {
        self.missed.remove(&target);

        let Some(existing) = known else {
            self.add_controller(target, identity);
            return;
        };

        if existing.is_active() && existing.signature() == identity.signature() {
            // Liveness revalidated, nothing structural changed.
            return;
        }

        if existing.is_active() {
            // Something new answers at this address.
            existing.set_active(false);
            let _ = self.notifications.send(Notification::ControllerRemoved {
                address: existing.address(),
            });
            observe::record_controller_state(target, "replaced");
        }

        // An entry never returns to active in place: a replaced or
        // returning controller gets a fresh entry with fresh repository
        // mirrors, so counters from before the outage cannot mask changes.
        self.tasks.remove_target(target);
        self.directory.reap_inactive(target);
        self.add_controller(target, identity);
    }

    fn handle_probe_miss(&mut self, target: u8, known: Option<Arc<Controller>>) {
        let limit = if target == self.local_target {
            LOCAL_MISS_LIMIT
        } else {
            BUS_MISS_LIMIT
        };

        let count = self.missed.entry(target).or_insert(0);
        *count += 1;
        if *count < limit {
            return;
        }
        self.missed.remove(&target);

        let Some(controller) = known else {
            return;
        };

        if controller.is_active() {
            controller.set_active(false);
            observe::record_controller_state(target, "inactive");
            let _ = self.notifications.send(Notification::ControllerRemoved {
                address: controller.address(),
            });
            self.tasks.remove_target(target);
        } else {
            // Already inactive and still silent for another full window.
            self.directory.reap_inactive(target);
            observe::record_controller_state(target, "reaped");
        }
    }

    fn add_controller(&mut self, target: u8, identity: DeviceId) {
        let address = Address::bus(target);
        let controller = Arc::new(Controller::new(address, identity.clone()));
        self.directory.insert(target, controller);
        observe::record_controller_state(target, "active");
        let _ = self
            .notifications
            .send(Notification::ControllerAdded { address });
        self.schedule_controller_tasks(target, &identity);
    }

    fn schedule_controller_tasks(&mut self, target: u8, identity: &DeviceId) {
        let now = Instant::now();
        if identity.support.sensor_records || identity.provides_device_sdrs {
            self.tasks.insert(now, TaskKind::SyncRecords { target });
        }
        if identity.support.event_log {
            self.tasks.insert(now, TaskKind::ReadEventLog { target });
        }
    }

    fn sync_records(&mut self, target: u8) {
        self.sync_repository(target, RepositoryKind::SensorRecords, self.config.scan_interval);
    }

    fn read_event_log(&mut self, target: u8) {
        self.sync_repository(
            target,
            RepositoryKind::EventLog,
            self.config.event_log_interval,
        );
    }

    /// Run one synchronization cycle and reschedule. An inactive or reaped
    /// controller ends the recurrence; reactivation schedules anew.
    fn sync_repository(&mut self, target: u8, kind: RepositoryKind, period: Duration) {
        let Some(controller) = self.directory.get(target) else {
            return;
        };
        if !controller.is_active() {
            return;
        }

        let io = ConnIo {
            conn: self.conn.as_ref(),
            addr: controller.address(),
            retry_budget: self.config.retry_budget,
        };

        match repository::synchronize(controller.repository(kind), &io) {
            Ok(SyncOutcome::Unchanged) => {}
            Ok(SyncOutcome::Replaced { records, removed }) => {
                let _ = self.notifications.send(Notification::RepositoryChanged {
                    address: controller.address(),
                    kind,
                    records,
                    removed,
                });
            }
            Err(Error::Closed) => return,
            Err(err) => {
                // Transient; the stored snapshot is intact and the next
                // period retries from the metadata read.
                crate::debug::dump_text("repository sync error", &err.to_string());
            }
        }

        let task = match kind {
            RepositoryKind::SensorRecords => TaskKind::SyncRecords { target },
            RepositoryKind::EventLog => TaskKind::ReadEventLog { target },
        };
        self.tasks.insert(Instant::now() + period, task);
    }
}
