//! Domain assembly and lifecycle.
//!
//! A [`Domain`] ties together one connection, the controller directory,
//! and the discovery scheduler, and hands the consumer a single
//! notification queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::commands::{Command, GetDeviceId};
use crate::conn::{Conn, ConnConfig};
use crate::directory::{Controller, Directory};
use crate::discovery::{Discovery, DiscoveryConfig};
use crate::error::Result;
use crate::transport::Channel;
use crate::types::{Address, Message, Notification, Reply};

/// Configures and starts a [`Domain`].
pub struct DomainBuilder {
    channel: Arc<dyn Channel>,
    conn: ConnConfig,
    discovery: DiscoveryConfig,
}

impl DomainBuilder {
    /// Build a domain over `channel` with default tuning.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            conn: ConnConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }

    /// Per-transmission reply deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.conn.timeout = timeout;
        self
    }

    /// Maximum requests in flight at once.
    pub fn max_outstanding(mut self, max: usize) -> Self {
        self.conn.max_outstanding = max;
        self
    }

    /// Bus address of the local interface.
    pub fn local_target(mut self, target: u8) -> Self {
        self.conn.local_target = target;
        self
    }

    /// Transmission budget for every command the domain itself sends.
    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.discovery.retry_budget = budget;
        self
    }

    /// Add a bus target probed on every scan regardless of locator
    /// records.
    pub fn scan_target(mut self, target: u8) -> Self {
        self.discovery.scan_targets.push(target);
        self
    }

    /// Period of the bus scan.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.discovery.scan_interval = interval;
        self
    }

    /// Period of event-log synchronization.
    pub fn event_log_interval(mut self, interval: Duration) -> Self {
        self.discovery.event_log_interval = interval;
        self
    }

    /// Open the connection, identify the local interface, and start the
    /// discovery thread.
    ///
    /// An unreachable local interface is fatal: there is no domain to
    /// manage without it.
    pub fn start(self) -> Result<Domain> {
        let (tx, rx) = mpsc::channel();
        let local_target = self.conn.local_target;
        let retry_budget = self.discovery.retry_budget;
        let conn = Conn::open(self.channel, self.conn, tx.clone())?;

        let local_addr = Address::bus(local_target);
        let reply = conn.submit(local_addr, GetDeviceId.message(), retry_budget)?;
        let identity = GetDeviceId.parse_response(reply.response)?;

        let directory = Arc::new(Directory::new());
        directory.insert(
            local_target,
            Arc::new(Controller::new(local_addr, identity)),
        );
        let _ = tx.send(Notification::ControllerAdded {
            address: local_addr,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let discovery = Discovery::new(
            Arc::clone(&conn),
            Arc::clone(&directory),
            tx,
            Arc::clone(&shutdown),
            self.discovery,
            local_target,
        );
        let handle = thread::Builder::new()
            .name("ipmi-domain-discovery".into())
            .spawn(move || discovery.run())?;

        Ok(Domain {
            conn,
            directory,
            retry_budget,
            shutdown,
            discovery_thread: Mutex::new(Some(handle)),
            notifications: Mutex::new(Some(rx)),
        })
    }
}

/// A running management domain.
pub struct Domain {
    conn: Arc<Conn>,
    directory: Arc<Directory>,
    retry_budget: u32,
    shutdown: Arc<AtomicBool>,
    discovery_thread: Mutex<Option<JoinHandle<()>>>,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl Domain {
    /// Take the notification receiver.
    ///
    /// The queue has exactly one consumer; the first call returns the
    /// receiver and later calls return `None`.
    pub fn notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// The controller directory.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Send a command to a controller with the domain's retry budget and
    /// block for its outcome.
    pub fn submit(&self, addr: Address, msg: Message) -> Result<Reply> {
        self.conn.submit(addr, msg, self.retry_budget)
    }

    /// Stop discovery, fail pending requests, and close the channel.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .discovery_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.conn.shutdown();
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
