//! Request/response correlation over a shared channel.
//!
//! One receive thread owns the channel read side, matches response frames
//! to outstanding requests by sequence number, sweeps deadlines, and routes
//! unsolicited events to the notification queue. Any number of caller
//! threads submit requests and block on a per-request completion slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::commands::NETFN_RESPONSE_BIT;
use crate::error::{Error, Result};
use crate::observe;
use crate::protocol::{self, Frame, MAX_DATA_LEN, MAX_SEQ};
use crate::transport::Channel;
use crate::types::{Address, Message, Notification, RawResponse, Reply};

/// Receive-poll period; also the deadline-sweep cadence.
const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Per-transmission reply deadline.
    pub timeout: Duration,
    /// Maximum number of requests in flight at once (at most
    /// [`MAX_SEQ`]); further submissions queue in FIFO order.
    pub max_outstanding: usize,
    /// Bus address of the local interface, used for the self-address
    /// rewrite.
    pub local_target: u8,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_outstanding: 8,
            local_target: 0x20,
        }
    }
}

#[derive(Default)]
struct Waiter {
    slot: Mutex<Option<Result<Reply>>>,
    cond: Condvar,
}

impl Waiter {
    fn complete(&self, result: Result<Reply>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.cond.notify_one();
    }

    fn wait(&self) -> Result<Reply> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.cond.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// A request occupying a sequence slot.
struct PendingRequest {
    netfn: u8,
    cmd: u8,
    /// Encoded frame, retransmitted verbatim on the same sequence number.
    frame: Vec<u8>,
    deadline: Instant,
    retries_left: u32,
    waiter: Arc<Waiter>,
}

/// A request waiting for a free slot.
struct QueuedRequest {
    addr: Address,
    msg: Message,
    retry_budget: u32,
    waiter: Arc<Waiter>,
}

/// Outstanding table and pending queue: one mutual-exclusion domain, since
/// both the receive thread and submitters allocate/release slots.
struct ConnState {
    outstanding: Vec<Option<PendingRequest>>,
    num_outstanding: usize,
    current_seq: usize,
    queue: VecDeque<QueuedRequest>,
    /// Set under the lock once the receive thread has drained; a request
    /// admitted after this point would have nobody to complete it.
    closed: bool,
}

struct Shared {
    channel: Arc<dyn Channel>,
    config: ConnConfig,
    state: Mutex<ConnState>,
    notifications: mpsc::Sender<Notification>,
    shutdown: AtomicBool,
}

/// A connection to the local interface: the transport and request
/// correlation engine.
pub struct Conn {
    shared: Arc<Shared>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Conn {
    /// Start the receive thread and return the connection.
    ///
    /// Unsolicited events are delivered to `notifications` as
    /// [`Notification::Unsolicited`].
    pub fn open(
        channel: Arc<dyn Channel>,
        config: ConnConfig,
        notifications: mpsc::Sender<Notification>,
    ) -> Result<Arc<Conn>> {
        if config.max_outstanding == 0 || config.max_outstanding > MAX_SEQ {
            return Err(Error::InvalidArgument("max_outstanding out of range"));
        }

        let shared = Arc::new(Shared {
            channel,
            config,
            state: Mutex::new(ConnState {
                outstanding: (0..MAX_SEQ).map(|_| None).collect(),
                num_outstanding: 0,
                current_seq: 0,
                queue: VecDeque::new(),
                closed: false,
            }),
            notifications,
            shutdown: AtomicBool::new(false),
        });

        let rx_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ipmi-domain-rx".into())
            .spawn(move || rx_shared.run_receive())?;

        Ok(Arc::new(Conn {
            shared,
            rx_thread: Mutex::new(Some(handle)),
        }))
    }

    /// Send a command and block until its terminal outcome.
    ///
    /// `retry_budget` counts total transmissions and must be positive.
    /// Exactly one outcome is produced per submission: the matched reply, a
    /// transport error, or [`Error::Timeout`] once the budget is exhausted.
    pub fn submit(&self, addr: Address, msg: Message, retry_budget: u32) -> Result<Reply> {
        if retry_budget == 0 {
            return Err(Error::InvalidArgument("retry budget must be positive"));
        }
        if msg.data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidArgument("message data too long"));
        }
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let started = Instant::now();
        let (netfn, cmd) = (msg.netfn, msg.cmd);
        let waiter = Arc::new(Waiter::default());

        {
            let mut state = self.shared.lock_state();
            // The unlocked flag check above is only a fast path; a caller
            // racing shutdown() can pass it after the receive thread has
            // drained, and nobody would ever complete its waiter.
            if state.closed {
                return Err(Error::Closed);
            }
            if state.num_outstanding < self.shared.config.max_outstanding {
                // Transmit within the caller context; a failure here is
                // synchronous and never occupies a slot.
                self.shared
                    .send_now(&mut state, addr, &msg, retry_budget, Arc::clone(&waiter))?;
            } else {
                state.queue.push_back(QueuedRequest {
                    addr,
                    msg,
                    retry_budget,
                    waiter: Arc::clone(&waiter),
                });
            }
        }

        let result = waiter.wait();
        match &result {
            Ok(reply) => observe::record_submit_ok(
                netfn,
                cmd,
                started.elapsed(),
                reply.response.completion_code,
            ),
            Err(err) => observe::record_submit_err(netfn, cmd, started.elapsed(), err),
        }
        result
    }

    /// Number of requests currently holding a sequence slot.
    pub fn outstanding(&self) -> usize {
        self.shared.lock_state().num_outstanding
    }

    /// Stop the receive thread, fail all pending requests with
    /// [`Error::Closed`], and close the channel.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .rx_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.shared.channel.close();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the next free sequence slot, round-robin from the cursor
    /// so no slot starves. Caller guarantees a slot is free.
    fn allocate_seq(state: &mut ConnState) -> u8 {
        while state.outstanding[state.current_seq].is_some() {
            state.current_seq = (state.current_seq + 1) % MAX_SEQ;
        }
        let seq = state.current_seq;
        state.current_seq = (state.current_seq + 1) % MAX_SEQ;
        seq as u8
    }

    /// Occupy a slot and transmit. On transmission failure the slot is
    /// released and the error returned to the caller.
    fn send_now(
        &self,
        state: &mut ConnState,
        addr: Address,
        msg: &Message,
        retry_budget: u32,
        waiter: Arc<Waiter>,
    ) -> Result<()> {
        let send_addr = addr.to_send_addr(self.config.local_target);
        let seq = Self::allocate_seq(state);
        let frame = protocol::encode_request(send_addr, seq, msg)?;

        self.channel.send(&frame)?;

        state.outstanding[seq as usize] = Some(PendingRequest {
            netfn: msg.netfn,
            cmd: msg.cmd,
            frame,
            deadline: Instant::now() + self.config.timeout,
            retries_left: retry_budget - 1,
            waiter,
        });
        state.num_outstanding += 1;
        Ok(())
    }

    /// Promote queued requests into freed slots, FIFO.
    fn promote_queued(&self, state: &mut ConnState) {
        while state.num_outstanding < self.config.max_outstanding {
            let Some(queued) = state.queue.pop_front() else {
                break;
            };
            let QueuedRequest {
                addr,
                msg,
                retry_budget,
                waiter,
            } = queued;
            if let Err(err) = self.send_now(state, addr, &msg, retry_budget, Arc::clone(&waiter)) {
                // The submitter is already parked; deliver the send error
                // as its terminal outcome.
                waiter.complete(Err(err));
            }
        }
    }

    fn run_receive(self: Arc<Self>) {
        observe::trace_receive_thread("started");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.channel.recv_timeout(POLL_PERIOD) {
                Ok(Some(bytes)) => self.handle_frame(&bytes),
                Ok(None) => {}
                Err(err) => {
                    // Channel read errors are recovered locally; back off so
                    // a persistent failure does not spin the thread.
                    observe::record_dropped_frame("channel_error");
                    crate::debug::dump_text("channel read error", &err.to_string());
                    thread::sleep(POLL_PERIOD);
                }
            }

            self.sweep_deadlines();
        }

        self.drain_on_shutdown();
        observe::trace_receive_thread("stopped");
    }

    fn handle_frame(&self, bytes: &[u8]) {
        crate::debug::dump_hex("rx frame", bytes);

        match protocol::decode_frame(bytes) {
            Ok(Frame::Response {
                seq,
                source,
                netfn,
                cmd,
                response,
            }) => self.handle_response(seq, source, netfn, cmd, response),
            Ok(Frame::Event { source, message }) => {
                let _ = self.notifications.send(Notification::Unsolicited {
                    address: source.normalize_reply(),
                    message,
                });
            }
            Err(_) => observe::record_dropped_frame("malformed"),
        }
    }

    fn handle_response(&self, seq: u8, source: Address, netfn: u8, cmd: u8, rsp: RawResponse) {
        let mut state = self.lock_state();

        let Some(request) = state.outstanding[seq as usize].take() else {
            // Response without a live request: late duplicate or garbage.
            observe::record_dropped_frame("unmatched_response");
            return;
        };
        state.num_outstanding -= 1;

        if netfn == (request.netfn | NETFN_RESPONSE_BIT) && cmd == request.cmd {
            request.waiter.complete(Ok(Reply {
                source: source.normalize_reply(),
                response: rsp,
            }));
        } else {
            request
                .waiter
                .complete(Err(Error::Protocol("response netfn/cmd mismatch")));
        }

        self.promote_queued(&mut state);
    }

    /// Retransmit or fail every request whose deadline has passed.
    fn sweep_deadlines(&self) {
        let now = Instant::now();
        let mut state = self.lock_state();

        for seq in 0..MAX_SEQ {
            let expired = match &state.outstanding[seq] {
                Some(request) => request.deadline <= now,
                None => false,
            };
            if !expired {
                continue;
            }

            let request = state.outstanding[seq].as_mut().expect("checked above");
            if request.retries_left > 0 {
                request.retries_left -= 1;
                request.deadline = now + self.config.timeout;
                observe::record_retransmit(request.netfn, request.cmd);
                let frame = request.frame.clone();
                if let Err(err) = self.channel.send(&frame) {
                    let exhausted = {
                        let request = state.outstanding[seq].as_ref().expect("checked above");
                        request.retries_left == 0
                    };
                    if exhausted {
                        let request = state.outstanding[seq].take().expect("checked above");
                        state.num_outstanding -= 1;
                        request.waiter.complete(Err(err));
                    }
                    // Otherwise keep the slot; the refreshed deadline will
                    // trigger another attempt.
                }
            } else {
                let request = state.outstanding[seq].take().expect("checked above");
                state.num_outstanding -= 1;
                request.waiter.complete(Err(Error::Timeout));
            }
        }

        self.promote_queued(&mut state);
    }

    /// Terminal outcomes for everything still pending at shutdown.
    fn drain_on_shutdown(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        for slot in state.outstanding.iter_mut() {
            if let Some(request) = slot.take() {
                request.waiter.complete(Err(Error::Closed));
            }
        }
        state.num_outstanding = 0;
        while let Some(queued) = state.queue.pop_front() {
            queued.waiter.complete(Err(Error::Closed));
        }
    }
}
