//! Shared test doubles: a scripted in-memory device on the far side of a
//! [`Channel`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use ipmi_domain::protocol;
use ipmi_domain::{Address, Channel, Error, Message, RawResponse, Result, NETFN_RESPONSE_BIT};

/// What the device does with one incoming request.
pub enum Action {
    /// Reply immediately with this response.
    Reply(RawResponse),
    /// Reply immediately with explicit netfn/cmd (for mismatch tests).
    ReplyRaw {
        netfn: u8,
        cmd: u8,
        response: RawResponse,
    },
    /// Hold the reply until [`FakeDevice::flush_deferred`] is called.
    Defer(RawResponse),
    /// Swallow the request.
    Drop,
}

/// One request the device saw, in arrival order.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub addr: Address,
    pub seq: u8,
    pub msg: Message,
}

type Handler = Box<dyn FnMut(&SeenRequest) -> Action + Send>;

struct DeviceState {
    inbox: VecDeque<Vec<u8>>,
    deferred: Vec<(Address, u8, Message, RawResponse)>,
    log: Vec<SeenRequest>,
    handler: Handler,
}

/// A device on the far end of the channel, driven by a handler closure.
///
/// `send` never blocks: it records the request, asks the handler what to
/// do, and queues any reply for the next `recv_timeout`.
pub struct FakeDevice {
    state: Mutex<DeviceState>,
    cond: Condvar,
}

impl FakeDevice {
    /// A device that answers every request with an empty OK response.
    pub fn new() -> Self {
        Self::with_handler(|_| {
            Action::Reply(RawResponse {
                completion_code: 0x00,
                data: vec![],
            })
        })
    }

    pub fn with_handler(handler: impl FnMut(&SeenRequest) -> Action + Send + 'static) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                inbox: VecDeque::new(),
                deferred: Vec::new(),
                log: Vec::new(),
                handler: Box::new(handler),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn set_handler(&self, handler: impl FnMut(&SeenRequest) -> Action + Send + 'static) {
        self.state.lock().unwrap().handler = Box::new(handler);
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state.lock().unwrap().log.clone()
    }

    /// Release all held replies.
    pub fn flush_deferred(&self) {
        let mut state = self.state.lock().unwrap();
        let deferred = std::mem::take(&mut state.deferred);
        for (addr, seq, msg, rsp) in deferred {
            let frame =
                protocol::encode_response(addr, seq, msg.netfn | NETFN_RESPONSE_BIT, msg.cmd, &rsp)
                    .expect("encode deferred reply");
            state.inbox.push_back(frame);
        }
        self.cond.notify_all();
    }

    /// Queue raw bytes for the client to receive (garbage, unmatched
    /// responses, and other hostile input).
    pub fn push_raw(&self, frame: Vec<u8>) {
        self.state.lock().unwrap().inbox.push_back(frame);
        self.cond.notify_all();
    }

    /// Queue an unsolicited event frame.
    pub fn push_event(&self, source: Address, msg: &Message) {
        let frame = protocol::encode_event(source, msg).expect("encode event");
        self.push_raw(frame);
    }

    /// Block until the device has seen at least `n` requests.
    pub fn wait_for_requests(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.lock().unwrap().log.len() >= n {
                return;
            }
            if Instant::now() >= deadline {
                panic!("device saw fewer than {n} requests within {timeout:?}");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Channel for FakeDevice {
    fn send(&self, frame: &[u8]) -> Result<()> {
        let (addr, seq, msg) = protocol::decode_request(frame)
            .map_err(|_| Error::Protocol("device received a non-request frame"))?;
        let seen = SeenRequest { addr, seq, msg };

        let mut state = self.state.lock().unwrap();
        state.log.push(seen.clone());

        match (state.handler)(&seen) {
            Action::Reply(rsp) => {
                let frame = protocol::encode_response(
                    seen.addr,
                    seen.seq,
                    seen.msg.netfn | NETFN_RESPONSE_BIT,
                    seen.msg.cmd,
                    &rsp,
                )
                .expect("encode reply");
                state.inbox.push_back(frame);
                self.cond.notify_all();
            }
            Action::ReplyRaw {
                netfn,
                cmd,
                response,
            } => {
                let frame = protocol::encode_response(seen.addr, seen.seq, netfn, cmd, &response)
                    .expect("encode raw reply");
                state.inbox.push_back(frame);
                self.cond.notify_all();
            }
            Action::Defer(rsp) => state.deferred.push((seen.addr, seen.seq, seen.msg, rsp)),
            Action::Drop => {}
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(frame) = state.inbox.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

/// Encode an identify response body: `device_id` doubles as the stable
/// identity so tests can tell controllers apart.
pub fn identity_bytes(device_id: u8, support_bits: u8) -> Vec<u8> {
    vec![
        device_id,
        0x01, // revision, no device SDRs unless bit 7 set
        0x01, // fw major
        0x00, // fw minor
        0x02, // protocol version
        support_bits,
        0xA2, // manufacturer (24-bit LE)
        0x02,
        0x00,
        0x01, // product (16-bit LE)
        0x00,
    ]
}

pub fn ok(data: Vec<u8>) -> RawResponse {
    RawResponse {
        completion_code: 0x00,
        data,
    }
}

pub fn fail(completion_code: u8) -> RawResponse {
    RawResponse {
        completion_code,
        data: vec![],
    }
}
