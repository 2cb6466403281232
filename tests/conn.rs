mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::{fail, identity_bytes, ok, Action, FakeDevice};
use ipmi_domain::{protocol, Address, Conn, ConnConfig, Error, Message, Notification};

fn open(device: Arc<FakeDevice>, config: ConnConfig) -> (Arc<Conn>, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel();
    let conn = Conn::open(device, config, tx).expect("open");
    (conn, rx)
}

fn probe() -> Message {
    Message::new(0x06, 0x01, vec![])
}

#[test]
fn concurrent_requests_get_unique_sequence_numbers() {
    let device = Arc::new(FakeDevice::with_handler(|_| {
        Action::Defer(ok(identity_bytes(0x01, 0x00)))
    }));
    let config = ConnConfig {
        timeout: Duration::from_secs(5),
        max_outstanding: 8,
        local_target: 0x20,
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    let mut joins = Vec::new();
    for i in 0..8u8 {
        let conn = Arc::clone(&conn);
        joins.push(std::thread::spawn(move || {
            conn.submit(Address::bus(0x30 + i), probe(), 1)
        }));
    }

    device.wait_for_requests(8, Duration::from_secs(2));
    let seqs: HashSet<u8> = device.requests().iter().map(|r| r.seq).collect();
    assert_eq!(seqs.len(), 8, "in-flight requests must not share a slot");

    device.flush_deferred();
    for join in joins {
        join.join().expect("thread").expect("reply");
    }
}

#[test]
fn admission_beyond_capacity_is_fifo() {
    let device = Arc::new(FakeDevice::with_handler(|_| Action::Defer(ok(vec![]))));
    let config = ConnConfig {
        timeout: Duration::from_secs(5),
        max_outstanding: 2,
        local_target: 0x20,
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    let mut joins = Vec::new();
    for cmd in 1..=4u8 {
        let conn = Arc::clone(&conn);
        joins.push(std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150 * u64::from(cmd)));
            conn.submit(Address::bus(0x30), Message::new(0x06, cmd, vec![]), 1)
        }));
    }

    device.wait_for_requests(2, Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(800));
    let seen: Vec<u8> = device.requests().iter().map(|r| r.msg.cmd).collect();
    assert_eq!(seen, vec![1, 2], "capacity must hold excess requests back");

    device.flush_deferred();
    device.wait_for_requests(4, Duration::from_secs(2));
    let seen: Vec<u8> = device.requests().iter().map(|r| r.msg.cmd).collect();
    assert_eq!(seen, vec![1, 2, 3, 4], "queued requests promote in FIFO order");

    device.flush_deferred();
    for join in joins {
        join.join().expect("thread").expect("reply");
    }
}

#[test]
fn silent_peer_times_out_after_the_whole_budget() {
    let device = Arc::new(FakeDevice::with_handler(|_| Action::Drop));
    let config = ConnConfig {
        timeout: Duration::from_millis(100),
        ..ConnConfig::default()
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    let err = conn
        .submit(Address::bus(0x30), probe(), 3)
        .expect_err("no reply ever comes");
    assert!(matches!(err, Error::Timeout));

    let requests = device.requests();
    assert_eq!(requests.len(), 3, "budget counts transmissions");
    let seqs: HashSet<u8> = requests.iter().map(|r| r.seq).collect();
    assert_eq!(seqs.len(), 1, "retransmissions reuse the sequence number");
}

#[test]
fn reply_to_a_retransmission_completes_the_request() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let device = Arc::new(FakeDevice::with_handler(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Action::Drop
        } else {
            Action::Reply(ok(vec![0xAB]))
        }
    }));
    let config = ConnConfig {
        timeout: Duration::from_millis(100),
        ..ConnConfig::default()
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    let reply = conn
        .submit(Address::bus(0x30), probe(), 3)
        .expect("third transmission is answered");
    assert_eq!(reply.response.data, vec![0xAB]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let seqs: HashSet<u8> = device.requests().iter().map(|r| r.seq).collect();
    assert_eq!(seqs.len(), 1);
}

#[test]
fn hostile_input_does_not_disturb_later_requests() {
    let device = Arc::new(FakeDevice::new());
    let (conn, _rx) = open(Arc::clone(&device), ConnConfig::default());

    // Garbage, then a well-formed response no request is waiting for.
    device.push_raw(vec![0x01, 0x02, 0x03]);
    let unmatched =
        protocol::encode_response(Address::bus(0x30), 10, 0x07, 0x01, &ok(vec![])).expect("encode");
    device.push_raw(unmatched);
    std::thread::sleep(Duration::from_millis(100));

    let reply = conn
        .submit(Address::bus(0x30), probe(), 1)
        .expect("engine still works");
    assert_eq!(reply.response.completion_code, 0x00);
}

#[test]
fn mismatched_reply_header_is_a_protocol_error() {
    let device = Arc::new(FakeDevice::with_handler(|_| Action::ReplyRaw {
        netfn: 0x07,
        cmd: 0x99,
        response: fail(0x00),
    }));
    let (conn, _rx) = open(Arc::clone(&device), ConnConfig::default());

    let err = conn
        .submit(Address::bus(0x30), probe(), 1)
        .expect_err("header mismatch");
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn unsolicited_events_reach_the_notification_queue() {
    let device = Arc::new(FakeDevice::new());
    let (_conn, rx) = open(Arc::clone(&device), ConnConfig::default());

    let event = Message::new(0x04, 0x02, vec![0x01, 0x55]);
    device.push_event(Address::bus(0x55), &event);

    match rx.recv_timeout(Duration::from_secs(1)).expect("notified") {
        Notification::Unsolicited { address, message } => {
            assert_eq!(address, Address::bus(0x55));
            assert_eq!(message, event);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[test]
fn self_addressed_bus_messages_go_to_the_system_interface() {
    let device = Arc::new(FakeDevice::new());
    let (conn, _rx) = open(Arc::clone(&device), ConnConfig::default());

    let reply = conn
        .submit(Address::bus(0x20), probe(), 1)
        .expect("local interface answers");

    assert_eq!(device.requests()[0].addr, Address::system_interface());
    assert_eq!(reply.source, Address::system_interface());
}

#[test]
fn shutdown_fails_pending_requests() {
    let device = Arc::new(FakeDevice::with_handler(|_| Action::Drop));
    let config = ConnConfig {
        timeout: Duration::from_secs(10),
        ..ConnConfig::default()
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    let submitter = {
        let conn = Arc::clone(&conn);
        std::thread::spawn(move || conn.submit(Address::bus(0x30), probe(), 1))
    };
    device.wait_for_requests(1, Duration::from_secs(2));

    conn.shutdown();
    let err = submitter.join().expect("thread").expect_err("closed");
    assert!(matches!(err, Error::Closed));

    let err = conn.submit(Address::bus(0x30), probe(), 1).expect_err("closed");
    assert!(matches!(err, Error::Closed));
}

#[test]
fn shutdown_races_do_not_strand_submitters() {
    let device = Arc::new(FakeDevice::with_handler(|_| Action::Drop));
    let config = ConnConfig {
        timeout: Duration::from_secs(30),
        ..ConnConfig::default()
    };
    let (conn, _rx) = open(Arc::clone(&device), config);

    // Every submitter must come back with an error no matter which side
    // of the teardown it lands on; none may park with nobody left to
    // complete it.
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..8u8 {
        let conn = Arc::clone(&conn);
        let done = done_tx.clone();
        std::thread::spawn(move || {
            let result = conn.submit(Address::bus(0x30 + i), probe(), 1);
            let _ = done.send(result);
        });
    }

    std::thread::sleep(Duration::from_millis(20));
    conn.shutdown();

    for _ in 0..8 {
        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("submitter finished after shutdown");
        assert!(result.is_err());
    }
}
