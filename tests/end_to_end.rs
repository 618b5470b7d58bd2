//! End-to-end tests driving a real server over the loopback interface.
//!
//! Each test binds its own server on an ephemeral port and runs it on a
//! background thread, so tests do not interfere with each other.

use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serial_test::serial;

use ubank::client::{Client, ClientConfig, CommunicationError, OperationFailed, Semantics};
use ubank::proto::{
    AmountRequest, BalanceReply, Currency, Message, MsgFlags, MsgType, OpCode, Status,
};
use ubank::{Server, ServerConfig};

fn start_server(config: ServerConfig) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0", config).expect("bind server");
    let addr = server.local_addr().expect("server address");
    thread::spawn(move || {
        let _ = server.run();
    });
    addr
}

fn connect(addr: SocketAddr, semantics: Semantics, timeout_ms: u64, retries: u32) -> Client {
    let config = ClientConfig {
        semantics,
        timeout: Duration::from_millis(timeout_ms),
        retries,
    };
    Client::connect(addr, config).expect("connect client")
}

/// Encode a DEPOSIT request by hand so tests can retransmit the identical
/// datagram, the way a retrying client would.
fn deposit_datagram(flags: MsgFlags, request_id: u64, account_no: i32, amount: f64) -> Vec<u8> {
    let mut body = vec![];
    AmountRequest {
        name: "alice".to_string(),
        account_no,
        password: "secret".to_string(),
        currency: Currency::CNY,
        amount,
    }
    .put(&mut body)
    .unwrap();
    Message::request(OpCode::DEPOSIT, flags, request_id, body)
        .encode()
        .unwrap()
}

fn raw_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

#[test]
fn open_then_query_round_trip() {
    let addr = start_server(ServerConfig::default());
    let mut client = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();
    assert_eq!(opened.account_no, 10001);
    assert_eq!(opened.balance, 100.0);
    let query = client.query_balance("alice", 10001, "secret").unwrap();
    assert_eq!(query.currency, Currency::CNY);
    assert_eq!(query.balance, 100.0);
}

#[test]
fn overdraft_is_rejected_and_balance_unchanged() {
    let addr = start_server(ServerConfig::default());
    let mut client = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();
    let err = client
        .withdraw("alice", opened.account_no, "secret", Currency::CNY, 150.0)
        .unwrap_err();
    let failed = err
        .downcast_ref::<OperationFailed>()
        .expect("typed status failure");
    assert_eq!(failed.0, Status::ERR_INSUFFICIENT_FUNDS);
    let query = client
        .query_balance("alice", opened.account_no, "secret")
        .unwrap();
    assert_eq!(query.balance, 100.0);
}

#[test]
fn at_most_once_retransmits_execute_once() {
    let addr = start_server(ServerConfig::default());
    let mut client = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();

    let socket = raw_socket();
    let datagram = deposit_datagram(MsgFlags::AT_MOST_ONCE, 77, opened.account_no, 10.0);
    let mut buf = [0u8; 2048];
    let mut replies = vec![];
    for _ in 0..3 {
        socket.send_to(&datagram, addr).unwrap();
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        replies.push(buf[..n].to_vec());
    }
    // replays are bit-identical to the original reply
    assert!(replies.windows(2).all(|pair| pair[0] == pair[1]));
    let reply = Message::decode(&replies[0]).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.request_id, 77);
    assert_eq!(BalanceReply::get(&reply.body[..]).unwrap().balance, 110.0);

    // the deposit happened exactly once
    let query = client
        .query_balance("alice", opened.account_no, "secret")
        .unwrap();
    assert_eq!(query.balance, 110.0);
}

#[test]
fn at_least_once_retransmits_execute_each_time() {
    let addr = start_server(ServerConfig::default());
    let mut client = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();

    let socket = raw_socket();
    let datagram = deposit_datagram(MsgFlags::empty(), 78, opened.account_no, 10.0);
    let mut buf = [0u8; 2048];
    let mut balances = vec![];
    for _ in 0..3 {
        socket.send_to(&datagram, addr).unwrap();
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        let reply = Message::decode(&buf[..n]).unwrap();
        balances.push(BalanceReply::get(&reply.body[..]).unwrap().balance);
    }
    assert_eq!(balances, vec![110.0, 120.0, 130.0]);
    let query = client
        .query_balance("alice", opened.account_no, "secret")
        .unwrap();
    assert_eq!(query.balance, 130.0);
}

#[test]
fn dedup_window_lapses_after_ttl() {
    let config = ServerConfig {
        dedup_ttl: Duration::from_millis(200),
        ..Default::default()
    };
    let addr = start_server(config);
    let mut client = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();

    let socket = raw_socket();
    let datagram = deposit_datagram(MsgFlags::AT_MOST_ONCE, 79, opened.account_no, 10.0);
    let mut buf = [0u8; 2048];
    socket.send_to(&datagram, addr).unwrap();
    socket.recv_from(&mut buf).unwrap();
    thread::sleep(Duration::from_millis(400));
    // the cached reply has lapsed; the same datagram re-executes
    socket.send_to(&datagram, addr).unwrap();
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    let reply = Message::decode(&buf[..n]).unwrap();
    assert_eq!(BalanceReply::get(&reply.body[..]).unwrap().balance, 120.0);
}

#[test]
fn monitor_receives_transfer_callbacks_in_order() {
    let addr = start_server(ServerConfig::default());
    let mut teller = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    let alice = teller.open("alice", "secret", Currency::CNY, 100.0).unwrap();
    let bob = teller.open("bob", "hunter2", Currency::CNY, 50.0).unwrap();

    let mut watcher = connect(addr, Semantics::AtLeastOnce, 1000, 3);
    watcher.register_monitor(3).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        watcher
            .watch_updates(3, |update| {
                let _ = tx.send(update);
            })
            .unwrap();
    });
    // give the watcher a moment to start polling
    thread::sleep(Duration::from_millis(200));
    teller
        .transfer(
            "alice",
            alice.account_no,
            "secret",
            bob.account_no,
            Currency::CNY,
            30.0,
        )
        .unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.update_type, OpCode::TRANSFER);
    assert_eq!(first.account_no, alice.account_no);
    assert_eq!(first.new_balance, 70.0);
    assert_eq!(second.update_type, OpCode::TRANSFER);
    assert_eq!(second.account_no, bob.account_no);
    assert_eq!(second.new_balance, 80.0);

    handle.join().unwrap();
    // the registration has expired; later operations produce no callbacks
    teller
        .deposit("alice", alice.account_no, "secret", Currency::CNY, 5.0)
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn corrupt_magic_is_dropped_silently() {
    let addr = start_server(ServerConfig::default());
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut datagram = deposit_datagram(MsgFlags::empty(), 80, 10001, 10.0);
    datagram[..4].copy_from_slice(&[0, 0, 0, 0]);
    socket.send_to(&datagram, addr).unwrap();
    let mut buf = [0u8; 2048];
    assert!(
        socket.recv_from(&mut buf).is_err(),
        "server must not answer a datagram with a bad magic"
    );
}

#[test]
fn unknown_opcode_gets_bad_request_reply() {
    let addr = start_server(ServerConfig::default());
    let socket = raw_socket();
    let msg = Message {
        msg_type: MsgType::Request,
        op: 42,
        flags: 0,
        status: 0,
        request_id: 5,
        body: vec![],
    };
    socket.send_to(&msg.encode().unwrap(), addr).unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    let reply = Message::decode(&buf[..n]).unwrap();
    assert_eq!(reply.msg_type, MsgType::Reply);
    assert_eq!(reply.status, u16::from(Status::ERR_BAD_REQUEST));
    assert_eq!(reply.op, 42);
    assert_eq!(reply.request_id, 5);
    assert!(reply.body.is_empty());
}

#[test]
fn retries_exhausted_raise_communication_error() {
    // a bound socket that never answers
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = sink.local_addr().unwrap();
    let mut client = connect(addr, Semantics::AtLeastOnce, 100, 2);
    let err = client
        .query_balance("alice", 10001, "secret")
        .unwrap_err();
    let comm = err
        .downcast_ref::<CommunicationError>()
        .expect("typed communication failure");
    assert_eq!(comm.attempts, 2);
}

#[test]
// timing-sensitive: retransmissions race the simulated loss, so keep these
// off a loaded scheduler
#[serial]
fn at_most_once_deposit_survives_reply_loss_exactly_once() {
    let config = ServerConfig {
        loss_rep: 0.5,
        ..Default::default()
    };
    let addr = start_server(config);
    let mut client = connect(addr, Semantics::AtMostOnce, 150, 15);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();
    client
        .deposit("alice", opened.account_no, "secret", Currency::CNY, 10.0)
        .unwrap();
    let query = client
        .query_balance("alice", opened.account_no, "secret")
        .unwrap();
    // however many retries fired, the deposit landed once
    assert_eq!(query.balance, 110.0);
}

#[test]
#[serial]
fn at_least_once_deposit_may_land_repeatedly_under_loss() {
    let config = ServerConfig {
        loss_rep: 0.5,
        ..Default::default()
    };
    let addr = start_server(config);
    let mut client = connect(addr, Semantics::AtLeastOnce, 150, 15);
    let opened = client.open("alice", "secret", Currency::CNY, 100.0).unwrap();
    client
        .deposit("alice", opened.account_no, "secret", Currency::CNY, 10.0)
        .unwrap();
    let query = client
        .query_balance("alice", opened.account_no, "secret")
        .unwrap();
    let executed = ((query.balance - 100.0) / 10.0).round() as i64;
    assert!(executed >= 1, "the acknowledged deposit must have landed");
    let expected = 100.0 + 10.0 * executed as f64;
    assert!((query.balance - expected).abs() < 1e-9);
}
