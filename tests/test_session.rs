mod common;
use common::*;

use rtrpc::error::*;
use rtrpc::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn hello_service(counter: Arc<AtomicUsize>) -> Service {
    Service::new().on("SayHello", move |rt: Runtime, name: String| -> Return {
        counter.fetch_add(1, Ordering::SeqCst);
        rt.reply(format!("hello {}", name))
    })
}

#[logfn]
#[rstest]
fn test_raw_say_hello(runner: TestRunner) {
    let _ = runner;
    let counter = Arc::new(AtomicUsize::new(0));
    let server = open_server(ServerConfig::default(), vec![("test", hello_service(counter))]);
    let mut peer = RawPeer::connect(&server, "");
    assert!(peer.reports.is_empty());
    assert_eq!(peer.init_back.concurrency, 64);
    assert_eq!(peer.request_ids(0, &[]), 64);

    let resp = peer.call(1, "#.test:SayHello", &["world".into()]);
    assert_eq!(decode_response(resp).expect("ok"), Value::from("hello world"));

    let e = decode_response(peer.call(2, "#.test:SayHello", &[Value::from(3i64)])).unwrap_err();
    assert!(e == ERR_ACTION_ARGUMENTS_MISMATCH);
    assert!(e.message().contains("expected: #.test:SayHello(rpc.String)"), "{}", e.message());
    assert!(e.message().contains("got: #.test:SayHello(rpc.Int64)"), "{}", e.message());

    let e = decode_response(peer.call(3, "#.test:SayHello", &[])).unwrap_err();
    assert!(e == ERR_ACTION_ARGUMENTS_MISMATCH);

    let e = decode_response(peer.call(4, "#.test:Nothing", &[])).unwrap_err();
    assert!(e == ERR_ACTION_NOT_FOUND);
    assert_eq!(e.message(), "target #.test:Nothing does not exist");
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_retransmit_runs_once(runner: TestRunner) {
    let _ = runner;
    let counter = Arc::new(AtomicUsize::new(0));
    let server =
        open_server(ServerConfig::default(), vec![("test", hello_service(counter.clone()))]);
    let mut peer = RawPeer::connect(&server, "");
    peer.request_ids(0, &[]);

    let req = peer.new_request(7, "#.test:SayHello", &["again".into()], false);
    peer.write(&req);
    let first = peer.read();
    peer.write(&req);
    let second = peer.read();
    assert_eq!(first, second);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // the slot is released once the client stops marking it
    peer.request_ids(64, &[]);
    let session = server.get_session(peer.session_id).expect("session");
    assert!(!session.slot_ids().contains(&7));
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_unknown_callback(runner: TestRunner) {
    let _ = runner;
    let server =
        open_server(ServerConfig::default(), vec![("test", hello_service(Arc::new(AtomicUsize::new(0))))]);
    let peer = RawPeer::connect(&server, "");
    // no ids requested yet
    peer.write(&peer.new_request(5, "#.test:SayHello", &["x".into()], false));
    let mut report = peer.read();
    assert_eq!(report.kind(), Some(StreamKind::SystemErrorReport));
    assert_eq!(report.get_callback_id(), 5);
    let e = proto::read_error(&mut report).expect("report");
    assert!(e == ERR_CALLBACK_NOT_FOUND);
    std::thread::sleep(Duration::from_millis(100));
    assert!(peer.conn.is_closed());
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_session_resume(runner: TestRunner) {
    let _ = runner;
    let server =
        open_server(ServerConfig::default(), vec![("test", hello_service(Arc::new(AtomicUsize::new(0))))]);
    let peer = RawPeer::connect(&server, "");
    let session = peer.session.clone();
    let _ = peer.conn.close();
    drop(peer);

    let peer = RawPeer::connect(&server, &session);
    assert_eq!(peer.session, session);
    assert!(peer.reports.is_empty());
    assert_eq!(server.sessions(), 1);

    let peer = RawPeer::connect(&server, "999999-nosuchtoken");
    assert_ne!(peer.session_id, 999999);
    assert_eq!(peer.reports.len(), 1);
    assert!(peer.reports[0] == ERR_GATEWAY_SESSION_NOT_FOUND);
    assert_eq!(server.sessions(), 2);

    // right id, wrong token
    let (id, _) = proto::parse_session(&session).expect("parse");
    let peer = RawPeer::connect(&server, &format!("{}-wrong", id));
    assert_ne!(peer.session, session);
    assert_eq!(server.sessions(), 3);
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_sweep_over_wire(runner: TestRunner) {
    let _ = runner;
    let mut config = ServerConfig::default();
    config.session_concurrency = 3;
    let server = open_server(config, vec![("test", hello_service(Arc::new(AtomicUsize::new(0))))]);
    let mut peer = RawPeer::connect(&server, "");
    let session = server.get_session(peer.session_id).expect("session");

    assert_eq!(peer.request_ids(0, &[]), 3);
    assert_eq!(session.slot_ids(), vec![1, 2, 3]);
    assert_eq!(peer.request_ids(3, &[3]), 5);
    assert_eq!(session.slot_ids(), vec![3, 4, 5]);
    assert_eq!(peer.request_ids(5, &[3, 5]), 6);
    assert_eq!(session.slot_ids(), vec![3, 5, 6]);

    // a stale sequence is acknowledged without sweeping
    assert_eq!(peer.request_ids_with_seq(1, 6, &[]), 6);
    assert_eq!(session.slot_ids(), vec![3, 5, 6]);

    assert_eq!(peer.request_ids(6, &[3, 42]), 8);
    assert_eq!(session.slot_ids(), vec![3, 7, 8]);
    assert_eq!(session.unknown_marks(), 1);
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_corrupt_stream_closes_conn(runner: TestRunner) {
    let _ = runner;
    let server =
        open_server(ServerConfig::default(), vec![("test", hello_service(Arc::new(AtomicUsize::new(0))))]);
    let mut peer = RawPeer::connect(&server, "");
    peer.request_ids(0, &[]);
    let mut raw = peer.new_request(1, "#.test:SayHello", &["x".into()], false).to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    peer.conn.write_raw(raw).expect("raw");
    let mut report = peer.read();
    assert_eq!(report.kind(), Some(StreamKind::SystemErrorReport));
    assert!(proto::read_error(&mut report).expect("report") == ERR_STREAM);
    std::thread::sleep(Duration::from_millis(100));
    assert!(peer.conn.is_closed());
    // the session survives the connection
    assert!(server.get_session(peer.session_id).is_some());
    server.close().expect("close");
}

#[logfn]
#[rstest]
#[case(StreamKind::RpcRequest, 0)]
#[case(StreamKind::Ping, 5)]
fn test_callback_id_mismatch_closes_conn(runner: TestRunner, #[case] kind: StreamKind, #[case] cb: u64) {
    let _ = runner;
    let counter = Arc::new(AtomicUsize::new(0));
    let server =
        open_server(ServerConfig::default(), vec![("test", hello_service(counter.clone()))]);
    let mut peer = RawPeer::connect(&server, "");
    peer.request_ids(0, &[]);
    let mut s = peer.new_request(cb, "#.test:SayHello", &["x".into()], false);
    s.set_kind(kind);
    s.build_stream_check();
    peer.write(&s);
    let mut report = peer.read();
    assert_eq!(report.kind(), Some(StreamKind::SystemErrorReport));
    assert_eq!(report.get_callback_id(), cb);
    let e = proto::read_error(&mut report).expect("report");
    assert!(e == ERR_STREAM);
    assert!(e.message().contains("with callback id"), "{}", e.message());
    let e = peer.conn.read_stream(IO_TIMEOUT, 1 << 20).unwrap_err();
    assert!(e == ERR_TRANSPORT_CLOSED);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    // the session survives for the next connection
    assert_eq!(server.sessions(), 1);
    server.close().expect("close");
}
