#![allow(dead_code)]

pub use captains_log::logfn;
pub use rstest::*;

use captains_log::*;
use rtrpc::error::*;
use rtrpc::proto::{self, FROM_CLIENT};
use rtrpc::stream::ControlCode;
use rtrpc::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub struct TestRunner {}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/rpc_test.log", Level::Trace).test().build().expect("log");
        Self {}
    }
}

pub fn open_server(config: ServerConfig, services: Vec<(&str, Service)>) -> Arc<Server> {
    let mut server = Server::new(config);
    for (name, svc) in services {
        server.add_service(name, svc);
    }
    server.open().expect("open");
    Arc::new(server)
}

/// Client dialing in-process connections served by `server`
pub fn mem_client(server: &Arc<Server>, config: ClientConfig) -> Client {
    let server = server.clone();
    Client::connect(config, move || {
        let (a, b) = MemConn::pair();
        server.serve_conn(a)?;
        Ok(b as Arc<dyn StreamConn>)
    })
    .expect("connect")
}

/// Speaks the wire protocol by hand
pub struct RawPeer {
    pub conn: Arc<MemConn>,
    pub session: String,
    pub session_id: u64,
    pub init_back: proto::InitBack,
    /// System error reports received before init-back
    pub reports: Vec<RpcError>,
    seq: u64,
}

impl RawPeer {
    pub fn connect(server: &Server, presented: &str) -> Self {
        let (a, b) = MemConn::pair();
        server.serve_conn(a).expect("serve");
        let mut s = proto::new_control(0, ControlCode::Init, 1);
        s.write_string(presented);
        s.build_stream_check();
        b.write_stream(&s, IO_TIMEOUT).expect("write init");
        let mut reports = Vec::new();
        loop {
            let mut back = b.read_stream(IO_TIMEOUT, 1 << 20).expect("read init-back");
            if back.kind() == Some(StreamKind::SystemErrorReport) {
                reports.push(proto::read_error(&mut back).expect("report"));
                continue;
            }
            let (code, seq) = proto::read_control_head(&mut back).expect("head");
            assert_eq!(code, ControlCode::InitBack);
            assert_eq!(seq, 1);
            let init_back = proto::InitBack::read_from(&mut back).expect("init-back");
            let (session_id, _) = proto::parse_session(&init_back.session).expect("session");
            return Self {
                conn: b,
                session: init_back.session.clone(),
                session_id,
                init_back,
                reports,
                seq: 1,
            };
        }
    }

    pub fn request_ids(&mut self, current: u64, marked: &[u64]) -> u64 {
        self.seq += 1;
        self.request_ids_with_seq(self.seq, current, marked)
    }

    pub fn request_ids_with_seq(&mut self, seq: u64, current: u64, marked: &[u64]) -> u64 {
        let mut s = proto::new_control(self.session_id, ControlCode::RequestIds, seq);
        s.write_uint64(current);
        for id in marked {
            s.write_uint64(*id);
        }
        s.build_stream_check();
        self.write(&s);
        let mut back = self.read();
        let (code, back_seq) = proto::read_control_head(&mut back).expect("head");
        assert_eq!(code, ControlCode::RequestIdsBack);
        assert_eq!(back_seq, seq);
        back.read_uint64().expect("max")
    }

    pub fn new_request(&self, cb: u64, target: &str, args: &[Value], debug: bool) -> Stream {
        let mut s = proto::new_request(target, FROM_CLIENT, args, cb, 0).expect("request");
        s.set_session_id(self.session_id);
        s.set_status_bit_debug(debug);
        s.build_stream_check();
        s
    }

    pub fn write(&self, s: &Stream) {
        self.conn.write_stream(s, IO_TIMEOUT).expect("write");
    }

    pub fn read(&self) -> Stream {
        self.conn.read_stream(IO_TIMEOUT, 1 << 20).expect("read")
    }

    /// Send one request and wait for its response
    pub fn call(&self, cb: u64, target: &str, args: &[Value]) -> Stream {
        self.write(&self.new_request(cb, target, args, false));
        let resp = self.read();
        assert_eq!(resp.get_callback_id(), cb);
        resp
    }
}

/// Ok payload or the error of a response stream
pub fn decode_response(mut resp: Stream) -> Result<Value, RpcError> {
    match resp.kind() {
        Some(StreamKind::RpcResponseOk) => {
            resp.set_read_pos_to_body_start();
            Ok(resp.read()?)
        }
        Some(StreamKind::RpcResponseError) => Err(proto::read_error(&mut resp)?),
        other => panic!("unexpected response kind {:?}", other),
    }
}
