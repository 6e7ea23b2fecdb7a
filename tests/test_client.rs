mod common;
use common::*;

use rtrpc::error::*;
use rtrpc::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn test_service(counter: Arc<AtomicUsize>) -> Service {
    Service::new()
        .on("SayHello", |rt: Runtime, name: String| -> Return {
            rt.reply(format!("hello {}", name))
        })
        .on("Add", |rt: Runtime, a: i64, b: i64| -> Return { rt.reply(a + b) })
        .on("Slow", move |rt: Runtime, ms: u64| -> Return {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(ms));
            rt.reply(ms)
        })
        .on("Panic", |_rt: Runtime| -> Return { panic!("boom") })
        .on("ReplyTwice", |rt: Runtime| -> Return {
            let _ = rt.reply(1i64);
            rt.reply(2i64)
        })
}

#[logfn]
#[rstest]
fn test_client_send(runner: TestRunner) {
    let _ = runner;
    let server = open_server(
        ServerConfig::default(),
        vec![("test", test_service(Arc::new(AtomicUsize::new(0))))],
    );
    let client = mem_client(&server, ClientConfig::default());
    assert!(client.is_connected());
    assert_eq!(client.send("#.test:SayHello", &["world".into()]).expect("say"), Value::from("hello world"));
    assert_eq!(client.send("#.test:Add", &[1i64.into(), 2i64.into()]).expect("add"), Value::Int64(3));
    // the first reply wins
    assert_eq!(client.send("#.test:ReplyTwice", &[]).expect("reply twice"), Value::Int64(1));
    let e = client.send("#.test:Add", &[1i64.into()]).unwrap_err();
    assert!(e == ERR_ACTION_ARGUMENTS_MISMATCH);
    let e = client.send("#.none:Add", &[]).unwrap_err();
    assert!(e == ERR_ACTION_NOT_FOUND);
    client.close();
    let e = client.send("#.test:SayHello", &["x".into()]).unwrap_err();
    assert!(e == ERR_TRANSPORT_CLOSED);
    server.close().expect("close");
}

#[logfn]
#[rstest]
#[case(false)]
#[case(true)]
fn test_client_panic(runner: TestRunner, #[case] debug: bool) {
    let _ = runner;
    let server = open_server(
        ServerConfig::default(),
        vec![("test", test_service(Arc::new(AtomicUsize::new(0))))],
    );
    let mut config = ClientConfig::default();
    config.debug = debug;
    let client = mem_client(&server, config);
    let e = client.send("#.test:Panic", &[]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::RuntimePanic);
    if debug {
        assert_eq!(e.message(), "boom");
        assert!(e.debug_info().contains("#.test:Panic"));
    } else {
        assert_eq!(e.message(), proto::SANITIZED_MESSAGE);
        assert_eq!(e.debug_info(), "");
    }
    // the worker survives
    assert_eq!(client.send("#.test:Add", &[2i64.into(), 2i64.into()]).expect("add"), Value::Int64(4));
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_client_concurrent(runner: TestRunner) {
    let _ = runner;
    let mut config = ServerConfig::default();
    config.session_concurrency = 4;
    let counter = Arc::new(AtomicUsize::new(0));
    let server = open_server(config, vec![("test", test_service(counter.clone()))]);
    let client = Arc::new(mem_client(&server, ClientConfig::default()));
    let mut ths = Vec::new();
    for i in 0..16u64 {
        let _client = client.clone();
        ths.push(thread::spawn(move || _client.send("#.test:Slow", &[Value::from(i * 2)])));
    }
    for (i, th) in ths.into_iter().enumerate() {
        let v = th.join().expect("join").expect("send");
        assert_eq!(v, Value::Uint64(i as u64 * 2));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 16);
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_client_reconnect_once(runner: TestRunner) {
    let _ = runner;
    let counter = Arc::new(AtomicUsize::new(0));
    let server = open_server(ServerConfig::default(), vec![("test", test_service(counter.clone()))]);
    let client = Arc::new(mem_client(&server, ClientConfig::default()));
    let session = client.session();

    let _client = client.clone();
    let th = thread::spawn(move || _client.send("#.test:Slow", &[Value::from(500u64)]));
    thread::sleep(Duration::from_millis(100));
    client.disconnect();
    let v = th.join().expect("join").expect("send");
    assert_eq!(v, Value::Uint64(500));
    // resent after reconnect but executed once
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(client.session(), session);
    assert_eq!(server.sessions(), 1);
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_client_timeout(runner: TestRunner) {
    let _ = runner;
    let counter = Arc::new(AtomicUsize::new(0));
    let server = open_server(ServerConfig::default(), vec![("test", test_service(counter))]);
    let client = mem_client(&server, ClientConfig::default());
    let e = client
        .send_timeout("#.test:Slow", &[Value::from(400u64)], Duration::from_millis(100))
        .unwrap_err();
    assert!(e == ERR_TRANSPORT_TIMEOUT);
    assert_eq!(client.send("#.test:Add", &[1i64.into(), 1i64.into()]).expect("add"), Value::Int64(2));
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_broadcast_and_config(runner: TestRunner) {
    let _ = runner;
    let svc = Service::new()
        .set_config("greeting", "hi")
        .on("Notify", |rt: Runtime, topic: String, n: i64| -> Return {
            if let Err(e) = rt.post("#.news", &topic, n) {
                return rt.reply(e);
            }
            rt.reply(true)
        })
        .on("Greet", |rt: Runtime, name: String| -> Return {
            let greeting = match rt.service_config_get("greeting") {
                Ok(Value::String(s)) => s,
                Ok(_) => "?".to_string(),
                Err(e) => return rt.reply(e),
            };
            let count = match rt.service_config_get("count") {
                Ok(Value::Int64(n)) => n + 1,
                _ => 1,
            };
            if let Err(e) = rt.service_config_set("count", count) {
                return rt.reply(e);
            }
            rt.reply(format!("{} {} #{}", greeting, name, count))
        });
    let server = open_server(ServerConfig::default(), vec![("test", svc)]);
    let client = mem_client(&server, ClientConfig::default());
    let got = Arc::new(Mutex::new(Vec::new()));
    let _got = got.clone();
    client.on_broadcast(move |endpoint, topic, v| {
        _got.lock().unwrap().push((endpoint, topic, v));
    });
    assert_eq!(client.send("#.test:Notify", &["weather".into(), 7i64.into()]).expect("notify"), Value::Bool(true));
    for _ in 0..100 {
        if !got.lock().unwrap().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        *got.lock().unwrap(),
        vec![("#.news".to_string(), "weather".to_string(), Value::Int64(7))]
    );

    assert_eq!(client.send("#.test:Greet", &["bob".into()]).expect("greet"), Value::from("hi bob #1"));
    assert_eq!(client.send("#.test:Greet", &["amy".into()]).expect("greet"), Value::from("hi amy #2"));
    client.close();
    server.close().expect("close");
}
