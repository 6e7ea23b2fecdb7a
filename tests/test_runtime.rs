mod common;
use common::*;

use rtrpc::error::*;
use rtrpc::*;
use std::sync::{Arc, Mutex};
use std::thread;

fn nested_service(stash: Arc<Mutex<Option<Runtime>>>) -> Service {
    Service::new()
        .on("SayHello", |rt: Runtime, name: String| -> Return {
            rt.reply(format!("hello {}", name))
        })
        .on("Nested", |rt: Runtime, name: String| -> Return {
            let r = rt.call("#.test:SayHello", &[name.into()]).and_then(|v| v.to_string());
            rt.reply(r)
        })
        .on("Loop", |rt: Runtime, n: i64| -> Return {
            match rt.call("#.test:Loop", &[Value::from(n + 1)]) {
                Ok(v) => rt.reply(v),
                Err(e) => rt.reply(e),
            }
        })
        .on("Stash", move |rt: Runtime| -> Return {
            *stash.lock().unwrap() = Some(rt.clone());
            rt.reply(())
        })
}

#[logfn]
#[rstest]
#[case(1, false)]
#[case(2, true)]
fn test_call_depth(runner: TestRunner, #[case] max_call_depth: usize, #[case] ok: bool) {
    let _ = runner;
    let mut config = ServerConfig::default();
    config.max_call_depth = max_call_depth;
    let stash = Arc::new(Mutex::new(None));
    let server = open_server(config, vec![("test", nested_service(stash))]);
    let client = mem_client(&server, ClientConfig::default());
    let r = client.send("#.test:Nested", &["rt".into()]);
    if ok {
        assert_eq!(r.expect("nested"), Value::from("hello rt"));
    } else {
        let e = r.unwrap_err();
        assert!(e == ERR_CALL_OVERFLOW);
        assert_eq!(e.message(), "call #.test:SayHello level(1) overflows");
    }
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_unbounded_recursion(runner: TestRunner) {
    let _ = runner;
    let mut config = ServerConfig::default();
    config.max_call_depth = 16;
    let stash = Arc::new(Mutex::new(None));
    let server = open_server(config, vec![("test", nested_service(stash))]);
    let client = mem_client(&server, ClientConfig::default());
    let e = client.send("#.test:Loop", &[Value::from(0i64)]).unwrap_err();
    assert!(e == ERR_CALL_OVERFLOW);
    assert_eq!(e.message(), "call #.test:Loop level(16) overflows");
    // nothing leaks on the worker
    assert_eq!(client.send("#.test:SayHello", &["again".into()]).expect("hello"), Value::from("hello again"));
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_runtime_misuse(runner: TestRunner) {
    let _ = runner;
    let stash: Arc<Mutex<Option<Runtime>>> = Arc::new(Mutex::new(None));
    let _stash = stash.clone();
    let svc = nested_service(stash.clone())
        .on("OtherThread", |rt: Runtime| -> Return {
            let _rt = rt.clone();
            let r = thread::spawn(move || _rt.service_config_get("k")).join().unwrap();
            rt.reply(r.err().map(|e| e.code()).unwrap_or(0))
        })
        .on("AfterCall", move |rt: Runtime| -> Return {
            if let Err(e) = rt.call("#.test:Stash", &[]) {
                return rt.reply(e);
            }
            let inner = _stash.lock().unwrap().take().unwrap();
            let r = inner.new_rt_array(1);
            rt.reply(r.err().map(|e| e.code()).unwrap_or(0))
        });
    let server = open_server(ServerConfig::default(), vec![("test", svc)]);
    let client = mem_client(&server, ClientConfig::default());
    let code = Value::from(ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE.code());
    assert_eq!(client.send("#.test:OtherThread", &[]).expect("other thread"), code);
    assert_eq!(client.send("#.test:AfterCall", &[]).expect("after call"), code);

    // a runtime kept after its request finished
    client.send("#.test:Stash", &[]).expect("stash");
    let rt = stash.lock().unwrap().take().unwrap();
    let _ = rt.reply(1i64);
    assert!(rt.service_config_get("k").unwrap_err() == ERR_RUNTIME_ILLEGAL_IN_CURRENT_GOROUTINE);
    client.close();
    server.close().expect("close");
}

#[logfn]
#[rstest]
fn test_rt_values(runner: TestRunner) {
    let _ = runner;
    let svc = Service::new()
        .on("Sum", |rt: Runtime, items: RTArray| -> Return {
            let mut sum = 0i64;
            let size = match items.size() {
                Ok(n) => n,
                Err(e) => return rt.reply(e),
            };
            for i in 0..size {
                match items.get(i).and_then(|v| v.to_int64()) {
                    Ok(n) => sum += n,
                    Err(e) => return rt.reply(e),
                }
            }
            rt.reply(sum)
        })
        .on("Edit", |rt: Runtime, mut m: RTMap| -> Return {
            let r = (|| -> Result<RTMap, RpcError> {
                let name = m.get("name")?.to_string()?;
                m.set("greeting", format!("hi {}", name))?;
                m.delete("drop")?;
                Ok(m)
            })();
            rt.reply(r)
        })
        .on("Build", |rt: Runtime, v: RTValue| -> Return {
            let r = (|| -> Result<RTArray, RpcError> {
                let mut a = rt.new_rt_array(4)?;
                a.append(v.type_name()?)?;
                a.append(v.to_value()?)?;
                a.append(1i64)?;
                a.set(2, "one")?;
                a.append(false)?;
                a.delete(3)?;
                Ok(a)
            })();
            rt.reply(r)
        })
        .on("Echo", |rt: Runtime, v: RTValue| -> Return { rt.reply(v) })
        .on("Index", |rt: Runtime, a: RTArray, i: u64| -> Return {
            rt.reply(a.get(i as usize).and_then(|v| v.to_value()))
        })
        .on("Bool", |rt: Runtime, v: RTValue| -> Return { rt.reply(v.to_bool()) })
        .on("Missing", |rt: Runtime, m: RTMap| -> Return { rt.reply(m.get("nope")) })
        .on("Through", |rt: Runtime, v: RTValue| -> Return {
            let r = rt.call("#.test:Echo", &[]).err();
            match r {
                Some(e) if e == ERR_ACTION_ARGUMENTS_MISMATCH => rt.reply(v),
                _ => rt.reply(false),
            }
        });
    let server = open_server(ServerConfig::default(), vec![("test", svc)]);
    let client = mem_client(&server, ClientConfig::default());

    let items: Array = vec![1i64.into(), 2i64.into(), 39i64.into()];
    assert_eq!(client.send("#.test:Sum", &[items.into()]).expect("sum"), Value::Int64(42));
    let e = client.send("#.test:Sum", &[vec![Value::from("x")].into()]).unwrap_err();
    assert!(e == ERR_RT_VALUE_TYPE);
    assert_eq!(e.message(), "rpc.Int64 expected, got rpc.String");

    let mut m = Map::new();
    m.insert("name".to_string(), "amy".into());
    m.insert("drop".to_string(), 1i64.into());
    let mut want = Map::new();
    want.insert("name".to_string(), "amy".into());
    want.insert("greeting".to_string(), "hi amy".into());
    assert_eq!(client.send("#.test:Edit", &[m.into()]).expect("edit"), Value::Map(want));

    let want: Array = vec!["rpc.Map".into(), Map::new().into(), "one".into()];
    assert_eq!(client.send("#.test:Build", &[Map::new().into()]).expect("build"), Value::Array(want));

    let nested: Array = vec![Value::Nil, vec![Value::from(1.5f64)].into()];
    assert_eq!(client.send("#.test:Echo", &[nested.clone().into()]).expect("echo"), Value::Array(nested));
    assert_eq!(client.send("#.test:Through", &["kept".into()]).expect("through"), Value::from("kept"));

    let e = client.send("#.test:Index", &[Array::new().into(), 0u64.into()]).unwrap_err();
    assert!(e == ERR_RT_ARRAY_INDEX_OVERFLOW);
    assert!(client.send("#.test:Bool", &[7i64.into()]).unwrap_err() == ERR_RT_VALUE_TYPE);
    assert!(client.send("#.test:Missing", &[Map::new().into()]).unwrap_err() == ERR_RT_MAP_KEY_MISSING);
    client.close();
    server.close().expect("close");
}
