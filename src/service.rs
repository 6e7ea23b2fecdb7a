//! Service tree, action handlers and the registry built from them.
//!
//! A handler is any `Fn(Runtime, A1, .., An) -> Return` whose arguments implement
//! [ArgType]. The adapter generated for it decodes the arguments straight from the
//! request stream, so a handler with an unsupported argument type does not compile.
//!
//! ```ignore
//! let svc = Service::new().on("SayHello", |rt: Runtime, name: String| {
//!     rt.reply(format!("hello {}", name))
//! });
//! server.add_service("test", svc);
//! ```

use crate::error::*;
use crate::processor::WorkerState;
use crate::rt_value::{RTArray, RTMap, RTValue};
use crate::runtime::{Return, Runtime};
use rtrpc_core::value::*;
use rtrpc_core::{Stream, Value};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

/// Root of every action path
pub const ROOT_NODE: &str = "#";

/// Decodes handler arguments in order from the request body.
///
/// The worker state stays locked while decoding and is released before the handler
/// runs.
pub struct ArgDecoder<'a> {
    state: Option<MutexGuard<'a, WorkerState>>,
    src: usize,
    rt: Runtime,
}

impl<'a> ArgDecoder<'a> {
    #[inline]
    pub(crate) fn new(state: MutexGuard<'a, WorkerState>, src: usize, rt: Runtime) -> Self {
        Self { state: Some(state), src, rt }
    }

    #[inline]
    fn stream(&mut self) -> Option<&mut Stream> {
        let src = self.src;
        self.state.as_mut().map(|st| &mut st.streams[src])
    }

    /// All arguments consumed, unlock the worker state
    #[inline]
    pub(crate) fn finish(&mut self) -> Option<()> {
        if !self.stream()?.is_read_finish() {
            return None;
        }
        self.state = None;
        Some(())
    }
}

/// Types a handler may take as argument
pub trait ArgType: Sized + 'static {
    const TYPE_NAME: &'static str;

    /// None on type mismatch or short body
    fn decode(d: &mut ArgDecoder) -> Option<Self>;
}

macro_rules! impl_arg_type {
    ($t: ty, $name: expr, $read: ident) => {
        impl ArgType for $t {
            const TYPE_NAME: &'static str = $name;

            #[inline]
            fn decode(d: &mut ArgDecoder) -> Option<Self> {
                d.stream()?.$read().ok()
            }
        }
    };
}

impl_arg_type!(bool, TYPE_BOOL, read_bool);
impl_arg_type!(i64, TYPE_INT64, read_int64);
impl_arg_type!(u64, TYPE_UINT64, read_uint64);
impl_arg_type!(f64, TYPE_FLOAT64, read_float64);
impl_arg_type!(String, TYPE_STRING, read_string);
impl_arg_type!(Bytes, TYPE_BYTES, read_bytes);
impl_arg_type!(Array, TYPE_ARRAY, read_array);
impl_arg_type!(Map, TYPE_MAP, read_map);

impl ArgType for RTValue {
    const TYPE_NAME: &'static str = TYPE_RT_VALUE;

    fn decode(d: &mut ArgDecoder) -> Option<Self> {
        let rt = d.rt.clone();
        let src = d.src;
        let s = d.stream()?;
        let pos = s.get_read_pos();
        s.skip_value().ok()?;
        Some(RTValue::new(rt, src, pos))
    }
}

impl ArgType for RTArray {
    const TYPE_NAME: &'static str = TYPE_RT_ARRAY;

    fn decode(d: &mut ArgDecoder) -> Option<Self> {
        let rt = d.rt.clone();
        let src = d.src;
        let positions = d.stream()?.read_array_positions().ok()?;
        Some(RTArray::from_items(rt, positions.into_iter().map(|pos| (src, pos)).collect()))
    }
}

impl ArgType for RTMap {
    const TYPE_NAME: &'static str = TYPE_RT_MAP;

    fn decode(d: &mut ArgDecoder) -> Option<Self> {
        let rt = d.rt.clone();
        let src = d.src;
        let positions = d.stream()?.read_map_positions().ok()?;
        Some(RTMap::from_items(rt, positions.into_iter().map(|(k, pos)| (k, (src, pos))).collect()))
    }
}

/// Adapter from a typed closure to an action
pub trait Handler<Args>: Send + Sync + 'static {
    /// Argument type names, without the Runtime
    fn signature() -> Vec<&'static str>;

    /// None when the arguments do not match the signature
    fn invoke(&self, rt: Runtime, d: &mut ArgDecoder) -> Option<Return>;
}

macro_rules! impl_handler {
    ($($a: ident),*) => {
        impl<F, $($a: ArgType,)*> Handler<($($a,)*)> for F
        where
            F: Fn(Runtime, $($a),*) -> Return + Send + Sync + 'static,
        {
            #[inline]
            fn signature() -> Vec<&'static str> {
                vec![$($a::TYPE_NAME),*]
            }

            #[allow(non_snake_case)]
            #[inline]
            fn invoke(&self, rt: Runtime, d: &mut ArgDecoder) -> Option<Return> {
                $(let $a = $a::decode(d)?;)*
                d.finish()?;
                Some((self)(rt, $($a),*))
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);
impl_handler!(A1, A2, A3, A4);
impl_handler!(A1, A2, A3, A4, A5);
impl_handler!(A1, A2, A3, A4, A5, A6);
impl_handler!(A1, A2, A3, A4, A5, A6, A7);
impl_handler!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Type erased [Handler]
pub(crate) trait Action: Send + Sync + 'static {
    fn invoke(&self, rt: Runtime, d: &mut ArgDecoder) -> Option<Return>;
}

struct HandlerAction<H, Args> {
    handler: H,
    _args: PhantomData<fn(Args)>,
}

impl<Args: 'static, H: Handler<Args>> Action for HandlerAction<H, Args> {
    #[inline]
    fn invoke(&self, rt: Runtime, d: &mut ArgDecoder) -> Option<Return> {
        self.handler.invoke(rt, d)
    }
}

pub(crate) type ActionFn = Arc<dyn Action>;

#[derive(Clone)]
struct ActionDef {
    signature: Vec<&'static str>,
    func: ActionFn,
}

/// A node of the service tree, built with chained calls and handed to the server
#[derive(Clone, Default)]
pub struct Service {
    actions: Vec<(String, ActionDef)>,
    children: Vec<(String, Service)>,
    config: Map,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, names are checked when the server opens
    pub fn on<Args: 'static, H: Handler<Args>>(mut self, name: &str, handler: H) -> Self {
        let func: ActionFn = Arc::new(HandlerAction { handler, _args: PhantomData });
        self.actions.push((name.to_string(), ActionDef { signature: H::signature(), func }));
        self
    }

    pub fn add_child_service(mut self, name: &str, service: Service) -> Self {
        self.children.push((name.to_string(), service));
        self
    }

    /// Seed the config map readable through `Runtime::service_config_get`
    pub fn set_config<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }
}

/// A resolved action
pub(crate) struct ActionEntry {
    pub path: String,
    pub signature: Vec<&'static str>,
    pub func: ActionFn,
    pub config: Arc<Mutex<Map>>,
}

impl ActionEntry {
    /// `#.svc:Action(rpc.String, rpc.Int64)`
    pub fn signature_string(&self) -> String {
        format!("{}({})", self.path, self.signature.join(", "))
    }
}

/// Read-only lookup table from action path to entry, built once per open
pub(crate) struct Registry {
    actions: FxHashMap<String, Arc<ActionEntry>>,
}

#[cfg(test)]
impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("actions", &self.actions.keys().collect::<Vec<_>>()).finish()
    }
}

#[inline]
fn is_service_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b == b'_' || b.is_ascii_alphanumeric())
}

#[inline]
fn is_action_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b == b'_' || b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b == b'_' || b.is_ascii_alphanumeric())
}

impl Registry {
    pub fn build(services: &[(String, Service)], max_node_depth: usize) -> Result<Self, RpcError> {
        let mut reg = Self { actions: FxHashMap::default() };
        let mut seen = BTreeSet::new();
        for (name, service) in services {
            reg.add_node(ROOT_NODE, 0, name, service, max_node_depth, &mut seen)?;
        }
        Ok(reg)
    }

    fn add_node(
        &mut self, parent: &str, parent_depth: usize, name: &str, service: &Service,
        max_node_depth: usize, seen: &mut BTreeSet<String>,
    ) -> Result<(), RpcError> {
        if !is_service_name(name) {
            return Err(ERR_SERVICE_NAME.msg(format!("service name \"{}\" is illegal", name)));
        }
        let path = format!("{}.{}", parent, name);
        let depth = parent_depth + 1;
        if depth > max_node_depth {
            return Err(ERR_NODE_DEPTH
                .msg(format!("service {} depth {} overflows {}", path, depth, max_node_depth)));
        }
        if !seen.insert(path.clone()) {
            return Err(ERR_SERVICE_NAME.msg(format!("service {} is duplicated", path)));
        }
        let config = Arc::new(Mutex::new(service.config.clone()));
        for (action, def) in &service.actions {
            if !is_action_name(action) {
                return Err(ERR_ACTION_NAME.msg(format!("action name \"{}\" is illegal", action)));
            }
            let full = format!("{}:{}", path, action);
            if self.actions.contains_key(&full) {
                return Err(ERR_ACTION_HANDLER.msg(format!("action {} is duplicated", full)));
            }
            let entry = ActionEntry {
                path: full.clone(),
                signature: def.signature.clone(),
                func: def.func.clone(),
                config: config.clone(),
            };
            self.actions.insert(full, Arc::new(entry));
        }
        for (child, svc) in &service.children {
            self.add_node(&path, depth, child, svc, max_node_depth, seen)?;
        }
        Ok(())
    }

    #[inline]
    pub fn get(&self, path: &str) -> Option<&Arc<ActionEntry>> {
        self.actions.get(path)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.actions.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_service() -> Service {
        Service::new()
            .on("SayHello", |rt: Runtime, name: String| rt.reply(format!("hello {}", name)))
            .on("Add", |rt: Runtime, a: i64, b: i64| rt.reply(a + b))
            .on("Nothing", |rt: Runtime| rt.reply(()))
    }

    #[test]
    fn test_names() {
        assert!(is_service_name("user_1"));
        assert!(is_service_name("1x"));
        assert!(!is_service_name(""));
        assert!(!is_service_name("a.b"));
        assert!(is_action_name("_Get1"));
        assert!(!is_action_name("1Get"));
        assert!(!is_action_name("Get-1"));
        assert!(!is_action_name(""));
    }

    #[test]
    fn test_build() {
        let svc = hello_service()
            .set_config("greeting", "hi")
            .add_child_service("inner", Service::new().on("Echo", |rt: Runtime, v: RTValue| rt.reply(v)));
        let reg = Registry::build(&[("test".to_string(), svc)], 128).expect("build");
        assert_eq!(
            reg.paths(),
            vec!["#.test.inner:Echo", "#.test:Add", "#.test:Nothing", "#.test:SayHello"]
        );
        let add = reg.get("#.test:Add").expect("add");
        assert_eq!(add.signature_string(), "#.test:Add(rpc.Int64, rpc.Int64)");
        let echo = reg.get("#.test.inner:Echo").expect("echo");
        assert_eq!(echo.signature_string(), "#.test.inner:Echo(rpc.RTValue)");
        assert_eq!(reg.get("#.test:SayHello").expect("hello").config.lock().unwrap().len(), 1);
        assert!(echo.config.lock().unwrap().is_empty());
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn test_build_errors() {
        let e = Registry::build(&[("a.b".to_string(), hello_service())], 128).unwrap_err();
        assert!(e == ERR_SERVICE_NAME);
        let svc = Service::new().on("1Bad", |rt: Runtime| rt.reply(()));
        let e = Registry::build(&[("a".to_string(), svc)], 128).unwrap_err();
        assert!(e == ERR_ACTION_NAME);
        let svc = Service::new().on("Dup", |rt: Runtime| rt.reply(())).on("Dup", |rt: Runtime, _a: bool| rt.reply(()));
        let e = Registry::build(&[("a".to_string(), svc)], 128).unwrap_err();
        assert!(e == ERR_ACTION_HANDLER);
        let e = Registry::build(&[("a".to_string(), Service::new()), ("a".to_string(), Service::new())], 128)
            .unwrap_err();
        assert!(e == ERR_SERVICE_NAME);
        let deep = Service::new().add_child_service("b", Service::new().add_child_service("c", Service::new()));
        assert!(Registry::build(&[("a".to_string(), deep.clone())], 3).is_ok());
        let e = Registry::build(&[("a".to_string(), deep)], 2).unwrap_err();
        assert!(e == ERR_NODE_DEPTH);
    }
}
