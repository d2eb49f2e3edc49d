//! Method registry and dispatch.
//!
//! Methods are plain closures captured at registration time. Each handler
//! decodes its own params, so a malformed argument list is reported as
//! "invalid params" for that method only.

use crate::client::Client;
use crate::error::{WireError, WireResult};
use crate::message::{ErrorObject, Message, MessageKind};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-call information handed to every handler.
#[derive(Clone, Default)]
pub struct CallContext {
    peer: Option<Arc<Client>>,
    peer_addr: Option<SocketAddr>,
}

impl CallContext {
    pub fn new(peer: Arc<Client>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            peer: Some(peer),
            peer_addr,
        }
    }

    /// Client for calling back into whoever made this call over the same
    /// connection. `None` when dispatched outside a Remote.
    pub fn peer(&self) -> Option<&Arc<Client>> {
        self.peer.as_ref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("has_peer", &self.peer.is_some())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

type HandlerFn = dyn Fn(CallContext, Option<Value>) -> BoxFuture<'static, Result<Value, ErrorObject>> + Send + Sync;

/// A type-erased method implementation.
#[derive(Clone)]
pub struct MethodHandler(Arc<HandlerFn>);

impl MethodHandler {
    /// Wrap a typed async function.
    ///
    /// `P` is decoded from the request params (positional params decode into
    /// tuples). A unit `R` is returned as `null`.
    pub fn new<P, R, E, F, Fut>(f: F) -> Self
    where
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<ErrorObject> + Send + 'static,
    {
        Self(Arc::new(move |ctx: CallContext, params: Option<Value>| match decode_params::<P>(params) {
            Ok(params) => {
                let fut = f(ctx, params);
                async move {
                    let result = fut.await.map_err(Into::into)?;
                    serde_json::to_value(result).map_err(ErrorObject::internal)
                }
                .boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        }))
    }

    pub async fn call(&self, ctx: CallContext, params: Option<Value>) -> Result<Value, ErrorObject> {
        (self.0)(ctx, params).await
    }
}

/// Decode params, treating a missing list, `null` and `[]` as the same
/// empty argument list.
fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, ErrorObject> {
    let value = params.unwrap_or(Value::Null);
    let alternate = match &value {
        Value::Null => Some(Value::Array(Vec::new())),
        Value::Array(items) if items.is_empty() => Some(Value::Null),
        _ => None,
    };
    match serde_json::from_value::<P>(value) {
        Ok(params) => Ok(params),
        Err(first) => alternate
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| ErrorObject::invalid_params(first)),
    }
}

/// An object that exposes some of its operations as RPC methods.
pub trait RpcService: Send + Sync + 'static {
    /// Every method this service can expose, keyed by short name.
    fn method_handlers(self: Arc<Self>) -> Vec<(&'static str, MethodHandler)>;
}

/// The serving half of a [`Remote`](crate::Remote).
#[derive(Default)]
pub struct Server {
    methods: DashMap<String, MethodHandler>,
    /// Serializes registrations so a batch is checked and inserted as one.
    registering: Mutex<()>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `names` of `service` as `prefix + name`. An empty `names`
    /// exposes everything the service offers.
    ///
    /// Nothing is registered if any name is unknown or already taken.
    pub fn register<S: RpcService>(&self, prefix: &str, service: Arc<S>, names: &[&str]) -> WireResult<()> {
        let offered = service.method_handlers();
        let selected: Vec<(String, MethodHandler)> = if names.is_empty() {
            offered
                .into_iter()
                .map(|(name, handler)| (format!("{prefix}{name}"), handler))
                .collect()
        } else {
            let mut selected = Vec::with_capacity(names.len());
            for name in names {
                let handler = offered
                    .iter()
                    .find(|(offered_name, _)| offered_name == name)
                    .map(|(_, handler)| handler.clone())
                    .ok_or_else(|| WireError::UnknownServiceMethod(name.to_string()))?;
                selected.push((format!("{prefix}{name}"), handler));
            }
            selected
        };
        self.insert_all(selected)
    }

    /// Expose a single operation of `service` under an explicit full name.
    pub fn register_method<S: RpcService>(&self, full_name: &str, service: Arc<S>, method: &str) -> WireResult<()> {
        let handler = service
            .method_handlers()
            .into_iter()
            .find(|(name, _)| *name == method)
            .map(|(_, handler)| handler)
            .ok_or_else(|| WireError::UnknownServiceMethod(method.to_string()))?;
        self.insert_all(vec![(full_name.to_string(), handler)])
    }

    /// Register a free-standing handler.
    pub fn register_handler(&self, full_name: &str, handler: MethodHandler) -> WireResult<()> {
        self.insert_all(vec![(full_name.to_string(), handler)])
    }

    fn insert_all(&self, handlers: Vec<(String, MethodHandler)>) -> WireResult<()> {
        let _registering = self.registering.lock().unwrap_or_else(|e| e.into_inner());
        for (i, (name, _)) in handlers.iter().enumerate() {
            let repeated = handlers[..i].iter().any(|(earlier, _)| earlier == name);
            if repeated || self.methods.contains_key(name) {
                return Err(WireError::DuplicateMethod(name.clone()));
            }
        }
        for (name, handler) in handlers {
            self.methods.insert(name, handler);
        }
        Ok(())
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Dispatch one inbound message. Returns the response to send, if any.
    pub async fn handle(&self, ctx: CallContext, message: Message) -> Option<Message> {
        match message.kind() {
            MessageKind::Request | MessageKind::Notification => {}
            MessageKind::Response => return None,
            MessageKind::Invalid => {
                return Some(Message::error_response(
                    message.id,
                    ErrorObject::invalid_request("missing method"),
                ));
            }
        }

        let method = message.method.unwrap_or_default();
        // Clone out of the map so no shard lock is held across the await.
        let handler = self.methods.get(&method).map(|entry| entry.value().clone());
        let result = match handler {
            Some(handler) => handler.call(ctx, message.params).await,
            None => Err(ErrorObject::method_not_found(&method)),
        };

        match (message.id, result) {
            (Some(id), Ok(value)) => Some(Message::response(id, value)),
            (Some(id), Err(error)) => Some(Message::error_response(Some(id), error)),
            (None, Ok(_)) => None,
            (None, Err(error)) => {
                debug!(method = %method, error = %error, "Notification handler failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Id, METHOD_NOT_FOUND};
    use serde_json::json;

    struct FruitService;

    impl FruitService {
        async fn apple(&self) -> Result<String, ErrorObject> {
            Ok("Apple".to_string())
        }

        async fn banana(&self) -> Result<(), ErrorObject> {
            Ok(())
        }

        async fn cherry(&self) -> Result<String, ErrorObject> {
            Ok("Cherry".to_string())
        }
    }

    impl RpcService for FruitService {
        fn method_handlers(self: Arc<Self>) -> Vec<(&'static str, MethodHandler)> {
            let apple = self.clone();
            let banana = self.clone();
            let cherry = self;
            vec![
                (
                    "apple",
                    MethodHandler::new(move |_ctx, (): ()| {
                        let svc = apple.clone();
                        async move { svc.apple().await }
                    }),
                ),
                (
                    "banana",
                    MethodHandler::new(move |_ctx, (): ()| {
                        let svc = banana.clone();
                        async move { svc.banana().await }
                    }),
                ),
                (
                    "cherry",
                    MethodHandler::new(move |_ctx, (): ()| {
                        let svc = cherry.clone();
                        async move { svc.cherry().await }
                    }),
                ),
            ]
        }
    }

    fn request(id: u64, method: &str) -> Message {
        Message::request(Id::Num(id), method, json!([]))
    }

    #[tokio::test]
    async fn test_server_dispatch() {
        let server = Server::new();
        server
            .register("foo_", Arc::new(FruitService), &["apple", "banana"])
            .unwrap();

        let resp = server
            .handle(CallContext::default(), request(1, "foo_apple"))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(Id::Num(1)));
        assert_eq!(resp.result, Some(json!("Apple")));

        let resp = server
            .handle(CallContext::default(), request(2, "foo_banana"))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(Value::Null));
        assert!(resp.error.is_none());
        assert!(serde_json::to_string(&resp).unwrap().contains(r#""result":null"#));

        let resp = server
            .handle(CallContext::default(), request(3, "foo_cherry"))
            .await
            .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.message, "method not found: foo_cherry");
    }

    #[tokio::test]
    async fn test_register_all_and_single() {
        let server = Server::new();
        server.register("foo_", Arc::new(FruitService), &[]).unwrap();
        assert_eq!(server.method_names(), vec!["foo_apple", "foo_banana", "foo_cherry"]);

        server
            .register_method("bar_pick", Arc::new(FruitService), "cherry")
            .unwrap();
        let resp = server
            .handle(CallContext::default(), request(1, "bar_pick"))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(json!("Cherry")));
    }

    #[test]
    fn test_duplicate_registration_fails_without_side_effects() {
        let server = Server::new();
        server
            .register("foo_", Arc::new(FruitService), &["apple"])
            .unwrap();
        let err = server
            .register("foo_", Arc::new(FruitService), &["banana", "apple"])
            .unwrap_err();
        assert!(matches!(err, WireError::DuplicateMethod(ref name) if name == "foo_apple"));
        assert_eq!(server.method_names(), vec!["foo_apple"]);
    }

    #[test]
    fn test_concurrent_registration_has_one_winner() {
        let server = Arc::new(Server::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                std::thread::spawn(move || {
                    server
                        .register("foo_", Arc::new(FruitService), &["apple", "banana"])
                        .is_ok()
                })
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(server.method_names(), vec!["foo_apple", "foo_banana"]);
    }

    #[test]
    fn test_unknown_service_method() {
        let server = Server::new();
        let err = server
            .register_method("foo_x", Arc::new(FruitService), "durian")
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownServiceMethod(_)));
    }

    #[tokio::test]
    async fn test_typed_params_and_errors() {
        let server = Server::new();
        server
            .register_handler(
                "math_div",
                MethodHandler::new(|_ctx, (a, b): (i64, i64)| async move {
                    if b == 0 {
                        return Err("division by zero".to_string());
                    }
                    Ok(a / b)
                }),
            )
            .unwrap();

        let ok = server
            .handle(
                CallContext::default(),
                Message::request(Id::Num(1), "math_div", json!([9, 3])),
            )
            .await
            .unwrap();
        assert_eq!(ok.result, Some(json!(3)));

        let failed = server
            .handle(
                CallContext::default(),
                Message::request(Id::Num(2), "math_div", json!([1, 0])),
            )
            .await
            .unwrap();
        assert_eq!(failed.error.unwrap().message, "division by zero");

        let bad = server
            .handle(
                CallContext::default(),
                Message::request(Id::Num(3), "math_div", json!(["x"])),
            )
            .await
            .unwrap();
        assert_eq!(bad.error.unwrap().code, crate::message::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let server = Server::new();
        server.register("foo_", Arc::new(FruitService), &[]).unwrap();
        let note = Message::notification("foo_apple", json!([]));
        assert!(server.handle(CallContext::default(), note).await.is_none());
        let unknown = Message::notification("foo_durian", json!([]));
        assert!(server.handle(CallContext::default(), unknown).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_message_reported() {
        let server = Server::new();
        let invalid: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":5}"#).unwrap();
        let resp = server.handle(CallContext::default(), invalid).await.unwrap();
        assert_eq!(resp.id, Some(Id::Num(5)));
        assert_eq!(resp.error.unwrap().code, crate::message::INVALID_REQUEST);
    }
}
