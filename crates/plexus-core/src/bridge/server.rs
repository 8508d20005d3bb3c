//! TCP bridge server run by the host process.
//!
//! Listens on `127.0.0.1` (OS-assigned port unless one is requested),
//! accepts UI connections and dispatches JSON-RPC calls. Method names are
//! checked against [`BridgeMethod`] before anything else runs.
//!
//! A connection whose first call is `subscribeEvents` becomes a one-way
//! event stream: the server acknowledges the subscription, then writes a
//! `{"method": "event", "params": <event>}` notification per published
//! event until either side closes.

use super::events::{EventBus, EventSubscription, EventTopic};
use super::protocol::{
    read_frame, write_frame, BridgeMethod, BridgeRequest, BridgeResponse, EVENT_NOTIFICATION,
    SUBSCRIBE_EVENTS,
};
use crate::config::BridgeConfig;
use crate::error::{PlexusError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Handle to a running bridge server. Dropping shuts down the server.
pub struct BridgeServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BridgeServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close every open one.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BridgeServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Host-side handler for bridge calls.
#[async_trait::async_trait]
pub trait BridgeDispatch: Send + Sync + 'static {
    /// Execute an allowed bridge method.
    async fn dispatch(&self, method: BridgeMethod, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Bus that `subscribeEvents` connections are attached to.
    fn events(&self) -> EventBus;
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    topics: Vec<String>,
}

enum Next {
    Continue,
    Stream(EventSubscription),
}

/// Owns the listener. Every served connection holds one slot until it closes.
struct Acceptor<D> {
    listener: TcpListener,
    dispatch: Arc<D>,
    slots: Arc<Semaphore>,
    closing: watch::Receiver<bool>,
}

impl<D: BridgeDispatch> Acceptor<D> {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(e) => error!("Bridge accept error: {}", e),
            }
        }
        info!("Bridge server stopped accepting connections");
    }

    /// Run `stream` on its own task, or close it when no slot is free.
    fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let Ok(slot) = self.slots.clone().try_acquire_owned() else {
            warn!("Closing bridge connection from {}: no free connection slot", peer);
            return;
        };
        let dispatch = self.dispatch.clone();
        let mut closing = self.closing.clone();

        tokio::spawn(async move {
            debug!("Bridge connection from {}", peer);
            if let Err(e) = BridgeServer::handle_connection(stream, &*dispatch, &mut closing).await {
                debug!("Bridge connection {} ended: {}", peer, e);
            }
            drop(slot);
        });
    }
}

/// Bridge server.
pub struct BridgeServer;

impl BridgeServer {
    /// Start on an OS-assigned loopback port.
    pub async fn start<D: BridgeDispatch>(dispatch: Arc<D>) -> Result<BridgeServerHandle> {
        Self::start_on(dispatch, 0).await
    }

    /// Start on a specific loopback port (`0` lets the OS choose).
    pub async fn start_on<D: BridgeDispatch>(dispatch: Arc<D>, port: u16) -> Result<BridgeServerHandle> {
        Self::bind(dispatch, port, BridgeConfig::MAX_CONNECTIONS).await
    }

    async fn bind<D: BridgeDispatch>(
        dispatch: Arc<D>,
        port: u16,
        max_connections: usize,
    ) -> Result<BridgeServerHandle> {
        let listener = TcpListener::bind((BridgeConfig::BIND_HOST, port)).await?;
        let addr = listener.local_addr()?;
        info!("Bridge server listening on {} (up to {} connections)", addr, max_connections);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, closing) = watch::channel(false);
        let acceptor = Acceptor {
            listener,
            dispatch,
            slots: Arc::new(Semaphore::new(max_connections)),
            closing,
        };

        Ok(BridgeServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(tokio::spawn(acceptor.run(shutdown_rx))),
        })
    }

    async fn handle_connection<D: BridgeDispatch>(
        mut stream: TcpStream,
        dispatch: &D,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let (response, next) = Self::process_frame(&frame, dispatch).await;
            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;

            if let Next::Stream(subscription) = next {
                return Self::stream_events(&mut reader, &mut writer, subscription, shutdown_rx).await;
            }
        }
    }

    async fn process_frame<D: BridgeDispatch>(frame: &[u8], dispatch: &D) -> (BridgeResponse, Next) {
        let request: BridgeRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return (
                    BridgeResponse::error(None, -32700, format!("Parse error: {}", e)),
                    Next::Continue,
                );
            }
        };

        if request.jsonrpc != "2.0" {
            return (
                BridgeResponse::error(
                    request.id,
                    -32600,
                    "Invalid Request: expected jsonrpc 2.0".to_string(),
                ),
                Next::Continue,
            );
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        if request.method == SUBSCRIBE_EVENTS {
            return match Self::subscribe(params, dispatch) {
                Ok((topics, subscription)) => (
                    BridgeResponse::success(request.id, serde_json::json!({ "subscribed": topics })),
                    Next::Stream(subscription),
                ),
                Err(e) => (BridgeResponse::from_error(request.id, &e), Next::Continue),
            };
        }

        let method = match request.method.parse::<BridgeMethod>() {
            Ok(method) => method,
            Err(e) => {
                warn!("Rejected bridge call to unsupported method '{}'", request.method);
                return (BridgeResponse::from_error(request.id, &e), Next::Continue);
            }
        };

        let response = match dispatch.dispatch(method, params).await {
            Ok(result) => BridgeResponse::success(request.id, result),
            Err(e) => {
                debug!("Bridge call {} failed: {}", method, e);
                BridgeResponse::from_error(request.id, &e)
            }
        };
        (response, Next::Continue)
    }

    fn subscribe<D: BridgeDispatch>(
        params: serde_json::Value,
        dispatch: &D,
    ) -> Result<(Vec<&'static str>, EventSubscription)> {
        let params: SubscribeParams = serde_json::from_value(params).map_err(|e| {
            PlexusError::InvalidParams {
                message: e.to_string(),
            }
        })?;

        let topics = params
            .topics
            .iter()
            .map(|t| {
                t.parse::<EventTopic>()
                    .map_err(|message| PlexusError::InvalidParams { message })
            })
            .collect::<Result<Vec<_>>>()?;

        let names = if topics.is_empty() {
            EventTopic::ALL.iter().map(|t| t.as_str()).collect()
        } else {
            topics.iter().map(|t| t.as_str()).collect()
        };
        Ok((names, dispatch.events().subscribe(&topics)))
    }

    async fn stream_events<R, W>(
        reader: &mut R,
        writer: &mut W,
        mut subscription: EventSubscription,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!("Bridge connection switched to event streaming");
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    let note = BridgeRequest::notification(
                        EVENT_NOTIFICATION,
                        serde_json::to_value(&event)?,
                    );
                    write_frame(writer, &serde_json::to_vec(&note)?).await?;
                }
                frame = read_frame(reader) => {
                    match frame? {
                        None => return Ok(()),
                        Some(_) => {
                            let resp = BridgeResponse::error(
                                None,
                                -32600,
                                "Invalid Request: connection is an event stream".to_string(),
                            );
                            write_frame(writer, &serde_json::to_vec(&resp)?).await?;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::BridgeEvent;

    struct EchoDispatch {
        events: EventBus,
    }

    #[async_trait::async_trait]
    impl BridgeDispatch for EchoDispatch {
        async fn dispatch(
            &self,
            method: BridgeMethod,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match method {
                BridgeMethod::Ping => Ok(serde_json::json!("pong")),
                BridgeMethod::ExecuteService => Ok(params),
                _ => Err(PlexusError::Other("test failure".to_string())),
            }
        }

        fn events(&self) -> EventBus {
            self.events.clone()
        }
    }

    async fn start() -> (BridgeServerHandle, EventBus) {
        let events = EventBus::new();
        let dispatch = Arc::new(EchoDispatch {
            events: events.clone(),
        });
        (BridgeServer::start(dispatch).await.unwrap(), events)
    }

    async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> BridgeResponse {
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, payload).await.unwrap();
        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let (mut handle, _) = start().await;
        assert!(handle.port > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_allowed_method_roundtrip() {
        let (mut handle, _) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let req = BridgeRequest::new("executeService", serde_json::json!({"x": 1}), 1);
        let resp = roundtrip(&mut stream, &serde_json::to_vec(&req).unwrap()).await;

        assert!(resp.error.is_none());
        assert_eq!(resp.result, Some(serde_json::json!({"x": 1})));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_before_dispatch() {
        let (mut handle, _) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let req = BridgeRequest::new("eval", serde_json::json!({"code": "1+1"}), 2);
        let resp = roundtrip(&mut stream, &serde_json::to_vec(&req).unwrap()).await;

        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
        assert!(err.message.contains("eval"));
        assert_eq!(resp.id, Some(serde_json::json!(2)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_json_returns_parse_error() {
        let (mut handle, _) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let resp = roundtrip(&mut stream, b"not valid json").await;
        assert_eq!(resp.error.unwrap().code, -32700);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (mut handle, _) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let resp = roundtrip(
            &mut stream,
            br#"{"jsonrpc":"1.0","method":"ping","id":1}"#,
        )
        .await;
        assert_eq!(resp.error.unwrap().code, -32600);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_streams_events_in_order() {
        let (mut handle, events) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let req = BridgeRequest::new(
            SUBSCRIBE_EVENTS,
            serde_json::json!({"topics": ["download.progress"]}),
            1,
        );
        let ack = roundtrip(&mut stream, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(
            ack.result,
            Some(serde_json::json!({"subscribed": ["download.progress"]}))
        );

        for n in 1..=3 {
            events.publish(BridgeEvent::DownloadProgress {
                key: "k".into(),
                bytes_transferred: n,
                bytes_total: None,
            });
        }
        // Filtered out.
        events.publish(BridgeEvent::DownloadAborted {
            key: "k".into(),
            bytes_transferred: 3,
        });

        let (mut reader, _) = stream.split();
        for n in 1..=3u64 {
            let bytes = read_frame(&mut reader).await.unwrap().unwrap();
            let note: BridgeRequest = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(note.method, EVENT_NOTIFICATION);
            assert!(note.id.is_none());
            let params = note.params.unwrap();
            assert_eq!(params["topic"], "download.progress");
            assert_eq!(params["payload"]["bytesTransferred"], n);
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_with_unknown_topic_is_invalid_params() {
        let (mut handle, _) = start().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let req = BridgeRequest::new(
            SUBSCRIBE_EVENTS,
            serde_json::json!({"topics": ["model.loaded"]}),
            1,
        );
        let resp = roundtrip(&mut stream, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.error.unwrap().code, -32602);

        // Connection stays in request/response mode.
        let req = BridgeRequest::new("ping", serde_json::json!({}), 2);
        let resp = roundtrip(&mut stream, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.result, Some(serde_json::json!("pong")));
        handle.shutdown();
    }

    async fn ping_served(addr: SocketAddr) -> bool {
        let Ok(mut stream) = TcpStream::connect(addr).await else {
            return false;
        };
        let (mut reader, mut writer) = stream.split();
        let req = serde_json::to_vec(&BridgeRequest::new("ping", serde_json::json!({}), 1)).unwrap();
        if write_frame(&mut writer, &req).await.is_err() {
            return false;
        }
        matches!(read_frame(&mut reader).await, Ok(Some(_)))
    }

    #[tokio::test]
    async fn test_connections_beyond_limit_are_closed_until_a_slot_frees() {
        let dispatch = Arc::new(EchoDispatch {
            events: EventBus::new(),
        });
        let mut handle = BridgeServer::bind(dispatch, 0, 1).await.unwrap();

        let mut held = TcpStream::connect(handle.addr()).await.unwrap();
        let req = BridgeRequest::new("ping", serde_json::json!({}), 1);
        let resp = roundtrip(&mut held, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.result, Some(serde_json::json!("pong")));

        assert!(!ping_served(handle.addr()).await);

        drop(held);
        let mut served = false;
        for _ in 0..50 {
            if ping_served(handle.addr()).await {
                served = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(served, "slot was not released after the first client left");
        handle.shutdown();
    }
}
