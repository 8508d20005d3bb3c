//! UI-side bridge client.
//!
//! `BridgeClient` serializes calls over a single TCP connection behind a
//! tokio `Mutex`, so it can be shared between tasks. Event subscriptions use
//! a dedicated connection, returned as a `BridgeEventStream`.

use super::events::{BridgeEvent, EventTopic};
use super::protocol::{
    read_frame, write_frame, BridgeMethod, BridgeRequest, BridgeResponse, EVENT_NOTIFICATION,
    SUBSCRIBE_EVENTS,
};
use crate::config::BridgeConfig;
use crate::error::{PlexusError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct BridgeClient {
    stream: Mutex<TcpStream>,
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl BridgeClient {
    /// Connect to the host's bridge server.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = open(addr).await?;
        debug!("Bridge client connected to {}", addr);

        Ok(Self {
            stream: Mutex::new(stream),
            addr,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call an allowed bridge method.
    pub async fn call(&self, method: BridgeMethod, params: serde_json::Value) -> Result<serde_json::Value> {
        self.call_raw(method.as_str(), params).await
    }

    /// Call a method by its wire name. The host still rejects names outside
    /// the allowed set.
    pub async fn call_raw(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = BridgeRequest::new(method, params, id);
        let request_bytes = serde_json::to_vec(&request)?;

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, &request_bytes)
            .await
            .map_err(|_| self.disconnected())?;

        let response_bytes = read_frame(&mut reader)
            .await
            .map_err(|_| self.disconnected())?
            .ok_or_else(|| self.disconnected())?;

        let response: BridgeResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| PlexusError::Json {
                message: format!("Failed to parse bridge response: {}", e),
                source: Some(e),
            })?;

        if let Some(err) = response.error {
            return Err(err.into());
        }

        response
            .result
            .ok_or_else(|| PlexusError::Other("Bridge response missing result".to_string()))
    }

    /// Open a dedicated connection streaming events for `topics`
    /// (all topics when empty).
    pub async fn subscribe(&self, topics: &[EventTopic]) -> Result<BridgeEventStream> {
        BridgeEventStream::open(self.addr, topics).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn disconnected(&self) -> PlexusError {
        PlexusError::BridgeDisconnected {
            addr: self.addr.to_string(),
        }
    }
}

/// Event notifications pushed by the host, in emission order.
#[derive(Debug)]
pub struct BridgeEventStream {
    stream: TcpStream,
    addr: SocketAddr,
}

impl BridgeEventStream {
    pub async fn open(addr: SocketAddr, topics: &[EventTopic]) -> Result<Self> {
        let mut stream = open(addr).await?;
        let names: Vec<&str> = topics.iter().map(|t| t.as_str()).collect();
        let request = BridgeRequest::new(SUBSCRIBE_EVENTS, serde_json::json!({ "topics": names }), 1);

        let lost = || PlexusError::BridgeDisconnected {
            addr: addr.to_string(),
        };
        write_frame(&mut stream, &serde_json::to_vec(&request)?)
            .await
            .map_err(|_| lost())?;
        let ack = read_frame(&mut stream).await.map_err(|_| lost())?.ok_or_else(lost)?;
        let ack: BridgeResponse = serde_json::from_slice(&ack)?;
        if let Some(err) = ack.error {
            return Err(err.into());
        }

        debug!("Subscribed to bridge events on {}", addr);
        Ok(Self { stream, addr })
    }

    /// Wait for the next event. `None` once the host closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<BridgeEvent>> {
        loop {
            let Some(frame) = read_frame(&mut self.stream).await.map_err(|_| {
                PlexusError::BridgeDisconnected {
                    addr: self.addr.to_string(),
                }
            })?
            else {
                return Ok(None);
            };

            let note: BridgeRequest = serde_json::from_slice(&frame)?;
            if note.method != EVENT_NOTIFICATION {
                debug!("Ignoring unexpected notification '{}'", note.method);
                continue;
            }
            let params = note.params.unwrap_or(serde_json::Value::Null);
            return Ok(Some(serde_json::from_value(params)?));
        }
    }
}

async fn open(addr: SocketAddr) -> Result<TcpStream> {
    let lost = || PlexusError::BridgeDisconnected {
        addr: addr.to_string(),
    };
    tokio::time::timeout(BridgeConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| lost())?
        .map_err(|_| lost())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::EventBus;
    use crate::bridge::server::{BridgeDispatch, BridgeServer};
    use std::sync::Arc;

    struct TestDispatch {
        events: EventBus,
    }

    #[async_trait::async_trait]
    impl BridgeDispatch for TestDispatch {
        async fn dispatch(
            &self,
            method: BridgeMethod,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match method {
                BridgeMethod::Ping => Ok(serde_json::json!("pong")),
                BridgeMethod::AbortDownload => Err(PlexusError::DownloadNotFound {
                    key: params["key"].as_str().unwrap_or_default().to_string(),
                }),
                _ => Err(PlexusError::InvalidParams {
                    message: format!("{} not wired in test", method),
                }),
            }
        }

        fn events(&self) -> EventBus {
            self.events.clone()
        }
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let dispatch = Arc::new(TestDispatch {
            events: EventBus::new(),
        });
        let mut handle = BridgeServer::start(dispatch).await.unwrap();

        let client = BridgeClient::connect(handle.addr()).await.unwrap();
        let result = client
            .call(BridgeMethod::Ping, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_client_errors_keep_their_code() {
        let dispatch = Arc::new(TestDispatch {
            events: EventBus::new(),
        });
        let mut handle = BridgeServer::start(dispatch).await.unwrap();
        let client = BridgeClient::connect(handle.addr()).await.unwrap();

        let err = client
            .call(BridgeMethod::AbortDownload, serde_json::json!({"key": "a.bin"}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = client
            .call_raw("deleteEverything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::UnsupportedOperation(_)));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_dead_server() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            BridgeClient::connect(addr).await,
            Err(PlexusError::BridgeDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_event_stream_receives_published_events() {
        let events = EventBus::new();
        let dispatch = Arc::new(TestDispatch {
            events: events.clone(),
        });
        let mut handle = BridgeServer::start(dispatch).await.unwrap();
        let client = BridgeClient::connect(handle.addr()).await.unwrap();

        let mut stream = client.subscribe(&[EventTopic::DownloadError]).await.unwrap();
        events.publish(BridgeEvent::DownloadError {
            key: "k".into(),
            code: "NETWORK".into(),
            message: "connection reset".into(),
        });

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.topic(), EventTopic::DownloadError);
        assert_eq!(event.download_key(), Some("k"));

        handle.shutdown();
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_detects_server_shutdown() {
        let dispatch = Arc::new(TestDispatch {
            events: EventBus::new(),
        });
        let mut handle = BridgeServer::start(dispatch).await.unwrap();
        let client = BridgeClient::connect(handle.addr()).await.unwrap();
        assert!(client.call(BridgeMethod::Ping, serde_json::json!({})).await.is_ok());

        handle.shutdown();

        let mut detected_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if client
                .call(BridgeMethod::Ping, serde_json::json!({}))
                .await
                .is_err()
            {
                detected_shutdown = true;
                break;
            }
        }
        assert!(detected_shutdown, "client should detect server shutdown");
    }
}
