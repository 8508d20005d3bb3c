//! End-to-end: install -> register -> load -> dispatch -> bridge.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use plexus_core::extension::builtin::{CONVERSATIONAL_EXTENSION, DOWNLOAD_EXTENSION, MODEL_EXTENSION};
use plexus_core::{
    ActivationPoint, BridgeClient, BridgeEvent, BridgeEventStream, BridgeMethod, BridgeServer,
    CapabilityType,
    DispatchOutcome, DownloadSource, EventTopic, ExtensionManifest, InstallationState, PlexusError,
    PlexusRuntime, ServiceName, SourceResponse,
};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Serves a fixed body for every url.
struct StaticSource(Vec<u8>);

#[async_trait]
impl DownloadSource for StaticSource {
    async fn open(&self, _url: &str, _offset: u64) -> plexus_core::Result<SourceResponse> {
        let chunks: Vec<plexus_core::Result<Bytes>> = self
            .0
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(SourceResponse {
            total: Some(self.0.len() as u64),
            resumed: false,
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

fn chat_package(dir: &Path) -> PathBuf {
    let manifest = json!({
        "name": "@acme/chat-store",
        "version": "2.1.0",
        "description": "Alternative conversation store",
        "entrypoint": "builtin:conversational",
        "capabilityType": "conversational",
        "activationPoints": ["onLoad"],
    });

    let path = dir.join("chat-store-2.1.0.zip");
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    let options = zip::write::SimpleFileOptions::default();
    zip.start_file("chat-store/manifest.json", options).unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    zip.start_file("chat-store/README.md", options).unwrap();
    zip.write_all(b"chat store").unwrap();
    zip.finish().unwrap();
    path
}

fn runtime(dir: &Path) -> Arc<PlexusRuntime> {
    Arc::new(
        PlexusRuntime::builder(dir)
            .with_download_source(Arc::new(StaticSource(b"0123456789abcdef".to_vec())))
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_install_then_load_switches_provider() {
    let data = TempDir::new().unwrap();
    let packages = TempDir::new().unwrap();
    let runtime = runtime(data.path());

    runtime.init().await.unwrap();
    runtime.load().await.unwrap();
    let builtin = runtime
        .registry()
        .get(CapabilityType::Conversational)
        .await
        .unwrap();
    assert_eq!(builtin.name, CONVERSATIONAL_EXTENSION);
    assert!(runtime.registry().get_by_name(DOWNLOAD_EXTENSION).await.unwrap().active);
    assert_eq!(
        runtime.registry().get(CapabilityType::Model).await.unwrap().name,
        MODEL_EXTENSION
    );
    runtime
        .execute(
            ServiceName::ModelSave,
            json!({ "model": { "id": "tiny", "engine": "openai" } }),
        )
        .await
        .unwrap();
    let ready = runtime
        .execute(ServiceName::ModelListDownloaded, Value::Null)
        .await
        .unwrap();
    assert_eq!(ready.value().unwrap()[0]["id"], "tiny");
    assert!(data.path().join("models").join("tiny").join("model.json").is_file());

    let reports = runtime.install(&[chat_package(packages.path())]).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "@acme/chat-store");
    assert_eq!(reports[0].installation_state, InstallationState::Installed);

    // Manifest on disk is the normalized one and reads back identically.
    let installed = data.path().join("extensions").join("acme-chat-store");
    let manifest = ExtensionManifest::read_from(&installed).unwrap();
    assert_eq!(manifest.name, "@acme/chat-store");
    assert_eq!(manifest.capability_type, Some(CapabilityType::Conversational));

    // Registered after the built-in, so it wins on the next load.
    runtime.load().await.unwrap();
    let active = runtime
        .registry()
        .get(CapabilityType::Conversational)
        .await
        .unwrap();
    assert_eq!(active.name, "@acme/chat-store");
    assert!(!runtime
        .registry()
        .get_by_name(CONVERSATIONAL_EXTENSION)
        .await
        .unwrap()
        .active);

    let outcome = runtime
        .execute(ServiceName::CreateConversation, json!({ "title": "first" }))
        .await
        .unwrap();
    let thread = outcome.value().unwrap();
    let id = thread["id"].as_str().unwrap();
    assert!(data.path().join("threads").join(id).join("thread.json").is_file());

    runtime.teardown().await.unwrap();
    assert!(runtime.registry().active().await.is_empty());
    assert!(matches!(
        runtime
            .execute(ServiceName::ListConversations, Value::Null)
            .await
            .unwrap(),
        DispatchOutcome::Unavailable { .. }
    ));
}

#[tokio::test]
async fn test_selection_survives_restart() {
    let data = TempDir::new().unwrap();
    let packages = TempDir::new().unwrap();

    let installed = {
        let runtime = runtime(data.path());
        runtime.init().await.unwrap();
        runtime.install(&[chat_package(packages.path())]).await;
        let record = runtime.registry().get_by_name("@acme/chat-store").await.unwrap();
        runtime
            .registry()
            .set_active(CapabilityType::Conversational, CONVERSATIONAL_EXTENSION)
            .await
            .unwrap();
        runtime.teardown().await.unwrap();
        record
    };

    let runtime = runtime(data.path());
    runtime.init().await.unwrap();

    // Rescanned from disk with the same identity it was installed with.
    let rescanned = runtime.registry().get_by_name("@acme/chat-store").await.unwrap();
    assert_eq!(rescanned.name, installed.name);
    assert_eq!(rescanned.capability_type, installed.capability_type);
    assert_eq!(rescanned.activation_points, installed.activation_points);
    assert_eq!(rescanned.activation_points, vec![ActivationPoint::OnLoad]);

    runtime.load().await.unwrap();
    assert_eq!(
        runtime
            .registry()
            .get(CapabilityType::Conversational)
            .await
            .unwrap()
            .name,
        CONVERSATIONAL_EXTENSION
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bridge_round_trip() {
    let data = TempDir::new().unwrap();
    let runtime = runtime(data.path());
    runtime.init().await.unwrap();
    runtime.load().await.unwrap();

    let server = BridgeServer::start(runtime.clone()).await.unwrap();
    let client = BridgeClient::connect(server.addr()).await.unwrap();

    let pong = client.call(BridgeMethod::Ping, Value::Null).await.unwrap();
    assert_eq!(pong["pong"], true);

    let listed = client.call(BridgeMethod::ListExtensions, Value::Null).await.unwrap();
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert!(names.contains(&CONVERSATIONAL_EXTENSION));

    // Not in the closed method set: rejected before any handler runs.
    let err = client.call_raw("deleteEverything", json!({})).await.unwrap_err();
    assert_eq!(err.to_rpc_error_code(), -32601);
    assert!(matches!(err, PlexusError::UnsupportedOperation(_)));

    let created = client
        .call(
            BridgeMethod::ExecuteService,
            json!({ "service": "CreateConversation", "args": { "title": "over the bridge" } }),
        )
        .await
        .unwrap();
    let thread_id = created["value"]["id"].as_str().unwrap().to_string();

    client
        .call(
            BridgeMethod::ExecuteServiceSerial,
            json!({
                "service": "AddMessage",
                "args": { "threadId": thread_id, "role": "user", "content": "hi" }
            }),
        )
        .await
        .unwrap();
    let messages = client
        .call(
            BridgeMethod::ExecuteService,
            json!({ "service": "GetMessages", "args": { "threadId": thread_id } }),
        )
        .await
        .unwrap();
    assert_eq!(messages["value"][0]["content"], "hi");

    let missing = client
        .call(
            BridgeMethod::ExecuteService,
            json!({ "service": "GetConversation", "args": { "id": "no-such-thread" } }),
        )
        .await
        .unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bridge_pushes_download_and_settings_events() {
    let data = TempDir::new().unwrap();
    let runtime = runtime(data.path());
    runtime.init().await.unwrap();
    runtime.load().await.unwrap();

    let server = BridgeServer::start(runtime.clone()).await.unwrap();
    let mut events = BridgeEventStream::open(
        server.addr(),
        &[EventTopic::DownloadCompleted, EventTopic::SettingsChanged],
    )
    .await
    .unwrap();
    let client = BridgeClient::connect(server.addr()).await.unwrap();

    let started = client
        .call(
            BridgeMethod::StartDownload,
            json!({ "url": "https://models.example/tiny.bin", "destination": "models/tiny.bin" }),
        )
        .await
        .unwrap();
    assert_eq!(started["key"], "tiny.bin");

    let event = tokio::time::timeout(Duration::from_secs(5), events.next_event())
        .await
        .expect("download completes")
        .unwrap()
        .unwrap();
    match event {
        BridgeEvent::DownloadCompleted {
            key,
            bytes_transferred,
            ..
        } => {
            assert_eq!(key, "tiny.bin");
            assert_eq!(bytes_transferred, 16);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let written = std::fs::read(data.path().join("models").join("tiny.bin")).unwrap();
    assert_eq!(written, b"0123456789abcdef");

    // Key left the active table before the terminal event went out.
    let state = client
        .call(BridgeMethod::GetDownloadState, json!({ "key": "tiny.bin" }))
        .await
        .unwrap();
    assert!(state.is_null());

    client
        .call(
            BridgeMethod::SetActiveExtension,
            json!({ "capabilityType": "conversational", "name": CONVERSATIONAL_EXTENSION }),
        )
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.next_event())
        .await
        .expect("settings event")
        .unwrap()
        .unwrap();
    assert!(matches!(event, BridgeEvent::SettingsChanged { .. }));
}
