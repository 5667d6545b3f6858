// Shared code for our test harness.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::Response;
use anyhow::{Context, Result};
use smoothstream_dl::{ChunkTiming, QualityLevel, SmoothStreamingMedia, StreamIndex};
use tracing::info;


static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, fmt::time::LocalTime, prelude::*};
    use time::macros::format_description;

    TRACING_INIT.call_once(|| {
        let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
        let fmt_layer = fmt::layer()
            .compact()
            .with_timer(timer)
            .with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,h2=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}


pub fn stream_index(stream_type: &str, bitrates: &[&str], durations: &[&str]) -> StreamIndex {
    let quality_levels = bitrates.iter()
        .enumerate()
        .map(|(i, b)| QualityLevel {
            index: Some(i.to_string()),
            bitrate: Some(b.to_string()),
            fourcc: Some(String::from(if stream_type == "video" { "H264" } else { "AACL" })),
            ..Default::default()
        })
        .collect();
    let timeline = durations.iter()
        .enumerate()
        .map(|(n, d)| ChunkTiming {
            n: Some(n.to_string()),
            d: Some(d.to_string()),
            ..Default::default()
        })
        .collect();
    StreamIndex {
        stream_type: Some(stream_type.to_string()),
        name: Some(stream_type.to_string()),
        chunks: Some(durations.len().to_string()),
        quality_level_count: Some(bitrates.len().to_string()),
        url: Some(format!("QualityLevels({{bitrate}})/Fragments({stream_type}={{start time}})")),
        quality_levels,
        timeline,
        ..Default::default()
    }
}

/// A client manifest with the given StreamIndex nodes, serialized to XML.
pub fn client_manifest(streams: Vec<StreamIndex>) -> String {
    let ssm = SmoothStreamingMedia {
        major_version: Some(String::from("2")),
        minor_version: Some(String::from("0")),
        duration: Some(String::from("40000000")),
        stream_indexes: streams,
        ..Default::default()
    };
    ssm.to_string()
}

/// The manifest of the reference scenario: video at 128000 and 256000 bps, audio at 64000 bps, two
/// fragments of 2000 units in each track.
pub fn two_track_manifest() -> String {
    client_manifest(vec![
        stream_index("video", &["128000", "256000"], &["2000", "2000"]),
        stream_index("audio", &["64000"], &["2000", "2000"]),
    ])
}

pub const SERVER_MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<smil xmlns="http://www.w3.org/2001/SMIL20/Language"><head/><body/></smil>"#;

/// Content served for the fragment at a request path. Distinct for each fragment, so that the
/// concatenated track files can be checked.
pub fn fragment_bytes(path: &str) -> Vec<u8> {
    format!("[moof {path}]").into_bytes()
}


struct OriginState {
    client_manifest: String,
    requests: Mutex<Vec<String>>,
}

/// An HTTP server that behaves like a Smooth Streaming origin for a single presentation, serving
/// the manifests and fragments under `/videos/` and recording the path of each request.
pub struct MockOrigin {
    pub addr: SocketAddr,
    state: Arc<OriginState>,
}

pub const MANIFEST_NAME: &str = "asset-1";

async fn serve_origin(State(state): State<Arc<OriginState>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    info!("origin request: {path}");
    state.requests.lock().unwrap().push(path.clone());
    let (content_type, body) = if path == format!("/videos/{MANIFEST_NAME}.ismc") {
        ("text/xml", state.client_manifest.clone().into_bytes())
    } else if path == format!("/videos/{MANIFEST_NAME}.ism") {
        ("application/smil+xml", SERVER_MANIFEST.as_bytes().to_vec())
    } else if path.starts_with(&format!("/videos/{MANIFEST_NAME}.ism/QualityLevels(")) {
        ("video/mp4", fragment_bytes(&path))
    } else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap();
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

impl MockOrigin {
    pub async fn start(client_manifest: String) -> Result<MockOrigin> {
        let state = Arc::new(OriginState {
            client_manifest,
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(serve_origin)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await
            .context("binding mock origin")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await
        });
        Ok(MockOrigin { addr, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/videos/", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn fragment_requests(&self) -> Vec<String> {
        self.requests().into_iter()
            .filter(|p| p.contains("/QualityLevels("))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.requests.lock().unwrap().clear();
    }
}

#[cfg(feature = "fetch")]
/// An HTTP client that ignores any proxy configured in the environment, since it only talks to our
/// local server.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::new(10, 0))
        .build()
        .expect("creating HTTP client")
}
