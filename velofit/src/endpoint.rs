//! HTTP endpoint binding the two client channels: the binary video stream
//! (`GET /video`) and the JSON event stream (`GET /events`, WebSocket).
//! Commands enter through `POST /command` or as WebSocket text frames.
//!
//! Video wire format: records of `u64 frame_id (LE) · u32 payload_len (LE)
//! · JPEG bytes`. While no ring is attached, placeholder records with
//! `frame_id = 0` keep the client painting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use frame_ring::FrameRing;
use velofit_bus::EventBus;
use velofit_types::{CamId, CommandEnvelope, CriticalEvent, FrameShape, ShmHandshake};

/// JPEG quality for the browser stream.
const JPEG_QUALITY: u8 = 50;

/// Target pacing of the video stream towards the client.
const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Cadence of placeholder records while no source is attached.
const PLACEHOLDER_INTERVAL: Duration = Duration::from_millis(500);

type RingDirectory = Arc<RwLock<BTreeMap<CamId, ShmHandshake>>>;

#[derive(Clone)]
pub struct EndpointState {
    bus: EventBus,
    rings: RingDirectory,
    events_tx: tokio::sync::broadcast::Sender<String>,
}

impl EndpointState {
    pub fn new(bus: EventBus) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        EndpointState {
            bus,
            rings: Arc::new(RwLock::new(BTreeMap::new())),
            events_tx,
        }
    }
}

/// Drain the bus into the endpoint: handshakes update the ring directory
/// (the authoritative re-attach trigger), broadcast and stream events are
/// serialized once and fanned out to every WebSocket client.
async fn pump_bus(state: EndpointState) {
    loop {
        let mut idle = true;
        while let Some(event) = state.bus.poll_critical() {
            idle = false;
            match event {
                CriticalEvent::ShmHandshake(hs) => {
                    info!(
                        "handshake: camera {} now on ring {}",
                        hs.camera_id, hs.shm_name
                    );
                    state.rings.write().insert(hs.camera_id, hs.clone());
                    if let Ok(text) =
                        serde_json::to_string(&CriticalEvent::ShmHandshake(hs))
                    {
                        let _ = state.events_tx.send(text);
                    }
                }
            }
        }
        while let Some(event) = state.bus.poll_broadcast() {
            idle = false;
            if let Ok(text) = serde_json::to_string(&event) {
                let _ = state.events_tx.send(text);
            }
        }
        while let Some(payload) = state.bus.poll_stream() {
            idle = false;
            let wrapped = serde_json::json!({"type": "stream", "payload": payload});
            let _ = state.events_tx.send(wrapped.to_string());
        }
        if idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

fn encode_record(frame_id: u64, jpeg: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(12 + jpeg.len());
    record.write_u64::<LittleEndian>(frame_id).expect("vec write");
    record
        .write_u32::<LittleEndian>(jpeg.len() as u32)
        .expect("vec write");
    record.extend_from_slice(jpeg);
    record
}

fn encode_jpeg(pixels: &[u8], shape: FrameShape) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    let color = match shape.channels {
        1 => image::ExtendedColorType::L8,
        3 => image::ExtendedColorType::Rgb8,
        _ => return None,
    };
    encoder
        .encode(pixels, shape.width, shape.height, color)
        .ok()?;
    Some(out)
}

/// "Waiting for camera" card sent while no ring is attached.
fn placeholder_jpeg() -> &'static [u8] {
    static PLACEHOLDER: std::sync::OnceLock<Vec<u8>> = std::sync::OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        let shape = FrameShape::new(240, 320, 3);
        let mut pixels = vec![24u8; shape.num_bytes()];
        // A lighter horizontal band so the card is visibly not a dead feed.
        for y in 110..130 {
            for x in 0..320 {
                let at = (y * 320 + x) * 3;
                pixels[at..at + 3].fill(96);
            }
        }
        encode_jpeg(&pixels, shape).expect("placeholder encodes")
    })
}

struct VideoSource {
    state: EndpointState,
    camera_id: CamId,
    attached: Option<(String, FrameRing)>,
    frame_buf: Vec<u8>,
    last_frame_id: i64,
}

impl VideoSource {
    fn new(state: EndpointState, camera_id: CamId) -> Self {
        VideoSource {
            state,
            camera_id,
            attached: None,
            frame_buf: Vec::new(),
            last_frame_id: -1,
        }
    }

    /// Follow the ring directory: attach on first handshake, re-attach
    /// whenever a newer handshake names a different ring (hot-swap).
    fn refresh_attachment(&mut self) {
        let desired = self.state.rings.read().get(&self.camera_id).cloned();
        let Some(hs) = desired else {
            return;
        };
        let already = matches!(&self.attached, Some((name, _)) if *name == hs.shm_name);
        if already {
            return;
        }
        match FrameRing::attach(&hs.shm_name, hs.shape) {
            Ok(ring) => {
                info!(
                    "video client following camera {} to ring {}",
                    self.camera_id, hs.shm_name
                );
                self.attached = Some((hs.shm_name, ring));
                self.last_frame_id = -1;
            }
            Err(e) => debug!("cannot attach {} yet: {e}", hs.shm_name),
        }
    }

    async fn next_record(&mut self) -> Vec<u8> {
        loop {
            tokio::time::sleep(VIDEO_FRAME_INTERVAL).await;
            self.refresh_attachment();

            let Some((_, ring)) = &self.attached else {
                tokio::time::sleep(PLACEHOLDER_INTERVAL).await;
                return encode_record(0, placeholder_jpeg());
            };

            let Ok(header) = ring.read_latest_copy(&mut self.frame_buf) else {
                continue;
            };
            if header.frame_id == self.last_frame_id {
                continue;
            }
            self.last_frame_id = header.frame_id;
            let shape = ring.shape();
            let pixels = std::mem::take(&mut self.frame_buf);
            let (jpeg, pixels) = tokio::task::spawn_blocking(move || {
                (encode_jpeg(&pixels, shape), pixels)
            })
            .await
            .unwrap_or((None, Vec::new()));
            self.frame_buf = pixels;
            if let Some(jpeg) = jpeg {
                return encode_record(header.frame_id.max(0) as u64, &jpeg);
            }
        }
    }
}

#[derive(Deserialize)]
struct VideoQuery {
    #[serde(default)]
    camera: u8,
}

async fn video(
    State(state): State<EndpointState>,
    Query(query): Query<VideoQuery>,
) -> Response {
    let source = VideoSource::new(state, CamId(query.camera));
    let stream = futures::stream::unfold(source, |mut source| async move {
        let record = source.next_record().await;
        Some((Ok::<_, std::convert::Infallible>(record), source))
    });
    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .expect("static response builds")
}

async fn events(
    ws: WebSocketUpgrade,
    State(state): State<EndpointState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

async fn handle_events(mut socket: WebSocket, state: EndpointState) {
    let mut rx = state.events_tx.subscribe();

    // Replay known handshakes so a late client can attach immediately.
    let known: Vec<ShmHandshake> = state.rings.read().values().cloned().collect();
    for hs in known {
        if let Ok(text) = serde_json::to_string(&CriticalEvent::ShmHandshake(hs)) {
            if socket.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            forwarded = rx.recv() => match forwarded {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("websocket client lagged, {n} events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<CommandEnvelope>(&text) {
                        Ok(envelope) => state.bus.send_envelope(envelope),
                        Err(e) => warn!("unparseable websocket command: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }
}

async fn command(
    State(state): State<EndpointState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Json<serde_json::Value> {
    debug!("command via HTTP: {} -> {}", envelope.cmd, envelope.target);
    state.bus.send_envelope(envelope);
    Json(serde_json::json!({"status": "ok"}))
}

/// Serve until `shutdown` resolves. The bus pump runs alongside the router
/// for the lifetime of the server.
pub async fn serve(
    addr: &str,
    bus: EventBus,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = EndpointState::new(bus);
    let pump = tokio::spawn(pump_bus(state.clone()));

    let app = Router::new()
        .route("/video", get(video))
        .route("/events", get(events))
        .route("/command", post(command))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    pump.abort();
    Ok(())
}
