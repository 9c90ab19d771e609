use crate::sensorhub_logic::state::AppState;
use anyhow::Result;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{SinkExt, Stream, StreamExt, stream};
use lib_sensorhub::connections::{EventQuery, StoreError, StoredEvent};
use lib_sensorhub::ingestors::ManualSubmitError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Errors surfaced to HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    /// Reading from the event store failed.
    Store(StoreError),
    /// A manual submission was rejected or could not be stored.
    Manual(ManualSubmitError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<ManualSubmitError> for ApiError {
    fn from(e: ManualSubmitError) -> Self {
        ApiError::Manual(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Store(e) => {
                error!("Error fetching data: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": "Failed to fetch data",
                        "error_type": "StoreError",
                        "detail": e.to_string()
                    }),
                )
            }
            ApiError::Manual(e) if e.is_validation() => {
                warn!("Rejected manual submission: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    json!({
                        "error": e.to_string(),
                        "error_type": "ValidationError"
                    }),
                )
            }
            ApiError::Manual(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Failed to store data",
                    "error_type": "PersistenceError",
                    "detail": e.to_string()
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Raw `/data` parameters; parsed leniently by [`EventQuery::from_params`].
#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    pub since: Option<String>,
    pub order: Option<String>,
    pub limit: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/data", get(data_handler))
        .route("/realtime", get(realtime_handler))
        .route("/realtime/stream", get(realtime_stream_handler))
        .route("/manual", post(manual_handler))
        .route("/mqtt/status", get(mqtt_status_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` fires, then drains open
/// connections. Callers close the registries so long-lived streams end.
pub async fn run(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    info!("Downstream server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn data_handler(
    State(state): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let query = EventQuery::from_params(params.since.as_deref(), params.order.as_deref(), params.limit.as_deref());
    let events = state.store.query(&query).await?;
    debug!("Returning {} stored events", events.len());
    Ok(Json(events))
}

async fn realtime_handler(State(state): State<AppState>) -> Response {
    match state.broadcaster.latest() {
        Some(event) => Json(event.to_json()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn realtime_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.broadcaster.stream_registry().register();
    // the subscription unregisters itself when axum drops the stream
    let frames = stream::unfold(subscription, |mut subscription| async move {
        let frame = subscription.recv().await?;
        Some((Ok(SseEvent::default().data(&*frame)), subscription))
    });
    Sse::new(frames).keep_alive(KeepAlive::new().interval(state.sse_keep_alive))
}

async fn manual_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let receipt = state.manual.submit(&body).await?;
    Ok(Json(json!({
        "status": "stored",
        "id": receipt.document_id,
    })))
}

async fn mqtt_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.bus_status.is_connected();
    let status = if connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "status": if connected { "connected" } else { "disconnected" },
        "broker": &*state.broker,
        "topic": &*state.topic,
    });
    (status, Json(body))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut subscription = state.broadcaster.push_registry().register();
    let client_id = subscription.id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text((&*frame).into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    None => {
                        // dropped as lagging, or the server is shutting down
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // clients have nothing to say
                }
            }
        }
    }

    drop(subscription);
    debug!("WebSocket client {} finished", client_id);
}
