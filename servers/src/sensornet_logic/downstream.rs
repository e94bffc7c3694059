use crate::sensornet_logic::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use lib_sensornet::core::{Field, FieldValue, Metric, Table};
use lib_sensornet::utils::clock_hms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Newest traffic log entries returned when no `limit` is given.
pub const DEFAULT_LOG_LIMIT: usize = 10;

pub fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/graph", get(graph_handler))
        .route("/api/latest", get(latest_handler))
        .route("/api/log", get(log_handler))
        .route("/api/export.csv", get(export_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(app_state)
}

pub async fn run(listener: TcpListener, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    match listener.local_addr() {
        Ok(addr) => log::info!("Downstream server listening on {}", addr),
        Err(e) => log::warn!("Downstream server listening on an unknown address: {}", e),
    }

    let served = axum::serve(listener, router(app_state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await;

    if let Err(e) = served {
        log::error!("Downstream server failed: {}", e);
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status())
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphQuery {
    /// Comma-separated column names.
    pub fields: Option<String>,
}

fn graph_fields(query: &GraphQuery) -> Vec<Field> {
    let requested: Vec<Field> = query
        .fields
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Field::parse)
        .collect();

    if !requested.is_empty() {
        return requested;
    }
    std::iter::once(Field::ReceivedAt)
        .chain(Metric::CHARTED.into_iter().map(Field::Metric))
        .collect()
}

async fn graph_handler(State(state): State<AppState>, Query(query): Query<GraphQuery>) -> Json<Table> {
    Json(state.graph.view(Some(&*state.target_id), &graph_fields(&query)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricCard {
    pub metric: Metric,
    pub label: &'static str,
    pub unit: &'static str,
    pub value: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestReading {
    pub id: String,
    pub sequence: u64,
    pub received_at: String,
    pub sensor_time: Option<String>,
    pub metrics: Vec<MetricCard>,
}

async fn latest_handler(State(state): State<AppState>) -> Json<Option<LatestReading>> {
    let snapshot = state.graph.snapshot().select_origin(&state.target_id);
    Json(snapshot.latest().map(|record| LatestReading {
        id: record.origin_id.clone(),
        sequence: record.sequence,
        received_at: clock_hms(record.received_at),
        sensor_time: record.sensor_time.clone(),
        metrics: record
            .readings
            .iter()
            .map(|(metric, value)| MetricCard {
                metric,
                label: metric.label(),
                unit: metric.unit(),
                value,
            })
            .collect(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub sequence: u64,
    pub received_at: String,
    /// From the home sensor.
    pub home: bool,
    pub fields: BTreeMap<String, FieldValue>,
}

async fn log_handler(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let entries = state
        .log
        .snapshot()
        .recent(limit)
        .into_iter()
        .map(|record| LogEntry {
            sequence: record.sequence,
            received_at: clock_hms(record.received_at),
            home: *record.origin_id == *state.target_id,
            fields: record
                .present_fields()
                .into_iter()
                .filter(|f| *f != Field::ReceivedAt)
                .filter_map(|f| record.value(&f).map(|v| (f.name().to_string(), v)))
                .collect(),
        })
        .collect();
    Json(entries)
}

async fn export_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.graph.snapshot().select_origin(&state.target_id);
    match snapshot.export_csv() {
        Ok(csv) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", state.export_file_name),
                ),
            ],
            csv,
        )
            .into_response(),
        Err(e) => {
            log::error!("CSV export failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "export failed").into_response()
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangeNotice {
    pub buffer: &'static str,
    pub generation: u64,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Generation updates of every buffer, merged for one client.
///
/// Forwarding tasks are aborted when the feed is dropped, so an idle buffer
/// never keeps a closed client's tasks alive.
struct ChangeFeed {
    notices: mpsc::Receiver<ChangeNotice>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ChangeFeed {
    fn new(state: &AppState) -> Self {
        let (notice_tx, notices) = mpsc::channel::<ChangeNotice>(16);
        let forwarders = state
            .changes()
            .into_iter()
            .map(|(buffer, mut changes)| {
                let notice_tx = notice_tx.clone();
                tokio::spawn(async move {
                    while changes.changed().await.is_ok() {
                        let generation = *changes.borrow_and_update();
                        if notice_tx.send(ChangeNotice { buffer, generation }).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        Self { notices, forwarders }
    }

    async fn next(&mut self) -> Option<ChangeNotice> {
        self.notices.recv().await
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {} connected", client_id);

    let mut feed = ChangeFeed::new(&state);

    loop {
        tokio::select! {
            msg = socket.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(notice) = feed.next() => {
                if let Ok(json_str) = serde_json::to_string(&notice) {
                    if socket.send(Message::Text(json_str.into())).await.is_err() {
                        break; // client disconnected
                    }
                }
            }
        }
    }

    drop(feed);
    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensornet_logic::config::{layer_config, Config, Settings};
    use lib_sensornet::ingestors::SubscriptionStatus;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn state() -> AppState {
        let config = layer_config(Config {
            config_path: Some(PathBuf::from("/nonexistent/server_sensornet.conf")),
            graph_capacity: Some(3),
            ..Default::default()
        });
        let settings = Settings::resolve(config).unwrap();
        AppState::new(&settings, Arc::new(SubscriptionStatus::default()))
    }

    fn deliver(state: &AppState, payload: serde_json::Value) {
        state.gateway.handle_delivery(payload.to_string().as_bytes());
    }

    #[test]
    fn graph_fields_default_to_the_charted_metrics() {
        let fields = graph_fields(&GraphQuery::default());
        assert_eq!(fields[0], Field::ReceivedAt);
        assert_eq!(fields.len(), 5);

        let fields = graph_fields(&GraphQuery { fields: Some("Temp_C, UVI,,".into()) });
        assert_eq!(fields, vec![Field::Metric(Metric::TempC), Field::Metric(Metric::Uvi)]);
    }

    #[tokio::test]
    async fn graph_and_latest_show_only_the_home_sensor() {
        let state = state();
        deliver(&state, serde_json::json!({"ID": "A1", "Temp_C": 21.0, "UVI": 2}));
        deliver(&state, serde_json::json!({"ID": "B2", "CO2_ppm": 650.0}));
        deliver(&state, serde_json::json!({"ID": "A1", "Temp_C": 999.0}));

        let Json(table) = graph_handler(State(state.clone()), Query(GraphQuery::default())).await;
        assert_eq!(table.rows.len(), 1);

        let Json(latest) = latest_handler(State(state.clone())).await;
        let latest = latest.unwrap();
        assert_eq!(latest.id, "A1");
        assert_eq!(latest.metrics.len(), 2);
        assert_eq!(latest.metrics[0].unit, Metric::TempC.unit());
    }

    #[tokio::test]
    async fn log_is_newest_first_and_flags_home() {
        let state = state();
        deliver(&state, serde_json::json!({"ID": "A1", "Temp_C": 21.0}));
        deliver(&state, serde_json::json!({"ID": "B2", "CO_ppm": 1.5, "Status": "OK"}));

        let Json(entries) = log_handler(State(state.clone()), Query(LogQuery { limit: Some(1) })).await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].home);
        assert_eq!(entries[0].fields.get("Status"), Some(&FieldValue::Text("OK".into())));

        let Json(entries) = log_handler(State(state), Query(LogQuery::default())).await;
        assert_eq!(entries.len(), 2);
        assert!(entries[1].home);
    }

    #[tokio::test]
    async fn export_is_an_attachment_even_when_empty() {
        let response = export_handler(State(state())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers().get(header::CONTENT_DISPOSITION).unwrap();
        assert_eq!(disposition.to_str().unwrap(), "attachment; filename=\"mis_datos_sensor.csv\"");
    }

    /// Waits until both buffers have exactly `count` change receivers.
    async fn wait_for_subscribers(state: &AppState, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.graph.buffer().change_subscribers() != count
                || state.log.buffer().change_subscribers() != count
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ws_announces_changes_and_releases_forwarders_on_close() {
        let state = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_subscribers(&state, 1).await;

        deliver(&state, serde_json::json!({"ID": "A1", "Temp_C": 21.0}));

        let mut notices = Vec::new();
        while notices.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                notices.push(serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap());
            }
        }
        notices.sort_by_key(|n| n["buffer"].as_str().unwrap().to_string());
        assert_eq!(notices[0], serde_json::json!({"buffer": "graph", "generation": 1}));
        assert_eq!(notices[1], serde_json::json!({"buffer": "log", "generation": 1}));

        client.close(None).await.unwrap();
        wait_for_subscribers(&state, 0).await;
    }

    #[tokio::test]
    async fn dropped_feed_stops_forwarding_while_buffers_are_idle() {
        let state = state();
        let feed = ChangeFeed::new(&state);
        assert_eq!(state.graph.buffer().change_subscribers(), 1);
        assert_eq!(state.log.buffer().change_subscribers(), 1);

        drop(feed);
        wait_for_subscribers(&state, 0).await;
    }

    #[test]
    fn status_reports_both_buffers() {
        let state = state();
        deliver(&state, serde_json::json!({"ID": "B2"}));
        let status = serde_json::to_value(state.status()).unwrap();
        assert_eq!(status["targetId"], "A1");
        assert_eq!(status["buffers"][0]["name"], "graph");
        assert_eq!(status["buffers"][1]["len"], 1);
        assert_eq!(status["liveness"]["status"], serde_json::Value::Null);
    }
}
