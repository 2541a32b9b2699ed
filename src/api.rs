//! HTTP API for settlement intake, status, health and metrics
//!
//! - POST /settlements - Create a settlement (idempotent on `external_id`)
//! - GET  /settlements/{external_id} - Current record
//! - POST /settlements/{external_id}/source-ref - Attach the Solana signature
//! - GET  /settlements/by-source/{signature} - Lookup by Solana signature
//! - GET  /health - Liveness
//! - GET  /readyz - zcashd reachable
//! - GET  /status - Record counts and uptime
//! - GET  /metrics - Prometheus metrics

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::SettlementRecord;
use crate::error::SettlementError;
use crate::settlement::{SettlementEngine, SettlementIntent};
use crate::shutdown::StopToken;
use crate::types::{Asset, SettlementKind, Status};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: Arc<SettlementEngine>) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }
}

/// Amounts may be sent as a JSON string or number
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Text(String),
    Number(serde_json::Number),
}

impl AmountField {
    fn into_string(self) -> String {
        match self {
            AmountField::Text(s) => s,
            AmountField::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSettlementRequest {
    /// Generated when absent; clients that retry should always send one
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub kind: SettlementKind,
    pub asset: Asset,
    pub amount: AmountField,
    #[serde(alias = "z_address")]
    pub counterparty_address: String,
    #[serde(alias = "user_pubkey")]
    pub caller_identity: String,
    #[serde(default, alias = "solana_tx_signature")]
    pub source_chain_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachSourceRefRequest {
    #[serde(alias = "solana_tx_signature", alias = "signature")]
    pub source_chain_ref: String,
}

#[derive(Serialize)]
pub struct SettlementResponse {
    #[serde(flatten)]
    pub settlement: SettlementRecord,
    /// True when the request replayed an existing `external_id`
    pub duplicate: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub settlements: BTreeMap<&'static str, i64>,
}

/// Maps engine errors onto HTTP responses
pub struct ApiError(SettlementError);

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        ApiError(err)
    }
}

fn status_code(err: &SettlementError) -> StatusCode {
    match err {
        SettlementError::Validation(_) | SettlementError::InvalidAddress(_) => {
            StatusCode::BAD_REQUEST
        }
        SettlementError::DuplicateIntent(_) => StatusCode::OK,
        SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
        SettlementError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SettlementError::RateUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SettlementError::Gateway(_)
        | SettlementError::OperationNotFound(_)
        | SettlementError::ProtocolViolation { .. } => StatusCode::BAD_GATEWAY,
        SettlementError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = status_code(&self.0);
        match self.0 {
            SettlementError::DuplicateIntent(existing) => (
                code,
                Json(SettlementResponse {
                    settlement: *existing,
                    duplicate: true,
                }),
            )
                .into_response(),
            err => {
                if code.is_server_error() {
                    warn!(error = %err, "Request failed");
                }
                (
                    code,
                    Json(ErrorResponse {
                        error: err.label(),
                        message: err.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

fn rejected(rejection: JsonRejection) -> ApiError {
    ApiError(SettlementError::Validation(rejection.body_text()))
}

async fn create_settlement(
    State(state): State<AppState>,
    payload: Result<Json<CreateSettlementRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SettlementResponse>), ApiError> {
    let Json(req) = payload.map_err(rejected)?;
    let intent = SettlementIntent {
        external_id: req
            .external_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        kind: req.kind,
        asset: req.asset,
        amount: req.amount.into_string(),
        counterparty_address: req.counterparty_address,
        caller_identity: req.caller_identity,
        source_chain_ref: req.source_chain_ref,
    };

    let record = state.engine.create_settlement(intent).await?;
    if record.status == Status::Submitted {
        state.engine.spawn_drive(record.external_id.clone());
    }
    Ok((
        StatusCode::CREATED,
        Json(SettlementResponse {
            settlement: record,
            duplicate: false,
        }),
    ))
}

async fn get_settlement(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<SettlementRecord>, ApiError> {
    Ok(Json(state.engine.get_status(&external_id).await?))
}

async fn attach_source_ref(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    payload: Result<Json<AttachSourceRefRequest>, JsonRejection>,
) -> Result<Json<SettlementRecord>, ApiError> {
    let Json(req) = payload.map_err(rejected)?;
    let record = state
        .engine
        .attach_source_chain_ref(&external_id, &req.source_chain_ref)
        .await?;
    if record.status == Status::Submitted {
        state.engine.spawn_drive(record.external_id.clone());
    }
    Ok(Json(record))
}

async fn get_by_source(
    State(state): State<AppState>,
    Path(signature): Path<String>,
) -> Result<Json<SettlementRecord>, ApiError> {
    Ok(Json(state.engine.get_by_source_chain_ref(&signature).await?))
}

/// Liveness probe (always OK if the server is running)
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

/// Readiness probe: the node must answer `getblockchaininfo`
async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    match state.engine.rpc().get_blockchain_info().await {
        Ok(info) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                chain: Some(info.chain),
                blocks: Some(info.blocks),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                chain: None,
                blocks: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let counts = state.engine.status_counts().await?;
    let mut settlements: BTreeMap<&'static str, i64> =
        Status::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for (status, n) in counts {
        settlements.insert(status.as_str(), n);
    }
    Ok(Json(StatusResponse {
        status: "ok",
        uptime_seconds: state.started.elapsed().as_secs(),
        settlements,
    }))
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/settlements", post(create_settlement))
        .route("/settlements/{external_id}", get(get_settlement))
        .route("/settlements/{external_id}/source-ref", post(attach_source_ref))
        .route("/settlements/by-source/{signature}", get(get_by_source))
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API until `stop` fires, then drain in-flight requests
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    stop: StopToken,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.stopped().await })
        .await?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::oracle::StaticRateOracle;
    use crate::testing::{engine_with, MockStatus, MockZcashNode};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use std::time::Duration;
    use tower::ServiceExt;

    const SAPLING: &str =
        "zs1z7rejlpsa98s2rrrfkwmaxu53e4ue0ulcrw0h4x5g8jl04tak0d3mm47vdtahatqrlkngh9sly";

    struct TestApp {
        app: Router,
        node: Arc<MockZcashNode>,
    }

    fn test_app() -> TestApp {
        let node = Arc::new(MockZcashNode::new());
        let oracle = StaticRateOracle::new()
            .with_rate(Asset::Sol, BigDecimal::from_str("0.5").unwrap())
            .with_rate(Asset::Usdc, BigDecimal::from_str("0.02").unwrap());
        let engine = engine_with(
            node.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(oracle),
            StopToken::never(),
        );
        TestApp {
            app: router(AppState::new(engine)),
            node,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn deposit_body(external_id: &str) -> serde_json::Value {
        serde_json::json!({
            "external_id": external_id,
            "asset": "SOL",
            "amount": "2",
            "z_address": SAPLING,
            "user_pubkey": "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin",
        })
    }

    #[tokio::test]
    async fn test_create_and_get_deposit() {
        let t = test_app();
        let (code, body) = send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["kind"], "deposit");
        assert_eq!(body["duplicate"], false);

        let (code, body) = send(&t.app, get("/settlements/d-1")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["external_id"], "d-1");
        assert_eq!(t.node.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_replay_returns_existing_record() {
        let t = test_app();
        send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        let (code, body) = send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["duplicate"], true);
        assert_eq!(body["external_id"], "d-1");
    }

    #[tokio::test]
    async fn test_missing_external_id_is_generated() {
        let t = test_app();
        let mut body = deposit_body("unused");
        body.as_object_mut().unwrap().remove("external_id");
        let (code, body) = send(&t.app, post_json("/settlements", body)).await;
        assert_eq!(code, StatusCode::CREATED);
        let id = body["external_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_numeric_amount_is_accepted() {
        let t = test_app();
        let mut body = deposit_body("d-num");
        body["amount"] = serde_json::json!(1.5);
        let (code, body) = send(&t.app, post_json("/settlements", body)).await;
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(body["amount"], "1.500000000");
    }

    #[tokio::test]
    async fn test_validation_errors_are_400() {
        let t = test_app();

        let mut bad_amount = deposit_body("d-1");
        bad_amount["amount"] = serde_json::json!("-1");
        let (code, body) = send(&t.app, post_json("/settlements", bad_amount)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let mut bad_address = deposit_body("d-2");
        bad_address["z_address"] = serde_json::json!("t1VShR9Ny4fVEBnQ4Jg2kN4KxGNfVhDnF5a");
        let (code, body) = send(&t.app, post_json("/settlements", bad_address)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_address");

        let (code, body) = send(
            &t.app,
            post_json("/settlements", serde_json::json!({ "asset": "SOL" })),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn test_unknown_settlement_is_404() {
        let t = test_app();
        let (code, body) = send(&t.app, get("/settlements/nope")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (code, _) = send(&t.app, get("/settlements/by-source/nope")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attach_source_ref_submits_and_settles() {
        let t = test_app();
        t.node.script_status(
            "opid-1",
            vec![MockStatus::Success(Some("txid-abc".to_string()))],
        );
        send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;

        let (code, body) = send(
            &t.app,
            post_json(
                "/settlements/d-1/source-ref",
                serde_json::json!({ "signature": "sig-1" }),
            ),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "submitted");
        assert_eq!(body["operation_id"], "opid-1");

        // Background drive commits the outcome
        let mut settled = serde_json::Value::Null;
        for _ in 0..100 {
            let (_, body) = send(&t.app, get("/settlements/by-source/sig-1")).await;
            if body["status"] == "sent" {
                settled = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(settled["target_chain_ref"], "txid-abc");
    }

    #[tokio::test]
    async fn test_conflicting_source_ref_is_409() {
        let t = test_app();
        send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        send(
            &t.app,
            post_json(
                "/settlements/d-1/source-ref",
                serde_json::json!({ "source_chain_ref": "sig-1" }),
            ),
        )
        .await;
        let (code, body) = send(
            &t.app,
            post_json(
                "/settlements/d-1/source-ref",
                serde_json::json!({ "source_chain_ref": "sig-2" }),
            ),
        )
        .await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_unpriced_withdrawal_is_503() {
        let node = Arc::new(MockZcashNode::new());
        let engine = engine_with(
            node.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticRateOracle::new()),
            StopToken::never(),
        );
        let app = router(AppState::new(engine));

        let mut body = deposit_body("w-1");
        body["kind"] = serde_json::json!("withdrawal");
        let (code, body) = send(&app, post_json("/settlements", body)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "rate_unavailable");

        let (code, _) = send(&app, get("/settlements/w-1")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(node.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_node_down_is_502() {
        let t = test_app();
        t.node.set_unreachable(true);
        let (code, body) = send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "transport");
    }

    #[tokio::test]
    async fn test_readiness_follows_node() {
        let t = test_app();
        let (code, body) = send(&t.app, get("/readyz")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["chain"], "regtest");

        t.node.set_unreachable(true);
        let (code, body) = send(&t.app, get("/readyz")).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        let (code, body) = send(&t.app, get("/health")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_status_counts_every_status() {
        let t = test_app();
        send(&t.app, post_json("/settlements", deposit_body("d-1"))).await;
        send(&t.app, post_json("/settlements", deposit_body("d-2"))).await;

        let (code, body) = send(&t.app, get("/status")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["settlements"]["pending"], 2);
        assert_eq!(body["settlements"]["sent"], 0);
        assert_eq!(body["settlements"]["failed"], 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let t = test_app();
        crate::metrics::record_duplicate();
        let resp = t.app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("zwap_duplicate_intents_total"));
    }
}
