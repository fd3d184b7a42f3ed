//! HTTP API exposing the service requests.

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use dplus_protocol::{codec, ServiceCall, ServiceRequest, ServiceResponse, SettingsMap};
use dplus_service::{ServiceError, ServiceHandle};

#[derive(Debug, Deserialize)]
struct InjectBody {
    voltage: Option<f64>,
}

type ApiResult = (StatusCode, Json<ServiceResponse>);

/// Start the HTTP API server
pub async fn start_http_server(addr: SocketAddr, handle: ServiceHandle) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/settings", get(get_settings_handler).put(put_settings_handler))
        .route("/inject", post(inject_handler))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/requests", post(raw_request_handler))
        .with_state(handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn reply(result: Result<ServiceResponse, ServiceError>) -> ApiResult {
    match result {
        Ok(response) => {
            let code = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, Json(response))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ServiceResponse::failed(503, e.to_string())),
        ),
    }
}

async fn status_handler(State(handle): State<ServiceHandle>) -> ApiResult {
    reply(handle.request(ServiceRequest::GetStatus).await)
}

async fn get_settings_handler(State(handle): State<ServiceHandle>) -> ApiResult {
    reply(handle.request(ServiceRequest::GetSettings).await)
}

async fn put_settings_handler(
    State(handle): State<ServiceHandle>,
    Json(settings): Json<SettingsMap>,
) -> ApiResult {
    reply(handle.request(ServiceRequest::UpdateSettings { settings }).await)
}

async fn inject_handler(State(handle): State<ServiceHandle>, Json(body): Json<InjectBody>) -> ApiResult {
    reply(
        handle
            .request(ServiceRequest::InjectVoltageSample { voltage: body.voltage })
            .await,
    )
}

async fn start_handler(State(handle): State<ServiceHandle>) -> ApiResult {
    reply(handle.request(ServiceRequest::Start).await)
}

async fn stop_handler(State(handle): State<ServiceHandle>) -> ApiResult {
    reply(handle.request(ServiceRequest::Stop).await)
}

/// Accepts any encoded [`ServiceCall`], including shutdown.
async fn raw_request_handler(State(handle): State<ServiceHandle>, body: String) -> ApiResult {
    let call: ServiceCall = match codec::decode_call(&body) {
        Ok(call) => call,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ServiceResponse::failed(400, e.to_string())),
            )
        }
    };
    reply(handle.call(call).await)
}
