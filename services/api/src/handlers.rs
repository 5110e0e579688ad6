//! Axum Handlers for the HTTP surface
//!
//! The call-control webhook tells the telephony provider to open a media
//! stream back to this service; the health endpoints report liveness and the
//! number of calls in flight.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{config::Greeting, state::AppState};

pub enum ApiError {
    BadRequest(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                warn!(%message, "Rejecting request");
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_calls: usize,
}

/// Plain liveness check.
pub async fn index() -> &'static str {
    "ok"
}

/// Liveness plus the number of registered calls.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_calls: state.registry.len(),
    })
}

/// Inbound call webhook. Answers with call-control markup that greets the
/// caller and then connects the call audio to `/media-stream`.
pub async fn voice_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let host = state
        .config
        .public_host
        .clone()
        .or_else(|| header_value(&headers, "x-forwarded-host"))
        .or_else(|| header_value(&headers, header::HOST.as_str()))
        .ok_or_else(|| ApiError::BadRequest("Cannot determine public host".to_string()))?;

    let stream_url = format!("wss://{}/media-stream", host);
    info!(%stream_url, "Answering inbound call");
    let twiml = render_twiml(&state.config.greeting, &stream_url);
    Ok(([(header::CONTENT_TYPE, "text/xml")], twiml).into_response())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

fn render_twiml(greeting: &Greeting, stream_url: &str) -> String {
    let say = |text: &str| {
        format!(
            r#"<Say voice="{}" language="{}">{}</Say>"#,
            escape_xml(&greeting.voice),
            escape_xml(&greeting.language),
            escape_xml(text)
        )
    };
    let mut twiml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    if !greeting.text.is_empty() {
        twiml.push_str(&say(&greeting.text));
    }
    if greeting.pause_secs > 0 {
        twiml.push_str(&format!(r#"<Pause length="{}"/>"#, greeting.pause_secs));
    }
    if !greeting.followup.is_empty() {
        twiml.push_str(&say(&greeting.followup));
    }
    twiml.push_str(&format!(
        r#"<Connect><Stream url="{}" /></Connect></Response>"#,
        escape_xml(stream_url)
    ));
    twiml
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
