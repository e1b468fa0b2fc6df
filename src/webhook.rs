//! Webhook/Answer Surface
//!
//! Thin HTTP layer over the adapters: carriers fetch answer documents and
//! post status callbacks here. Responses are XML or JSON depending on the
//! provider; unknown paths get a JSON error envelope.

use crate::server::AdapterMap;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;

pub fn router(adapters: AdapterMap) -> Router {
    Router::new()
        .route("/telephony/:provider/*path", post(dispatch))
        .fallback(unknown_path)
        .with_state(adapters)
}

async fn dispatch(
    State(adapters): State<AdapterMap>,
    Path((provider, path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    let adapter = adapters
        .values()
        .find(|adapter| adapter.provider().tag() == provider);
    let reply = match adapter {
        Some(adapter) => adapter.handle_webhook(&path, method.as_str(), &body, &query),
        None => crate::provider::WebhookReply::not_found(),
    };

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, reply.content_type)], reply.body)
}

async fn unknown_path() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Unknown webhook path"})),
    )
}
