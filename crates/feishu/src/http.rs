//! Webhook HTTP routes.
//!
//! One POST route per account (`/feishu/webhook/{account_id}`) plus the
//! default-account alias. Method routing yields 405 for anything but POST.
//! The response body is always JSON: the echoed challenge for handshakes,
//! `{"code":0,"msg":"success"}` on success, and a generic
//! `{"code":500,"msg":"error"}` for every processing failure.

use std::sync::Arc;

use {
    axum::{
        Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::post,
    },
    serde_json::{Value, json},
    tracing::error,
};

use crate::{
    config::DEFAULT_ACCOUNT_ID,
    events::{self, Callback, CallbackHeaders},
    inbound,
    runtime::FeishuRuntime,
};

/// Build the webhook router for the channel.
pub fn webhook_router(runtime: Arc<FeishuRuntime>) -> Router {
    Router::new()
        .route("/feishu/webhook", post(webhook_default))
        .route("/feishu/webhook/{account_id}", post(webhook_for_account))
        .with_state(runtime)
}

async fn webhook_default(
    State(runtime): State<Arc<FeishuRuntime>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    handle_callback(&runtime, DEFAULT_ACCOUNT_ID, &headers, &body).await
}

async fn webhook_for_account(
    State(runtime): State<Arc<FeishuRuntime>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    handle_callback(&runtime, &account_id, &headers, &body).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

fn error_response() -> Response {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "code": 500, "msg": "error" }),
    )
}

async fn handle_callback(
    runtime: &Arc<FeishuRuntime>,
    account_id: &str,
    headers: &HeaderMap,
    body: &str,
) -> Response {
    let account = runtime.resolve(Some(account_id));
    let callback_headers = CallbackHeaders {
        signature: header_str(headers, "x-lark-signature"),
        timestamp: header_str(headers, "x-lark-request-timestamp"),
        nonce: header_str(headers, "x-lark-request-nonce"),
    };

    match events::parse_callback(body, &callback_headers, &account) {
        Ok(Callback::Challenge(challenge)) => {
            json_response(StatusCode::OK, json!({ "challenge": challenge }))
        },
        Ok(Callback::Event(envelope)) => {
            match inbound::handle_inbound_event(runtime, account_id, envelope).await {
                Ok(()) => json_response(StatusCode::OK, json!({ "code": 0, "msg": "success" })),
                Err(err) => {
                    error!(account_id, error = %err, "callback processing failed");
                    error_response()
                },
            }
        },
        Err(err) => {
            error!(account_id, error = %err, "callback rejected");
            error_response()
        },
    }
}
