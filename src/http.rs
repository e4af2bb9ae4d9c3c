//! JSON-over-HTTP surface
//!
//! Every endpoint is a `POST`. Protocol errors are answered with HTTP 200 and
//! `{successful: false, error}`; only bodies that can't be parsed get a 4xx.
//!
//! A client that goes away while its connect is parked drops the handler
//! future, which releases the long-poll slot.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use crate::dispatcher::Dispatcher;
use crate::errors::BayeuxError;
use crate::message::Message;
use crate::protocol::{
    Ack, ConnectRequest, DisconnectRequest, ErrorResponse, HandshakeResponse, PublishAck,
    PublishRequest, SubscriptionRequest,
};

type AppState = State<Arc<Dispatcher>>;
type HttpResult<T> = Result<Json<T>, BayeuxError>;

impl IntoResponse for BayeuxError {
    fn into_response(self) -> Response {
        Json(ErrorResponse::from(self)).into_response()
    }
}

/// Routes for the protocol endpoints
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/handshake", post(handshake))
        .route("/connect", post(connect))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/publish", post(publish))
        .route("/disconnect", post(disconnect))
        .with_state(dispatcher)
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn handshake(State(dispatcher): AppState) -> Json<HandshakeResponse> {
    let client_id = dispatcher.handshake();
    let timeout = millis(dispatcher.config().long_poll_timeout);
    Json(HandshakeResponse::new(client_id, timeout))
}

async fn connect(
    State(dispatcher): AppState,
    Json(request): Json<ConnectRequest>,
) -> HttpResult<Vec<Message>> {
    let messages = dispatcher
        .connect(&request.client_id, &request.connection_type)
        .await?;
    Ok(Json(messages))
}

async fn subscribe(
    State(dispatcher): AppState,
    Json(request): Json<SubscriptionRequest>,
) -> HttpResult<Ack> {
    let pattern = dispatcher.subscribe(&request.client_id, &request.subscription)?;
    Ok(Json(Ack::subscription(pattern)))
}

async fn unsubscribe(
    State(dispatcher): AppState,
    Json(request): Json<SubscriptionRequest>,
) -> HttpResult<Ack> {
    let pattern = dispatcher.unsubscribe(&request.client_id, &request.subscription)?;
    Ok(Json(Ack::subscription(pattern)))
}

async fn publish(
    State(dispatcher): AppState,
    Json(request): Json<PublishRequest>,
) -> HttpResult<PublishAck> {
    let id = dispatcher.publish_from(&request.client_id, &request.channel, request.data)?;
    Ok(Json(PublishAck {
        successful: true,
        id,
    }))
}

async fn disconnect(
    State(dispatcher): AppState,
    Json(request): Json<DisconnectRequest>,
) -> HttpResult<Ack> {
    dispatcher.disconnect(&request.client_id)?;
    Ok(Json(Ack::ok()))
}
