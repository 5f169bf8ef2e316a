use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{NaiveDate, Utc};
use drum_ledger::AvailabilityView;
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::error::OrderError;
use crate::handlers::{OrderService, PaymentConfirmation, PlaceOrder};
use crate::models::Order;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct StockRequest {
    pub stock: i32,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub size: Option<DrumSize>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub vendor_id: Uuid,
    pub date: NaiveDate,
    pub sizes: Vec<AvailabilityView>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(place_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/payment", post(confirm_payment))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/status", post(update_status))
        .route("/orders/:id/returns", post(return_drums))
        .route("/vendors/:id/availability", get(availability))
        .route("/vendors/:id/stock/:size", put(set_stock))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

pub async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<PlaceOrder>,
) -> Result<(StatusCode, Json<Order>), OrderError> {
    let order = state.orders.place_order(request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>, OrderError> {
    Ok(Json(state.orders.get_order(id).await?))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PaymentConfirmation>,
) -> Result<Json<Order>, OrderError> {
    Ok(Json(state.orders.confirm_payment(id, request, Utc::now()).await?))
}

pub async fn cancel_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>, OrderError> {
    let order = state
        .orders
        .cancel_order(id, CancelReason::CustomerCancelled, Utc::now())
        .await?;
    Ok(Json(order))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Order>, OrderError> {
    Ok(Json(state.orders.update_status(id, request.status, Utc::now()).await?))
}

pub async fn return_drums(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>, OrderError> {
    Ok(Json(state.orders.return_drums(id, Utc::now()).await?))
}

pub async fn availability(
    State(state): State<AppState>,
    Path(vendor_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, OrderError> {
    let sizes = state.orders.availability(vendor_id, query.date, query.size).await?;
    Ok(Json(AvailabilityResponse {
        vendor_id,
        date: query.date,
        sizes,
    }))
}

pub async fn set_stock(
    State(state): State<AppState>,
    Path((vendor_id, size)): Path<(Uuid, DrumSize)>,
    Json(request): Json<StockRequest>,
) -> Result<StatusCode, OrderError> {
    state.orders.set_stock(vendor_id, size, request.stock).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health_check() -> &'static str {
    "OK"
}
