use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use drum_ledger::LedgerError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("an order needs at least one item")]
    EmptyOrder,

    #[error("item quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("orders must be placed at least {hours} hours before delivery")]
    LeadTimeTooShort { hours: i64 },

    #[error("Reservation expired. Please place a new order.")]
    ReservationExpired,

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("order {0} must be paid before it can be prepared")]
    PaymentRequired(Uuid),

    #[error("payment reference {reference} was already applied to order {order_id}")]
    PaymentReferenceReused { reference: String, order_id: Uuid },

    #[error("order {0} kept changing underneath us, try again")]
    Conflict(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl OrderError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrderError::NotFound(_) => StatusCode::NOT_FOUND,
            OrderError::EmptyOrder
            | OrderError::InvalidQuantity(_)
            | OrderError::LeadTimeTooShort { .. }
            | OrderError::ReservationExpired => StatusCode::BAD_REQUEST,
            OrderError::InvalidTransition { .. }
            | OrderError::PaymentRequired(_)
            | OrderError::PaymentReferenceReused { .. }
            | OrderError::Conflict(_) => StatusCode::CONFLICT,
            OrderError::Ledger(e) if e.is_rejection() => StatusCode::BAD_REQUEST,
            OrderError::Ledger(_) | OrderError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}
