use axum::{Json, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::payment::{InitiatePayment, WebhookOutcome};
use crate::state::AppState;

// === 決済開始 ===

#[derive(Debug, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    #[garde(skip)]
    pub booking_id: Uuid,
    #[garde(range(min = 0.01))]
    pub amount: f64,
    #[garde(length(min = 1))]
    pub currency: String,
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 9))]
    pub phone_number: String,
    #[garde(skip)]
    pub first_name: Option<String>,
    #[garde(skip)]
    pub last_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    pub success: bool,
    pub reference: String,
    pub data: Value,
    pub requires_authorization: bool,
    pub payment_status: String,
    pub message: &'static str,
}

/// POST /api/payments/initiate
pub async fn initiate_payment(
    State(state): State<AppState>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>, AppError> {
    request.validate()?;

    tracing::info!(booking_id = %request.booking_id, email = %request.email, "決済開始リクエスト");

    let initiated = state
        .payment_service
        .initiate(&InitiatePayment {
            booking_id: request.booking_id,
            amount: request.amount,
            currency: request.currency,
            phone_number: request.phone_number,
        })
        .await?;

    let message = if initiated.requires_authorization {
        "Please authorize the payment on your phone"
    } else {
        "Payment initiated"
    };

    Ok(Json(InitiatePaymentResponse {
        success: true,
        reference: initiated.reference,
        data: initiated.data,
        requires_authorization: initiated.requires_authorization,
        payment_status: initiated.payment_status,
        message,
    }))
}

// === Webhook ===

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_reference: Option<String>,
}

impl From<WebhookOutcome> for WebhookResponse {
    fn from(outcome: WebhookOutcome) -> Self {
        let message = outcome.message();
        let transfer_reference = match outcome {
            WebhookOutcome::PayoutInitiated { reference, .. } => Some(reference),
            _ => None,
        };
        Self {
            success: true,
            message,
            transfer_reference,
        }
    }
}

/// POST /api/payments/webhook
///
/// ペイロードの形式はプロバイダー依存のため Value で受ける
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<WebhookResponse>, AppError> {
    let outcome = state.payment_service.handle_webhook(&payload).await?;
    Ok(Json(outcome.into()))
}
