use axum::{Json, extract::State, http::HeaderMap};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

// === OTP 発行 ===

#[derive(Debug, Deserialize, Validate)]
pub struct SendOtpRequest {
    #[garde(email)]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SendOtpResponse {
    pub success: bool,
    pub message: &'static str,
    pub expires_in_seconds: i64,
}

/// POST /api/otp/send
///
/// # Security
/// - パスコードはレスポンス・ログに含めない
pub async fn send_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<SendOtpRequest>,
) -> Result<Json<SendOtpResponse>, AppError> {
    request.email = request.email.trim().to_string();
    request.validate()?;

    let issued = state
        .otp_service
        .issue(&request.email, client_ip(&headers))
        .await?;

    Ok(Json(SendOtpResponse {
        success: true,
        message: "Verification code sent",
        expires_in_seconds: issued.expires_in_seconds,
    }))
}

// === OTP 検証 ===

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyOtpRequest {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 1))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyOtpResponse {
    pub success: bool,
    pub message: &'static str,
    pub email: String,
}

/// POST /api/otp/verify
///
/// # Security
/// - code はログに出力しない
pub async fn verify_otp(
    State(state): State<AppState>,
    Json(mut request): Json<VerifyOtpRequest>,
) -> Result<Json<VerifyOtpResponse>, AppError> {
    request.email = request.email.trim().to_string();
    request.validate()?;

    let verified = state
        .otp_service
        .verify(&request.email, &request.code)
        .await?;

    Ok(Json(VerifyOtpResponse {
        success: true,
        message: "Email verified",
        email: verified.email,
    }))
}

/// x-forwarded-for の先頭アドレス
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
