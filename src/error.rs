use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("OTP 発行回数の上限に到達")]
    OtpRateLimited,

    #[error("有効な OTP が見つかりません")]
    OtpNotFound,

    #[error("OTP の有効期限切れ")]
    OtpExpired,

    #[error("OTP の試行回数の上限に到達")]
    OtpTooManyAttempts,

    #[error("OTP が一致しません（残り {attempts_remaining} 回）")]
    OtpMismatch { attempts_remaining: i32 },

    #[error("設定エラー: {0}")]
    Configuration(&'static str),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("永続化エラー: {0}")]
    Persistence(String),

    #[error("タイムアウト: {0}")]
    Timeout(&'static str),

    #[error("外部 API 通信エラー")]
    Upstream(#[from] reqwest::Error),

    #[error("外部 API エラー: {service} ({status})")]
    UpstreamStatus { service: &'static str, status: u16 },

    #[error("認証エラー")]
    Unauthorized,

    #[error("このメールアドレスは既に使用されています")]
    EmailAlreadyExists,

    #[error("見つかりません: {0}")]
    NotFound(&'static str),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts_remaining: Option<i32>,
}

const INTERNAL_MESSAGE: &str = "Internal server error";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut attempts_remaining = None;
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::OtpRateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.".to_string(),
            ),
            // 存在有無・期限切れの区別を漏らさない
            Self::OtpNotFound | Self::OtpExpired => (
                StatusCode::BAD_REQUEST,
                "Invalid or expired verification code".to_string(),
            ),
            Self::OtpTooManyAttempts => (
                StatusCode::BAD_REQUEST,
                "Too many failed attempts. Request a new code.".to_string(),
            ),
            Self::OtpMismatch {
                attempts_remaining: remaining,
            } => {
                attempts_remaining = Some(*remaining);
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid verification code".to_string(),
                )
            }
            Self::Configuration(what) => {
                tracing::error!(missing = %what, "設定不足");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_MESSAGE.to_string(),
                )
            }
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_MESSAGE.to_string(),
                )
            }
            Self::Persistence(detail) => {
                tracing::error!(detail = %detail, "永続化エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_MESSAGE.to_string(),
                )
            }
            Self::Timeout(operation) => {
                tracing::error!(operation = %operation, "外部呼び出しタイムアウト");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "Upstream service timed out".to_string(),
                )
            }
            Self::Upstream(e) => {
                tracing::error!(error = ?e, "外部 API 通信エラー");
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach upstream service".to_string(),
                )
            }
            Self::UpstreamStatus { service, status } => {
                tracing::error!(service = %service, status = %status, "外部 API がエラーを返却");
                (
                    StatusCode::BAD_GATEWAY,
                    format!("{service} request failed"),
                )
            }
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            Self::EmailAlreadyExists => (
                StatusCode::CONFLICT,
                "A user with this email address already exists".to_string(),
            ),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_MESSAGE.to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                attempts_remaining,
            }),
        )
            .into_response()
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        Self::Validation(report.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_otp_error_statuses() {
        assert_eq!(status_of(AppError::OtpRateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_of(AppError::OtpNotFound), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AppError::OtpExpired), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AppError::OtpTooManyAttempts), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(AppError::OtpMismatch {
                attempts_remaining: 2
            }),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_server_side_failures_are_500() {
        assert_eq!(
            status_of(AppError::Configuration("OTP_SALT")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::Persistence("mark used".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::Database(sqlx::Error::PoolTimedOut)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_and_auth_statuses() {
        assert_eq!(status_of(AppError::Timeout("lenco")), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_of(AppError::UpstreamStatus {
                service: "lenco",
                status: 400
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_of(AppError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AppError::EmailAlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_of(AppError::NotFound("user")), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ErrorResponse {
            error: "Invalid verification code".to_string(),
            attempts_remaining: Some(3),
        })
        .unwrap();
        assert_eq!(body["attempts_remaining"], 3);

        let body = serde_json::to_value(ErrorResponse {
            error: "x".to_string(),
            attempts_remaining: None,
        })
        .unwrap();
        assert!(body.get("attempts_remaining").is_none());
    }
}
