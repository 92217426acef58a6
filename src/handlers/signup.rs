use axum::{Json, extract::State, http::HeaderMap};
use garde::Validate;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::Date;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Profile, Role};
use crate::repositories::ProfileFields;
use crate::services::account::{CompleteSignup, UserLookup};
use crate::services::auth_admin::{AuthSession, AuthUser};
use crate::state::AppState;

const CONFIRM_SECRET_HEADER: &str = "x-confirm-secret";

// === サインアップ完了 ===

#[derive(Debug, Deserialize, Validate)]
pub struct CompleteSignupRequest {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 6))]
    pub password: String, // SecretBox不要（Auth API にそのまま渡す）
    #[garde(skip)]
    pub first_name: Option<String>,
    #[garde(skip)]
    pub last_name: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub role: Role,
    #[garde(skip)]
    pub dob: Option<Date>,
    #[garde(skip)]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteSignupResponse {
    pub success: bool,
    pub user: AuthUser,
    pub profile: Profile,
    pub session: Option<AuthSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<&'static str>,
}

/// POST /api/signup/complete
///
/// # Security
/// - password はログに出力しない
pub async fn complete_signup(
    State(state): State<AppState>,
    Json(mut request): Json<CompleteSignupRequest>,
) -> Result<Json<CompleteSignupResponse>, AppError> {
    request.email = request.email.trim().to_lowercase();
    request.validate()?;

    let input = CompleteSignup {
        email: request.email,
        password: request.password,
        role: request.role,
        profile: ProfileFields {
            first_name: request.first_name,
            last_name: request.last_name,
            dob: request.dob,
            phone: request.phone,
            ..Default::default()
        },
    };

    let completed = state.account_service.complete_signup(&input).await?;

    Ok(Json(CompleteSignupResponse {
        success: true,
        user: completed.user,
        profile: completed.profile,
        session: completed.session,
        warning: completed.warning,
    }))
}

// === ユーザー確認 ===

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmUserRequest {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub dob: Option<Date>,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmUserResponse {
    pub success: bool,
    pub user_id: Uuid,
    pub profile: Profile,
}

/// POST /api/signup/confirm
///
/// x-confirm-secret ヘッダーで呼び出し元を認証する
pub async fn confirm_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConfirmUserRequest>,
) -> Result<Json<ConfirmUserResponse>, AppError> {
    let expected = state
        .config
        .confirm_secret
        .as_ref()
        .map(|s| s.expose_secret().as_str());
    let provided = headers
        .get(CONFIRM_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    check_confirm_secret(expected, provided)?;

    let lookup = user_lookup(&request)?;
    let fields = ProfileFields {
        email: request.email.as_deref().map(|e| e.trim().to_lowercase()),
        first_name: request.first_name,
        last_name: request.last_name,
        role: request.role.map(|r| r.as_str().to_string()),
        dob: request.dob,
        phone: request.phone,
    };

    let (user_id, profile) = state.account_service.confirm_user(&lookup, &fields).await?;

    Ok(Json(ConfirmUserResponse {
        success: true,
        user_id,
        profile,
    }))
}

/// 共有シークレットの照合（未設定も拒否）
///
/// 長さに依存しないよう SHA-256 ダイジェスト同士を定数時間で比較する
fn check_confirm_secret(expected: Option<&str>, provided: Option<&str>) -> Result<(), AppError> {
    match (expected, provided) {
        (Some(expected), Some(provided)) if !expected.is_empty() && secrets_match(expected, provided) => {
            Ok(())
        }
        _ => {
            tracing::warn!("確認シークレットの不一致");
            Err(AppError::Unauthorized)
        }
    }
}

fn secrets_match(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// user_id を優先し、なければ email で解決する
fn user_lookup(request: &ConfirmUserRequest) -> Result<UserLookup, AppError> {
    if let Some(id) = request.user_id {
        return Ok(UserLookup::Id(id));
    }
    match request.email.as_deref().map(str::trim) {
        Some(email) if !email.is_empty() => Ok(UserLookup::Email(email.to_lowercase())),
        _ => Err(AppError::Validation(
            "user_id or email is required".to_string(),
        )),
    }
}
