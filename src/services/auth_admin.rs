use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Role;

/// 管理者APIでのユーザー作成リクエスト
#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    email: &'a str,
    password: &'a str,
    email_confirm: bool,
    user_metadata: UserMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct UserMetadata<'a> {
    first_name: &'a str,
    last_name: &'a str,
    role: Role,
}

#[derive(Debug, Serialize)]
struct ConfirmEmailRequest {
    email_confirm: bool,
}

#[derive(Debug, Serialize)]
struct PasswordGrantRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Auth ユーザー
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
}

/// パスワードログインで得られるセッション
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// 新規ユーザーのプロフィール情報（user_metadata に格納）
#[derive(Debug, Clone, Copy)]
pub struct NewAuthUser<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub role: Role,
}

/// Supabase Auth Admin API クライアント
///
/// # Security
/// - service role キーはログに出力しない
#[derive(Clone)]
pub struct AuthAdminClient {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

impl AuthAdminClient {
    /// 新しい AuthAdminClient を作成
    pub fn new(client: reqwest::Client, base_url: String, service_role_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
            .header(http::header::ACCEPT, "application/json")
    }

    /// メール確認済みのユーザーを作成
    ///
    /// # Errors
    /// - 既に登録済みのメールアドレス: `AppError::EmailAlreadyExists`
    pub async fn create_user(&self, user: NewAuthUser<'_>) -> Result<AuthUser, AppError> {
        let body = CreateUserRequest {
            email: user.email,
            password: user.password,
            email_confirm: true,
            user_metadata: UserMetadata {
                first_name: user.first_name.unwrap_or_default(),
                last_name: user.last_name.unwrap_or_default(),
                role: user.role,
            },
        };

        let response = self
            .request(reqwest::Method::POST, &self.url("/admin/users"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            tracing::warn!(email = %user.email, "Auth ユーザー作成: 既に登録済み");
            return Err(AppError::EmailAlreadyExists);
        }
        if !status.is_success() {
            tracing::error!(status = %status, "Auth ユーザー作成に失敗");
            return Err(AppError::UpstreamStatus {
                service: "auth",
                status: status.as_u16(),
            });
        }

        let created: AuthUser = response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "Auth レスポンスのパースエラー");
            AppError::Internal(anyhow::anyhow!("Failed to parse auth response"))
        })?;

        tracing::info!(user_id = %created.id, "Auth ユーザー作成");
        Ok(created)
    }

    /// ユーザーを削除（プロフィール作成失敗時の後始末）
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), AppError> {
        let url = self.url(&format!("/admin/users/{user_id}"));
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, user_id = %user_id, "Auth ユーザー削除に失敗");
            return Err(AppError::UpstreamStatus {
                service: "auth",
                status: status.as_u16(),
            });
        }

        tracing::info!(user_id = %user_id, "Auth ユーザー削除");
        Ok(())
    }

    /// email_confirm = true に更新
    pub async fn confirm_email(&self, user_id: Uuid) -> Result<(), AppError> {
        let url = self.url(&format!("/admin/users/{user_id}"));
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&ConfirmEmailRequest {
                email_confirm: true,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound("User"));
        }
        if !status.is_success() {
            tracing::error!(status = %status, user_id = %user_id, "Auth ユーザーのメール確認に失敗");
            return Err(AppError::UpstreamStatus {
                service: "auth",
                status: status.as_u16(),
            });
        }

        tracing::info!(user_id = %user_id, "Auth ユーザーのメール確認完了");
        Ok(())
    }

    /// パスワードでログインしてセッションを取得
    ///
    /// # Security
    /// - password はログに出力しない
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AppError> {
        let url = self.url("/token?grant_type=password");
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&PasswordGrantRequest { email, password })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(status = %status, "パスワードログインに失敗");
            return Err(AppError::UpstreamStatus {
                service: "auth",
                status: status.as_u16(),
            });
        }

        response.json::<AuthSession>().await.map_err(|e| {
            tracing::error!(error = ?e, "セッションレスポンスのパースエラー");
            AppError::Internal(anyhow::anyhow!("Failed to parse session response"))
        })
    }
}
