use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::deadline::Deadline;
use crate::error::AppError;
use crate::repositories::{
    BookingRepository, EmailOtpRepository, NotificationRepository, ProfileRepository,
};
use crate::services::{
    AccountService, AuthAdminClient, BookingNotificationService, EmailService, LencoClient,
    OtpPolicy, OtpService, PaymentService,
};

/// 本番構成の OTP サービス
pub type EmailOtpService = OtpService<EmailOtpRepository, EmailService>;

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// メール OTP サービス
    pub otp_service: EmailOtpService,
    /// サインアップ・ユーザー確認
    pub account_service: AccountService,
    /// 決済サービス
    pub payment_service: PaymentService,
    /// 予約通知サービス
    pub booking_notification_service: BookingNotificationService,
}

impl AppState {
    /// 新しい AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let deadline = Deadline::new(config.outbound_timeout());

        // 外部 API 呼び出しは1つのクライアント（コネクションプール）を共有
        let http_client = reqwest::Client::builder()
            .timeout(config.outbound_timeout())
            .build()
            .map_err(|e| {
                tracing::error!(error = ?e, "HTTP クライアントの初期化に失敗");
                AppError::Internal(anyhow::anyhow!("Failed to build HTTP client"))
            })?;

        let otp_repo = EmailOtpRepository::new(db_pool.clone());
        let profile_repo = ProfileRepository::new(db_pool.clone());
        let booking_repo = BookingRepository::new(db_pool.clone());
        let notification_repo = NotificationRepository::new(db_pool.clone());

        let email_service = EmailService::new(&config, http_client.clone())?;

        let salt = config
            .otp_salt
            .as_ref()
            .map(|s| s.expose_secret().trim().to_string())
            .filter(|s| !s.is_empty());
        if salt.is_none() {
            tracing::warn!("OTP_SALT 未設定（OTP の発行・検証は設定エラーになる）");
        }

        let otp_service = OtpService::new(
            otp_repo,
            email_service,
            OtpPolicy::from_config(&config),
            salt,
            deadline,
        );

        // Auth Admin API（設定されている場合のみ初期化）
        let auth_admin = match (&config.supabase_url, &config.supabase_service_role_key) {
            (Some(url), Some(key)) => {
                tracing::info!(supabase_url = %url, "Auth Admin クライアントを初期化");
                Some(AuthAdminClient::new(
                    http_client.clone(),
                    url.clone(),
                    key.expose_secret().clone(),
                ))
            }
            _ => {
                tracing::info!("Auth Admin 未設定（サインアップ系はスキップ）");
                None
            }
        };

        // Lenco（設定されている場合のみ初期化）
        let lenco = match &config.lenco_api_key {
            Some(key) => {
                tracing::info!(api_url = %config.lenco_api_url, "Lenco クライアントを初期化");
                Some(LencoClient::new(
                    http_client.clone(),
                    config.lenco_api_url.clone(),
                    key.expose_secret().clone(),
                ))
            }
            None => {
                tracing::info!("Lenco 未設定（決済系はスキップ）");
                None
            }
        };

        if config.confirm_secret.is_none() {
            tracing::warn!("CONFIRM_SECRET 未設定（/api/signup/confirm は常に 401）");
        }

        let account_service = AccountService::new(auth_admin, profile_repo.clone(), deadline);
        let payment_service = PaymentService::new(
            booking_repo,
            profile_repo,
            notification_repo.clone(),
            lenco,
            config.platform_fee_percent,
            deadline,
        );
        let booking_notification_service = BookingNotificationService::new(notification_repo, deadline);

        Ok(Self {
            db_pool,
            config,
            otp_service,
            account_service,
            payment_service,
            booking_notification_service,
        })
    }
}
