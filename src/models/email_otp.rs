use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// メール OTP レコード
///
/// パスコード自体は保存せず、ソルト付き SHA-256 ハッシュ（otp_hash）のみ保持する。
/// `used` は一方向のラッチで、true になった行は二度と検証に成功しない。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EmailOtp {
    pub id: Uuid,
    pub email: String,
    #[serde(skip)]
    pub otp_hash: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub used: bool,
    pub used_at: Option<OffsetDateTime>,
    pub attempts: i32,
    pub ip_address: Option<String>,
}

impl EmailOtp {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// 新規発行する OTP レコード
#[derive(Debug, Clone)]
pub struct NewEmailOtp {
    pub email: String,
    pub otp_hash: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub ip_address: Option<String>,
}
