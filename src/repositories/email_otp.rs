use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{EmailOtp, NewEmailOtp};
use crate::services::otp::OtpStore;

#[derive(Clone)]
pub struct EmailOtpRepository {
    pool: PgPool,
}

impl EmailOtpRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl OtpStore for EmailOtpRepository {
    /// レート制限用: 指定時刻以降に作成された件数
    async fn count_created_since(
        &self,
        email: &str,
        since: OffsetDateTime,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM email_otps
            WHERE email = $1 AND created_at >= $2
            "#,
        )
        .bind(email)
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    /// 新しい OTP レコードを作成
    ///
    /// # Note
    /// used / attempts / used_at は明示的に初期化する
    async fn insert(&self, otp: NewEmailOtp) -> Result<EmailOtp, sqlx::Error> {
        sqlx::query_as::<_, EmailOtp>(
            r#"
            INSERT INTO email_otps
                (email, otp_hash, created_at, expires_at, ip_address, used, attempts, used_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, 0, NULL)
            RETURNING id, email, otp_hash, created_at, expires_at, used, used_at, attempts, ip_address
            "#,
        )
        .bind(&otp.email)
        .bind(&otp.otp_hash)
        .bind(otp.created_at)
        .bind(otp.expires_at)
        .bind(&otp.ip_address)
        .fetch_one(&self.pool)
        .await
    }

    async fn find_latest_unused(&self, email: &str) -> Result<Option<EmailOtp>, sqlx::Error> {
        sqlx::query_as::<_, EmailOtp>(
            r#"
            SELECT id, email, otp_hash, created_at, expires_at, used, used_at, attempts, ip_address
            FROM email_otps
            WHERE email = $1 AND used = FALSE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EmailOtp>, sqlx::Error> {
        sqlx::query_as::<_, EmailOtp>(
            r#"
            SELECT id, email, otp_hash, created_at, expires_at, used, used_at, attempts, ip_address
            FROM email_otps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 試行回数をDB側で加算（同時リクエストでも加算が失われない）
    async fn increment_attempts(&self, id: Uuid) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE email_otps
            SET attempts = attempts + 1
            WHERE id = $1 AND used = FALSE
            RETURNING attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 未使用・期限内・試行回数上限未満の場合のみ使用済みにマーク
    ///
    /// 判定は UPDATE の WHERE で行うため、検証前の読み出しと書き込みの間に
    /// 他のリクエストが attempts を進めても上限を超えて消費されない
    async fn mark_used(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        max_attempts: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE email_otps
            SET used = TRUE, used_at = $2
            WHERE id = $1
              AND used = FALSE
              AND expires_at >= $2
              AND attempts < $3
            "#,
        )
        .bind(id)
        .bind(used_at)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
