use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{BookingPayout, PaymentStatus, TransferStatus};

#[derive(Clone)]
pub struct BookingRepository {
    pool: PgPool,
}

impl BookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 決済開始時に参照番号を記録（payment_status = pending）
    pub async fn set_payment_reference(
        &self,
        booking_id: Uuid,
        reference: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET payment_reference = $2, payment_status = $3
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(reference)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Webhook の決済結果を反映
    ///
    /// completed の場合は予約自体も confirmed にし、支払額を記録する
    pub async fn apply_payment_result(
        &self,
        reference: &str,
        status: PaymentStatus,
        amount: Option<f64>,
        paid_at: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = if status == PaymentStatus::Completed {
            sqlx::query(
                r#"
                UPDATE bookings
                SET payment_status = $2, payment_date = $3, status = 'confirmed', payment_amount = $4
                WHERE payment_reference = $1
                "#,
            )
            .bind(reference)
            .bind(status.as_str())
            .bind(paid_at)
            .bind(amount)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE bookings
                SET payment_status = $2, payment_date = $3
                WHERE payment_reference = $1
                "#,
            )
            .bind(reference)
            .bind(status.as_str())
            .bind(paid_at)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected())
    }

    /// 送金に必要な予約情報（物件オーナー・物件名を含む）
    pub async fn find_payout_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BookingPayout>, sqlx::Error> {
        sqlx::query_as::<_, BookingPayout>(
            r#"
            SELECT
                b.id,
                b.total_amount::float8 AS total_amount,
                b.payment_amount::float8 AS payment_amount,
                b.transfer_status,
                COALESCE(b.owner_id, bh.owner_id) AS owner_id,
                bh.title AS listing_title
            FROM bookings b
            LEFT JOIN boarding_houses bh ON bh.id = b.listing_id
            WHERE b.payment_reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn record_transfer_failure(
        &self,
        booking_id: Uuid,
        transfer_reference: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE bookings
            SET transfer_status = $2, transfer_reference = $3
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(TransferStatus::Failed.as_str())
        .bind(transfer_reference)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_transfer_pending(
        &self,
        booking_id: Uuid,
        transfer_reference: &str,
        transfer_amount: f64,
        transferred_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE bookings
            SET transfer_status = $2, transfer_reference = $3, transfer_amount = $4, transfer_date = $5
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(TransferStatus::Pending.as_str())
        .bind(transfer_reference)
        .bind(transfer_amount)
        .bind(transferred_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
