use sqlx::FromRow;
use uuid::Uuid;

/// 決済ステータス（bookings.payment_status）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// オーナー送金ステータス（bookings.transfer_status）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Successful,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    /// 送金処理済み（再送金してはならない）かどうか
    pub fn is_settled(value: Option<&str>) -> bool {
        matches!(value, Some("pending") | Some("successful"))
    }
}

/// オーナー送金に必要な予約情報
#[derive(Debug, Clone, FromRow)]
pub struct BookingPayout {
    pub id: Uuid,
    pub total_amount: Option<f64>,
    pub payment_amount: Option<f64>,
    pub transfer_status: Option<String>,
    pub owner_id: Option<Uuid>,
    pub listing_title: Option<String>,
}

impl BookingPayout {
    /// 送金の元になる金額（支払額 → 予約総額の順に採用）
    pub fn gross_amount(&self) -> f64 {
        self.payment_amount.or(self.total_amount).unwrap_or(0.0)
    }

    /// 予約IDの先頭8文字（参照番号・通知文言用）
    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }
}
