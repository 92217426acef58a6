use serde::Serialize;
use uuid::Uuid;

pub const BOOKING_UPDATE_TYPE: &str = "booking_update";
pub const PAYMENT_TYPE: &str = "payment";

/// notifications テーブルに挿入する通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub related_id: Option<Uuid>,
}
