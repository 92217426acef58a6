use uuid::Uuid;

use crate::deadline::Deadline;
use crate::error::AppError;
use crate::models::NewNotification;
use crate::models::notification::BOOKING_UPDATE_TYPE;
use crate::repositories::NotificationRepository;

/// 予約ステータス変更の通知文面（tenant 向け）
fn tenant_message(status: &str) -> (&'static str, String) {
    match status {
        "confirmed" => (
            "Booking Confirmed",
            "Your booking has been confirmed by the owner.".to_string(),
        ),
        "completed" => (
            "Booking Completed",
            "Your booking has been marked as completed.".to_string(),
        ),
        "cancelled" => (
            "Booking Cancelled",
            "Your booking has been cancelled.".to_string(),
        ),
        "rejected" => (
            "Booking Request Declined",
            "Unfortunately, your booking request was declined by the owner.".to_string(),
        ),
        other => (
            "Booking Updated",
            format!("Your booking status is now: {other}"),
        ),
    }
}

/// 予約ステータス変更に対する通知を組み立てる
///
/// tenant には常に1件、owner には pending の場合のみ1件
pub fn build_booking_notifications(
    booking_id: Uuid,
    status: &str,
    owner_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
) -> Vec<NewNotification> {
    let mut notifications = Vec::with_capacity(2);

    if let Some(tenant_id) = tenant_id {
        let (title, message) = tenant_message(status);
        notifications.push(NewNotification {
            user_id: tenant_id,
            title: title.to_string(),
            message,
            kind: BOOKING_UPDATE_TYPE,
            related_id: Some(booking_id),
        });
    }

    if let Some(owner_id) = owner_id
        && status == "pending"
    {
        notifications.push(NewNotification {
            user_id: owner_id,
            title: "New Booking Request".to_string(),
            message: "You have received a new booking request.".to_string(),
            kind: BOOKING_UPDATE_TYPE,
            related_id: Some(booking_id),
        });
    }

    notifications
}

/// 予約通知サービス
#[derive(Clone)]
pub struct BookingNotificationService {
    notifications: NotificationRepository,
    deadline: Deadline,
}

impl BookingNotificationService {
    pub fn new(notifications: NotificationRepository, deadline: Deadline) -> Self {
        Self {
            notifications,
            deadline,
        }
    }

    /// 通知を作成して挿入件数を返す
    pub async fn notify(
        &self,
        booking_id: Uuid,
        status: &str,
        owner_id: Option<Uuid>,
        tenant_id: Option<Uuid>,
    ) -> Result<u64, AppError> {
        let notifications = build_booking_notifications(booking_id, status, owner_id, tenant_id);
        if notifications.is_empty() {
            tracing::debug!(booking_id = %booking_id, status = %status, "通知対象なし");
            return Ok(0);
        }

        let inserted = self
            .deadline
            .run(
                "notifications.insert_many",
                self.notifications.insert_many(&notifications),
            )
            .await?;
        tracing::info!(booking_id = %booking_id, status = %status, inserted, "予約通知を作成");
        Ok(inserted)
    }
}
