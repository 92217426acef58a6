use axum::{Json, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct NotifyBookingRequest {
    #[garde(skip)]
    pub booking_id: Uuid,
    #[garde(length(min = 1))]
    pub status: String,
    #[garde(skip)]
    pub owner_id: Option<Uuid>,
    #[garde(skip)]
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct NotifyBookingResponse {
    pub success: bool,
    pub notifications_created: u64,
}

/// POST /api/bookings/notify
pub async fn notify_booking_update(
    State(state): State<AppState>,
    Json(request): Json<NotifyBookingRequest>,
) -> Result<Json<NotifyBookingResponse>, AppError> {
    request.validate()?;

    let created = state
        .booking_notification_service
        .notify(
            request.booking_id,
            &request.status,
            request.owner_id,
            request.tenant_id,
        )
        .await?;

    Ok(Json(NotifyBookingResponse {
        success: true,
        notifications_created: created,
    }))
}
