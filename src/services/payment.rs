use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::deadline::Deadline;
use crate::error::AppError;
use crate::models::notification::PAYMENT_TYPE;
use crate::models::{BookingPayout, NewNotification, PaymentStatus, TransferStatus};
use crate::repositories::{BookingRepository, NotificationRepository, ProfileRepository};
use crate::services::lenco::LencoClient;
use crate::services::operator::detect_operator;

/// 決済開始の入力（検証済み）
#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub booking_id: Uuid,
    pub amount: f64,
    pub currency: String,
    pub phone_number: String,
}

/// 決済開始の結果
#[derive(Debug, Clone)]
pub struct PaymentInitiated {
    pub reference: String,
    pub payment_status: String,
    pub requires_authorization: bool,
    pub data: Value,
}

/// Webhook ペイロードから読み取ったイベント
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event_type: Option<String>,
    pub reference: String,
    pub status: Option<PaymentStatus>,
    pub amount: Option<f64>,
}

/// Webhook 処理結果
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// ステータスを判定できなかった
    NoAction,
    /// 予約を更新した（送金なし）
    Updated,
    /// 予約は更新したが送金は行わなかった
    PayoutSkipped(&'static str),
    /// 送金 API が失敗した
    PayoutFailed,
    PayoutInitiated { reference: String, amount: f64 },
}

impl WebhookOutcome {
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::NoAction => Some("No action"),
            Self::Updated => None,
            Self::PayoutSkipped(reason) => Some(reason),
            Self::PayoutFailed => Some("Payment confirmed but transfer failed"),
            Self::PayoutInitiated { .. } => Some("Payment confirmed and transfer initiated"),
        }
    }
}

/// 手数料差し引き後の送金額
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Payout {
    pub fee: f64,
    pub transfer: f64,
}

/// 決済サービス（集金開始・Webhook・オーナー送金）
#[derive(Clone)]
pub struct PaymentService {
    bookings: BookingRepository,
    profiles: ProfileRepository,
    notifications: NotificationRepository,
    lenco: Option<LencoClient>,
    platform_fee_percent: f64,
    deadline: Deadline,
}

impl PaymentService {
    /// 新しい PaymentService を作成
    pub fn new(
        bookings: BookingRepository,
        profiles: ProfileRepository,
        notifications: NotificationRepository,
        lenco: Option<LencoClient>,
        platform_fee_percent: f64,
        deadline: Deadline,
    ) -> Self {
        Self {
            bookings,
            profiles,
            notifications,
            lenco,
            platform_fee_percent,
            deadline,
        }
    }

    /// モバイルマネー集金を開始し、予約に参照番号を記録
    pub async fn initiate(&self, request: &InitiatePayment) -> Result<PaymentInitiated, AppError> {
        let lenco = self
            .lenco
            .as_ref()
            .ok_or(AppError::Configuration("LENCO_API_KEY"))?;

        let operator = detect_operator(&request.phone_number);
        let reference = payment_reference(request.booking_id, OffsetDateTime::now_utc());

        tracing::info!(
            booking_id = %request.booking_id,
            reference = %reference,
            operator = operator.as_str(),
            currency = %request.currency,
            "モバイルマネー集金開始"
        );

        let response = self
            .deadline
            .run(
                "lenco.collect",
                lenco.collect_mobile_money(
                    request.amount,
                    &reference,
                    &request.phone_number,
                    operator,
                ),
            )
            .await?;

        // 参照番号の記録失敗は集金自体を失敗させない
        match self
            .deadline
            .run(
                "bookings.set_payment_reference",
                self.bookings
                    .set_payment_reference(request.booking_id, &reference),
            )
            .await
        {
            Ok(0) => {
                tracing::warn!(booking_id = %request.booking_id, "参照番号の記録対象の予約が存在しない")
            }
            Ok(_) => {
                tracing::info!(booking_id = %request.booking_id, reference = %reference, "参照番号を記録")
            }
            Err(e) => {
                tracing::warn!(error = %e, booking_id = %request.booking_id, "参照番号の記録に失敗")
            }
        }

        let payment_status = response.payment_status().to_string();
        Ok(PaymentInitiated {
            requires_authorization: payment_status == "pay-offline",
            payment_status,
            reference,
            data: response.data,
        })
    }

    /// 決済プロバイダーからの Webhook を処理
    ///
    /// 送金関連の失敗は Webhook 自体のエラーにしない
    pub async fn handle_webhook(&self, payload: &Value) -> Result<WebhookOutcome, AppError> {
        let event = interpret_webhook(payload)?;

        let Some(status) = event.status else {
            tracing::info!(
                reference = %event.reference,
                event_type = ?event.event_type,
                "Webhook: ステータスを判定できず"
            );
            return Ok(WebhookOutcome::NoAction);
        };

        let now = OffsetDateTime::now_utc();
        let updated = self
            .deadline
            .run(
                "bookings.apply_payment_result",
                self.bookings
                    .apply_payment_result(&event.reference, status, event.amount, now),
            )
            .await?;

        tracing::info!(
            reference = %event.reference,
            status = status.as_str(),
            updated,
            "Webhook: 予約の決済ステータスを更新"
        );

        if status != PaymentStatus::Completed {
            return Ok(WebhookOutcome::Updated);
        }

        match &self.lenco {
            Some(lenco) => Ok(self.pay_out_owner(lenco, &event.reference, now).await),
            None => {
                tracing::warn!("Lenco 未設定のためオーナー送金をスキップ");
                Ok(WebhookOutcome::Updated)
            }
        }
    }

    /// 手数料を差し引いてオーナーへ送金
    async fn pay_out_owner(
        &self,
        lenco: &LencoClient,
        reference: &str,
        now: OffsetDateTime,
    ) -> WebhookOutcome {
        let booking = match self
            .deadline
            .run(
                "bookings.find_payout",
                self.bookings.find_payout_by_reference(reference),
            )
            .await
        {
            Ok(Some(booking)) => booking,
            Ok(None) => {
                tracing::error!(reference = %reference, "送金対象の予約が見つからない");
                return WebhookOutcome::PayoutSkipped("Payment updated but transfer skipped");
            }
            Err(e) => {
                tracing::error!(error = %e, reference = %reference, "送金対象の予約取得に失敗");
                return WebhookOutcome::PayoutSkipped("Payment updated but transfer skipped");
            }
        };

        if TransferStatus::is_settled(booking.transfer_status.as_deref()) {
            tracing::info!(booking_id = %booking.id, "送金処理済みのためスキップ");
            return WebhookOutcome::PayoutSkipped("Transfer already processed");
        }

        let Some(owner_id) = booking.owner_id else {
            tracing::error!(booking_id = %booking.id, "予約にオーナーが設定されていない");
            return WebhookOutcome::PayoutSkipped("Payment updated but no owner found");
        };

        let phone = match self
            .deadline
            .run("profiles.find_contact", self.profiles.find_contact(owner_id))
            .await
        {
            Ok(Some(owner)) => match owner.phone.filter(|p| !p.trim().is_empty()) {
                Some(phone) => phone,
                None => {
                    tracing::error!(owner_id = %owner_id, "オーナーの電話番号が未登録");
                    return WebhookOutcome::PayoutSkipped(
                        "Payment updated but owner details incomplete",
                    );
                }
            },
            Ok(None) => {
                tracing::error!(owner_id = %owner_id, "オーナーが見つからない");
                return WebhookOutcome::PayoutSkipped("Payment updated but owner details incomplete");
            }
            Err(e) => {
                tracing::error!(error = %e, owner_id = %owner_id, "オーナー情報の取得に失敗");
                return WebhookOutcome::PayoutSkipped("Payment updated but owner details incomplete");
            }
        };

        let payout = split_payout(booking.gross_amount(), self.platform_fee_percent);
        tracing::info!(
            booking_id = %booking.id,
            gross = booking.gross_amount(),
            fee = payout.fee,
            transfer = payout.transfer,
            "送金額を計算"
        );

        if payout.transfer <= 0.0 {
            tracing::error!(booking_id = %booking.id, transfer = payout.transfer, "送金額が不正");
            return WebhookOutcome::PayoutSkipped("Payment updated but invalid transfer amount");
        }

        let transfer_ref = transfer_reference(&booking, now);
        let narration = format!(
            "Booking payment - {}",
            booking
                .listing_title
                .clone()
                .unwrap_or_else(|| booking.short_id())
        );

        let result = self
            .deadline
            .run(
                "lenco.transfer",
                lenco.transfer_mobile_money(
                    payout.transfer,
                    &transfer_ref,
                    &phone,
                    detect_operator(&phone),
                    &narration,
                ),
            )
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, booking_id = %booking.id, "オーナー送金に失敗");
            if let Err(e) = self
                .deadline
                .run(
                    "bookings.record_transfer_failure",
                    self.bookings
                        .record_transfer_failure(booking.id, &transfer_ref),
                )
                .await
            {
                tracing::error!(error = %e, booking_id = %booking.id, "送金失敗の記録に失敗");
            }
            return WebhookOutcome::PayoutFailed;
        }

        if let Err(e) = self
            .deadline
            .run(
                "bookings.record_transfer_pending",
                self.bookings
                    .record_transfer_pending(booking.id, &transfer_ref, payout.transfer, now),
            )
            .await
        {
            tracing::error!(error = %e, booking_id = %booking.id, "送金情報の記録に失敗");
        }

        let notification = payment_received_notification(owner_id, &booking, payout.transfer);
        if let Err(e) = self
            .deadline
            .run(
                "notifications.insert",
                self.notifications.insert_many(&[notification]),
            )
            .await
        {
            tracing::warn!(error = %e, owner_id = %owner_id, "入金通知の作成に失敗");
        }

        tracing::info!(booking_id = %booking.id, transfer_reference = %transfer_ref, "オーナー送金開始");

        WebhookOutcome::PayoutInitiated {
            reference: transfer_ref,
            amount: payout.transfer,
        }
    }
}

fn unix_millis(now: OffsetDateTime) -> i128 {
    now.unix_timestamp_nanos() / 1_000_000
}

/// 集金の参照番号（英数字と - のみ）
pub fn payment_reference(booking_id: Uuid, now: OffsetDateTime) -> String {
    format!("RMN-{}-{}", booking_id.simple(), unix_millis(now))
}

/// 送金の参照番号
pub fn transfer_reference(booking: &BookingPayout, now: OffsetDateTime) -> String {
    format!("TRF-{}-{}", booking.short_id(), unix_millis(now))
}

/// プラットフォーム手数料を差し引いた送金額（小数第2位で丸め）
pub fn split_payout(gross: f64, fee_percent: f64) -> Payout {
    let fee = round_cents(gross * fee_percent / 100.0);
    Payout {
        fee,
        transfer: round_cents(gross - fee),
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn payment_received_notification(
    owner_id: Uuid,
    booking: &BookingPayout,
    amount: f64,
) -> NewNotification {
    NewNotification {
        user_id: owner_id,
        title: "Payment Received".to_string(),
        message: format!(
            "You received K{:.2} for booking {}",
            amount,
            booking.short_id()
        ),
        kind: PAYMENT_TYPE,
        related_id: Some(booking.id),
    }
}

fn str_at<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(payload, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn amount_at(payload: &Value, path: &[&str]) -> Option<f64> {
    let value = path.iter().try_fold(payload, |v, key| v.get(key))?;
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn status_from_field(value: Option<&str>) -> Option<PaymentStatus> {
    match value? {
        "successful" => Some(PaymentStatus::Completed),
        "failed" => Some(PaymentStatus::Failed),
        "cancelled" => Some(PaymentStatus::Cancelled),
        _ => None,
    }
}

/// Webhook ペイロードを解釈
///
/// ペイロード形式は一定しないため、複数の位置から event / reference / status を探す
pub fn interpret_webhook(payload: &Value) -> Result<WebhookEvent, AppError> {
    let event_type = str_at(payload, &["event"])
        .or_else(|| str_at(payload, &["type"]))
        .or_else(|| str_at(payload, &["data", "type"]))
        .map(str::to_string);

    let reference = str_at(payload, &["reference"])
        .or_else(|| str_at(payload, &["data", "reference"]))
        .or_else(|| str_at(payload, &["collection", "reference"]))
        .ok_or_else(|| {
            tracing::warn!("Webhook: reference が見つからない");
            AppError::Validation("No reference found".to_string())
        })?
        .to_string();

    let collection_status = str_at(payload, &["collection", "status"]);
    let data_status = str_at(payload, &["data", "status"]);

    let status = match event_type.as_deref() {
        Some("collection.successful" | "collection.created" | "collection.updated") => {
            let succeeded = payload
                .get("data")
                .and_then(|d| d.get("success"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || collection_status == Some("successful")
                || data_status == Some("successful");
            succeeded.then_some(PaymentStatus::Completed)
        }
        Some("collection.failed") => Some(PaymentStatus::Failed),
        Some("collection.cancelled") => Some(PaymentStatus::Cancelled),
        _ => None,
    }
    .or_else(|| status_from_field(collection_status.or(data_status)));

    let amount = amount_at(payload, &["data", "amount"])
        .or_else(|| amount_at(payload, &["collection", "amount"]));

    Ok(WebhookEvent {
        event_type,
        reference,
        status,
        amount,
    })
}
