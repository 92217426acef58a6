use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::operator::MobileOperator;

const COUNTRY: &str = "zm";

/// モバイルマネー集金リクエスト（roominate → Lenco）
#[derive(Debug, Serialize)]
pub struct CollectionRequest<'a> {
    pub amount: f64,
    pub reference: &'a str,
    pub phone: &'a str,
    pub operator: MobileOperator,
    pub country: &'static str,
    pub bearer: &'static str,
}

/// モバイルマネー送金リクエスト（roominate → Lenco）
#[derive(Debug, Serialize)]
pub struct TransferRequest<'a> {
    pub amount: f64,
    pub reference: &'a str,
    pub phone: &'a str,
    pub operator: MobileOperator,
    pub country: &'static str,
    pub narration: &'a str,
}

/// Lenco API の共通レスポンス（data 以外は使わない）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LencoResponse {
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl LencoResponse {
    /// data.status（例: "pay-offline", "pending"）
    pub fn payment_status(&self) -> &str {
        self.data
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
    }
}

/// Lenco API クライアント
#[derive(Clone)]
pub struct LencoClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl LencoClient {
    /// 新しい LencoClient を作成
    pub fn new(client: reqwest::Client, api_url: String, api_key: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// モバイルマネー集金を開始
    ///
    /// 利用者の端末に承認リクエストが送られる
    pub async fn collect_mobile_money(
        &self,
        amount: f64,
        reference: &str,
        phone: &str,
        operator: MobileOperator,
    ) -> Result<LencoResponse, AppError> {
        let body = CollectionRequest {
            amount,
            reference,
            phone,
            operator,
            country: COUNTRY,
            bearer: "merchant",
        };

        self.post("/collections/mobile-money", &body).await
    }

    /// モバイルマネー送金（オーナーへの支払い）
    pub async fn transfer_mobile_money(
        &self,
        amount: f64,
        reference: &str,
        phone: &str,
        operator: MobileOperator,
        narration: &str,
    ) -> Result<LencoResponse, AppError> {
        let body = TransferRequest {
            amount,
            reference,
            phone,
            operator,
            country: COUNTRY,
            narration,
        };

        self.post("/transfers/mobile-money", &body).await
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<LencoResponse, AppError> {
        let url = format!("{}{}", self.api_url, path);

        let response: reqwest::Response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(http::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::error!(status = %status, path = %path, body = %text, "Lenco API エラー");
            return Err(AppError::UpstreamStatus {
                service: "lenco",
                status: status.as_u16(),
            });
        }

        // JSON でない応答も成功として扱い、本文は raw に残す
        let parsed = match serde_json::from_str::<LencoResponse>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = ?e, path = %path, "Lenco レスポンスのパースエラー");
                LencoResponse {
                    data: serde_json::json!({ "raw": text }),
                    ..Default::default()
                }
            }
        };

        tracing::debug!(path = %path, payment_status = %parsed.payment_status(), "Lenco API 呼び出し成功");
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_payload_shape() {
        let body = CollectionRequest {
            amount: 1500.0,
            reference: "RMN-abc-1",
            phone: "0971234567",
            operator: MobileOperator::Airtel,
            country: COUNTRY,
            bearer: "merchant",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["operator"], "airtel");
        assert_eq!(json["country"], "zm");
        assert_eq!(json["bearer"], "merchant");
        assert_eq!(json["amount"], 1500.0);
    }

    #[test]
    fn test_payment_status_from_data() {
        let response: LencoResponse = serde_json::from_value(serde_json::json!({
            "status": true,
            "message": "ok",
            "data": { "status": "pay-offline", "reference": "RMN-1" }
        }))
        .unwrap();
        assert_eq!(response.payment_status(), "pay-offline");

        let response: LencoResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(response.payment_status(), "unknown");
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let client = LencoClient::new(
            reqwest::Client::new(),
            "https://api.lenco.co/access/v2/".to_string(),
            "key".to_string(),
        );
        assert_eq!(client.api_url, "https://api.lenco.co/access/v2");
    }
}
