use secrecy::ExposeSecret;
use serde::Serialize;
use time::Duration;

use crate::config::Config;
use crate::error::AppError;
use crate::services::otp::OtpDelivery;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const OTP_SUBJECT: &str = "Your Roominate Verification Code";

#[derive(Debug, Serialize)]
struct ResendEmailBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: String,
    text: String,
}

#[derive(Clone)]
enum Backend {
    Resend {
        api_key: String,
    },
    #[cfg(feature = "email")]
    Smtp(lettre::AsyncSmtpTransport<lettre::Tokio1Executor>),
    /// 開発環境: 送信せずログ出力のみ
    DevLog,
}

/// メール送信サービス
///
/// 優先順: Resend API → SMTP（email 機能有効時）→ ログ出力のみ
#[derive(Clone)]
pub struct EmailService {
    client: reqwest::Client,
    backend: Backend,
    from: String,
}

impl EmailService {
    /// 新しい EmailService を作成
    pub fn new(config: &Config, client: reqwest::Client) -> Result<Self, AppError> {
        let backend = match &config.resend_api_key {
            Some(key) => {
                tracing::info!("メール送信: Resend API");
                Backend::Resend {
                    api_key: key.expose_secret().clone(),
                }
            }
            None => Self::fallback_backend(config)?,
        };

        Ok(Self {
            client,
            backend,
            from: config.email_from.clone(),
        })
    }

    #[cfg(feature = "email")]
    fn fallback_backend(config: &Config) -> Result<Backend, AppError> {
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, Tokio1Executor};

        match (&config.smtp_host, &config.smtp_username, &config.smtp_password) {
            (Some(host), Some(username), Some(password)) => {
                let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                    .map_err(|e| {
                        tracing::error!(error = ?e, host = %host, "SMTP トランスポートの初期化に失敗");
                        AppError::Internal(anyhow::anyhow!("smtp relay error"))
                    })?
                    .port(config.smtp_port)
                    .credentials(Credentials::new(
                        username.expose_secret().clone(),
                        password.expose_secret().clone(),
                    ))
                    .build();
                tracing::info!(host = %host, "メール送信: SMTP");
                Ok(Backend::Smtp(transport))
            }
            _ => {
                tracing::warn!("メール送信未設定（開発モード: ログ出力のみ）");
                Ok(Backend::DevLog)
            }
        }
    }

    #[cfg(not(feature = "email"))]
    fn fallback_backend(_config: &Config) -> Result<Backend, AppError> {
        tracing::warn!("メール送信未設定（開発モード: ログ出力のみ）");
        Ok(Backend::DevLog)
    }

    /// 認証コードメールを送信
    pub async fn send_otp_email(&self, to: &str, code: &str, ttl: Duration) -> Result<(), AppError> {
        let minutes = ttl.whole_minutes();
        let text = otp_email_text(code, minutes);
        let html = otp_email_html(code, minutes);

        match &self.backend {
            Backend::Resend { api_key } => self.send_via_resend(api_key, to, text, html).await,
            #[cfg(feature = "email")]
            Backend::Smtp(transport) => self.send_via_smtp(transport, to, text, html).await,
            Backend::DevLog => {
                tracing::info!(to = %to, "認証コードメール送信（開発モード）");
                tracing::debug!("認証コード: {}", code);
                Ok(())
            }
        }
    }

    async fn send_via_resend(
        &self,
        api_key: &str,
        to: &str,
        text: String,
        html: String,
    ) -> Result<(), AppError> {
        let body = ResendEmailBody {
            from: &self.from,
            to: [to],
            subject: OTP_SUBJECT,
            html,
            text,
        };

        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, to = %to, "Resend API エラー");
            return Err(AppError::UpstreamStatus {
                service: "resend",
                status: status.as_u16(),
            });
        }

        tracing::info!(to = %to, "認証コードメール送信完了");
        Ok(())
    }

    #[cfg(feature = "email")]
    async fn send_via_smtp(
        &self,
        transport: &lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
        to: &str,
        text: String,
        html: String,
    ) -> Result<(), AppError> {
        use lettre::message::MultiPart;
        use lettre::{AsyncTransport, Message};

        let message = Message::builder()
            .from(self.from.parse().map_err(|e| {
                tracing::error!(error = ?e, "送信元アドレスが不正");
                AppError::Internal(anyhow::anyhow!("invalid from address"))
            })?)
            .to(to
                .parse()
                .map_err(|_| AppError::Validation("Invalid email address".to_string()))?)
            .subject(OTP_SUBJECT)
            .multipart(MultiPart::alternative_plain_html(text, html))
            .map_err(|e| {
                tracing::error!(error = ?e, "メール組み立てエラー");
                AppError::Internal(anyhow::anyhow!("email build error"))
            })?;

        transport.send(message).await.map_err(|e| {
            tracing::error!(error = ?e, to = %to, "SMTP 送信エラー");
            AppError::Internal(anyhow::anyhow!("smtp send error"))
        })?;

        tracing::info!(to = %to, "認証コードメール送信完了（SMTP）");
        Ok(())
    }
}

impl OtpDelivery for EmailService {
    async fn deliver(&self, email: &str, code: &str, ttl: Duration) -> Result<(), AppError> {
        self.send_otp_email(email, code, ttl).await
    }
}

fn otp_email_text(code: &str, minutes: i64) -> String {
    format!(
        "Your Roominate Verification Code\n\n\
         Your verification code is: {code}\n\n\
         This code will expire in {minutes} minutes.\n\n\
         If you didn't request this code, please ignore this email.\n\n\
         Best regards,\nThe Roominate Team\n"
    )
}

fn otp_email_html(code: &str, minutes: i64) -> String {
    format!(
        "<!DOCTYPE html><html><body style=\"font-family: Arial, sans-serif; color: #333;\">\
         <h1>Roominate</h1>\
         <h2>Your Verification Code</h2>\
         <p>Please use the verification code below to complete your registration:</p>\
         <p style=\"font-size: 32px; font-weight: bold; letter-spacing: 8px;\">{code}</p>\
         <p><strong>This code will expire in {minutes} minutes.</strong></p>\
         <p>If you didn't request this code, please ignore this email.</p>\
         <p>Best regards,<br>The Roominate Team</p>\
         </body></html>"
    )
}
