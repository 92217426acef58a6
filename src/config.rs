use std::time::Duration;

use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // OTP 設定
    /// パスコードのハッシュ化に使うソルト（未設定時は発行・検証とも設定エラー）
    #[serde(default)]
    pub otp_salt: Option<SecretBox<String>>,
    #[serde(default = "default_otp_ttl_secs")]
    pub otp_ttl_secs: i64,
    #[serde(default = "default_otp_rate_limit_window_secs")]
    pub otp_rate_limit_window_secs: i64,
    #[serde(default = "default_otp_rate_limit_max")]
    pub otp_rate_limit_max: i64,
    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: i32,

    /// 外部呼び出し（DB・API・メール）のタイムアウト
    #[serde(default = "default_outbound_timeout_secs")]
    pub outbound_timeout_secs: u64,

    // メール送信設定
    pub resend_api_key: Option<SecretBox<String>>,
    #[serde(default = "default_email_from")]
    pub email_from: String,

    // SMTP設定（オプション - email機能有効時のみ使用）
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<SecretBox<String>>,
    pub smtp_password: Option<SecretBox<String>>,

    // Supabase Auth Admin API 設定
    #[serde(default)]
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<SecretBox<String>>,
    /// /api/signup/confirm 用の共有シークレット（x-confirm-secret ヘッダー）
    pub confirm_secret: Option<SecretBox<String>>,

    // Lenco（モバイルマネー決済）設定
    pub lenco_api_key: Option<SecretBox<String>>,
    #[serde(default = "default_lenco_api_url")]
    pub lenco_api_url: String,
    /// オーナー送金時に差し引くプラットフォーム手数料（%）
    #[serde(default = "default_platform_fee_percent")]
    pub platform_fee_percent: f64,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OTP_TTL_SECS: i64 = 300;
const DEFAULT_OTP_RATE_LIMIT_WINDOW_SECS: i64 = 600;
const DEFAULT_OTP_RATE_LIMIT_MAX: i64 = 3;
const DEFAULT_OTP_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_OUTBOUND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_EMAIL_FROM: &str = "Roominate <onboarding@resend.dev>";
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_LENCO_API_URL: &str = "https://api.lenco.co/access/v2";
const DEFAULT_PLATFORM_FEE_PERCENT: f64 = 10.0;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_otp_ttl_secs() -> i64 {
    DEFAULT_OTP_TTL_SECS
}

fn default_otp_rate_limit_window_secs() -> i64 {
    DEFAULT_OTP_RATE_LIMIT_WINDOW_SECS
}

fn default_otp_rate_limit_max() -> i64 {
    DEFAULT_OTP_RATE_LIMIT_MAX
}

fn default_otp_max_attempts() -> i32 {
    DEFAULT_OTP_MAX_ATTEMPTS
}

fn default_outbound_timeout_secs() -> u64 {
    DEFAULT_OUTBOUND_TIMEOUT_SECS
}

fn default_email_from() -> String {
    DEFAULT_EMAIL_FROM.to_string()
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_lenco_api_url() -> String {
    DEFAULT_LENCO_API_URL.to_string()
}

fn default_platform_fee_percent() -> f64 {
    DEFAULT_PLATFORM_FEE_PERCENT
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn outbound_timeout(&self) -> Duration {
        Duration::from_secs(self.outbound_timeout_secs)
    }
}
