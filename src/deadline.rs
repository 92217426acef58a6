use std::future::IntoFuture;
use std::time::Duration;

use crate::error::AppError;

/// 外部呼び出しのタイムアウト
///
/// DB クエリ・外部 API・メール送信はすべてこれを経由する。
/// 期限切れ時は内側の Future を drop する（= キャンセルが伝播する）。
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// `operation` はログとエラーに載せる呼び出し名
    pub async fn run<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T, AppError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        AppError: From<E>,
    {
        match tokio::time::timeout(self.limit, fut.into_future()).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => {
                tracing::warn!(
                    operation = %operation,
                    limit_ms = self.limit.as_millis() as u64,
                    "外部呼び出しがタイムアウト"
                );
                Err(AppError::Timeout(operation))
            }
        }
    }
}
