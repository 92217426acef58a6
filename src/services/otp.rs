use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::Config;
use crate::deadline::Deadline;
use crate::error::AppError;
use crate::models::{EmailOtp, NewEmailOtp};

/// パスコードの桁数
pub const CODE_LENGTH: usize = 6;

/// 使用済みマークの書き込み試行回数（初回 + リトライ1回）
const MARK_USED_ATTEMPTS: u32 = 2;

/// OTP レコードの永続化先
///
/// 試行回数の加算と使用済みマークはレコードIDを条件にした単一の UPDATE で行うこと。
/// 同時リクエストでの更新喪失を防ぐため、読み出した値を書き戻してはならない。
pub trait OtpStore: Send + Sync {
    /// `since` 以降に作成されたレコード数
    fn count_created_since(
        &self,
        email: &str,
        since: OffsetDateTime,
    ) -> impl Future<Output = Result<i64, sqlx::Error>> + Send;

    fn insert(&self, otp: NewEmailOtp)
    -> impl Future<Output = Result<EmailOtp, sqlx::Error>> + Send;

    /// 未使用レコードのうち最も新しいもの
    fn find_latest_unused(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<EmailOtp>, sqlx::Error>> + Send;

    fn find_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EmailOtp>, sqlx::Error>> + Send;

    /// attempts を 1 加算し、加算後の値を返す（未使用行が無ければ None）
    fn increment_attempts(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<i32>, sqlx::Error>> + Send;

    /// 未使用・期限内・試行回数 `max_attempts` 未満の場合のみ使用済みにする。更新した場合 true
    ///
    /// 条件は読み出し時点の値ではなく、書き込み時点の行に対して評価すること。
    fn mark_used(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        max_attempts: i32,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

impl<T: OtpStore> OtpStore for Arc<T> {
    fn count_created_since(
        &self,
        email: &str,
        since: OffsetDateTime,
    ) -> impl Future<Output = Result<i64, sqlx::Error>> + Send {
        (**self).count_created_since(email, since)
    }

    fn insert(
        &self,
        otp: NewEmailOtp,
    ) -> impl Future<Output = Result<EmailOtp, sqlx::Error>> + Send {
        (**self).insert(otp)
    }

    fn find_latest_unused(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<EmailOtp>, sqlx::Error>> + Send {
        (**self).find_latest_unused(email)
    }

    fn find_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EmailOtp>, sqlx::Error>> + Send {
        (**self).find_by_id(id)
    }

    fn increment_attempts(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<i32>, sqlx::Error>> + Send {
        (**self).increment_attempts(id)
    }

    fn mark_used(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        max_attempts: i32,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send {
        (**self).mark_used(id, used_at, max_attempts)
    }
}

/// パスコードの配送チャネル（メール等）
pub trait OtpDelivery: Send + Sync {
    fn deliver(
        &self,
        email: &str,
        code: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

impl<T: OtpDelivery> OtpDelivery for Arc<T> {
    fn deliver(
        &self,
        email: &str,
        code: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send {
        (**self).deliver(email, code, ttl)
    }
}

/// 発行・検証のポリシー
#[derive(Debug, Clone, Copy)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: i64,
    pub max_attempts: i32,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            rate_limit_window: Duration::minutes(10),
            rate_limit_max: 3,
            max_attempts: 5,
        }
    }
}

impl OtpPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: Duration::seconds(config.otp_ttl_secs),
            rate_limit_window: Duration::seconds(config.otp_rate_limit_window_secs),
            rate_limit_max: config.otp_rate_limit_max,
            max_attempts: config.otp_max_attempts,
        }
    }
}

/// 発行結果
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub id: Uuid,
    pub expires_in_seconds: i64,
}

/// 検証成功
#[derive(Debug, Clone)]
pub struct VerifiedOtp {
    pub id: Uuid,
    pub email: String,
}

/// メール OTP サービス
///
/// # Security
/// - パスコード平文は DB に保存しない（ソルト付き SHA-256 のみ）
/// - パスコード・ソルト・ハッシュはログに出力しない
#[derive(Clone)]
pub struct OtpService<S, D> {
    store: S,
    delivery: D,
    policy: OtpPolicy,
    salt: Option<String>,
    deadline: Deadline,
}

impl<S: OtpStore, D: OtpDelivery> OtpService<S, D> {
    pub fn new(
        store: S,
        delivery: D,
        policy: OtpPolicy,
        salt: Option<String>,
        deadline: Deadline,
    ) -> Self {
        Self {
            store,
            delivery,
            policy,
            salt,
            deadline,
        }
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    /// OTP を発行してメールで送信
    pub async fn issue(&self, email: &str, ip_address: Option<String>) -> Result<IssuedOtp, AppError> {
        self.issue_at(email, ip_address, OffsetDateTime::now_utc())
            .await
    }

    /// OTP を検証して使用済みにする
    pub async fn verify(&self, email: &str, code: &str) -> Result<VerifiedOtp, AppError> {
        self.verify_at(email, code, OffsetDateTime::now_utc()).await
    }

    pub async fn issue_at(
        &self,
        email: &str,
        ip_address: Option<String>,
        now: OffsetDateTime,
    ) -> Result<IssuedOtp, AppError> {
        let salt = self.salt()?;
        let email = normalize_email(email);

        // レート制限（スライディングウィンドウ）。チェック失敗は発行を止めない
        let since = now - self.policy.rate_limit_window;
        match self
            .deadline
            .run(
                "otp.count_recent",
                self.store.count_created_since(&email, since),
            )
            .await
        {
            Ok(count) if count >= self.policy.rate_limit_max => {
                tracing::warn!(email = %email, count, "OTP 発行のレート制限");
                return Err(AppError::OtpRateLimited);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, email = %email, "レート制限チェックに失敗（続行）");
            }
        }

        let code = generate_code();
        let otp_hash = hash_code(&code, salt);

        let record = self
            .deadline
            .run(
                "otp.insert",
                self.store.insert(NewEmailOtp {
                    email: email.clone(),
                    otp_hash,
                    created_at: now,
                    expires_at: now + self.policy.ttl,
                    ip_address,
                }),
            )
            .await
            .map_err(persistence("OTP レコードの保存に失敗"))?;

        tracing::info!(email = %email, otp_id = %record.id, "OTP 発行");

        // 配送失敗でもレコードは有効なまま（ユーザーは再送/検証を選べる）
        if let Err(e) = self
            .deadline
            .run(
                "otp.deliver",
                self.delivery.deliver(&email, &code, self.policy.ttl),
            )
            .await
        {
            tracing::warn!(error = %e, email = %email, otp_id = %record.id, "OTP の配送に失敗");
        }

        Ok(IssuedOtp {
            id: record.id,
            expires_in_seconds: self.policy.ttl.whole_seconds(),
        })
    }

    /// 判定順序: 形式 → 存在 → 期限 → 試行回数 → ハッシュ
    pub async fn verify_at(
        &self,
        email: &str,
        code: &str,
        now: OffsetDateTime,
    ) -> Result<VerifiedOtp, AppError> {
        let code = code.trim();
        validate_code_format(code)?;
        let salt = self.salt()?;
        let email = normalize_email(email);

        let submitted_hash = hash_code(code, salt);

        let record = self
            .deadline
            .run("otp.find_latest", self.store.find_latest_unused(&email))
            .await
            .map_err(persistence("OTP レコードの取得に失敗"))?
            .ok_or(AppError::OtpNotFound)?;

        if record.is_expired_at(now) {
            tracing::info!(otp_id = %record.id, "期限切れ OTP");
            return Err(AppError::OtpExpired);
        }

        if record.attempts >= self.policy.max_attempts {
            tracing::warn!(otp_id = %record.id, attempts = record.attempts, "OTP 試行回数超過");
            return Err(AppError::OtpTooManyAttempts);
        }

        if !hashes_match(&record.otp_hash, &submitted_hash) {
            let attempts = self.record_failed_attempt(&record).await;
            let attempts_remaining = (self.policy.max_attempts - attempts).max(0);
            tracing::info!(otp_id = %record.id, attempts, attempts_remaining, "OTP 不一致");
            return Err(AppError::OtpMismatch { attempts_remaining });
        }

        self.consume(&record, now).await?;

        tracing::info!(email = %email, otp_id = %record.id, "OTP 検証成功");

        Ok(VerifiedOtp {
            id: record.id,
            email,
        })
    }

    /// 失敗回数を加算（ベストエフォート）。加算後の回数を返す
    async fn record_failed_attempt(&self, record: &EmailOtp) -> i32 {
        match self
            .deadline
            .run(
                "otp.increment_attempts",
                self.store.increment_attempts(record.id),
            )
            .await
        {
            Ok(Some(attempts)) => attempts,
            Ok(None) => record.attempts + 1,
            Err(e) => {
                tracing::warn!(error = %e, otp_id = %record.id, "試行回数の更新に失敗");
                record.attempts + 1
            }
        }
    }

    /// 使用済みマーク（条件付き UPDATE）
    ///
    /// 書き込みがエラーになった場合のみ1回リトライし、それでも駄目なら読み戻して判定する。
    /// エラーなしで更新0件なら、他のリクエストが先に使用済みにしたか試行回数・期限の条件を外れた。
    async fn consume(&self, record: &EmailOtp, now: OffsetDateTime) -> Result<(), AppError> {
        let mut write_failed = false;
        for attempt in 1..=MARK_USED_ATTEMPTS {
            match self
                .deadline
                .run(
                    "otp.mark_used",
                    self.store
                        .mark_used(record.id, now, self.policy.max_attempts),
                )
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) if !write_failed => {
                    tracing::info!(otp_id = %record.id, "使用済みマークの条件不成立");
                    return Err(self.rejection(record, now).await);
                }
                // 直前の失敗した書き込みが反映済みの可能性がある
                Ok(false) => break,
                Err(e) => {
                    write_failed = true;
                    tracing::warn!(error = %e, otp_id = %record.id, attempt, "使用済みマークに失敗");
                }
            }
        }

        match self
            .deadline
            .run("otp.read_back", self.store.find_by_id(record.id))
            .await
        {
            Ok(Some(current)) if current.used => {
                tracing::info!(otp_id = %record.id, "使用済みマークは反映済み");
                Ok(())
            }
            Ok(Some(current)) if self.is_locked(&current, now) => Err(self.rejection_for(&current, now)),
            Ok(_) => Err(AppError::Persistence(format!(
                "OTP {} を使用済みにできませんでした",
                record.id
            ))),
            Err(e) => Err(AppError::Persistence(format!(
                "OTP {} の読み戻しに失敗: {e}",
                record.id
            ))),
        }
    }

    /// 条件付き UPDATE が0件だった理由を現在の行から判定する
    async fn rejection(&self, record: &EmailOtp, now: OffsetDateTime) -> AppError {
        match self
            .deadline
            .run("otp.read_back", self.store.find_by_id(record.id))
            .await
        {
            Ok(Some(current)) => self.rejection_for(&current, now),
            Ok(None) => AppError::OtpNotFound,
            Err(e) => {
                tracing::warn!(error = %e, otp_id = %record.id, "OTP の再読み込みに失敗");
                AppError::OtpNotFound
            }
        }
    }

    fn is_locked(&self, current: &EmailOtp, now: OffsetDateTime) -> bool {
        current.is_expired_at(now) || current.attempts >= self.policy.max_attempts
    }

    fn rejection_for(&self, current: &EmailOtp, now: OffsetDateTime) -> AppError {
        if current.used {
            AppError::OtpNotFound
        } else if current.is_expired_at(now) {
            AppError::OtpExpired
        } else if current.attempts >= self.policy.max_attempts {
            AppError::OtpTooManyAttempts
        } else {
            AppError::OtpNotFound
        }
    }

    fn salt(&self) -> Result<&str, AppError> {
        self.salt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AppError::Configuration("OTP_SALT"))
    }
}

fn persistence(context: &'static str) -> impl FnOnce(AppError) -> AppError {
    move |e| AppError::Persistence(format!("{context}: {e}"))
}

/// メールアドレスの正規化（前後空白除去 + 小文字化）
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 100000〜999999 の6桁パスコードを生成
pub fn generate_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!("{:0width$}", code, width = CODE_LENGTH)
}

/// SHA256(code ‖ salt) の16進表現。両入力とも前後空白を除去する
pub fn hash_code(code: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    hasher.update(salt.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 保存済みハッシュとの定数時間比較
fn hashes_match(stored: &str, submitted: &str) -> bool {
    stored.as_bytes().ct_eq(submitted.as_bytes()).into()
}

pub fn validate_code_format(code: &str) -> Result<(), AppError> {
    if code.len() != CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Validation("Invalid OTP format".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    const SALT: &str = "test-salt";
    const EMAIL: &str = "a@b.com";

    /// インメモリの OtpStore（障害注入つき）
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<EmailOtp>>,
        fail_count: AtomicBool,
        fail_increment: AtomicBool,
        /// mark_used を失敗させる残り回数
        mark_used_failures: AtomicUsize,
        /// 失敗を返す前に更新自体は適用する
        apply_before_failing: AtomicBool,
    }

    impl MemoryStore {
        fn row(&self, id: Uuid) -> EmailOtp {
            let rows = self.rows.lock().unwrap();
            rows.iter().find(|r| r.id == id).cloned().unwrap()
        }

        fn set_attempts(&self, id: Uuid, attempts: i32) {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.attempts = attempts;
            }
        }

        fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    fn injected() -> sqlx::Error {
        sqlx::Error::Protocol("injected failure".to_string())
    }

    impl OtpStore for MemoryStore {
        async fn count_created_since(
            &self,
            email: &str,
            since: OffsetDateTime,
        ) -> Result<i64, sqlx::Error> {
            if self.fail_count.load(Ordering::SeqCst) {
                return Err(injected());
            }
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|r| r.email == email && r.created_at >= since)
                .count() as i64)
        }

        async fn insert(&self, otp: NewEmailOtp) -> Result<EmailOtp, sqlx::Error> {
            let row = EmailOtp {
                id: Uuid::new_v4(),
                email: otp.email,
                otp_hash: otp.otp_hash,
                created_at: otp.created_at,
                expires_at: otp.expires_at,
                used: false,
                used_at: None,
                attempts: 0,
                ip_address: otp.ip_address,
            };
            self.rows.lock().unwrap().push(row.clone());
            Ok(row)
        }

        /// 読み出し後に yield し、DB 往復の間に他のリクエストが割り込めるようにする
        async fn find_latest_unused(&self, email: &str) -> Result<Option<EmailOtp>, sqlx::Error> {
            let latest = {
                let rows = self.rows.lock().unwrap();
                rows.iter()
                    .filter(|r| r.email == email && !r.used)
                    .max_by_key(|r| r.created_at)
                    .cloned()
            };
            tokio::task::yield_now().await;
            Ok(latest)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<EmailOtp>, sqlx::Error> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().find(|r| r.id == id).cloned())
        }

        async fn increment_attempts(&self, id: Uuid) -> Result<Option<i32>, sqlx::Error> {
            if self.fail_increment.load(Ordering::SeqCst) {
                return Err(injected());
            }
            let mut rows = self.rows.lock().unwrap();
            Ok(rows.iter_mut().find(|r| r.id == id && !r.used).map(|r| {
                r.attempts += 1;
                r.attempts
            }))
        }

        async fn mark_used(
            &self,
            id: Uuid,
            used_at: OffsetDateTime,
            max_attempts: i32,
        ) -> Result<bool, sqlx::Error> {
            let failing = self
                .mark_used_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing && !self.apply_before_failing.load(Ordering::SeqCst) {
                return Err(injected());
            }
            let mut rows = self.rows.lock().unwrap();
            let updated = match rows.iter_mut().find(|r| {
                r.id == id && !r.used && r.expires_at >= used_at && r.attempts < max_attempts
            }) {
                Some(row) => {
                    row.used = true;
                    row.used_at = Some(used_at);
                    true
                }
                None => false,
            };
            if failing {
                return Err(injected());
            }
            Ok(updated)
        }
    }

    /// 送信されたコードを記録する配送チャネル
    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
    }

    impl RecordingDelivery {
        fn last_code(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    impl OtpDelivery for RecordingDelivery {
        async fn deliver(&self, email: &str, code: &str, _ttl: Duration) -> Result<(), AppError> {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_string(), code.to_string()));
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::UpstreamStatus {
                    service: "email",
                    status: 500,
                });
            }
            Ok(())
        }
    }

    type TestService = OtpService<Arc<MemoryStore>, Arc<RecordingDelivery>>;

    fn setup_with_salt(salt: Option<&str>) -> (TestService, Arc<MemoryStore>, Arc<RecordingDelivery>) {
        let store = Arc::new(MemoryStore::default());
        let delivery = Arc::new(RecordingDelivery::default());
        let service = OtpService::new(
            store.clone(),
            delivery.clone(),
            OtpPolicy::default(),
            salt.map(str::to_string),
            Deadline::new(std::time::Duration::from_secs(5)),
        );
        (service, store, delivery)
    }

    fn setup() -> (TestService, Arc<MemoryStore>, Arc<RecordingDelivery>) {
        setup_with_salt(Some(SALT))
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn wrong_code(correct: &str) -> &'static str {
        if correct == "000000" { "111111" } else { "000000" }
    }

    #[test]
    fn test_generate_code_is_six_digits_in_range() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            let value: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&value));
        }
    }

    #[test]
    fn test_hash_code_trims_inputs() {
        assert_eq!(hash_code("123456", "salt"), hash_code(" 123456 ", " salt\n"));
        assert_ne!(hash_code("123456", "salt"), hash_code("123456", "other"));
        assert_eq!(hash_code("123456", "salt").len(), 64);
    }

    #[test]
    fn test_validate_code_format() {
        assert!(validate_code_format("123456").is_ok());
        assert!(validate_code_format("12345").is_err());
        assert!(validate_code_format("1234567").is_err());
        assert!(validate_code_format("12345a").is_err());
        assert!(validate_code_format("").is_err());
    }

    #[tokio::test]
    async fn test_issue_stores_salted_hash_only() {
        let (service, store, delivery) = setup();

        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        assert_eq!(issued.expires_in_seconds, 300);

        let code = delivery.last_code();
        let row = store.row(issued.id);
        assert_ne!(row.otp_hash, code);
        assert_eq!(row.otp_hash, hash_code(&code, SALT));
        assert!(!row.used);
        assert_eq!(row.attempts, 0);
        assert!(row.used_at.is_none());
        assert_eq!(row.expires_at, t0() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_fourth_issue_within_window_is_rate_limited() {
        let (service, store, _) = setup();

        for minute in 0..3 {
            service
                .issue_at(EMAIL, None, t0() + Duration::minutes(minute))
                .await
                .unwrap();
        }

        let result = service
            .issue_at(EMAIL, None, t0() + Duration::minutes(4))
            .await;
        assert!(matches!(result, Err(AppError::OtpRateLimited)));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_window_slides() {
        let (service, _, _) = setup();

        for minute in 0..3 {
            service
                .issue_at(EMAIL, None, t0() + Duration::minutes(minute))
                .await
                .unwrap();
        }

        // 最初の発行から10分超経過すればウィンドウ内は2件
        let result = service
            .issue_at(EMAIL, None, t0() + Duration::minutes(10) + Duration::seconds(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_check_failure_does_not_block_issue() {
        let (service, store, _) = setup();
        store.fail_count.store(true, Ordering::SeqCst);

        assert!(service.issue_at(EMAIL, None, t0()).await.is_ok());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_record_valid() {
        let (service, store, delivery) = setup();
        delivery.fail.store(true, Ordering::SeqCst);

        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        assert_eq!(store.len(), 1);

        let code = delivery.last_code();
        let verified = service
            .verify_at(EMAIL, &code, t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(verified.id, issued.id);
    }

    #[tokio::test]
    async fn test_missing_salt_is_configuration_error() {
        let (service, store, _) = setup_with_salt(None);
        let result = service.issue_at(EMAIL, None, t0()).await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
        assert_eq!(store.len(), 0);

        let result = service.verify_at(EMAIL, "123456", t0()).await;
        assert!(matches!(result, Err(AppError::Configuration(_))));

        let (service, _, _) = setup_with_salt(Some("   "));
        let result = service.issue_at(EMAIL, None, t0()).await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_invalid_format_fails_before_storage() {
        let (service, _, _) = setup_with_salt(None);
        // ソルト未設定でも形式エラーが先に返る
        let result = service.verify_at(EMAIL, "12ab56", t0()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_verify_succeeds_exactly_once() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        let code = delivery.last_code();

        let now = t0() + Duration::minutes(1);
        let verified = service.verify_at(EMAIL, &code, now).await.unwrap();
        assert_eq!(verified.email, EMAIL);

        let row = store.row(issued.id);
        assert!(row.used);
        assert_eq!(row.used_at, Some(now));

        let again = service.verify_at(EMAIL, &code, now).await;
        assert!(matches!(again, Err(AppError::OtpNotFound)));
    }

    #[tokio::test]
    async fn test_verify_without_record_is_not_found() {
        let (service, _, _) = setup();
        let result = service.verify_at(EMAIL, "123456", t0()).await;
        assert!(matches!(result, Err(AppError::OtpNotFound)));
    }

    #[tokio::test]
    async fn test_verify_normalizes_email_and_trims_code() {
        let (service, _, delivery) = setup();
        service.issue_at("  A@B.com ", None, t0()).await.unwrap();
        let code = delivery.last_code();

        let result = service
            .verify_at("a@b.COM", &format!(" {code}\n"), t0())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_expired_code_fails_even_when_correct() {
        let (service, _, delivery) = setup();
        service.issue_at(EMAIL, None, t0()).await.unwrap();
        let code = delivery.last_code();

        let later = t0() + Duration::minutes(5) + Duration::seconds(1);
        let result = service.verify_at(EMAIL, &code, later).await;
        assert!(matches!(result, Err(AppError::OtpExpired)));
    }

    #[tokio::test]
    async fn test_expiry_checked_before_attempts() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.set_attempts(issued.id, 5);
        let code = delivery.last_code();

        let later = t0() + Duration::minutes(6);
        let result = service.verify_at(EMAIL, &code, later).await;
        assert!(matches!(result, Err(AppError::OtpExpired)));
    }

    #[tokio::test]
    async fn test_last_attempt_then_locked_out() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.set_attempts(issued.id, 4);
        let code = delivery.last_code();

        let result = service.verify_at(EMAIL, wrong_code(&code), t0()).await;
        assert!(matches!(
            result,
            Err(AppError::OtpMismatch {
                attempts_remaining: 0
            })
        ));
        assert_eq!(store.row(issued.id).attempts, 5);

        let result = service.verify_at(EMAIL, &code, t0()).await;
        assert!(matches!(result, Err(AppError::OtpTooManyAttempts)));
        assert!(!store.row(issued.id).used);
    }

    #[tokio::test]
    async fn test_wrong_codes_then_correct_code() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        let code = delivery.last_code();
        let wrong = wrong_code(&code);

        for expected_remaining in [4, 3, 2] {
            match service.verify_at(EMAIL, wrong, t0()).await {
                Err(AppError::OtpMismatch { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, expected_remaining)
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(store.row(issued.id).attempts, 3);

        assert!(service.verify_at(EMAIL, &code, t0()).await.is_ok());
        assert!(store.row(issued.id).used);

        let again = service.verify_at(EMAIL, &code, t0()).await;
        assert!(matches!(again, Err(AppError::OtpNotFound)));
    }

    #[tokio::test]
    async fn test_latest_unused_record_is_checked() {
        let (service, _, delivery) = setup();
        service.issue_at(EMAIL, None, t0()).await.unwrap();
        let first = delivery.last_code();
        service
            .issue_at(EMAIL, None, t0() + Duration::minutes(1))
            .await
            .unwrap();
        let second = delivery.last_code();

        let now = t0() + Duration::minutes(2);
        if first != second {
            let result = service.verify_at(EMAIL, &first, now).await;
            assert!(matches!(result, Err(AppError::OtpMismatch { .. })));
        }
        assert!(service.verify_at(EMAIL, &second, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_mismatches_are_both_counted() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        let wrong = wrong_code(&delivery.last_code());

        // 両方が attempts = 0 を読んだ後に書き込む
        let (a, b) = tokio::join!(
            service.verify_at(EMAIL, wrong, t0()),
            service.verify_at(EMAIL, wrong, t0())
        );
        let mut remaining = [a, b].map(|r| match r {
            Err(AppError::OtpMismatch { attempts_remaining }) => attempts_remaining,
            other => panic!("unexpected result: {other:?}"),
        });
        remaining.sort();
        assert_eq!(remaining, [3, 4]);
        assert_eq!(store.row(issued.id).attempts, 2);
    }

    #[tokio::test]
    async fn test_concurrent_correct_codes_succeed_once() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        let code = delivery.last_code();

        let (a, b) = tokio::join!(
            service.verify_at(EMAIL, &code, t0()),
            service.verify_at(EMAIL, &code, t0())
        );
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(
            matches!(a, Err(AppError::OtpNotFound)) || matches!(b, Err(AppError::OtpNotFound))
        );
        assert!(store.row(issued.id).used);
    }

    #[tokio::test]
    async fn test_parallel_guesses_cannot_exceed_attempt_cap() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.set_attempts(issued.id, 4);
        let code = delivery.last_code();
        let wrong = wrong_code(&code);

        // 全員が attempts = 4 を読んだ後、誤りの加算が正解の消費より先に書き込まれる
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..19 {
            let service = service.clone();
            tasks.spawn(async move { service.verify_at(EMAIL, wrong, t0()).await });
        }
        let correct = code.clone();
        let last = service.clone();
        tasks.spawn(async move { last.verify_at(EMAIL, &correct, t0()).await });

        let mut successes = 0;
        let mut locked_out = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(_) => successes += 1,
                Err(AppError::OtpTooManyAttempts) => locked_out += 1,
                Err(AppError::OtpMismatch { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, 0)
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(successes, 0);
        assert_eq!(locked_out, 1);
        assert!(!store.row(issued.id).used);

        // 上限到達後は正しいコードでも拒否され続ける
        let result = service.verify_at(EMAIL, &code, t0()).await;
        assert!(matches!(result, Err(AppError::OtpTooManyAttempts)));
    }

    #[tokio::test]
    async fn test_mark_used_rejects_expired_row() {
        let (service, store, _) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();

        let late = t0() + Duration::minutes(6);
        let marked = store.mark_used(issued.id, late, 5).await.unwrap();
        assert!(!marked);
        assert!(!store.row(issued.id).used);
        assert!(matches!(
            service.rejection_for(&store.row(issued.id), late),
            AppError::OtpExpired
        ));
    }

    #[tokio::test]
    async fn test_increment_failure_still_reports_mismatch() {
        let (service, store, delivery) = setup();
        service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.fail_increment.store(true, Ordering::SeqCst);
        let wrong = wrong_code(&delivery.last_code());

        let result = service.verify_at(EMAIL, wrong, t0()).await;
        assert!(matches!(
            result,
            Err(AppError::OtpMismatch {
                attempts_remaining: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_mark_used_retries_once() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.mark_used_failures.store(1, Ordering::SeqCst);

        let code = delivery.last_code();
        assert!(service.verify_at(EMAIL, &code, t0()).await.is_ok());
        assert!(store.row(issued.id).used);
    }

    #[tokio::test]
    async fn test_mark_used_read_back_converges() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        // 書き込みは反映されたがエラーが返るケース
        store.mark_used_failures.store(2, Ordering::SeqCst);
        store.apply_before_failing.store(true, Ordering::SeqCst);

        let code = delivery.last_code();
        assert!(service.verify_at(EMAIL, &code, t0()).await.is_ok());
        assert!(store.row(issued.id).used);
    }

    #[tokio::test]
    async fn test_mark_used_persistent_failure() {
        let (service, store, delivery) = setup();
        let issued = service.issue_at(EMAIL, None, t0()).await.unwrap();
        store.mark_used_failures.store(2, Ordering::SeqCst);

        let code = delivery.last_code();
        let result = service.verify_at(EMAIL, &code, t0()).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert!(!store.row(issued.id).used);
    }
}
