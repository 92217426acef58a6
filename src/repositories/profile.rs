use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Profile, ProfileContact};

/// profiles の書き込み内容（None の列は upsert 時に既存値を保持）
#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub dob: Option<time::Date>,
    pub phone: Option<String>,
}

#[derive(Clone)]
pub struct ProfileRepository {
    pool: PgPool,
}

impl ProfileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 新しいプロフィールを作成（id は auth ユーザーID）
    pub async fn create(&self, id: Uuid, fields: &ProfileFields) -> Result<Profile, sqlx::Error> {
        sqlx::query_as::<_, Profile>(
            r#"
            INSERT INTO profiles (id, email, first_name, last_name, role, dob, phone)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, email, first_name, last_name, role, dob, phone
            "#,
        )
        .bind(id)
        .bind(&fields.email)
        .bind(&fields.first_name)
        .bind(&fields.last_name)
        .bind(&fields.role)
        .bind(fields.dob)
        .bind(&fields.phone)
        .fetch_one(&self.pool)
        .await
    }

    /// プロフィールを upsert（NULL の入力は既存値を上書きしない）
    pub async fn upsert(&self, id: Uuid, fields: &ProfileFields) -> Result<Profile, sqlx::Error> {
        sqlx::query_as::<_, Profile>(
            r#"
            INSERT INTO profiles (id, email, first_name, last_name, role, dob, phone)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, profiles.email),
                first_name = COALESCE(EXCLUDED.first_name, profiles.first_name),
                last_name = COALESCE(EXCLUDED.last_name, profiles.last_name),
                role = COALESCE(EXCLUDED.role, profiles.role),
                dob = COALESCE(EXCLUDED.dob, profiles.dob),
                phone = COALESCE(EXCLUDED.phone, profiles.phone)
            RETURNING id, email, first_name, last_name, role, dob, phone
            "#,
        )
        .bind(id)
        .bind(&fields.email)
        .bind(&fields.first_name)
        .bind(&fields.last_name)
        .bind(&fields.role)
        .bind(fields.dob)
        .bind(&fields.phone)
        .fetch_one(&self.pool)
        .await
    }

    /// 送金先の連絡先を取得
    pub async fn find_contact(&self, id: Uuid) -> Result<Option<ProfileContact>, sqlx::Error> {
        sqlx::query_as::<_, ProfileContact>(
            r#"
            SELECT id, first_name, last_name, phone, email
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// メールアドレスから auth ユーザーIDを解決
    ///
    /// # Note
    /// auth スキーマへの参照権限（service role 接続）が必要
    pub async fn find_auth_user_id_by_email(&self, email: &str) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM auth.users
            WHERE lower(email) = lower($1)
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }
}
