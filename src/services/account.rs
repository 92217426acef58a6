use uuid::Uuid;

use crate::deadline::Deadline;
use crate::error::AppError;
use crate::models::{Profile, Role};
use crate::repositories::{ProfileFields, ProfileRepository};
use crate::services::auth_admin::{AuthAdminClient, AuthSession, AuthUser, NewAuthUser};

/// サインアップ完了の入力（検証済み）
#[derive(Debug, Clone)]
pub struct CompleteSignup {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub profile: ProfileFields,
}

/// サインアップ完了の結果
#[derive(Debug, Clone)]
pub struct SignupCompleted {
    pub user: AuthUser,
    pub profile: Profile,
    pub session: Option<AuthSession>,
    pub warning: Option<&'static str>,
}

/// 確認対象のユーザー指定
#[derive(Debug, Clone)]
pub enum UserLookup {
    Id(Uuid),
    Email(String),
}

/// アカウントサービス（Auth ユーザー作成・確認とプロフィール管理）
#[derive(Clone)]
pub struct AccountService {
    auth: Option<AuthAdminClient>,
    profiles: ProfileRepository,
    deadline: Deadline,
}

impl AccountService {
    /// 新しい AccountService を作成
    pub fn new(auth: Option<AuthAdminClient>, profiles: ProfileRepository, deadline: Deadline) -> Self {
        Self {
            auth,
            profiles,
            deadline,
        }
    }

    fn auth(&self) -> Result<&AuthAdminClient, AppError> {
        self.auth
            .as_ref()
            .ok_or(AppError::Configuration("SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY"))
    }

    /// Auth ユーザーとプロフィールを作成し、可能ならログインまで行う
    ///
    /// # Security
    /// - password はログに出力しない
    pub async fn complete_signup(&self, input: &CompleteSignup) -> Result<SignupCompleted, AppError> {
        let auth = self.auth()?;

        tracing::info!(email = %input.email, role = input.role.as_str(), "サインアップ開始");

        let user = self
            .deadline
            .run(
                "auth.create_user",
                auth.create_user(NewAuthUser {
                    email: &input.email,
                    password: &input.password,
                    first_name: input.profile.first_name.as_deref(),
                    last_name: input.profile.last_name.as_deref(),
                    role: input.role,
                }),
            )
            .await?;

        let fields = ProfileFields {
            email: Some(input.email.clone()),
            role: Some(input.role.as_str().to_string()),
            ..input.profile.clone()
        };

        let profile = match self
            .deadline
            .run("profiles.create", self.profiles.create(user.id, &fields))
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(error = %e, user_id = %user.id, "プロフィール作成に失敗");
                // 中途半端な Auth ユーザーを残さない（ベストエフォート）
                if let Err(cleanup) = self
                    .deadline
                    .run("auth.delete_user", auth.delete_user(user.id))
                    .await
                {
                    tracing::error!(error = %cleanup, user_id = %user.id, "Auth ユーザーの後始末に失敗");
                }
                return Err(AppError::Persistence(format!("プロフィール作成に失敗: {e}")));
            }
        };

        let (session, warning) = match self
            .deadline
            .run(
                "auth.sign_in",
                auth.sign_in_with_password(&input.email, &input.password),
            )
            .await
        {
            Ok(session) => (Some(session), None),
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user.id, "作成直後のログインに失敗");
                (None, Some("User created but auto sign-in failed"))
            }
        };

        tracing::info!(user_id = %user.id, "サインアップ完了");

        Ok(SignupCompleted {
            user,
            profile,
            session,
            warning,
        })
    }

    /// Auth ユーザーのメールを確認済みにし、プロフィールを upsert
    pub async fn confirm_user(
        &self,
        lookup: &UserLookup,
        fields: &ProfileFields,
    ) -> Result<(Uuid, Profile), AppError> {
        let auth = self.auth()?;

        let user_id = match lookup {
            UserLookup::Id(id) => *id,
            UserLookup::Email(email) => self
                .deadline
                .run(
                    "profiles.find_auth_user",
                    self.profiles.find_auth_user_id_by_email(email),
                )
                .await?
                .ok_or_else(|| {
                    tracing::info!(email = %email, "確認対象ユーザーが見つからない");
                    AppError::NotFound("User")
                })?,
        };

        self.deadline
            .run("auth.confirm_email", auth.confirm_email(user_id))
            .await?;

        let profile = self
            .deadline
            .run("profiles.upsert", self.profiles.upsert(user_id, fields))
            .await?;

        tracing::info!(user_id = %user_id, "ユーザー確認・プロフィール更新完了");

        Ok((user_id, profile))
    }
}
