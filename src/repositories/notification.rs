use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::NewNotification;

#[derive(Clone)]
pub struct NotificationRepository {
    pool: PgPool,
}

impl NotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 通知をまとめて挿入（1ステートメント）
    ///
    /// # Returns
    /// 挿入された行数
    pub async fn insert_many(&self, notifications: &[NewNotification]) -> Result<u64, sqlx::Error> {
        if notifications.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO notifications (user_id, title, message, type, related_id, is_read) ",
        );
        builder.push_values(notifications, |mut row, n| {
            row.push_bind(n.user_id)
                .push_bind(&n.title)
                .push_bind(&n.message)
                .push_bind(n.kind)
                .push_bind(n.related_id)
                .push_bind(false);
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
