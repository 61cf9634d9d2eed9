use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use tradeback_core::domain::contact::{Contact, ContactId};

use super::{parse_optional_timestamp, parse_timestamp, parse_u32, ContactRepository, RepositoryError};
use crate::DbPool;

const CONTACT_COLUMNS: &str = "contact_id,
    display_name,
    first_seen,
    last_seen,
    reliability_score,
    completed_exchanges,
    failed_exchanges,
    blocked,
    cooldown_until";

pub struct SqlContactRepository {
    pool: DbPool,
}

impl SqlContactRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ContactRepository for SqlContactRepository {
    async fn find_by_id(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CONTACT_COLUMNS} FROM contact WHERE contact_id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(contact_from_row).transpose()
    }

    async fn save(&self, contact: Contact) -> Result<(), RepositoryError> {
        upsert_contact(&self.pool, &contact).await
    }

    async fn list(&self) -> Result<Vec<Contact>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contact ORDER BY last_seen DESC, contact_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(contact_from_row).collect()
    }
}

pub(crate) async fn upsert_contact<'e, E>(executor: E, contact: &Contact) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO contact (
            contact_id,
            display_name,
            first_seen,
            last_seen,
            reliability_score,
            completed_exchanges,
            failed_exchanges,
            blocked,
            cooldown_until
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(contact_id) DO UPDATE SET
            display_name = excluded.display_name,
            last_seen = excluded.last_seen,
            reliability_score = excluded.reliability_score,
            completed_exchanges = excluded.completed_exchanges,
            failed_exchanges = excluded.failed_exchanges,
            blocked = excluded.blocked,
            cooldown_until = excluded.cooldown_until",
    )
    .bind(&contact.contact_id.0)
    .bind(&contact.display_name)
    .bind(contact.first_seen.to_rfc3339())
    .bind(contact.last_seen.to_rfc3339())
    .bind(contact.reliability_score)
    .bind(i64::from(contact.completed_exchanges))
    .bind(i64::from(contact.failed_exchanges))
    .bind(contact.blocked)
    .bind(contact.cooldown_until.map(|value| value.to_rfc3339()))
    .execute(executor)
    .await?;

    Ok(())
}

fn contact_from_row(row: SqliteRow) -> Result<Contact, RepositoryError> {
    Ok(Contact {
        contact_id: ContactId(row.try_get("contact_id")?),
        display_name: row.try_get("display_name")?,
        first_seen: parse_timestamp("first_seen", row.try_get("first_seen")?)?,
        last_seen: parse_timestamp("last_seen", row.try_get("last_seen")?)?,
        reliability_score: row.try_get("reliability_score")?,
        completed_exchanges: parse_u32(
            "completed_exchanges",
            row.try_get("completed_exchanges")?,
        )?,
        failed_exchanges: parse_u32("failed_exchanges", row.try_get("failed_exchanges")?)?,
        blocked: row.try_get("blocked")?,
        cooldown_until: parse_optional_timestamp("cooldown_until", row.try_get("cooldown_until")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tradeback_core::domain::contact::{Contact, ContactId};

    use super::SqlContactRepository;
    use crate::migrations;
    use crate::repositories::ContactRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_contact_repo_round_trip_and_update() {
        let pool = setup_pool().await;
        let repo = SqlContactRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T09:00:00Z");
        let contact = Contact::new(ContactId("c-sql-1".to_string()), "Ada", 0.5, now);

        repo.save(contact.clone()).await.expect("save contact");
        assert_eq!(repo.find_by_id(&contact.contact_id).await.expect("find"), Some(contact.clone()));

        let mut updated = contact.clone();
        updated.reliability_score = 0.6;
        updated.failed_exchanges = 1;
        updated.blocked = true;
        updated.cooldown_until = Some(now + Duration::hours(24));
        updated.touch(now + Duration::minutes(3));
        repo.save(updated.clone()).await.expect("update contact");

        assert_eq!(repo.find_by_id(&contact.contact_id).await.expect("find"), Some(updated));
        assert_eq!(repo.list().await.expect("list").len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn missing_contact_is_none() {
        let pool = setup_pool().await;
        let repo = SqlContactRepository::new(pool.clone());

        let found = repo.find_by_id(&ContactId("nobody".to_string())).await.expect("find");
        assert_eq!(found, None);
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
