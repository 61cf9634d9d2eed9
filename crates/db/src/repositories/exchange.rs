use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use tradeback_core::domain::contact::{Contact, ContactId};
use tradeback_core::domain::conversation::{ConversationTurn, Direction, Intent, TurnId};
use tradeback_core::domain::exchange::{
    Exchange, ExchangeId, ExchangeState, FulfillmentStatus, Term,
};

use super::contact::upsert_contact;
use super::{
    conflict_or_database, parse_enum, parse_optional_timestamp, parse_timestamp, parse_u32,
    ExchangeRepository, RepositoryError,
};
use crate::DbPool;

const EXCHANGE_COLUMNS: &str = "exchange_id,
    contact_id,
    state,
    terms_offered_json,
    terms_requested_json,
    negotiation_round,
    created_at,
    agreed_at,
    completed_at,
    fulfillment_deadline,
    our_fulfillment_status,
    their_fulfillment_status,
    state_version";

const TERMINAL_STATES_SQL: &str = "('completed', 'failed', 'abandoned', 'blocked')";

pub struct SqlExchangeRepository {
    pool: DbPool,
}

impl SqlExchangeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExchangeRepository for SqlExchangeRepository {
    async fn find_by_id(&self, id: &ExchangeId) -> Result<Option<Exchange>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {EXCHANGE_COLUMNS} FROM exchange WHERE exchange_id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(exchange_from_row).transpose()
    }

    async fn find_active_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Option<Exchange>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXCHANGE_COLUMNS}
             FROM exchange
             WHERE contact_id = ? AND state NOT IN {TERMINAL_STATES_SQL}
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(&contact_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(exchange_from_row).transpose()
    }

    async fn list_by_state(&self, state: ExchangeState) -> Result<Vec<Exchange>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXCHANGE_COLUMNS}
             FROM exchange
             WHERE state = ?
             ORDER BY created_at ASC, exchange_id ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(exchange_from_row).collect()
    }

    async fn count_by_state(&self) -> Result<Vec<(ExchangeState, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM exchange GROUP BY state ORDER BY state ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw = row.try_get::<String, _>("state")?;
                let state = parse_enum("exchange state", &raw, ExchangeState::parse)?;
                let count = row.try_get::<i64, _>("count")?;
                Ok((state, u64::try_from(count).unwrap_or_default()))
            })
            .collect()
    }

    async fn save(&self, exchange: Exchange) -> Result<(), RepositoryError> {
        upsert_exchange(&self.pool, &exchange).await
    }

    async fn append_turn(&self, turn: ConversationTurn) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_turn (
                turn_id,
                exchange_id,
                direction,
                raw_text,
                classified_intent,
                timestamp
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.turn_id.0)
        .bind(&turn.exchange_id.0)
        .bind(turn.direction.as_str())
        .bind(&turn.raw_text)
        .bind(turn.classified_intent.map(|intent| intent.as_str()))
        .bind(turn.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|error| conflict_or_database(error, "duplicate conversation turn"))?;

        Ok(())
    }

    async fn list_turns(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT turn_id, exchange_id, direction, raw_text, classified_intent, timestamp
             FROM conversation_turn
             WHERE exchange_id = ?
             ORDER BY seq ASC",
        )
        .bind(&exchange_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(turn_from_row).collect()
    }

    async fn commit_terminal(
        &self,
        exchange: Exchange,
        contact: Contact,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        upsert_contact(&mut *tx, &contact).await?;
        upsert_exchange(&mut *tx, &exchange).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_exchange<'e, E>(executor: E, exchange: &Exchange) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let offered = encode_terms(&exchange.terms_offered)?;
    let requested = encode_terms(&exchange.terms_requested)?;

    let result = sqlx::query(
        "INSERT INTO exchange (
            exchange_id,
            contact_id,
            state,
            terms_offered_json,
            terms_requested_json,
            negotiation_round,
            created_at,
            agreed_at,
            completed_at,
            fulfillment_deadline,
            our_fulfillment_status,
            their_fulfillment_status,
            state_version
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(exchange_id) DO UPDATE SET
            state = excluded.state,
            terms_offered_json = excluded.terms_offered_json,
            terms_requested_json = excluded.terms_requested_json,
            negotiation_round = excluded.negotiation_round,
            agreed_at = excluded.agreed_at,
            completed_at = excluded.completed_at,
            fulfillment_deadline = excluded.fulfillment_deadline,
            our_fulfillment_status = excluded.our_fulfillment_status,
            their_fulfillment_status = excluded.their_fulfillment_status,
            state_version = excluded.state_version
         WHERE exchange.state_version <= excluded.state_version",
    )
    .bind(&exchange.exchange_id.0)
    .bind(&exchange.contact_id.0)
    .bind(exchange.state.as_str())
    .bind(offered)
    .bind(requested)
    .bind(i64::from(exchange.negotiation_round))
    .bind(exchange.created_at.to_rfc3339())
    .bind(exchange.agreed_at.map(|value| value.to_rfc3339()))
    .bind(exchange.completed_at.map(|value| value.to_rfc3339()))
    .bind(exchange.fulfillment_deadline.map(|value| value.to_rfc3339()))
    .bind(exchange.our_fulfillment_status.as_str())
    .bind(exchange.their_fulfillment_status.as_str())
    .bind(i64::from(exchange.state_version))
    .execute(executor)
    .await
    .map_err(|error| {
        conflict_or_database(
            error,
            &format!("contact `{}` already has an active exchange", exchange.contact_id),
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "exchange `{}` was written with a newer state_version than {}",
            exchange.exchange_id, exchange.state_version
        )));
    }

    Ok(())
}

fn encode_terms(terms: &[Term]) -> Result<String, RepositoryError> {
    serde_json::to_string(terms)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode terms: {error}")))
}

fn decode_terms(column: &str, raw: String) -> Result<Vec<Term>, RepositoryError> {
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid terms in `{column}`: {error}")))
}

fn exchange_from_row(row: SqliteRow) -> Result<Exchange, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let ours_raw = row.try_get::<String, _>("our_fulfillment_status")?;
    let theirs_raw = row.try_get::<String, _>("their_fulfillment_status")?;

    Ok(Exchange {
        exchange_id: ExchangeId(row.try_get("exchange_id")?),
        contact_id: ContactId(row.try_get("contact_id")?),
        state: parse_enum("exchange state", &state_raw, ExchangeState::parse)?,
        terms_offered: decode_terms("terms_offered_json", row.try_get("terms_offered_json")?)?,
        terms_requested: decode_terms(
            "terms_requested_json",
            row.try_get("terms_requested_json")?,
        )?,
        negotiation_round: parse_u32("negotiation_round", row.try_get("negotiation_round")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        agreed_at: parse_optional_timestamp("agreed_at", row.try_get("agreed_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        fulfillment_deadline: parse_optional_timestamp(
            "fulfillment_deadline",
            row.try_get("fulfillment_deadline")?,
        )?,
        our_fulfillment_status: parse_enum(
            "fulfillment status",
            &ours_raw,
            FulfillmentStatus::parse,
        )?,
        their_fulfillment_status: parse_enum(
            "fulfillment status",
            &theirs_raw,
            FulfillmentStatus::parse,
        )?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
    })
}

fn turn_from_row(row: SqliteRow) -> Result<ConversationTurn, RepositoryError> {
    let direction_raw = row.try_get::<String, _>("direction")?;
    let classified_intent = row
        .try_get::<Option<String>, _>("classified_intent")?
        .map(|value| parse_enum("intent", &value, Intent::parse))
        .transpose()?;

    Ok(ConversationTurn {
        turn_id: TurnId(row.try_get("turn_id")?),
        exchange_id: ExchangeId(row.try_get("exchange_id")?),
        direction: parse_enum("direction", &direction_raw, Direction::parse)?,
        raw_text: row.try_get("raw_text")?,
        classified_intent,
        timestamp: parse_timestamp("timestamp", row.try_get("timestamp")?)?,
    })
}
