//! Postgres store.
//!
//! `run_atomic` opens a database transaction and takes a per-user advisory
//! lock inside it, so concurrent mutations for one user serialize while
//! different users proceed in parallel. The lock is transaction-scoped;
//! Postgres releases it on commit or rollback.

use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool};
use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::plans::Plan;
use crate::shared::models::schema::{bots, conversations, messages, subscriptions, user_stats};
use crate::shared::models::{Bot, Conversation, Message, UserStats, SUBSCRIPTION_STATUS_ACTIVE};
use crate::shared::utils::DbPool;
use crate::store::{BotMetric, BotPatch, CascadeCounts, ConversationFilter, Store, StoreTx};

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(40);

pub struct PgStore {
    pool: DbPool,
}

pub struct PgTx<'a> {
    conn: &'a mut PgConnection,
}

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Bool)]
    locked: bool,
}

#[derive(AsChangeset)]
#[diesel(table_name = bots)]
struct BotChanges {
    name: Option<String>,
    description: Option<Option<String>>,
    category: Option<Option<String>>,
    personality: Option<Option<String>>,
    language: Option<Option<String>>,
    branding: Option<serde_json::Value>,
    features: Option<serde_json::Value>,
    status: Option<String>,
    last_activity_at: DateTime<Utc>,
}

/// Advisory lock key for a user. Collisions across users only cost extra
/// serialization, never correctness.
fn advisory_key(user_id: Uuid) -> i64 {
    let bytes = user_id.as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(head)
}

/// Bounded try-lock loop. Gives up with `Busy` rather than queueing
/// indefinitely behind a slow writer.
fn acquire_user_lock(conn: &mut PgConnection, user_id: Uuid) -> Result<(), LifecycleError> {
    let key = advisory_key(user_id);
    for attempt in 0..LOCK_ATTEMPTS {
        let row: LockRow = diesel::sql_query("SELECT pg_try_advisory_xact_lock($1) AS locked")
            .bind::<BigInt, _>(key)
            .get_result(conn)?;
        if row.locked {
            return Ok(());
        }
        if attempt + 1 < LOCK_ATTEMPTS {
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }
    Err(LifecycleError::Busy)
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>, LifecycleError>
    {
        self.pool.get().map_err(LifecycleError::store)
    }
}

impl Store for PgStore {
    type Tx<'a>
        = PgTx<'a>
    where
        Self: 'a;

    fn run_atomic<T, F>(&self, user_id: Uuid, body: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(&mut Self::Tx<'_>) -> Result<T, LifecycleError>,
    {
        let mut conn = self.conn()?;
        conn.transaction::<T, LifecycleError, _>(|conn| {
            acquire_user_lock(conn, user_id)?;
            let mut tx = PgTx { conn };
            body(&mut tx)
        })
    }

    fn list_bots(&self, user_id: Uuid) -> Result<Vec<Bot>, LifecycleError> {
        let mut conn = self.conn()?;
        let rows = bots::table
            .filter(bots::user_id.eq(user_id))
            .order(bots::created_at.asc())
            .load::<Bot>(&mut conn)
            .map_err(LifecycleError::store)?;
        Ok(rows)
    }

    fn get_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError> {
        let mut conn = self.conn()?;
        let row = bots::table
            .filter(bots::id.eq(bot_id))
            .filter(bots::user_id.eq(user_id))
            .first::<Bot>(&mut conn)
            .optional()
            .map_err(LifecycleError::store)?;
        Ok(row)
    }

    fn list_conversations(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, LifecycleError> {
        let mut conn = self.conn()?;
        let mut query = conversations::table
            .filter(conversations::bot_id.eq(bot_id))
            .filter(conversations::user_id.eq(user_id))
            .into_boxed();
        if let Some(status) = &filter.status {
            query = query.filter(conversations::status.eq(status.clone()));
        }
        let rows = query
            .order(conversations::created_at.asc())
            .load::<Conversation>(&mut conn)
            .map_err(LifecycleError::store)?;
        Ok(rows)
    }

    fn stats(&self, user_id: Uuid) -> Result<UserStats, LifecycleError> {
        let mut conn = self.conn()?;
        let row = user_stats::table
            .find(user_id)
            .first::<UserStats>(&mut conn)
            .optional()
            .map_err(LifecycleError::store)?;
        Ok(row.unwrap_or_else(|| UserStats::zeroed(user_id)))
    }
}

impl StoreTx for PgTx<'_> {
    fn active_plan(&mut self, user_id: Uuid) -> Result<Option<Plan>, LifecycleError> {
        let plan = subscriptions::table
            .filter(subscriptions::user_id.eq(user_id))
            .filter(subscriptions::status.eq(SUBSCRIPTION_STATUS_ACTIVE))
            .order(subscriptions::created_at.desc())
            .select(subscriptions::plan)
            .first::<String>(self.conn)
            .optional()?;
        Ok(plan.map(|p| Plan::parse(&p)))
    }

    fn count_bots(&mut self, user_id: Uuid) -> Result<u64, LifecycleError> {
        let count: i64 = bots::table
            .filter(bots::user_id.eq(user_id))
            .count()
            .get_result(self.conn)?;
        Ok(count.max(0) as u64)
    }

    fn insert_bot(&mut self, bot: &Bot) -> Result<(), LifecycleError> {
        diesel::insert_into(bots::table)
            .values(bot)
            .execute(self.conn)?;
        Ok(())
    }

    fn find_bot(&mut self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError> {
        let row = bots::table
            .filter(bots::id.eq(bot_id))
            .filter(bots::user_id.eq(user_id))
            .first::<Bot>(self.conn)
            .optional()?;
        Ok(row)
    }

    fn apply_bot_patch(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        patch: &BotPatch,
        last_activity_at: DateTime<Utc>,
    ) -> Result<Option<Bot>, LifecycleError> {
        let changes = BotChanges {
            name: patch.name.clone(),
            description: patch.description.clone(),
            category: patch.category.clone(),
            personality: patch.personality.clone(),
            language: patch.language.clone(),
            branding: patch.branding.clone(),
            features: patch.features.clone(),
            status: patch.status.clone(),
            last_activity_at,
        };
        let row = diesel::update(
            bots::table
                .filter(bots::id.eq(bot_id))
                .filter(bots::user_id.eq(user_id)),
        )
        .set(&changes)
        .get_result::<Bot>(self.conn)
        .optional()?;
        Ok(row)
    }

    fn delete_bot_cascade(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
    ) -> Result<Option<CascadeCounts>, LifecycleError> {
        let owned: Option<Uuid> = bots::table
            .filter(bots::id.eq(bot_id))
            .filter(bots::user_id.eq(user_id))
            .select(bots::id)
            .first(self.conn)
            .optional()?;
        if owned.is_none() {
            return Ok(None);
        }

        let conversation_ids = conversations::table
            .filter(conversations::bot_id.eq(bot_id))
            .select(conversations::id);
        let messages_removed = diesel::delete(
            messages::table.filter(messages::conversation_id.eq_any(conversation_ids)),
        )
        .execute(self.conn)?;
        let conversations_removed =
            diesel::delete(conversations::table.filter(conversations::bot_id.eq(bot_id)))
                .execute(self.conn)?;
        diesel::delete(bots::table.filter(bots::id.eq(bot_id))).execute(self.conn)?;

        Ok(Some(CascadeCounts {
            conversations: conversations_removed as i64,
            messages: messages_removed as i64,
        }))
    }

    fn bump_stats(
        &mut self,
        user_id: Uuid,
        bots_delta: i64,
        conversations_delta: i64,
        messages_delta: i64,
    ) -> Result<(), LifecycleError> {
        diesel::sql_query(
            "INSERT INTO user_stats (user_id, total_bots, total_conversations, total_messages) \
             VALUES ($1, GREATEST($2, 0), GREATEST($3, 0), GREATEST($4, 0)) \
             ON CONFLICT (user_id) DO UPDATE SET \
               total_bots = GREATEST(user_stats.total_bots + $2, 0), \
               total_conversations = GREATEST(user_stats.total_conversations + $3, 0), \
               total_messages = GREATEST(user_stats.total_messages + $4, 0)",
        )
        .bind::<diesel::sql_types::Uuid, _>(user_id)
        .bind::<BigInt, _>(bots_delta)
        .bind::<BigInt, _>(conversations_delta)
        .bind::<BigInt, _>(messages_delta)
        .execute(self.conn)?;
        Ok(())
    }

    fn bump_bot_metric(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        metric: BotMetric,
        delta: i64,
        last_activity_at: DateTime<Utc>,
    ) -> Result<Option<Bot>, LifecycleError> {
        let scope = bots::table
            .filter(bots::id.eq(bot_id))
            .filter(bots::user_id.eq(user_id));
        let row = match metric {
            BotMetric::Conversations => diesel::update(scope)
                .set((
                    bots::conversation_count.eq(diesel::dsl::sql::<BigInt>(
                        "GREATEST(conversation_count + ",
                    )
                    .bind::<BigInt, _>(delta)
                    .sql(", 0)")),
                    bots::last_activity_at.eq(last_activity_at),
                ))
                .get_result::<Bot>(self.conn)
                .optional()?,
            BotMetric::Messages => diesel::update(scope)
                .set((
                    bots::message_count
                        .eq(diesel::dsl::sql::<BigInt>("GREATEST(message_count + ")
                            .bind::<BigInt, _>(delta)
                            .sql(", 0)")),
                    bots::last_activity_at.eq(last_activity_at),
                ))
                .get_result::<Bot>(self.conn)
                .optional()?,
            BotMetric::Users => diesel::update(scope)
                .set((
                    bots::user_count.eq(diesel::dsl::sql::<BigInt>("GREATEST(user_count + ")
                        .bind::<BigInt, _>(delta)
                        .sql(", 0)")),
                    bots::last_activity_at.eq(last_activity_at),
                ))
                .get_result::<Bot>(self.conn)
                .optional()?,
        };
        Ok(row)
    }

    fn insert_conversation(&mut self, conversation: &Conversation) -> Result<(), LifecycleError> {
        diesel::insert_into(conversations::table)
            .values(conversation)
            .execute(self.conn)?;
        Ok(())
    }

    fn find_conversation(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, LifecycleError> {
        let row = conversations::table
            .filter(conversations::id.eq(conversation_id))
            .filter(conversations::bot_id.eq(bot_id))
            .filter(conversations::user_id.eq(user_id))
            .first::<Conversation>(self.conn)
            .optional()?;
        Ok(row)
    }

    fn insert_message(&mut self, message: &Message) -> Result<(), LifecycleError> {
        diesel::insert_into(messages::table)
            .values(message)
            .execute(self.conn)?;
        Ok(())
    }
}
