//! Resource store contract.
//!
//! `Store` is the seam between the lifecycle core and persistence. The
//! Postgres implementation (`pg`) is the production path; the in-memory
//! implementation (`memory`) backs tests and single-node development with
//! the same commit-or-rollback semantics.

pub mod memory;
pub mod pg;

use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::plans::Plan;
use crate::shared::models::{Bot, Conversation, UserStats};

/// Counter columns on a bot row that may be bumped atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotMetric {
    Conversations,
    Messages,
    Users,
}

impl BotMetric {
    /// Wire names as the API accepts them. Returns `None` for anything
    /// outside the enumerated set.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "conversation_count" => Some(Self::Conversations),
            "message_count" => Some(Self::Messages),
            "user_count" => Some(Self::Users),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversations => "conversation_count",
            Self::Messages => "message_count",
            Self::Users => "user_count",
        }
    }
}

/// Partial update for a bot row. `None` means the field was omitted from
/// the request; the inner `Option` on nullable columns distinguishes
/// "set to null" from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct BotPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub personality: Option<Option<String>>,
    pub language: Option<Option<String>>,
    pub branding: Option<serde_json::Value>,
    pub features: Option<serde_json::Value>,
    pub status: Option<String>,
}

impl BotPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.personality.is_none()
            && self.language.is_none()
            && self.branding.is_none()
            && self.features.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<String>,
}

/// Rows removed by a cascade delete, used to settle the aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeCounts {
    pub conversations: i64,
    pub messages: i64,
}

/// Row operations available inside a transaction. Every method scoped by
/// `user_id` filters on ownership; a missing row and a foreign row are
/// indistinguishable to callers.
pub trait StoreTx {
    /// Plan of the user's active subscription, if any.
    fn active_plan(&mut self, user_id: Uuid) -> Result<Option<Plan>, LifecycleError>;

    /// Number of bot rows the user currently owns.
    fn count_bots(&mut self, user_id: Uuid) -> Result<u64, LifecycleError>;

    fn insert_bot(&mut self, bot: &Bot) -> Result<(), LifecycleError>;

    fn find_bot(&mut self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError>;

    /// Applies the patch in one statement; returns the updated row or
    /// `None` when no owned row matched.
    fn apply_bot_patch(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        patch: &BotPatch,
        last_activity_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Bot>, LifecycleError>;

    /// Deletes the bot's messages, conversations, and the bot row itself.
    /// Returns the removed dependent counts, or `None` when no owned row
    /// matched.
    fn delete_bot_cascade(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
    ) -> Result<Option<CascadeCounts>, LifecycleError>;

    /// Adds the deltas to the user's aggregate counters, creating the row
    /// when absent. Results are floored at zero.
    fn bump_stats(
        &mut self,
        user_id: Uuid,
        bots: i64,
        conversations: i64,
        messages: i64,
    ) -> Result<(), LifecycleError>;

    /// Single-statement `SET x = x + delta` on the named counter; also
    /// stamps last activity. Returns the updated row or `None` when no
    /// owned row matched.
    fn bump_bot_metric(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        metric: BotMetric,
        delta: i64,
        last_activity_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Bot>, LifecycleError>;

    fn insert_conversation(&mut self, conversation: &Conversation) -> Result<(), LifecycleError>;

    fn find_conversation(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, LifecycleError>;

    fn insert_message(&mut self, message: &crate::shared::models::Message) -> Result<(), LifecycleError>;
}

/// Transaction coordinator plus ownership-scoped reads.
///
/// `run_atomic` serializes concurrent bodies for the same user, so a
/// read-then-decide-then-write sequence (the quota check) cannot interleave
/// with another writer for that user. Lock acquisition is bounded; timing
/// out yields `LifecycleError::Busy` and the caller may retry.
pub trait Store: Send + Sync + 'static {
    type Tx<'a>: StoreTx
    where
        Self: 'a;

    fn run_atomic<T, F>(&self, user_id: Uuid, body: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(&mut Self::Tx<'_>) -> Result<T, LifecycleError>;

    fn list_bots(&self, user_id: Uuid) -> Result<Vec<Bot>, LifecycleError>;

    fn get_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError>;

    fn list_conversations(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, LifecycleError>;

    /// Aggregate counters for the user; a zeroed row when none exists yet.
    fn stats(&self, user_id: Uuid) -> Result<UserStats, LifecycleError>;
}
