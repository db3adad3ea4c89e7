//! In-memory store with copy-on-commit transactions.
//!
//! The whole state sits behind one mutex that `run_atomic` holds for the
//! duration of the body, so transactions are serializable by construction.
//! The body works on a staged clone; a commit swaps it in, any error drops
//! it, which makes rollback trivial and total.

use std::collections::HashMap;
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::plans::Plan;
use crate::shared::models::{
    Bot, Conversation, Message, Subscription, UserStats, SUBSCRIPTION_STATUS_ACTIVE,
};
use crate::store::{BotMetric, BotPatch, CascadeCounts, ConversationFilter, Store, StoreTx};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
struct MemState {
    bots: HashMap<Uuid, Bot>,
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    subscriptions: Vec<Subscription>,
    stats: HashMap<Uuid, UserStats>,
}

pub struct MemoryStore {
    state: Mutex<MemState>,
    lock_wait: Duration,
}

pub struct MemoryTx {
    staged: MemState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            lock_wait,
        }
    }

    /// Seeds a subscription row, replacing any previous one for the user.
    pub fn set_subscription(&self, user_id: Uuid, plan: &str, status: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.subscriptions.retain(|s| s.user_id != user_id);
        state.subscriptions.push(Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan: plan.to_string(),
            status: status.to_string(),
            created_at: Utc::now(),
        });
    }

    fn acquire(&self) -> Result<std::sync::MutexGuard<'_, MemState>, LifecycleError> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match self.state.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(LifecycleError::store("memory store lock poisoned"))
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(LifecycleError::Busy);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Tx<'a>
        = MemoryTx
    where
        Self: 'a;

    fn run_atomic<T, F>(&self, _user_id: Uuid, body: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(&mut Self::Tx<'_>) -> Result<T, LifecycleError>,
    {
        let mut guard = self.acquire()?;
        let mut tx = MemoryTx {
            staged: guard.clone(),
        };
        let out = body(&mut tx)?;
        *guard = tx.staged;
        Ok(out)
    }

    fn list_bots(&self, user_id: Uuid) -> Result<Vec<Bot>, LifecycleError> {
        let state = self.acquire()?;
        let mut bots: Vec<Bot> = state
            .bots
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    fn get_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError> {
        let state = self.acquire()?;
        Ok(state
            .bots
            .get(&bot_id)
            .filter(|b| b.user_id == user_id)
            .cloned())
    }

    fn list_conversations(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, LifecycleError> {
        let state = self.acquire()?;
        let mut out: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.bot_id == bot_id && c.user_id == user_id)
            .filter(|c| filter.status.as_deref().map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    fn stats(&self, user_id: Uuid) -> Result<UserStats, LifecycleError> {
        let state = self.acquire()?;
        Ok(state
            .stats
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| UserStats::zeroed(user_id)))
    }
}

impl StoreTx for MemoryTx {
    fn active_plan(&mut self, user_id: Uuid) -> Result<Option<Plan>, LifecycleError> {
        let plan = self
            .staged
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SUBSCRIPTION_STATUS_ACTIVE)
            .max_by_key(|s| s.created_at)
            .map(|s| Plan::parse(&s.plan));
        Ok(plan)
    }

    fn count_bots(&mut self, user_id: Uuid) -> Result<u64, LifecycleError> {
        Ok(self
            .staged
            .bots
            .values()
            .filter(|b| b.user_id == user_id)
            .count() as u64)
    }

    fn insert_bot(&mut self, bot: &Bot) -> Result<(), LifecycleError> {
        self.staged.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    fn find_bot(&mut self, user_id: Uuid, bot_id: Uuid) -> Result<Option<Bot>, LifecycleError> {
        Ok(self
            .staged
            .bots
            .get(&bot_id)
            .filter(|b| b.user_id == user_id)
            .cloned())
    }

    fn apply_bot_patch(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        patch: &BotPatch,
        last_activity_at: DateTime<Utc>,
    ) -> Result<Option<Bot>, LifecycleError> {
        let Some(bot) = self
            .staged
            .bots
            .get_mut(&bot_id)
            .filter(|b| b.user_id == user_id)
        else {
            return Ok(None);
        };

        if let Some(name) = &patch.name {
            bot.name = name.clone();
        }
        if let Some(description) = &patch.description {
            bot.description = description.clone();
        }
        if let Some(category) = &patch.category {
            bot.category = category.clone();
        }
        if let Some(personality) = &patch.personality {
            bot.personality = personality.clone();
        }
        if let Some(language) = &patch.language {
            bot.language = language.clone();
        }
        if let Some(branding) = &patch.branding {
            bot.branding = branding.clone();
        }
        if let Some(features) = &patch.features {
            bot.features = features.clone();
        }
        if let Some(status) = &patch.status {
            bot.status = status.clone();
        }
        bot.last_activity_at = last_activity_at;

        Ok(Some(bot.clone()))
    }

    fn delete_bot_cascade(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
    ) -> Result<Option<CascadeCounts>, LifecycleError> {
        if !self
            .staged
            .bots
            .get(&bot_id)
            .map_or(false, |b| b.user_id == user_id)
        {
            return Ok(None);
        }

        let conversation_ids: Vec<Uuid> = self
            .staged
            .conversations
            .values()
            .filter(|c| c.bot_id == bot_id)
            .map(|c| c.id)
            .collect();

        let before = self.staged.messages.len();
        self.staged
            .messages
            .retain(|_, m| !conversation_ids.contains(&m.conversation_id));
        let messages_removed = (before - self.staged.messages.len()) as i64;

        for conversation_id in &conversation_ids {
            self.staged.conversations.remove(conversation_id);
        }
        self.staged.bots.remove(&bot_id);

        Ok(Some(CascadeCounts {
            conversations: conversation_ids.len() as i64,
            messages: messages_removed,
        }))
    }

    fn bump_stats(
        &mut self,
        user_id: Uuid,
        bots: i64,
        conversations: i64,
        messages: i64,
    ) -> Result<(), LifecycleError> {
        let stats = self
            .staged
            .stats
            .entry(user_id)
            .or_insert_with(|| UserStats::zeroed(user_id));
        stats.total_bots = (stats.total_bots + bots).max(0);
        stats.total_conversations = (stats.total_conversations + conversations).max(0);
        stats.total_messages = (stats.total_messages + messages).max(0);
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
        let Some(bot) = self
            .staged
            .bots
            .get_mut(&bot_id)
            .filter(|b| b.user_id == user_id)
        else {
            return Ok(None);
        };

        match metric {
            BotMetric::Conversations => {
                bot.conversation_count = (bot.conversation_count + delta).max(0)
            }
            BotMetric::Messages => bot.message_count = (bot.message_count + delta).max(0),
            BotMetric::Users => bot.user_count = (bot.user_count + delta).max(0),
        }
        bot.last_activity_at = last_activity_at;

        Ok(Some(bot.clone()))
    }

    fn insert_conversation(&mut self, conversation: &Conversation) -> Result<(), LifecycleError> {
        self.staged
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    fn find_conversation(
        &mut self,
        user_id: Uuid,
        bot_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, LifecycleError> {
        Ok(self
            .staged
            .conversations
            .get(&conversation_id)
            .filter(|c| c.bot_id == bot_id && c.user_id == user_id)
            .cloned())
    }

    fn insert_message(&mut self, message: &Message) -> Result<(), LifecycleError> {
        self.staged.messages.insert(message.id, message.clone());
        Ok(())
    }
}
