//! Bot lifecycle core.
//!
//! Every mutation runs inside `Store::run_atomic`, so the quota check, the
//! row writes, and the aggregate counter updates commit or roll back as one
//! unit. Ownership is enforced by the store's scoped lookups; a bot owned
//! by someone else reports `NotFound`, never a permission error.

pub mod error;
pub mod kinds;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::kinds::{merge_defaults, BotKind};
use crate::plans::{bot_limit_for, BotLimit, Plan};
use crate::shared::models::{
    Bot, Conversation, Message, UserStats, BOT_STATUS_ACTIVE, BOT_STATUS_INACTIVE,
    CONVERSATION_STATUS_ACTIVE, CONVERSATION_STATUS_ARCHIVED, CONVERSATION_STATUS_CLOSED,
    MESSAGE_SENDERS,
};
use crate::store::{BotMetric, BotPatch, ConversationFilter, Store, StoreTx};

const MAX_NAME_LEN: usize = 255;
const COPY_SUFFIX: &str = " (Copy)";

/// Creation input after HTTP decoding. Omitted JSON fields arrive as `None`
/// and fall back to the kind's defaults.
#[derive(Debug, Clone, Default)]
pub struct NewBot {
    pub name: String,
    pub kind: BotKind,
    pub description: Option<String>,
    pub category: Option<String>,
    pub personality: Option<String>,
    pub language: Option<String>,
    pub branding: Option<Value>,
    pub features: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub end_user_name: Option<String>,
    pub end_user_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub content: String,
    pub attachments: Option<Value>,
}

pub struct LifecycleManager<S: Store> {
    store: S,
}

impl<S: Store> LifecycleManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a bot for the user, enforcing the plan's bot quota. A user
    /// without an active subscription is treated as `free`.
    pub fn create_bot(&self, user_id: Uuid, input: NewBot) -> Result<Bot, LifecycleError> {
        let name = validated_name(&input.name)?;
        let now = Utc::now();
        let bot = Bot {
            id: Uuid::new_v4(),
            user_id,
            kind: input.kind.as_str().to_string(),
            name,
            description: input.description,
            category: Some(
                input
                    .category
                    .unwrap_or_else(|| input.kind.default_category().to_string()),
            ),
            personality: input.personality,
            language: input.language,
            branding: merge_defaults(input.kind.default_branding(), input.branding),
            features: merge_defaults(input.kind.default_features(), input.features),
            status: BOT_STATUS_ACTIVE.to_string(),
            conversation_count: 0,
            message_count: 0,
            user_count: 0,
            created_at: now,
            last_activity_at: now,
        };

        let created = self.store.run_atomic(user_id, |tx| {
            enforce_bot_quota(tx, user_id)?;
            tx.insert_bot(&bot)?;
            tx.bump_stats(user_id, 1, 0, 0)?;
            Ok(bot.clone())
        })?;

        info!("created bot {} for user {}", created.id, user_id);
        Ok(created)
    }

    /// Clones an existing bot into a fresh one. The copy gets its own id,
    /// zeroed activity counters, and a name suffix; the same quota applies
    /// as for a plain create.
    pub fn duplicate_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<Bot, LifecycleError> {
        let now = Utc::now();
        let copy_id = Uuid::new_v4();

        let copy = self.store.run_atomic(user_id, |tx| {
            let source = tx.find_bot(user_id, bot_id)?.ok_or(LifecycleError::NotFound)?;
            enforce_bot_quota(tx, user_id)?;
            let copy = Bot {
                id: copy_id,
                user_id,
                kind: source.kind.clone(),
                name: format!("{}{}", source.name, COPY_SUFFIX),
                description: source.description.clone(),
                category: source.category.clone(),
                personality: source.personality.clone(),
                language: source.language.clone(),
                branding: source.branding.clone(),
                features: source.features.clone(),
                status: BOT_STATUS_ACTIVE.to_string(),
                conversation_count: 0,
                message_count: 0,
                user_count: 0,
                created_at: now,
                last_activity_at: now,
            };
            tx.insert_bot(&copy)?;
            tx.bump_stats(user_id, 1, 0, 0)?;
            Ok(copy)
        })?;

        info!("duplicated bot {} into {} for user {}", bot_id, copy.id, user_id);
        Ok(copy)
    }

    /// Applies a partial update. Rejects an empty patch outright; quota is
    /// not re-checked, so users over a shrunk limit can still manage what
    /// they already own.
    pub fn update_bot(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        mut patch: BotPatch,
    ) -> Result<Bot, LifecycleError> {
        if patch.is_empty() {
            return Err(LifecycleError::validation("no fields to update"));
        }
        if let Some(name) = &patch.name {
            patch.name = Some(validated_name(name)?);
        }
        if let Some(status) = &patch.status {
            if status != BOT_STATUS_ACTIVE && status != BOT_STATUS_INACTIVE {
                return Err(LifecycleError::validation(format!(
                    "invalid status: {status}"
                )));
            }
        }

        let now = Utc::now();
        let updated = self.store.run_atomic(user_id, |tx| {
            tx.apply_bot_patch(user_id, bot_id, &patch, now)?
                .ok_or(LifecycleError::NotFound)
        })?;

        debug!("updated bot {} for user {}", bot_id, user_id);
        Ok(updated)
    }

    /// Deletes the bot and everything under it, settling the user's
    /// aggregate counters by exactly what was removed.
    pub fn delete_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<(), LifecycleError> {
        let removed = self.store.run_atomic(user_id, |tx| {
            let counts = tx
                .delete_bot_cascade(user_id, bot_id)?
                .ok_or(LifecycleError::NotFound)?;
            tx.bump_stats(user_id, -1, -counts.conversations, -counts.messages)?;
            Ok(counts)
        })?;

        info!(
            "deleted bot {} for user {} ({} conversations, {} messages)",
            bot_id, user_id, removed.conversations, removed.messages
        );
        Ok(())
    }

    /// Adds `delta` to one of the bot's activity counters. The counter
    /// floors at zero, and last activity is stamped either way.
    pub fn increment_metric(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        metric_name: &str,
        delta: i64,
    ) -> Result<Bot, LifecycleError> {
        let metric = BotMetric::parse(metric_name).ok_or_else(|| {
            LifecycleError::validation(format!("invalid metric: {metric_name}"))
        })?;

        let now = Utc::now();
        self.store.run_atomic(user_id, |tx| {
            tx.bump_bot_metric(user_id, bot_id, metric, delta, now)?
                .ok_or(LifecycleError::NotFound)
        })
    }

    /// Opens a conversation on the bot and bumps its conversation counter
    /// plus the user's aggregate total, all in one transaction.
    pub fn start_conversation(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        input: NewConversation,
    ) -> Result<Conversation, LifecycleError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            bot_id,
            user_id,
            status: CONVERSATION_STATUS_ACTIVE.to_string(),
            end_user_name: input.end_user_name,
            end_user_email: input.end_user_email,
            rating: None,
            created_at: now,
        };

        self.store.run_atomic(user_id, |tx| {
            tx.find_bot(user_id, bot_id)?.ok_or(LifecycleError::NotFound)?;
            tx.insert_conversation(&conversation)?;
            tx.bump_bot_metric(user_id, bot_id, BotMetric::Conversations, 1, now)?;
            tx.bump_stats(user_id, 0, 1, 0)?;
            Ok(conversation.clone())
        })
    }

    /// Records a message in a conversation and bumps the message counters.
    pub fn append_message(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        conversation_id: Uuid,
        input: NewMessage,
    ) -> Result<Message, LifecycleError> {
        if !MESSAGE_SENDERS.contains(&input.sender.as_str()) {
            return Err(LifecycleError::validation(format!(
                "invalid sender: {}",
                input.sender
            )));
        }
        if input.content.trim().is_empty() {
            return Err(LifecycleError::validation("message content is required"));
        }

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender: input.sender,
            content: input.content,
            attachments: input.attachments,
            created_at: now,
        };

        self.store.run_atomic(user_id, |tx| {
            tx.find_conversation(user_id, bot_id, conversation_id)?
                .ok_or(LifecycleError::NotFound)?;
            tx.insert_message(&message)?;
            tx.bump_bot_metric(user_id, bot_id, BotMetric::Messages, 1, now)?;
            tx.bump_stats(user_id, 0, 0, 1)?;
            Ok(message.clone())
        })
    }

    pub fn list_bots(&self, user_id: Uuid) -> Result<Vec<Bot>, LifecycleError> {
        self.store.list_bots(user_id)
    }

    pub fn get_bot(&self, user_id: Uuid, bot_id: Uuid) -> Result<Bot, LifecycleError> {
        self.store
            .get_bot(user_id, bot_id)?
            .ok_or(LifecycleError::NotFound)
    }

    pub fn list_conversations(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>, LifecycleError> {
        if let Some(status) = &filter.status {
            let known = [
                CONVERSATION_STATUS_ACTIVE,
                CONVERSATION_STATUS_CLOSED,
                CONVERSATION_STATUS_ARCHIVED,
            ];
            if !known.contains(&status.as_str()) {
                return Err(LifecycleError::validation(format!(
                    "invalid conversation status: {status}"
                )));
            }
        }
        self.store
            .get_bot(user_id, bot_id)?
            .ok_or(LifecycleError::NotFound)?;
        self.store.list_conversations(user_id, bot_id, &filter)
    }

    pub fn stats(&self, user_id: Uuid) -> Result<UserStats, LifecycleError> {
        self.store.stats(user_id)
    }
}

fn validated_name(raw: &str) -> Result<String, LifecycleError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(LifecycleError::validation("name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LifecycleError::validation("name too long"));
    }
    Ok(name.to_string())
}

/// The quota check that makes the create paths safe: it runs inside the
/// same per-user transaction as the insert, so two concurrent creates for
/// one user cannot both observe the last free slot.
fn enforce_bot_quota<Tx: StoreTx>(tx: &mut Tx, user_id: Uuid) -> Result<(), LifecycleError> {
    // A failed subscription lookup degrades to the most restrictive plan
    // instead of failing the whole operation.
    let plan: Plan = match tx.active_plan(user_id) {
        Ok(plan) => plan.unwrap_or_default(),
        Err(err) => {
            warn!("subscription lookup failed for user {user_id}, assuming free plan: {err}");
            Plan::Free
        }
    };
    let limit = bot_limit_for(plan);
    let current = tx.count_bots(user_id)?;
    if let BotLimit::Limited(max) = limit {
        if current >= max {
            return Err(LifecycleError::QuotaExceeded {
                limit: max,
                current,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    fn manager() -> LifecycleManager<MemoryStore> {
        LifecycleManager::new(MemoryStore::new())
    }

    fn named(name: &str) -> NewBot {
        NewBot {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_bot_fills_kind_defaults() {
        let mgr = manager();
        let user_id = Uuid::new_v4();

        let bot = mgr.create_bot(user_id, named("Support")).unwrap();
        assert_eq!(bot.name, "Support");
        assert_eq!(bot.kind, "standard");
        assert_eq!(bot.category.as_deref(), Some("general"));
        assert_eq!(bot.status, BOT_STATUS_ACTIVE);
        assert_eq!(bot.branding["avatar"], "default");
        assert_eq!(bot.conversation_count, 0);

        assert_eq!(mgr.stats(user_id).unwrap().total_bots, 1);
    }

    #[test]
    fn test_create_bot_caller_overrides_win() {
        let mgr = manager();
        let user_id = Uuid::new_v4();

        let bot = mgr
            .create_bot(
                user_id,
                NewBot {
                    name: "Sales".into(),
                    kind: BotKind::Business,
                    category: Some("sales".into()),
                    branding: Some(serde_json::json!({"primary_color": "#111111"})),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(bot.kind, "business");
        assert_eq!(bot.category.as_deref(), Some("sales"));
        assert_eq!(bot.branding["primary_color"], "#111111");
        // Kind default survives where the caller stayed silent.
        assert_eq!(bot.branding["avatar"], "business");
        assert_eq!(bot.features["crm_sync"], true);
    }

    #[test]
    fn test_create_bot_rejects_blank_name() {
        let mgr = manager();
        let user_id = Uuid::new_v4();

        for name in ["", "   ", "\t\n"] {
            let err = mgr.create_bot(user_id, named(name)).unwrap_err();
            assert!(matches!(err, LifecycleError::Validation(_)));
        }
        assert!(mgr.list_bots(user_id).unwrap().is_empty());
    }

    #[test]
    fn test_free_plan_allows_one_bot() {
        let mgr = manager();
        let user_id = Uuid::new_v4();

        mgr.create_bot(user_id, named("First")).unwrap();
        let err = mgr.create_bot(user_id, named("Second")).unwrap_err();
        match err {
            LifecycleError::QuotaExceeded { limit, current } => {
                assert_eq!(limit, 1);
                assert_eq!(current, 1);
            }
            other => panic!("expected quota error, got {other:?}"),
        }
        // The rejected create must leave no trace.
        assert_eq!(mgr.list_bots(user_id).unwrap().len(), 1);
        assert_eq!(mgr.stats(user_id).unwrap().total_bots, 1);
    }

    #[test]
    fn test_business_plan_allows_ten_bots() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "active");

        for i in 0..10 {
            mgr.create_bot(user_id, named(&format!("Bot {i}"))).unwrap();
        }
        let err = mgr.create_bot(user_id, named("One too many")).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::QuotaExceeded { limit: 10, current: 10 }
        ));
    }

    #[test]
    fn test_custom_plan_is_unlimited() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "custom", "active");

        for i in 0..30 {
            mgr.create_bot(user_id, named(&format!("Bot {i}"))).unwrap();
        }
        assert_eq!(mgr.list_bots(user_id).unwrap().len(), 30);
    }

    #[test]
    fn test_cancelled_subscription_counts_as_free() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "cancelled");

        mgr.create_bot(user_id, named("Only one")).unwrap();
        assert!(matches!(
            mgr.create_bot(user_id, named("Nope")),
            Err(LifecycleError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_over_quota_user_can_still_update_and_delete() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "active");
        let bots: Vec<Bot> = (0..3)
            .map(|i| mgr.create_bot(user_id, named(&format!("Bot {i}"))).unwrap())
            .collect();
        // Plan downgrade leaves the user over the free limit.
        mgr.store().set_subscription(user_id, "free", "active");

        assert!(matches!(
            mgr.create_bot(user_id, named("Blocked")),
            Err(LifecycleError::QuotaExceeded { limit: 1, current: 3 })
        ));

        let patch = BotPatch {
            name: Some("Renamed".into()),
            ..Default::default()
        };
        let updated = mgr.update_bot(user_id, bots[0].id, patch).unwrap();
        assert_eq!(updated.name, "Renamed");

        mgr.delete_bot(user_id, bots[1].id).unwrap();
        assert_eq!(mgr.list_bots(user_id).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_copies_config_and_resets_counters() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "active");

        let original = mgr
            .create_bot(
                user_id,
                NewBot {
                    name: "Helpdesk".into(),
                    kind: BotKind::Business,
                    description: Some("tier 1 support".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        mgr.increment_metric(user_id, original.id, "conversation_count", 5)
            .unwrap();

        let copy = mgr.duplicate_bot(user_id, original.id).unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.name, "Helpdesk (Copy)");
        assert_eq!(copy.kind, original.kind);
        assert_eq!(copy.description, original.description);
        assert_eq!(copy.conversation_count, 0);
        assert_eq!(copy.message_count, 0);

        assert_eq!(mgr.stats(user_id).unwrap().total_bots, 2);
    }

    #[test]
    fn test_duplicate_respects_quota() {
        let mgr = manager();
        let user_id = Uuid::new_v4();

        let bot = mgr.create_bot(user_id, named("Solo")).unwrap();
        assert!(matches!(
            mgr.duplicate_bot(user_id, bot.id),
            Err(LifecycleError::QuotaExceeded { limit: 1, current: 1 })
        ));
    }

    #[test]
    fn test_duplicate_missing_bot_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.duplicate_bot(Uuid::new_v4(), Uuid::new_v4()),
            Err(LifecycleError::NotFound)
        ));
    }

    #[test]
    fn test_update_rejects_empty_patch() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Bot")).unwrap();

        let err = mgr
            .update_bot(user_id, bot.id, BotPatch::default())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[test]
    fn test_update_rejects_unknown_status() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Bot")).unwrap();

        let patch = BotPatch {
            status: Some("paused".into()),
            ..Default::default()
        };
        assert!(matches!(
            mgr.update_bot(user_id, bot.id, patch),
            Err(LifecycleError::Validation(_))
        ));
    }

    #[test]
    fn test_update_can_null_a_field() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr
            .create_bot(
                user_id,
                NewBot {
                    name: "Bot".into(),
                    description: Some("temp".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let patch = BotPatch {
            description: Some(None),
            status: Some(BOT_STATUS_INACTIVE.into()),
            ..Default::default()
        };
        let updated = mgr.update_bot(user_id, bot.id, patch).unwrap();
        assert_eq!(updated.description, None);
        assert_eq!(updated.status, BOT_STATUS_INACTIVE);
        assert!(updated.last_activity_at >= bot.last_activity_at);
    }

    #[test]
    fn test_foreign_bot_is_invisible() {
        let mgr = manager();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let bot = mgr.create_bot(owner, named("Private")).unwrap();

        assert!(matches!(
            mgr.get_bot(stranger, bot.id),
            Err(LifecycleError::NotFound)
        ));
        assert!(matches!(
            mgr.update_bot(
                stranger,
                bot.id,
                BotPatch {
                    name: Some("Hijacked".into()),
                    ..Default::default()
                }
            ),
            Err(LifecycleError::NotFound)
        ));
        assert!(matches!(
            mgr.delete_bot(stranger, bot.id),
            Err(LifecycleError::NotFound)
        ));
        // Untouched for the owner.
        assert_eq!(mgr.get_bot(owner, bot.id).unwrap().name, "Private");
    }

    #[test]
    fn test_delete_cascades_and_settles_stats() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Short-lived")).unwrap();

        let conversation = mgr
            .start_conversation(user_id, bot.id, NewConversation::default())
            .unwrap();
        for _ in 0..3 {
            mgr.append_message(
                user_id,
                bot.id,
                conversation.id,
                NewMessage {
                    sender: "user".into(),
                    content: "hello".into(),
                    attachments: None,
                },
            )
            .unwrap();
        }

        let stats = mgr.stats(user_id).unwrap();
        assert_eq!(stats.total_bots, 1);
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 3);

        mgr.delete_bot(user_id, bot.id).unwrap();

        let stats = mgr.stats(user_id).unwrap();
        assert_eq!(stats.total_bots, 0);
        assert_eq!(stats.total_conversations, 0);
        assert_eq!(stats.total_messages, 0);
        assert!(matches!(
            mgr.get_bot(user_id, bot.id),
            Err(LifecycleError::NotFound)
        ));
    }

    #[test]
    fn test_increment_metric_defaults_and_floors() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Counter")).unwrap();

        let bumped = mgr
            .increment_metric(user_id, bot.id, "user_count", 1)
            .unwrap();
        assert_eq!(bumped.user_count, 1);

        let floored = mgr
            .increment_metric(user_id, bot.id, "user_count", -5)
            .unwrap();
        assert_eq!(floored.user_count, 0);
        assert!(floored.last_activity_at >= bumped.last_activity_at);
    }

    #[test]
    fn test_increment_metric_rejects_unknown_name() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Counter")).unwrap();

        assert!(matches!(
            mgr.increment_metric(user_id, bot.id, "total_bots", 1),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            mgr.increment_metric(user_id, Uuid::new_v4(), "user_count", 1),
            Err(LifecycleError::NotFound)
        ));
    }

    #[test]
    fn test_conversation_flow_keeps_counters_in_lockstep() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Chat")).unwrap();

        let conversation = mgr
            .start_conversation(
                user_id,
                bot.id,
                NewConversation {
                    end_user_name: Some("Ada".into()),
                    end_user_email: None,
                },
            )
            .unwrap();
        assert_eq!(conversation.status, CONVERSATION_STATUS_ACTIVE);

        mgr.append_message(
            user_id,
            bot.id,
            conversation.id,
            NewMessage {
                sender: "user".into(),
                content: "hi".into(),
                attachments: None,
            },
        )
        .unwrap();
        mgr.append_message(
            user_id,
            bot.id,
            conversation.id,
            NewMessage {
                sender: "bot".into(),
                content: "hello!".into(),
                attachments: None,
            },
        )
        .unwrap();

        let refreshed = mgr.get_bot(user_id, bot.id).unwrap();
        assert_eq!(refreshed.conversation_count, 1);
        assert_eq!(refreshed.message_count, 2);

        let stats = mgr.stats(user_id).unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 2);
    }

    #[test]
    fn test_append_message_validates_sender_and_content() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Chat")).unwrap();
        let conversation = mgr
            .start_conversation(user_id, bot.id, NewConversation::default())
            .unwrap();

        let bad_sender = mgr.append_message(
            user_id,
            bot.id,
            conversation.id,
            NewMessage {
                sender: "admin".into(),
                content: "hi".into(),
                attachments: None,
            },
        );
        assert!(matches!(bad_sender, Err(LifecycleError::Validation(_))));

        let blank = mgr.append_message(
            user_id,
            bot.id,
            conversation.id,
            NewMessage {
                sender: "user".into(),
                content: "  ".into(),
                attachments: None,
            },
        );
        assert!(matches!(blank, Err(LifecycleError::Validation(_))));

        assert_eq!(mgr.stats(user_id).unwrap().total_messages, 0);
    }

    #[test]
    fn test_list_conversations_filters_by_status() {
        let mgr = manager();
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Chat")).unwrap();
        mgr.start_conversation(user_id, bot.id, NewConversation::default())
            .unwrap();
        mgr.start_conversation(user_id, bot.id, NewConversation::default())
            .unwrap();

        let all = mgr
            .list_conversations(user_id, bot.id, ConversationFilter::default())
            .unwrap();
        assert_eq!(all.len(), 2);

        let closed = mgr
            .list_conversations(
                user_id,
                bot.id,
                ConversationFilter {
                    status: Some(CONVERSATION_STATUS_CLOSED.into()),
                },
            )
            .unwrap();
        assert!(closed.is_empty());

        assert!(matches!(
            mgr.list_conversations(
                user_id,
                bot.id,
                ConversationFilter {
                    status: Some("bogus".into())
                }
            ),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            mgr.list_conversations(user_id, Uuid::new_v4(), ConversationFilter::default()),
            Err(LifecycleError::NotFound)
        ));
    }

    #[test]
    fn test_concurrent_creates_never_exceed_quota() {
        let mgr = Arc::new(manager());
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "active");

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.create_bot(user_id, named(&format!("Bot {i}"))))
            })
            .collect();

        let mut created = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => created += 1,
                Err(LifecycleError::QuotaExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(created, 10);
        assert_eq!(rejected, 10);
        assert_eq!(mgr.list_bots(user_id).unwrap().len(), 10);
        assert_eq!(mgr.stats(user_id).unwrap().total_bots, 10);
    }

    #[test]
    fn test_concurrent_increments_lose_no_updates() {
        let mgr = Arc::new(manager());
        let user_id = Uuid::new_v4();
        let bot = mgr.create_bot(user_id, named("Busy")).unwrap();
        let bot_id = bot.id;

        mgr.increment_metric(user_id, bot_id, "conversation_count", 3)
            .unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    mgr.increment_metric(user_id, bot_id, "conversation_count", 1)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let refreshed = mgr.get_bot(user_id, bot_id).unwrap();
        assert_eq!(refreshed.conversation_count, 13);
    }

    #[test]
    fn test_concurrent_create_and_duplicate_race_for_last_slot() {
        let mgr = Arc::new(manager());
        let user_id = Uuid::new_v4();
        mgr.store().set_subscription(user_id, "business", "active");

        for i in 0..9 {
            mgr.create_bot(user_id, named(&format!("Bot {i}"))).unwrap();
        }
        let seed_id = mgr.list_bots(user_id).unwrap()[0].id;

        let creator = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.create_bot(user_id, named("Racer")))
        };
        let duplicator = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.duplicate_bot(user_id, seed_id))
        };

        let outcomes = [creator.join().unwrap(), duplicator.join().unwrap()];
        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for outcome in &outcomes {
            if let Err(err) = outcome {
                assert!(matches!(err, LifecycleError::QuotaExceeded { .. }));
            }
        }
        assert_eq!(mgr.list_bots(user_id).unwrap().len(), 10);
    }
}
