use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use self::schema::{bots, conversations, messages, subscriptions, user_stats};

pub const BOT_STATUS_ACTIVE: &str = "active";
pub const BOT_STATUS_INACTIVE: &str = "inactive";

pub const CONVERSATION_STATUS_ACTIVE: &str = "active";
pub const CONVERSATION_STATUS_CLOSED: &str = "closed";
pub const CONVERSATION_STATUS_ARCHIVED: &str = "archived";

pub const SUBSCRIPTION_STATUS_ACTIVE: &str = "active";

/// Senders a message row may carry. Anything else is rejected before it
/// reaches the store.
pub const MESSAGE_SENDERS: &[&str] = &["user", "bot"];

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = bots)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub personality: Option<String>,
    pub language: Option<String>,
    pub branding: serde_json::Value,
    pub features: serde_json::Value,
    pub status: String,
    pub conversation_count: i64,
    pub message_count: i64,
    pub user_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub end_user_name: Option<String>,
    pub end_user_email: Option<String>,
    pub rating: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: String,
    pub content: String,
    pub attachments: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Denormalized per-user totals, kept in lockstep with the underlying rows
/// by the transactional mutation paths.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, Selectable)]
#[diesel(table_name = user_stats)]
pub struct UserStats {
    pub user_id: Uuid,
    pub total_bots: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
}

impl UserStats {
    pub fn zeroed(user_id: Uuid) -> Self {
        Self {
            user_id,
            total_bots: 0,
            total_conversations: 0,
            total_messages: 0,
        }
    }
}

pub mod schema {
    diesel::table! {
        bots (id) {
            id -> Uuid,
            user_id -> Uuid,
            kind -> Varchar,
            name -> Varchar,
            description -> Nullable<Text>,
            category -> Nullable<Varchar>,
            personality -> Nullable<Text>,
            language -> Nullable<Varchar>,
            branding -> Jsonb,
            features -> Jsonb,
            status -> Varchar,
            conversation_count -> Int8,
            message_count -> Int8,
            user_count -> Int8,
            created_at -> Timestamptz,
            last_activity_at -> Timestamptz,
        }
    }

    diesel::table! {
        conversations (id) {
            id -> Uuid,
            bot_id -> Uuid,
            user_id -> Uuid,
            status -> Varchar,
            end_user_name -> Nullable<Varchar>,
            end_user_email -> Nullable<Varchar>,
            rating -> Nullable<Int4>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        messages (id) {
            id -> Uuid,
            conversation_id -> Uuid,
            sender -> Varchar,
            content -> Text,
            attachments -> Nullable<Jsonb>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        subscriptions (id) {
            id -> Uuid,
            user_id -> Uuid,
            plan -> Varchar,
            status -> Varchar,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        user_stats (user_id) {
            user_id -> Uuid,
            total_bots -> Int8,
            total_conversations -> Int8,
            total_messages -> Int8,
        }
    }

    diesel::joinable!(conversations -> bots (bot_id));
    diesel::joinable!(messages -> conversations (conversation_id));

    diesel::allow_tables_to_appear_in_same_query!(
        bots,
        conversations,
        messages,
        subscriptions,
        user_stats,
    );
}
