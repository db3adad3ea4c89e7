use serde::{Deserialize, Serialize};

/// Subscription tiers. Anything the store hands us that does not parse
/// falls back to `Free`, the most restrictive tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Business,
    Professional,
    Custom,
}

impl Plan {
    pub fn parse(value: &str) -> Self {
        match value {
            "business" => Self::Business,
            "professional" => Self::Professional,
            "custom" => Self::Custom,
            _ => Self::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Business => "business",
            Self::Professional => "professional",
            Self::Custom => "custom",
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::Free
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BotLimit {
    Limited(u64),
    Unlimited,
}

impl BotLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    pub fn value(&self) -> Option<u64> {
        match self {
            Self::Limited(v) => Some(*v),
            Self::Unlimited => None,
        }
    }

    /// Whether one more bot fits under this limit given the current count.
    pub fn allows(&self, current: u64) -> bool {
        match self {
            Self::Limited(limit) => current < *limit,
            Self::Unlimited => true,
        }
    }
}

/// Maximum number of bots a user may own on a given plan. Total over all
/// plan values; there is no plan without a defined limit.
pub fn bot_limit_for(plan: Plan) -> BotLimit {
    match plan {
        Plan::Free => BotLimit::Limited(1),
        Plan::Business => BotLimit::Limited(10),
        Plan::Professional => BotLimit::Limited(25),
        Plan::Custom => BotLimit::Unlimited,
    }
}
