//! Rate limit keys and operation classes.

use serde::{Deserialize, Serialize};

/// Opaque identifier of the throttled resource and principal pair, e.g.
/// `email:user:42`.
///
/// One sliding window exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Wrap an arbitrary caller-supplied key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for `subject` within an operation class namespace.
    pub fn for_operation(class: OperationClass, subject: &str) -> Self {
        match class {
            OperationClass::EmailGlobal => Self(class.namespace().to_string()),
            _ => Self(format!("{}:{}", class.namespace(), subject)),
        }
    }

    /// The key as stored (before the limiter's store prefix is applied).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RateLimitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Classes of operation with their own preset limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// AI queries, per user
    Ai,
    /// Outbound email, per sending user
    EmailByUser,
    /// Outbound email, per recipient address
    EmailByRecipient,
    /// Outbound email across the whole fleet
    EmailGlobal,
    /// Outbound SMS, per user
    Sms,
    /// Generic API calls, per caller key
    Api,
}

impl OperationClass {
    /// Every class, in declaration order.
    pub const ALL: [OperationClass; 6] = [
        OperationClass::Ai,
        OperationClass::EmailByUser,
        OperationClass::EmailByRecipient,
        OperationClass::EmailGlobal,
        OperationClass::Sms,
        OperationClass::Api,
    ];

    /// Configuration name of this class.
    pub fn name(&self) -> &'static str {
        match self {
            OperationClass::Ai => "ai",
            OperationClass::EmailByUser => "email_by_user",
            OperationClass::EmailByRecipient => "email_by_recipient",
            OperationClass::EmailGlobal => "email_global",
            OperationClass::Sms => "sms",
            OperationClass::Api => "api",
        }
    }

    /// Key namespace for this class.
    pub fn namespace(&self) -> &'static str {
        match self {
            OperationClass::Ai => "ai",
            OperationClass::EmailByUser => "email:user",
            OperationClass::EmailByRecipient => "email:recipient",
            OperationClass::EmailGlobal => "email:global",
            OperationClass::Sms => "sms",
            OperationClass::Api => "api",
        }
    }
}

impl std::str::FromStr for OperationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationClass::ALL
            .into_iter()
            .find(|class| class.name() == s)
            .ok_or_else(|| format!("unknown operation class: {s}"))
    }
}
