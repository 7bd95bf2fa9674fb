//! Rate limit rules and per-operation presets.
//!
//! Presets are loaded from `rate_limiting.presets` in the configuration.
//! Any class left out of the file keeps its built-in default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::OperationClass;
use crate::error::{AdmissionError, Result};

/// A limit of `max_requests` per rolling `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Admissions allowed inside one window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitRule {
    /// Create a rule.
    pub const fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    /// Shorthand for a rule with a window given in seconds.
    pub const fn per_secs(max_requests: u64, secs: u64) -> Self {
        Self::new(max_requests, secs * 1000)
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// How long window entries are kept: the window rounded up to whole
    /// seconds plus a one minute cleanup margin.
    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.window_ms.div_ceil(1000) + 60)
    }

    /// Reject rules that cannot describe a window.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(AdmissionError::Config(
                "rate limit window must be longer than 0ms".to_string(),
            ));
        }
        if self.window_ms > i64::MAX as u64 {
            return Err(AdmissionError::Config(format!(
                "rate limit window of {}ms is too long",
                self.window_ms
            )));
        }
        Ok(())
    }
}

/// Limits for each operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPresets {
    pub ai: RateLimitRule,
    pub email_by_user: RateLimitRule,
    pub email_by_recipient: RateLimitRule,
    pub email_global: RateLimitRule,
    pub sms: RateLimitRule,
    pub api: RateLimitRule,
}

impl Default for RateLimitPresets {
    fn default() -> Self {
        Self {
            ai: RateLimitRule::per_secs(20, 60),
            email_by_user: RateLimitRule::per_secs(50, 3600),
            email_by_recipient: RateLimitRule::per_secs(5, 3600),
            email_global: RateLimitRule::per_secs(1000, 3600),
            sms: RateLimitRule::per_secs(10, 3600),
            api: RateLimitRule::per_secs(100, 60),
        }
    }
}

impl RateLimitPresets {
    /// The rule applied to an operation class.
    pub fn rule(&self, class: OperationClass) -> RateLimitRule {
        match class {
            OperationClass::Ai => self.ai,
            OperationClass::EmailByUser => self.email_by_user,
            OperationClass::EmailByRecipient => self.email_by_recipient,
            OperationClass::EmailGlobal => self.email_global,
            OperationClass::Sms => self.sms,
            OperationClass::Api => self.api,
        }
    }

    /// Validate every preset.
    pub fn validate(&self) -> Result<()> {
        for class in OperationClass::ALL {
            if let Err(AdmissionError::Config(reason)) = self.rule(class).validate() {
                return Err(AdmissionError::Config(format!(
                    "rate_limiting.presets.{}: {}",
                    class.name(),
                    reason
                )));
            }
        }
        Ok(())
    }
}
