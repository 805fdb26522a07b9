//! Runtime configuration from the environment.

use std::str::FromStr;

use stocktake_counting::{Quantity, ReconciliationPolicy};

pub const FLAG_THRESHOLD_ENV: &str = "STOCKTAKE_FLAG_THRESHOLD_PCT";
pub const BIND_ADDR_ENV: &str = "STOCKTAKE_BIND_ADDR";
pub const JWT_SECRET_ENV: &str = "JWT_SECRET";

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountingConfig {
    /// |variance %| above which an auto-resolved item is flagged.
    ///
    /// Copied into each session at creation, so later changes never alter
    /// how an existing session replays.
    pub flag_threshold_pct: Quantity,
    pub bind_addr: String,
    pub jwt_secret: String,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            flag_threshold_pct: ReconciliationPolicy::default().flag_threshold_pct,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
        }
    }
}

impl CountingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let flag_threshold_pct = match lookup(FLAG_THRESHOLD_ENV) {
            None => defaults.flag_threshold_pct,
            Some(raw) => match Quantity::from_str(raw.trim()) {
                Ok(v) if !v.is_sign_negative() => v,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        "{FLAG_THRESHOLD_ENV} is not a non-negative number; using default"
                    );
                    defaults.flag_threshold_pct
                }
            },
        };

        let bind_addr = lookup(BIND_ADDR_ENV)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.bind_addr);

        let jwt_secret = match lookup(JWT_SECRET_ENV).filter(|s| !s.is_empty()) {
            Some(s) => s,
            None => {
                tracing::warn!("{JWT_SECRET_ENV} not set; using insecure dev default");
                defaults.jwt_secret
            }
        };

        Self {
            flag_threshold_pct,
            bind_addr,
            jwt_secret,
        }
    }

    pub fn policy(&self) -> ReconciliationPolicy {
        ReconciliationPolicy::new(self.flag_threshold_pct)
    }
}
