use std::time::Duration;

use dxram_common::{
    BACKUP_SUPERPEERS, MAX_RETRIES, MAX_RETRY_BACKOFF, PROMOTION_MAX_TICKS, PROMOTION_MIN_TICKS,
    RETRY_BACKOFF, RPC_TIMEOUT, STABILIZATION_INTERVAL,
};
use dxram_utils::env;
use serde::{Deserialize, Serialize};
use snafu::Whatever;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Pause between two stabilization rounds.
    #[serde(with = "millis")]
    pub stabilization_interval: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    pub max_retries: usize,
    /// First retry delay, doubled per attempt up to `max_retry_backoff`.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    #[serde(with = "millis")]
    pub max_retry_backoff: Duration,
    pub promotion_min_ticks: usize,
    pub promotion_max_ticks: usize,
    pub backup_count: usize,
    /// Overrides the superpeer count announced by the boot component.
    pub expected_superpeers: Option<usize>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            stabilization_interval: STABILIZATION_INTERVAL,
            rpc_timeout: RPC_TIMEOUT,
            max_retries: MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            max_retry_backoff: MAX_RETRY_BACKOFF,
            promotion_min_ticks: PROMOTION_MIN_TICKS,
            promotion_max_ticks: PROMOTION_MAX_TICKS,
            backup_count: BACKUP_SUPERPEERS,
            expected_superpeers: None,
        }
    }
}

impl LookupConfig {
    pub fn with_env_overrides(mut self) -> Result<Self, Whatever> {
        if let Some(v) = env::var_millis("DXRAM_STABILIZATION_INTERVAL_MS")? {
            self.stabilization_interval = v;
        }
        if let Some(v) = env::var_millis("DXRAM_RPC_TIMEOUT_MS")? {
            self.rpc_timeout = v;
        }
        env::override_with(&mut self.max_retries, "DXRAM_MAX_RETRIES")?;
        Ok(self)
    }

    /// Unstable rounds to wait before promoting a peer. Larger overlays wait
    /// longer so that a joining superpeer has time to show up.
    pub fn promotion_threshold(&self, expected_superpeers: usize) -> usize {
        expected_superpeers
            .max(self.promotion_min_ticks)
            .min(self.promotion_max_ticks)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
