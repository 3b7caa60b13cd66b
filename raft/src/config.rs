//! Runtime configuration for a Raft node.

use std::time::Duration;

use thiserror::Error;

/// Errors returned while building a [`Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat_timeout must be greater than zero")]
    HeartbeatTimeoutZero,
    #[error("election_timeout must be greater than zero")]
    ElectionTimeoutZero,
    #[error("max_append_entries must be greater than zero")]
    MaxAppendEntriesZero,
    #[error("snapshot_threshold must be greater than zero")]
    SnapshotThresholdZero,
}

/// Tunables governing the timing, batching and retention behavior of a Raft
/// node. Constructed via [`Config::build`], which validates the values the
/// way the teacher crate's own config builder does, rather than letting a
/// nonsensical config (e.g. a zero heartbeat) surface as a confusing panic
/// deep in the role loop.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lower bound of the randomized `[HeartbeatTimeout, 2*HeartbeatTimeout)`
    /// follower election timeout, and the interval a leader's replicators
    /// heartbeat at.
    pub heartbeat_timeout: Duration,
    /// Lower bound of the randomized `[ElectionTimeout, 2*ElectionTimeout)`
    /// candidate election timeout.
    pub election_timeout: Duration,
    /// Pacing of a replicator's steady-state AppendEntries cycle (waited on
    /// in addition to `triggerCh`/`stopCh`).
    pub commit_timeout: Duration,
    /// Maximum number of log entries batched into a single AppendEntries RPC.
    pub max_append_entries: usize,
    /// Lower bound of the randomized snapshot-manager tick interval.
    pub snapshot_interval: Duration,
    /// Log-length delta (`lastLogIndex - firstLogIndex`) which triggers an
    /// automatic snapshot.
    pub snapshot_threshold: u64,
    /// Number of log entries retained past a snapshot so that slow
    /// followers can catch up via AppendEntries rather than InstallSnapshot.
    pub trailing_logs: u64,
    /// If true, a node that commits its own removal from the peer set
    /// initiates shutdown instead of stepping down to Follower.
    pub shutdown_on_remove: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(150),
            election_timeout: Duration::from_millis(150),
            commit_timeout: Duration::from_millis(50),
            max_append_entries: 64,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
            trailing_logs: 10_000,
            shutdown_on_remove: true,
        }
    }
}

impl Config {
    /// Start building a config from defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::HeartbeatTimeoutZero);
        }
        if self.election_timeout.is_zero() {
            return Err(ConfigError::ElectionTimeoutZero);
        }
        if self.max_append_entries == 0 {
            return Err(ConfigError::MaxAppendEntriesZero);
        }
        if self.snapshot_threshold == 0 {
            return Err(ConfigError::SnapshotThresholdZero);
        }
        Ok(())
    }
}

/// Builder for [`Config`], validated on [`ConfigBuilder::build`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder(Config);

macro_rules! setter {
    ($name:ident : $ty:ty) => {
        pub fn $name(mut self, $name: $ty) -> Self {
            self.0.$name = $name;
            self
        }
    };
}

impl ConfigBuilder {
    setter!(heartbeat_timeout: Duration);
    setter!(election_timeout: Duration);
    setter!(commit_timeout: Duration);
    setter!(max_append_entries: usize);
    setter!(snapshot_interval: Duration);
    setter!(snapshot_threshold: u64);
    setter!(trailing_logs: u64);
    setter!(shutdown_on_remove: bool);

    pub fn build(self) -> Result<Config, ConfigError> {
        self.0.validate()?;
        Ok(self.0)
    }
}

/// Draw a duration uniformly from `[d, 2d)`.
///
/// Used for follower heartbeat timeout, candidate election timeout and
/// snapshot-manager interval jitter alike — randomization prevents split
/// votes and synchronized snapshotting (§5).
pub fn random_timeout(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    let extra: u64 = rand::random::<u64>() % (d.as_millis() as u64).max(1);
    d + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_heartbeat() {
        let err = Config::builder().heartbeat_timeout(Duration::ZERO).build().unwrap_err();
        assert_eq!(err, ConfigError::HeartbeatTimeoutZero);
    }

    #[test]
    fn random_timeout_is_within_bounds() {
        let d = Duration::from_millis(100);
        for _ in 0..1000 {
            let t = random_timeout(d);
            assert!(t >= d && t < d * 2);
        }
    }
}
