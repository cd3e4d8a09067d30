use std::convert::TryFrom;
use tokio::time::Duration;

/// RaftOptions are optional overrides. Anything left `None` takes its default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    pub max_entries_per_append: Option<usize>,
    /// Take a snapshot once this many entries were applied since the last one.
    pub snapshot_max_log_entries: Option<u64>,
    /// Also take a snapshot once the last one is this old, if anything was applied since.
    pub snapshot_max_age: Option<Duration>,
    pub actor_queue_size: Option<usize>,
}

#[derive(Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub max_entries_per_append: usize,
    pub snapshot_max_log_entries: u64,
    pub snapshot_max_age: Option<Duration>,
    pub actor_queue_size: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per AppendEntries must be at least 1");
        }
        if self.snapshot_max_log_entries == 0 {
            return Err("Snapshot entry threshold must be at least 1");
        }
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be at least 1");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            snapshot_max_log_entries: options.snapshot_max_log_entries.unwrap_or(1000),
            snapshot_max_age: options.snapshot_max_age,
            actor_queue_size: options.actor_queue_size.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}
