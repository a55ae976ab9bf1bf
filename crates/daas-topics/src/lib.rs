//! Canonical event topic constants for the provisioning engine.
//!
//! Keep this list grouped by subject and favor dot.case names.

// Server lifecycle
pub const TOPIC_SERVER_PROVISIONING: &str = "server.provisioning";
pub const TOPIC_SERVER_PROVISIONED: &str = "server.provisioned";
pub const TOPIC_SERVER_PROVISIONING_FAILED: &str = "server.provisioning.failed";
pub const TOPIC_SERVER_RECONFIGURING: &str = "server.reconfiguring";
pub const TOPIC_SERVER_RECONFIGURED: &str = "server.reconfigured";
pub const TOPIC_SERVER_RECONFIGURATION_FAILED: &str = "server.reconfiguration.failed";
pub const TOPIC_SERVER_DEPROVISIONING: &str = "server.deprovisioning";
pub const TOPIC_SERVER_DEPROVISIONED: &str = "server.deprovisioned";
pub const TOPIC_SERVER_DEPROVISIONING_FAILED: &str = "server.deprovisioning.failed";

// Server observations
pub const TOPIC_SERVER_PHASE_CHANGED: &str = "server.phase.changed";
pub const TOPIC_SERVER_INGRESS_CHANGED: &str = "server.ingress.changed";
pub const TOPIC_SERVER_STATS_COLLECTED: &str = "server.stats.collected";

// Databases
pub const TOPIC_DATABASE_PROVISIONED: &str = "database.provisioned";
pub const TOPIC_DATABASE_DEPROVISIONED: &str = "database.deprovisioned";
pub const TOPIC_DATABASE_FAILED: &str = "database.failed";

// Engine
pub const TOPIC_SUPERVISOR_SYNCED: &str = "supervisor.synced";
pub const TOPIC_WATCH_RESTARTED: &str = "watch.restarted";

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[&str] = &[
        TOPIC_SERVER_PROVISIONING,
        TOPIC_SERVER_PROVISIONED,
        TOPIC_SERVER_PROVISIONING_FAILED,
        TOPIC_SERVER_RECONFIGURING,
        TOPIC_SERVER_RECONFIGURED,
        TOPIC_SERVER_RECONFIGURATION_FAILED,
        TOPIC_SERVER_DEPROVISIONING,
        TOPIC_SERVER_DEPROVISIONED,
        TOPIC_SERVER_DEPROVISIONING_FAILED,
        TOPIC_SERVER_PHASE_CHANGED,
        TOPIC_SERVER_INGRESS_CHANGED,
        TOPIC_SERVER_STATS_COLLECTED,
        TOPIC_DATABASE_PROVISIONED,
        TOPIC_DATABASE_DEPROVISIONED,
        TOPIC_DATABASE_FAILED,
        TOPIC_SUPERVISOR_SYNCED,
        TOPIC_WATCH_RESTARTED,
    ];

    #[test]
    fn topics_are_unique_dot_case() {
        let mut seen = std::collections::HashSet::new();
        for topic in ALL {
            assert!(seen.insert(*topic), "duplicate topic {topic}");
            assert!(
                topic
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c == '.'),
                "{topic} is not dot.case"
            );
        }
    }
}
