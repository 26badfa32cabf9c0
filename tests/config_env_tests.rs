//! Integration tests for loading configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;

use clusterkernel::cluster::raft::{RaftServerConfig, SnapshotStoreKind};
use clusterkernel::cluster::{ClusterConfig, ClusterRole, CoordinationError, LeaderElectionMode};
use clusterkernel::telemetry::LogFormat;

/// Every variable read by the config loaders. All are cleared before each
/// test and restored afterwards.
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "CLUSTER_NODE_ID",
    "CLUSTER_HOST",
    "CLUSTER_PORT",
    "CLUSTER_ROLES",
    "CLUSTER_ZONE",
    "CLUSTER_HEARTBEAT_INTERVAL_MS",
    "CLUSTER_HEARTBEAT_TIMEOUT_MS",
    "CLUSTER_LEADER_LEASE_MS",
    "CLUSTER_LOCK_LEASE_MS",
    "CLUSTER_SHUTDOWN_TIMEOUT_MS",
    "CLUSTER_MODE",
    "RAFT_NODE_ID",
    "RAFT_DATA_DIR",
    "RAFT_PEER_COUNT",
    "RAFT_HEARTBEAT_INTERVAL_MS",
    "RAFT_RPC_TIMEOUT_MS",
    "RAFT_ELECTION_TIMEOUT_MIN_MS",
    "RAFT_ELECTION_TIMEOUT_MAX_MS",
    "RAFT_SNAPSHOT_THRESHOLD",
    "RAFT_SNAPSHOT_SIZE_THRESHOLD_BYTES",
    "RAFT_SNAPSHOT_STORE",
    "RAFT_SNAPSHOT_PREFIX",
    "RAFT_GROUPS",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables.
/// Callers are `#[serial]` because the environment is process-global.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// ClusterConfig
// ============================================================================

#[test]
#[serial]
fn test_cluster_config_defaults_without_env() {
    with_env_vars(&[], || {
        let config = ClusterConfig::from_env().expect("defaults should parse");
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.leader_lease, Duration::from_secs(30));
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.mode, LeaderElectionMode::Raft);
        assert!(config.raft.is_some());
        assert!(config.validate().is_ok());
    });
}

#[test]
#[serial]
fn test_cluster_config_overrides() {
    with_env_vars(
        &[
            ("CLUSTER_NODE_ID", "worker-7"),
            ("CLUSTER_HOST", "10.0.0.7"),
            ("CLUSTER_PORT", "9100"),
            ("CLUSTER_ROLES", "source, workflow"),
            ("CLUSTER_ZONE", "eu-west-1a"),
            ("CLUSTER_HEARTBEAT_INTERVAL_MS", "1000"),
            ("CLUSTER_HEARTBEAT_TIMEOUT_MS", "4000"),
            ("CLUSTER_LEADER_LEASE_MS", "10000"),
            ("CLUSTER_LOCK_LEASE_MS", "20000"),
            ("CLUSTER_SHUTDOWN_TIMEOUT_MS", "750"),
            ("CLUSTER_MODE", "kafka"),
        ],
        || {
            let config = ClusterConfig::from_env().expect("should parse");
            assert_eq!(config.node_id, "worker-7");
            assert_eq!(config.host, "10.0.0.7");
            assert_eq!(config.port, 9100);
            assert_eq!(config.roles.len(), 2);
            assert!(config.roles.contains(&ClusterRole::Source));
            assert!(config.roles.contains(&ClusterRole::Workflow));
            assert_eq!(config.zone.as_deref(), Some("eu-west-1a"));
            assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
            assert_eq!(config.heartbeat_timeout, Duration::from_secs(4));
            assert_eq!(config.leader_lease, Duration::from_secs(10));
            assert_eq!(config.lock_lease, Duration::from_secs(20));
            assert_eq!(config.shutdown_timeout, Duration::from_millis(750));
            assert_eq!(config.mode, LeaderElectionMode::Kafka);
            assert!(config.raft.is_none());
        },
    );
}

#[test]
#[serial]
fn test_cluster_config_rejects_bad_values() {
    for (key, value) in [
        ("CLUSTER_PORT", "70000"),
        ("CLUSTER_PORT", "not-a-port"),
        ("CLUSTER_ROLES", "SOURCE,JANITOR"),
        ("CLUSTER_MODE", "zookeeper"),
        ("CLUSTER_LOCK_LEASE_MS", "-5"),
    ] {
        with_env_vars(&[(key, value)], || {
            assert!(
                matches!(ClusterConfig::from_env(), Err(CoordinationError::Config(_))),
                "{key}={value} should be rejected"
            );
        });
    }
}

#[test]
#[serial]
fn test_cluster_config_raft_mode_reads_raft_vars() {
    with_env_vars(&[("CLUSTER_MODE", "RAFT"), ("RAFT_PEER_COUNT", "5")], || {
        let config = ClusterConfig::from_env().expect("should parse");
        assert_eq!(config.raft.expect("raft section").peer_count, 5);
    });
}

// ============================================================================
// RaftServerConfig
// ============================================================================

#[test]
#[serial]
fn test_raft_config_overrides() {
    with_env_vars(
        &[
            ("RAFT_NODE_ID", "3"),
            ("RAFT_DATA_DIR", "/var/lib/clusterkernel"),
            ("RAFT_HEARTBEAT_INTERVAL_MS", "200"),
            ("RAFT_RPC_TIMEOUT_MS", "2000"),
            ("RAFT_ELECTION_TIMEOUT_MIN_MS", "1000"),
            ("RAFT_ELECTION_TIMEOUT_MAX_MS", "2000"),
            ("RAFT_SNAPSHOT_THRESHOLD", "50"),
            ("RAFT_SNAPSHOT_SIZE_THRESHOLD_BYTES", "1048576"),
            ("RAFT_SNAPSHOT_STORE", "object-store"),
            ("RAFT_SNAPSHOT_PREFIX", "snapshots/prod"),
            ("RAFT_GROUPS", "orders=n1;n2;n3,billing=n4;n5;n6"),
        ],
        || {
            let config = RaftServerConfig::from_env().expect("should parse");
            assert_eq!(config.node_id, 3);
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/clusterkernel"));
            assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
            assert_eq!(config.rpc_timeout, Duration::from_secs(2));
            assert_eq!(config.election_timeout_min, Duration::from_secs(1));
            assert_eq!(config.election_timeout_max, Duration::from_secs(2));
            assert_eq!(config.snapshot_threshold, 50);
            assert_eq!(config.snapshot_size_threshold_bytes, 1_048_576);
            assert_eq!(config.snapshot_store, SnapshotStoreKind::ObjectStore);
            assert_eq!(config.snapshot_prefix, "snapshots/prod");
            assert_eq!(config.groups.len(), 2);
            assert_eq!(config.groups["orders"].peers.len(), 3);
            assert!(config.validate().is_ok());
        },
    );
}

#[test]
#[serial]
fn test_raft_config_store_aliases() {
    for (raw, expected) in [
        ("FILE", SnapshotStoreKind::File),
        ("db", SnapshotStoreKind::Db),
        ("repository", SnapshotStoreKind::Repository),
        ("kafka_ktable", SnapshotStoreKind::KafkaKtable),
    ] {
        with_env_vars(&[("RAFT_SNAPSHOT_STORE", raw)], || {
            let config = RaftServerConfig::from_env().expect("should parse");
            assert_eq!(config.snapshot_store, expected, "{raw}");
        });
    }
}

#[test]
#[serial]
fn test_raft_config_rejects_malformed_groups() {
    with_env_vars(&[("RAFT_GROUPS", "orders")], || {
        assert!(matches!(
            RaftServerConfig::from_env(),
            Err(CoordinationError::Config(_))
        ));
    });
}

#[test]
#[serial]
fn test_raft_config_validation_reports_every_problem() {
    with_env_vars(
        &[
            ("RAFT_PEER_COUNT", "4"),
            ("RAFT_ELECTION_TIMEOUT_MIN_MS", "3000"),
            ("RAFT_ELECTION_TIMEOUT_MAX_MS", "3000"),
        ],
        || {
            let config = RaftServerConfig::from_env().expect("parses, fails validation");
            let errors = config.validate().unwrap_err();
            assert!(errors.iter().any(|e| e.contains("peer_count")));
            assert!(errors.iter().any(|e| e.contains("election_timeout_min")));
        },
    );
}

// ============================================================================
// LogFormat
// ============================================================================

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "json")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[("LOG_FORMAT", "yaml")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
