//! Default trust policies and the capability catalog
//!
//! The policy table maps each of the five trust tiers to its allowed and
//! denied capabilities plus resource ceilings. The catalog names every
//! capability the platform knows about with its risk classification.

use std::collections::{HashMap, HashSet};

use plugon_core::types::{
    AuditLevel, Capability, CapabilityCategory, ResourceLimits, RiskLevel, TrustLevel, TrustPolicy,
};

fn caps(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The built-in capability catalog
pub fn default_capability_catalog() -> HashMap<String, Capability> {
    let entries = [
        ("api.routes", RiskLevel::Low, CapabilityCategory::Api),
        ("logging", RiskLevel::Low, CapabilityCategory::Api),
        ("events.subscribe", RiskLevel::Low, CapabilityCategory::Api),
        (
            "network.outbound",
            RiskLevel::Medium,
            CapabilityCategory::Network,
        ),
        (
            "network.listen",
            RiskLevel::High,
            CapabilityCategory::Network,
        ),
        (
            "filesystem",
            RiskLevel::High,
            CapabilityCategory::Filesystem,
        ),
        (
            "filesystem.read",
            RiskLevel::Medium,
            CapabilityCategory::Filesystem,
        ),
        (
            "filesystem.write",
            RiskLevel::High,
            CapabilityCategory::Filesystem,
        ),
        ("process", RiskLevel::Critical, CapabilityCategory::Process),
        (
            "database",
            RiskLevel::High,
            CapabilityCategory::Database,
        ),
        (
            "database.read",
            RiskLevel::Medium,
            CapabilityCategory::Database,
        ),
        (
            "security-audit",
            RiskLevel::Critical,
            CapabilityCategory::Security,
        ),
    ];

    entries
        .into_iter()
        .map(|(name, risk_level, category)| {
            (
                name.to_string(),
                Capability {
                    name: name.to_string(),
                    risk_level,
                    category,
                },
            )
        })
        .collect()
}

/// The built-in policy table
pub fn default_policy_table() -> HashMap<TrustLevel, TrustPolicy> {
    let mut table = HashMap::new();

    table.insert(
        TrustLevel::Quarantined,
        TrustPolicy {
            trust_level: TrustLevel::Quarantined,
            allowed_capabilities: HashSet::new(),
            denied_capabilities: default_capability_catalog().into_keys().collect(),
            resource_limits: ResourceLimits {
                cpu_ms: 0,
                memory_mb: 0,
                file_handles: 0,
                network_connections: 0,
            },
            requires_review: true,
            audit_level: AuditLevel::Forensic,
        },
    );

    table.insert(
        TrustLevel::Untrusted,
        TrustPolicy {
            trust_level: TrustLevel::Untrusted,
            allowed_capabilities: caps(&["api.routes", "logging", "events.subscribe"]),
            denied_capabilities: caps(&[
                "filesystem",
                "filesystem.read",
                "filesystem.write",
                "process",
                "network.listen",
                "database",
                "security-audit",
            ]),
            resource_limits: ResourceLimits {
                cpu_ms: 1_000,
                memory_mb: 64,
                file_handles: 8,
                network_connections: 2,
            },
            requires_review: true,
            audit_level: AuditLevel::Detailed,
        },
    );

    table.insert(
        TrustLevel::Community,
        TrustPolicy {
            trust_level: TrustLevel::Community,
            allowed_capabilities: caps(&[
                "api.routes",
                "logging",
                "events.subscribe",
                "network.outbound",
                "database.read",
                "filesystem.read",
            ]),
            denied_capabilities: caps(&[
                "filesystem.write",
                "process",
                "network.listen",
                "security-audit",
            ]),
            resource_limits: ResourceLimits {
                cpu_ms: 5_000,
                memory_mb: 256,
                file_handles: 32,
                network_connections: 16,
            },
            requires_review: false,
            audit_level: AuditLevel::Basic,
        },
    );

    table.insert(
        TrustLevel::Verified,
        TrustPolicy {
            trust_level: TrustLevel::Verified,
            allowed_capabilities: caps(&[
                "api.routes",
                "logging",
                "events.subscribe",
                "network.outbound",
                "network.listen",
                "database",
                "database.read",
                "filesystem",
                "filesystem.read",
                "filesystem.write",
            ]),
            denied_capabilities: caps(&["process", "security-audit"]),
            resource_limits: ResourceLimits {
                cpu_ms: 30_000,
                memory_mb: 1_024,
                file_handles: 128,
                network_connections: 64,
            },
            requires_review: false,
            audit_level: AuditLevel::Basic,
        },
    );

    table.insert(
        TrustLevel::Internal,
        TrustPolicy {
            trust_level: TrustLevel::Internal,
            allowed_capabilities: default_capability_catalog().into_keys().collect(),
            denied_capabilities: HashSet::new(),
            resource_limits: ResourceLimits {
                cpu_ms: 120_000,
                memory_mb: 4_096,
                file_handles: 1_024,
                network_connections: 256,
            },
            requires_review: false,
            audit_level: AuditLevel::None,
        },
    );

    table
}
