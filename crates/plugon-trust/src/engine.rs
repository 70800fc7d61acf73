//! Trust and capability engine
//!
//! Holds the policy table, the capability catalog, the assignment ledger
//! and the violation ledger. Assignments are append-only: assigning a new
//! level deactivates the prior active row for the same `(name, version?)`
//! key and inserts a fresh active one, so superseded rows remain for audit.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::{
    Capability, ChangeRequestStatus, PluginManifest, RiskLevel, TrustAssignment,
    TrustChangeRequest, TrustLevel, TrustPolicy, TrustViolation, ViolationSeverity,
};
use plugon_common::Result;

/// Outcome of validating a manifest against the effective trust policy
#[derive(Debug, Clone, Serialize)]
pub struct PolicyValidation {
    /// Whether every implied capability is permitted
    pub is_valid: bool,

    /// Capability names that were denied or not granted
    pub violations: Vec<String>,

    /// Suggested remediations, e.g. the trust level that would grant a
    /// denied capability
    pub required_actions: Vec<String>,
}

/// Trust level gap beyond which change requests queue for review instead
/// of auto-applying
const DEFAULT_AUTO_APPLY_GAP: u8 = 1;

/// The trust and capability engine
#[derive(Debug)]
pub struct TrustEngine {
    policies: HashMap<TrustLevel, TrustPolicy>,
    catalog: HashMap<String, Capability>,
    assignments: RwLock<Vec<TrustAssignment>>,
    violations: RwLock<Vec<TrustViolation>>,
    change_requests: RwLock<Vec<TrustChangeRequest>>,
    events: EventBus,
    auto_apply_gap: u8,
}

impl TrustEngine {
    /// Create an engine with the built-in policy table and catalog
    pub fn new(events: EventBus) -> Self {
        Self {
            policies: crate::policy::default_policy_table(),
            catalog: crate::policy::default_capability_catalog(),
            assignments: RwLock::new(Vec::new()),
            violations: RwLock::new(Vec::new()),
            change_requests: RwLock::new(Vec::new()),
            events,
            auto_apply_gap: DEFAULT_AUTO_APPLY_GAP,
        }
    }

    /// Resolve the effective trust level for `(name, version?)`
    ///
    /// Falls back from the version-scoped assignment to the name-wide one,
    /// then to UNTRUSTED. Expired assignments are skipped.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_trust_level(&self, name: &str, version: Option<&str>) -> TrustLevel {
        let assignments = self.assignments.read().await;
        let now = Utc::now();

        let lookup = |wanted: Option<&str>| {
            assignments
                .iter()
                .find(|a| {
                    a.is_active
                        && a.plugin_name == name
                        && a.version.as_deref() == wanted
                        && a.valid_until.map(|until| until > now).unwrap_or(true)
                })
                .map(|a| a.trust_level)
        };

        if let Some(version) = version {
            if let Some(level) = lookup(Some(version)) {
                return level;
            }
        }
        lookup(None).unwrap_or(TrustLevel::Untrusted)
    }

    /// Whether the plugin may perform the capability at its effective level
    #[instrument(level = "debug", skip(self))]
    pub async fn can_perform_capability(
        &self,
        name: &str,
        capability: &str,
        version: Option<&str>,
    ) -> bool {
        let level = self.get_trust_level(name, version).await;
        let Some(policy) = self.policies.get(&level) else {
            return false;
        };
        policy.allowed_capabilities.contains(capability)
            && !policy.denied_capabilities.contains(capability)
    }

    /// Record a new trust assignment, deactivating the prior active row for
    /// the same `(name, version?)` key
    #[instrument(level = "debug", skip(self, assignment), fields(name = %assignment.plugin_name, level = %assignment.trust_level))]
    pub async fn assign_trust_level(&self, mut assignment: TrustAssignment) -> Result<()> {
        let mut assignments = self.assignments.write().await;
        for row in assignments.iter_mut() {
            if row.is_active
                && row.plugin_name == assignment.plugin_name
                && row.version == assignment.version
            {
                row.is_active = false;
            }
        }
        assignment.is_active = true;

        info!(
            "✅ trust level {} assigned to {}{} by {}",
            assignment.trust_level,
            assignment.plugin_name,
            assignment
                .version
                .as_deref()
                .map(|v| format!("@{}", v))
                .unwrap_or_default(),
            assignment.assigned_by
        );
        self.events.emit(PluginEvent::TrustAssigned {
            plugin_name: assignment.plugin_name.clone(),
            version: assignment.version.clone(),
            trust_level: assignment.trust_level,
            assigned_by: assignment.assigned_by.clone(),
        });
        assignments.push(assignment);
        Ok(())
    }

    /// Validate every capability the manifest implies against the plugin's
    /// effective policy
    #[instrument(level = "debug", skip(self, manifest), fields(name = %manifest.name))]
    pub async fn validate_against_policy(
        &self,
        name: &str,
        manifest: &PluginManifest,
        version: Option<&str>,
    ) -> PolicyValidation {
        let level = self.get_trust_level(name, version).await;
        let Some(policy) = self.policies.get(&level) else {
            return PolicyValidation {
                is_valid: false,
                violations: vec![format!("no policy for trust level {}", level)],
                required_actions: Vec::new(),
            };
        };

        let mut violations = Vec::new();
        let mut required_actions = Vec::new();

        for capability in manifest.implied_capabilities() {
            let permitted = policy.allowed_capabilities.contains(&capability)
                && !policy.denied_capabilities.contains(&capability);
            if permitted {
                continue;
            }
            violations.push(capability.clone());
            match self.minimum_level_for(&capability) {
                Some(minimum) => required_actions.push(format!(
                    "capability '{}' requires trust level {} or higher",
                    capability, minimum
                )),
                None => required_actions.push(format!(
                    "capability '{}' is not in the capability catalog",
                    capability
                )),
            }
        }

        if !violations.is_empty() {
            warn!(
                "⚠️ {} requests {} capabilities outside its {} policy",
                name,
                violations.len(),
                level
            );
        }

        PolicyValidation {
            is_valid: violations.is_empty(),
            violations,
            required_actions,
        }
    }

    /// Append a violation to the ledger
    #[instrument(level = "debug", skip(self, violation), fields(name = %violation.plugin_name))]
    pub async fn record_violation(&self, violation: TrustViolation) {
        warn!(
            "⚠️ trust violation for {}: {} ({:?})",
            violation.plugin_name, violation.description, violation.severity
        );
        self.events.emit(PluginEvent::ViolationRecorded {
            plugin_name: violation.plugin_name.clone(),
            severity: format!("{:?}", violation.severity).to_lowercase(),
        });
        self.violations.write().await.push(violation);
    }

    /// Violations recorded for a plugin
    pub async fn violations_for(&self, name: &str) -> Vec<TrustViolation> {
        self.violations
            .read()
            .await
            .iter()
            .filter(|v| v.plugin_name == name)
            .cloned()
            .collect()
    }

    /// Enqueue a trust level change request
    ///
    /// Changes within the configured rank gap are applied immediately;
    /// larger jumps are queued for review.
    #[instrument(level = "debug", skip(self, request), fields(name = %request.plugin_name))]
    pub async fn request_change(&self, mut request: TrustChangeRequest) -> Result<ChangeRequestStatus> {
        let gap = request
            .requested_level
            .rank()
            .abs_diff(request.current_level.rank());

        let status = if gap <= self.auto_apply_gap {
            self.assign_trust_level(TrustAssignment {
                id: Uuid::new_v4(),
                plugin_name: request.plugin_name.clone(),
                version: request.version.clone(),
                trust_level: request.requested_level,
                assigned_by: request.requested_by.clone(),
                assigned_at: Utc::now(),
                reason: request.reason.clone(),
                evidence: Vec::new(),
                valid_until: None,
                review_required: false,
                is_active: true,
            })
            .await?;
            ChangeRequestStatus::AutoApplied
        } else {
            debug!(
                "🔧 change request for {} queued: gap {} exceeds auto-apply limit",
                request.plugin_name, gap
            );
            ChangeRequestStatus::Pending
        };

        request.status = status;
        self.change_requests.write().await.push(request);
        Ok(status)
    }

    /// Pending change requests, oldest first
    pub async fn pending_changes(&self) -> Vec<TrustChangeRequest> {
        self.change_requests
            .read()
            .await
            .iter()
            .filter(|r| r.status == ChangeRequestStatus::Pending)
            .cloned()
            .collect()
    }

    /// The policy for a trust level
    pub fn policy_for(&self, level: TrustLevel) -> Option<&TrustPolicy> {
        self.policies.get(&level)
    }

    /// The capability catalog
    pub fn catalog(&self) -> &HashMap<String, Capability> {
        &self.catalog
    }

    /// Severity a violation of this capability warrants, from its risk
    pub fn severity_for_capability(&self, capability: &str) -> ViolationSeverity {
        match self.catalog.get(capability).map(|c| c.risk_level) {
            Some(RiskLevel::Low) => ViolationSeverity::Low,
            Some(RiskLevel::Medium) => ViolationSeverity::Medium,
            Some(RiskLevel::High) => ViolationSeverity::High,
            Some(RiskLevel::Critical) => ViolationSeverity::Critical,
            None => ViolationSeverity::High,
        }
    }

    /// The lowest trust level whose policy permits the capability
    fn minimum_level_for(&self, capability: &str) -> Option<TrustLevel> {
        TrustLevel::all().into_iter().find(|level| {
            self.policies
                .get(level)
                .map(|p| {
                    p.allowed_capabilities.contains(capability)
                        && !p.denied_capabilities.contains(capability)
                })
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugon_core::types::{EvidenceKind, TrustEvidence, ViolationAction};

    fn engine() -> TrustEngine {
        TrustEngine::new(EventBus::default())
    }

    fn assignment(name: &str, version: Option<&str>, level: TrustLevel) -> TrustAssignment {
        TrustAssignment {
            id: Uuid::new_v4(),
            plugin_name: name.to_string(),
            version: version.map(|v| v.to_string()),
            trust_level: level,
            assigned_by: "test".to_string(),
            assigned_at: Utc::now(),
            reason: "test".to_string(),
            evidence: vec![TrustEvidence {
                kind: EvidenceKind::Audit,
                score: 90,
                detail: "reviewed".to_string(),
                recorded_at: Utc::now(),
            }],
            valid_until: None,
            review_required: false,
            is_active: true,
        }
    }

    fn manifest_with_permissions(services: &[&str]) -> PluginManifest {
        serde_json::from_value(serde_json::json!({
            "name": "subject",
            "version": "1.0.0",
            "description": "d",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Subject",
            "compatibilityVersion": "1.0.0",
            "permissions": { "services": services, "modules": [] }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_default_level_is_untrusted() {
        let engine = engine();
        assert_eq!(
            engine.get_trust_level("unknown", None).await,
            TrustLevel::Untrusted
        );
    }

    #[tokio::test]
    async fn test_fallback_chain() {
        let engine = engine();
        engine
            .assign_trust_level(assignment("p", None, TrustLevel::Community))
            .await
            .unwrap();
        engine
            .assign_trust_level(assignment("p", Some("2.0.0"), TrustLevel::Verified))
            .await
            .unwrap();

        // version-scoped wins for that version
        assert_eq!(
            engine.get_trust_level("p", Some("2.0.0")).await,
            TrustLevel::Verified
        );
        // other versions fall back to the name-wide assignment
        assert_eq!(
            engine.get_trust_level("p", Some("1.0.0")).await,
            TrustLevel::Community
        );
        assert_eq!(engine.get_trust_level("p", None).await, TrustLevel::Community);
    }

    #[tokio::test]
    async fn test_assignment_supersedes_previous_active() {
        let engine = engine();
        engine
            .assign_trust_level(assignment("p", None, TrustLevel::Community))
            .await
            .unwrap();
        engine
            .assign_trust_level(assignment("p", None, TrustLevel::Verified))
            .await
            .unwrap();

        assert_eq!(engine.get_trust_level("p", None).await, TrustLevel::Verified);

        // exactly one active row per key; superseded rows stay for audit
        let rows = engine.assignments.read().await;
        let active: Vec<_> = rows
            .iter()
            .filter(|a| a.is_active && a.plugin_name == "p" && a.version.is_none())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_assignment_is_ignored() {
        let engine = engine();
        let mut expired = assignment("p", None, TrustLevel::Internal);
        expired.valid_until = Some(Utc::now() - chrono::Duration::hours(1));
        engine.assign_trust_level(expired).await.unwrap();

        assert_eq!(engine.get_trust_level("p", None).await, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn test_capability_gating() {
        let engine = engine();
        // untrusted plugin: api.routes allowed, filesystem denied
        assert!(engine.can_perform_capability("p", "api.routes", None).await);
        assert!(!engine.can_perform_capability("p", "filesystem", None).await);

        engine
            .assign_trust_level(assignment("p", None, TrustLevel::Verified))
            .await
            .unwrap();
        assert!(engine.can_perform_capability("p", "filesystem", None).await);
        assert!(!engine.can_perform_capability("p", "process", None).await);
    }

    #[tokio::test]
    async fn test_policy_validation_flags_filesystem_for_untrusted() {
        let engine = engine();
        let manifest = manifest_with_permissions(&["filesystem"]);
        let validation = engine.validate_against_policy("subject", &manifest, None).await;

        assert!(!validation.is_valid);
        assert_eq!(validation.violations, vec!["filesystem".to_string()]);
        assert!(validation.required_actions[0].contains("VERIFIED"));
    }

    #[tokio::test]
    async fn test_policy_validation_passes_within_policy() {
        let engine = engine();
        let manifest = manifest_with_permissions(&["logging"]);
        let validation = engine.validate_against_policy("subject", &manifest, None).await;
        assert!(validation.is_valid);
        assert!(validation.violations.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_capability_reported() {
        let engine = engine();
        let manifest = manifest_with_permissions(&["quantum-entanglement"]);
        let validation = engine.validate_against_policy("subject", &manifest, None).await;
        assert!(!validation.is_valid);
        assert!(validation.required_actions[0].contains("catalog"));
    }

    #[tokio::test]
    async fn test_violation_ledger() {
        let engine = engine();
        engine
            .record_violation(TrustViolation {
                id: Uuid::new_v4(),
                plugin_name: "p".to_string(),
                version: Some("1.0.0".to_string()),
                capability: Some("filesystem".to_string()),
                severity: ViolationSeverity::High,
                action: ViolationAction::Quarantine,
                description: "requested filesystem at UNTRUSTED".to_string(),
                recorded_at: Utc::now(),
            })
            .await;

        let violations = engine.violations_for("p").await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::High);
        assert!(engine.violations_for("other").await.is_empty());
    }

    #[tokio::test]
    async fn test_small_change_auto_applies() {
        let engine = engine();
        let status = engine
            .request_change(TrustChangeRequest {
                id: Uuid::new_v4(),
                plugin_name: "p".to_string(),
                version: None,
                current_level: TrustLevel::Untrusted,
                requested_level: TrustLevel::Community,
                requested_by: "admin".to_string(),
                reason: "looks fine".to_string(),
                requested_at: Utc::now(),
                status: ChangeRequestStatus::Pending,
            })
            .await
            .unwrap();

        assert_eq!(status, ChangeRequestStatus::AutoApplied);
        assert_eq!(engine.get_trust_level("p", None).await, TrustLevel::Community);
    }

    #[tokio::test]
    async fn test_large_change_queues_for_review() {
        let engine = engine();
        let status = engine
            .request_change(TrustChangeRequest {
                id: Uuid::new_v4(),
                plugin_name: "p".to_string(),
                version: None,
                current_level: TrustLevel::Untrusted,
                requested_level: TrustLevel::Internal,
                requested_by: "admin".to_string(),
                reason: "promote to internal".to_string(),
                requested_at: Utc::now(),
                status: ChangeRequestStatus::Pending,
            })
            .await
            .unwrap();

        assert_eq!(status, ChangeRequestStatus::Pending);
        // not applied
        assert_eq!(engine.get_trust_level("p", None).await, TrustLevel::Untrusted);
        assert_eq!(engine.pending_changes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_from_risk() {
        let engine = engine();
        assert_eq!(
            engine.severity_for_capability("process"),
            ViolationSeverity::Critical
        );
        assert_eq!(
            engine.severity_for_capability("filesystem"),
            ViolationSeverity::High
        );
        assert_eq!(
            engine.severity_for_capability("logging"),
            ViolationSeverity::Low
        );
        assert_eq!(
            engine.severity_for_capability("unknown"),
            ViolationSeverity::High
        );
    }

    #[tokio::test]
    async fn test_assignment_emits_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let engine = TrustEngine::new(bus);

        engine
            .assign_trust_level(assignment("p", None, TrustLevel::Verified))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            PluginEvent::TrustAssigned {
                plugin_name,
                trust_level,
                ..
            } => {
                assert_eq!(plugin_name, "p");
                assert_eq!(trust_level, TrustLevel::Verified);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
