//! Audit logging
//!
//! Mutations of external systems and breaker transitions are emitted on the
//! `audit` tracing target, tagged with the component and the affected
//! resource keys, so they can be filtered apart from operational logs
//! (`RUST_LOG=audit=info`).

use std::sync::Arc;

use crate::model::{Action, ResourceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Audit,
    Warn,
    Error,
}

/// Audit logger with reconciliation-specific methods
pub struct AuditLogger {
    component: String,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }

    pub fn log(&self, level: AuditLevel, message: impl AsRef<str>, objects: &[&ResourceKey]) {
        let message = message.as_ref();
        let objects: Vec<String> = objects.iter().map(|k| k.to_string()).collect();
        match level {
            AuditLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?objects, "{}", message)
            }
            AuditLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?objects, "{}", message)
            }
            AuditLevel::Audit => {
                tracing::info!(target: "audit", component = %self.component, objects = ?objects, "{}", message)
            }
        }
    }

    // === Reconciliation Events ===

    pub fn action_applied(&self, key: &ResourceKey, action: &Action, revision: u64) {
        self.log(
            AuditLevel::Audit,
            format!("{}: {} (revision {})", key, action, revision),
            &[key],
        );
    }

    pub fn attempt_failed(&self, key: &ResourceKey, detail: &str) {
        self.log(
            AuditLevel::Error,
            format!("{}: reconciliation failed: {}", key, detail),
            &[key],
        );
    }

    pub fn commit_conflict(&self, key: &ResourceKey, expected: u64, actual: u64) {
        self.log(
            AuditLevel::Warn,
            format!(
                "{}: commit lost to concurrent writer (expected revision {}, found {})",
                key, expected, actual
            ),
            &[key],
        );
    }

    // === Circuit Breaker Events ===

    pub fn degraded(&self, key: &ResourceKey, consecutive_failures: u32) {
        self.log(
            AuditLevel::Error,
            format!(
                "{}: degraded after {} consecutive failures, automatic retries suspended",
                key, consecutive_failures
            ),
            &[key],
        );
    }

    pub fn forced(&self, key: &ResourceKey, consecutive_failures: u32) {
        self.log(
            AuditLevel::Warn,
            format!(
                "{}: forced reconciliation past {} consecutive failures",
                key, consecutive_failures
            ),
            &[key],
        );
    }

    // === Desired State Events ===

    pub fn untracked(&self, key: &ResourceKey) {
        self.log(
            AuditLevel::Audit,
            format!("{}: removed from desired state, no longer tracked", key),
            &[key],
        );
    }
}

pub fn create_audit_logger(component: &str) -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new(component))
}
