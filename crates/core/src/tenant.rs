use crate::error::{WorkflowError, WorkflowResult};
use crate::settings::EngineSettings;
use crate::types::WorkflowDirection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Unique identifier for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Tenant used for every request when multi-tenancy is disabled
    pub const DEFAULT: &'static str = "_default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_tenant() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-flight workflow counters for one tenant
#[derive(Debug, Default)]
pub struct TenantQuota {
    active_provisions: AtomicUsize,
    active_deprovisions: AtomicUsize,
}

impl TenantQuota {
    fn counter(&self, direction: WorkflowDirection) -> &AtomicUsize {
        match direction {
            WorkflowDirection::Provision => &self.active_provisions,
            WorkflowDirection::Deprovision => &self.active_deprovisions,
        }
    }

    pub fn active(&self, direction: WorkflowDirection) -> usize {
        self.counter(direction).load(Ordering::Acquire)
    }

    /// Increment only while below `max`. Returns the count observed on rejection.
    fn try_increment(&self, direction: WorkflowDirection, max: usize) -> Result<(), usize> {
        self.counter(direction)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|_| ())
    }

    fn decrement(&self, direction: WorkflowDirection) {
        // Saturating: a counter never goes below zero.
        let _ = self
            .counter(direction)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// Gates how many provision/deprovision workflows each tenant runs at once
pub struct TenantAdmissionController {
    quotas: Mutex<HashMap<TenantId, Arc<TenantQuota>>>,
    multi_tenancy_enabled: bool,
    max_active_provisions: usize,
    max_active_deprovisions: usize,
}

impl TenantAdmissionController {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            quotas: Mutex::new(HashMap::new()),
            multi_tenancy_enabled: settings.multi_tenancy_enabled,
            max_active_provisions: settings.max_active_provisions_per_tenant,
            max_active_deprovisions: settings.max_active_deprovisions_per_tenant,
        }
    }

    /// Resolve the tenant a request is accounted against
    pub fn effective_tenant(&self, tenant_id: Option<&TenantId>) -> TenantId {
        match tenant_id {
            Some(tenant) if self.multi_tenancy_enabled => tenant.clone(),
            _ => TenantId::default_tenant(),
        }
    }

    fn max_for(&self, direction: WorkflowDirection) -> usize {
        match direction {
            WorkflowDirection::Provision => self.max_active_provisions,
            WorkflowDirection::Deprovision => self.max_active_deprovisions,
        }
    }

    fn quota(&self, tenant: &TenantId) -> Arc<TenantQuota> {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        quotas.entry(tenant.clone()).or_default().clone()
    }

    /// Admit one workflow execution for the tenant, or reject it without side effects.
    ///
    /// The returned permit releases the slot when dropped.
    pub fn try_acquire(
        &self,
        tenant_id: Option<&TenantId>,
        direction: WorkflowDirection,
    ) -> WorkflowResult<AdmissionPermit> {
        let tenant = self.effective_tenant(tenant_id);
        let max = self.max_for(direction);
        let quota = self.quota(&tenant);

        match quota.try_increment(direction, max) {
            Ok(()) => {
                tracing::debug!(
                    "Admitted {} for tenant {} ({} active)",
                    direction,
                    tenant,
                    quota.active(direction)
                );
                Ok(AdmissionPermit {
                    tenant,
                    direction,
                    quota,
                })
            }
            Err(active) => {
                tracing::warn!(
                    "Rejected {} for tenant {}: {} of {} slots in use",
                    direction,
                    tenant,
                    active,
                    max
                );
                Err(WorkflowError::AdmissionRejected {
                    tenant,
                    direction,
                    active,
                    max,
                })
            }
        }
    }

    /// Current in-flight count for a tenant
    pub fn active(&self, tenant_id: Option<&TenantId>, direction: WorkflowDirection) -> usize {
        let tenant = self.effective_tenant(tenant_id);
        self.quotas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tenant)
            .map(|q| q.active(direction))
            .unwrap_or(0)
    }
}

/// A held admission slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct AdmissionPermit {
    tenant: TenantId,
    direction: WorkflowDirection,
    quota: Arc<TenantQuota>,
}

impl AdmissionPermit {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn direction(&self) -> WorkflowDirection {
        self.direction
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.quota.decrement(self.direction);
        tracing::debug!(
            "Released {} slot for tenant {}",
            self.direction,
            self.tenant
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(multi_tenant: bool, max_provisions: usize) -> TenantAdmissionController {
        let settings = EngineSettings {
            multi_tenancy_enabled: multi_tenant,
            max_active_provisions_per_tenant: max_provisions,
            max_active_deprovisions_per_tenant: 1,
            ..EngineSettings::default()
        };
        TenantAdmissionController::new(&settings)
    }

    #[test]
    fn test_third_provision_rejected_until_one_finishes() {
        let controller = controller(true, 2);
        let tenant = TenantId::new("acme");

        let first = controller
            .try_acquire(Some(&tenant), WorkflowDirection::Provision)
            .unwrap();
        let _second = controller
            .try_acquire(Some(&tenant), WorkflowDirection::Provision)
            .unwrap();

        let third = controller.try_acquire(Some(&tenant), WorkflowDirection::Provision);
        assert!(matches!(
            third,
            Err(WorkflowError::AdmissionRejected { active: 2, max: 2, .. })
        ));

        drop(first);
        assert_eq!(controller.active(Some(&tenant), WorkflowDirection::Provision), 1);
        controller
            .try_acquire(Some(&tenant), WorkflowDirection::Provision)
            .unwrap();
    }

    #[test]
    fn test_tenants_are_isolated() {
        let controller = controller(true, 1);
        let _a = controller
            .try_acquire(Some(&TenantId::new("a")), WorkflowDirection::Provision)
            .unwrap();
        controller
            .try_acquire(Some(&TenantId::new("b")), WorkflowDirection::Provision)
            .unwrap();
    }

    #[test]
    fn test_directions_are_counted_separately() {
        let controller = controller(true, 1);
        let tenant = TenantId::new("a");
        let _p = controller
            .try_acquire(Some(&tenant), WorkflowDirection::Provision)
            .unwrap();
        let _d = controller
            .try_acquire(Some(&tenant), WorkflowDirection::Deprovision)
            .unwrap();
        assert!(controller
            .try_acquire(Some(&tenant), WorkflowDirection::Deprovision)
            .is_err());
    }

    #[test]
    fn test_single_tenant_mode_applies_bound_globally() {
        let controller = controller(false, 1);
        let _a = controller
            .try_acquire(Some(&TenantId::new("a")), WorkflowDirection::Provision)
            .unwrap();
        let b = controller.try_acquire(Some(&TenantId::new("b")), WorkflowDirection::Provision);
        assert!(b.is_err());
        assert_eq!(controller.active(None, WorkflowDirection::Provision), 1);
    }

    #[test]
    fn test_counter_never_goes_negative() {
        let quota = TenantQuota::default();
        quota.decrement(WorkflowDirection::Provision);
        assert_eq!(quota.active(WorkflowDirection::Provision), 0);
    }

    #[test]
    fn test_concurrent_acquire_respects_bound() {
        let controller = Arc::new(controller(true, 3));
        let tenant = TenantId::new("busy");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let controller = controller.clone();
                let tenant = tenant.clone();
                std::thread::spawn(move || {
                    controller
                        .try_acquire(Some(&tenant), WorkflowDirection::Provision)
                        .ok()
                })
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 3);
        drop(permits);
        assert_eq!(controller.active(Some(&tenant), WorkflowDirection::Provision), 0);
    }
}
