//! Plan-tier resolution.
//!
//! A plan maps limit kinds to quota profiles; accounts are assigned to a
//! plan, and an identifier that resolves to a known account has its plan's
//! limits override the endpoint defaults. Read-only at evaluation time.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::identifier::{Identifier, LimitKind};
use super::rules::LimitProfile;
use crate::error::{BreakwaterError, Result};

/// A subscription-plan quota profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    /// Per-kind limits this plan grants.
    #[serde(default)]
    pub limits: HashMap<LimitKind, LimitProfile>,
}

/// Maps identifiers to plans and plans to quota profiles.
///
/// The plan table is an immutable snapshot swapped whole; account
/// assignments are a concurrent map mutated by infrequent admin calls.
pub struct PlanResolver {
    plans: RwLock<Arc<HashMap<String, Arc<Plan>>>>,
    /// account identifier value -> plan name
    assignments: DashMap<String, String>,
}

impl PlanResolver {
    /// Build a resolver from configured plans.
    pub fn new(plans: Vec<Plan>) -> Result<Self> {
        let mut table = HashMap::new();
        for plan in plans {
            if plan.name.is_empty() {
                return Err(BreakwaterError::Validation(
                    "plan name must not be empty".to_string(),
                ));
            }
            if table
                .insert(plan.name.clone(), Arc::new(plan))
                .is_some()
            {
                return Err(BreakwaterError::Validation(
                    "duplicate plan name".to_string(),
                ));
            }
        }
        Ok(Self {
            plans: RwLock::new(Arc::new(table)),
            assignments: DashMap::new(),
        })
    }

    /// Assign an account identifier to a plan tier.
    pub fn assign(&self, account: &str, plan_name: &str) -> Result<()> {
        let plans = self.plans.read().clone();
        if !plans.contains_key(plan_name) {
            return Err(BreakwaterError::Validation(format!(
                "unknown plan: {}",
                plan_name
            )));
        }
        self.assignments
            .insert(account.to_string(), plan_name.to_string());
        debug!(account = %account, plan = %plan_name, "Plan assigned");
        Ok(())
    }

    /// Remove an account's assignment, dropping it back to defaults.
    pub fn unassign(&self, account: &str) -> Result<()> {
        self.assignments
            .remove(account)
            .map(|_| ())
            .ok_or_else(|| BreakwaterError::NotFound(format!("no plan assignment for {}", account)))
    }

    /// Resolve an identifier to its plan, if any. IPs never map to a plan;
    /// only account-shaped identifiers (user, email, token) do.
    pub fn resolve(&self, identifier: &Identifier) -> Option<Arc<Plan>> {
        if identifier.kind() == LimitKind::Ip {
            return None;
        }
        let plan_name = self.assignments.get(identifier.value())?.clone();
        self.plans.read().get(&plan_name).cloned()
    }

    /// The plan's limit for one kind, if the plan defines it.
    pub fn plan_limit(plan: &Plan, kind: LimitKind) -> Option<LimitProfile> {
        plan.limits.get(&kind).copied()
    }

    /// Currently-tracked identifiers per plan tier. Observability only.
    pub fn distribution(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.assignments.iter() {
            *counts.entry(entry.value().clone()).or_default() += 1;
        }
        counts
    }

    /// The configured plans.
    pub fn plans(&self) -> Vec<Arc<Plan>> {
        self.plans.read().values().cloned().collect()
    }

    /// Publish a new plan table. Existing assignments pointing at plans
    /// that no longer exist silently fall back to defaults at resolve time.
    pub fn set_plans(&self, plans: Vec<Plan>) -> Result<()> {
        let next = Self::new(plans)?;
        *self.plans.write() = next.plans.read().clone();
        Ok(())
    }
}
