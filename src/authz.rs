//! Role based access control.
//!
//! Rules are loaded from the [`PolicyStore`] into a casbin enforcer and
//! periodically reloaded. Checks only read the in-memory copy.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use casbin::prelude::*;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errno;
use crate::error::{ApiError, Result};
use crate::known::{ROLE_ADMIN, ROLE_USER};
use crate::model::PolicyRule;
use crate::proto::SERVICE_NAME;
use crate::store::PolicyStore;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Action checked on gRPC calls.
pub const ACTION_CALL: &str = "CALL";

const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && keyMatch(r.obj, p.obj) && (r.act == p.act || p.act == "*")
"#;

/// Rules applied to a fresh deployment.
pub fn default_policies() -> Vec<PolicyRule> {
    let rpc = |method: &str| format!("/{SERVICE_NAME}/{method}");

    vec![
        PolicyRule::policy(ROLE_ADMIN, "*", "*", "allow"),
        PolicyRule::policy(ROLE_USER, &rpc("*"), ACTION_CALL, "allow"),
        PolicyRule::policy(ROLE_USER, &rpc("DeleteUser"), ACTION_CALL, "deny"),
        PolicyRule::policy(ROLE_USER, "/v1/*", "*", "allow"),
        PolicyRule::policy(ROLE_USER, "/v1/users/*", "DELETE", "deny"),
    ]
}

fn operation_failed(err: casbin::Error) -> ApiError {
    tracing::error!(error = %err, "authorization engine failure");
    errno::ERR_OPERATION_FAILED.with_message(err.to_string())
}

struct Snapshot {
    enforcer: Enforcer,
    groupings: HashSet<(String, String)>,
}

impl Snapshot {
    async fn build(rules: &[PolicyRule]) -> Result<Self> {
        let model = DefaultModel::from_str(MODEL).await.map_err(operation_failed)?;
        let mut enforcer = Enforcer::new(model, MemoryAdapter::default())
            .await
            .map_err(operation_failed)?;

        let mut policies = BTreeSet::new();
        let mut groupings = BTreeSet::new();
        for rule in rules {
            match rule.ptype.as_str() {
                "p" => {
                    let effect = if rule.v3.is_empty() { "allow" } else { rule.v3.as_str() };
                    policies.insert(vec![
                        rule.v0.clone(),
                        rule.v1.clone(),
                        rule.v2.clone(),
                        effect.to_owned(),
                    ]);
                },
                "g" => {
                    groupings.insert(vec![rule.v0.clone(), rule.v1.clone()]);
                },
                other => tracing::warn!(ptype = other, "unknown policy type skipped"),
            }
        }

        if !policies.is_empty() {
            enforcer
                .add_policies(policies.into_iter().collect())
                .await
                .map_err(operation_failed)?;
        }

        let set = groupings
            .iter()
            .map(|g| (g[0].clone(), g[1].clone()))
            .collect();
        if !groupings.is_empty() {
            enforcer
                .add_grouping_policies(groupings.into_iter().collect())
                .await
                .map_err(operation_failed)?;
        }

        Ok(Self {
            enforcer,
            groupings: set,
        })
    }
}

/// Subject/object/action authorizer.
pub struct Authorizer {
    snapshot: RwLock<Snapshot>,
    /// Held by reloads and live updates, so an update is never replaced by
    /// rules loaded before it.
    updates: Mutex<()>,
    store: Arc<dyn PolicyStore>,
}

impl Authorizer {
    /// Create an [`Authorizer`] loaded with the rules of `store`.
    pub async fn new(store: Arc<dyn PolicyStore>) -> Result<Self> {
        let rules = store.load().await?;
        let snapshot = Snapshot::build(&rules).await?;
        tracing::debug!(rules = rules.len(), "authorization rules loaded");

        Ok(Self {
            snapshot: RwLock::new(snapshot),
            updates: Mutex::new(()),
            store,
        })
    }

    /// Whether `subject` may perform `action` on `object`.
    pub async fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        self.snapshot
            .read()
            .await
            .enforcer
            .enforce((subject, object, action))
            .map_err(operation_failed)
    }

    /// Same as [`Authorizer::authorize`], denial becomes `PermissionDenied`.
    pub async fn check(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        if self.authorize(subject, object, action).await? {
            return Ok(());
        }

        Err(errno::ERR_PERMISSION_DENIED.with_message(format!(
            "access denied: subject={subject}, object={object}, action={action}, reason=no matching allow rule"
        )))
    }

    pub async fn has_role(&self, subject: &str, role: &str) -> bool {
        self.snapshot
            .read()
            .await
            .groupings
            .contains(&(subject.to_owned(), role.to_owned()))
    }

    /// Grant `role` to `subject` on the live rules.
    pub async fn add_grouping(&self, subject: &str, role: &str) -> Result<()> {
        let _updates = self.updates.lock().await;
        let mut snapshot = self.snapshot.write().await;
        snapshot
            .enforcer
            .add_grouping_policy(vec![subject.to_owned(), role.to_owned()])
            .await
            .map_err(operation_failed)?;
        snapshot
            .groupings
            .insert((subject.to_owned(), role.to_owned()));
        Ok(())
    }

    /// Drop every role of `subject` from the live rules.
    pub async fn remove_subject(&self, subject: &str) -> Result<()> {
        let _updates = self.updates.lock().await;
        let mut snapshot = self.snapshot.write().await;
        snapshot
            .enforcer
            .remove_filtered_grouping_policy(0, vec![subject.to_owned()])
            .await
            .map_err(operation_failed)?;
        snapshot.groupings.retain(|(user, _)| user != subject);
        Ok(())
    }

    /// Reload every rule from storage.
    pub async fn refresh(&self) -> Result<()> {
        let _updates = self.updates.lock().await;
        let rules = self.store.load().await?;
        let fresh = Snapshot::build(&rules).await?;
        *self.snapshot.write().await = fresh;
        Ok(())
    }

    /// Reload rules every `interval` until `shutdown` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately, rules are already loaded.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("authorization refresher stopped");
                        break;
                    },
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            tracing::error!(error = %err, "failed to refresh authorization rules");
                        }
                    },
                }
            }
        })
    }
}
