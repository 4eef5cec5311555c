//! Row policies, resolved per principal.
//!
//! Only the effective set is computed here: which policies apply to a user
//! and its enabled roles. Conditions stay text. An [`EnabledRowPolicies`]
//! handed out by [`StorageRowPolicyProvider`] is refreshed in place whenever
//! a row policy changes, so holders never see a stale set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use palisade_types::{EntityId, EntityKind, RoleId, UserId};
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{ExpiringCache, LiveHandles};
use crate::entities::{ConditionType, Entity, RowPolicy};
use crate::storage::{AccessStorage, Subscription};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MixedConditions {
    conditions: BTreeMap<ConditionType, Vec<String>>,
    policy_ids: Vec<EntityId>,
}

type ConditionsByTable = HashMap<(String, String), MixedConditions>;

/// Row-policy conditions in effect for one principal.
#[derive(Debug, Default)]
pub struct EnabledRowPolicies {
    user: Option<UserId>,
    enabled_roles: BTreeSet<RoleId>,
    by_table: RwLock<Arc<ConditionsByTable>>,
}

impl EnabledRowPolicies {
    /// No policies at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A principal with no policies yet; fill it with
    /// [`set_policies`](Self::set_policies).
    pub fn new(user: UserId, enabled_roles: BTreeSet<RoleId>) -> Self {
        Self {
            user: Some(user),
            enabled_roles,
            by_table: RwLock::default(),
        }
    }

    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    pub fn enabled_roles(&self) -> &BTreeSet<RoleId> {
        &self.enabled_roles
    }

    /// Replaces the conditions with those of the `policies` that apply to
    /// this principal. Conditions are combined in iteration order.
    pub fn set_policies<'a>(&self, policies: impl IntoIterator<Item = (EntityId, &'a RowPolicy)>) {
        let mut by_table = ConditionsByTable::new();
        if let Some(user) = self.user {
            for (id, policy) in policies {
                if !policy.to.matches_any(user, &self.enabled_roles) {
                    continue;
                }
                let mixed = by_table
                    .entry((policy.database.clone(), policy.table.clone()))
                    .or_default();
                mixed.policy_ids.push(id);
                for (kind, expression) in &policy.conditions {
                    mixed
                        .conditions
                        .entry(*kind)
                        .or_default()
                        .push(expression.clone());
                }
            }
        }
        *self.by_table.write() = Arc::new(by_table);
    }

    fn snapshot(&self) -> Arc<ConditionsByTable> {
        Arc::clone(&self.by_table.read())
    }

    /// The combined condition for a table, or `None` when no policy filters
    /// it. Conditions of several policies are joined with `OR`.
    pub fn condition(&self, database: &str, table: &str, kind: ConditionType) -> Option<String> {
        let by_table = self.snapshot();
        let conditions = by_table
            .get(&(database.to_string(), table.to_string()))?
            .conditions
            .get(&kind)?;
        match conditions.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(
                many.iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            ),
        }
    }

    /// Like [`condition`](Self::condition), additionally requiring `extra`.
    pub fn condition_with(
        &self,
        database: &str,
        table: &str,
        kind: ConditionType,
        extra: Option<&str>,
    ) -> Option<String> {
        match (self.condition(database, table, kind), extra) {
            (Some(condition), Some(extra)) => Some(format!("({condition}) AND ({extra})")),
            (Some(condition), None) => Some(condition),
            (None, extra) => extra.map(str::to_string),
        }
    }

    /// Every policy applied to this principal.
    pub fn policy_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .snapshot()
            .values()
            .flat_map(|mixed| mixed.policy_ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Policies applied to one table.
    pub fn policy_ids_for(&self, database: &str, table: &str) -> Vec<EntityId> {
        self.snapshot()
            .get(&(database.to_string(), table.to_string()))
            .map(|mixed| mixed.policy_ids.clone())
            .unwrap_or_default()
    }
}

/// Supplies the row policies of a principal.
pub trait RowPolicyProvider: Send + Sync {
    fn row_policies(&self, user: UserId, enabled_roles: &BTreeSet<RoleId>) -> Arc<EnabledRowPolicies>;
}

type RowPolicyKey = (UserId, Vec<RoleId>);

/// Row policies from the storage, sorted by full name.
fn load_policies(storage: &dyn AccessStorage) -> Vec<(EntityId, Arc<Entity>)> {
    let mut policies: Vec<(String, EntityId, Arc<Entity>)> = storage
        .ids_of_kind(EntityKind::RowPolicy)
        .into_iter()
        .filter_map(|id| {
            let entity = storage.try_read(id)?;
            Some((entity.name(), id, entity))
        })
        .collect();
    policies.sort_by(|a, b| a.0.cmp(&b.0));
    policies.into_iter().map(|(_, id, entity)| (id, entity)).collect()
}

fn fill(enabled: &EnabledRowPolicies, policies: &[(EntityId, Arc<Entity>)]) {
    enabled.set_policies(
        policies
            .iter()
            .filter_map(|(id, entity)| Some((*id, entity.as_row_policy()?))),
    );
}

/// Computes row policies from the storage.
///
/// Equal principals share one [`EnabledRowPolicies`] while it stays cached.
/// Every instance handed out, cached or not, is refreshed when any row
/// policy changes.
pub struct StorageRowPolicyProvider {
    storage: Arc<dyn AccessStorage>,
    cache: ExpiringCache<RowPolicyKey, Arc<EnabledRowPolicies>>,
    live: Arc<LiveHandles<EnabledRowPolicies>>,
    _subscription: Subscription,
}

impl StorageRowPolicyProvider {
    pub fn new(storage: Arc<dyn AccessStorage>, capacity: usize, ttl: Duration) -> Self {
        let live = Arc::new(LiveHandles::new());
        let subscription = refresh_on_change(&storage, &live);
        Self {
            storage,
            cache: ExpiringCache::new(capacity, ttl),
            live,
            _subscription: subscription,
        }
    }

    /// Instances still referenced somewhere.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

fn refresh_on_change(
    storage: &Arc<dyn AccessStorage>,
    live: &Arc<LiveHandles<EnabledRowPolicies>>,
) -> Subscription {
    let weak_storage: Weak<dyn AccessStorage> = Arc::downgrade(storage);
    let live = Arc::downgrade(live);
    storage.subscribe_kind(
        EntityKind::RowPolicy,
        Arc::new(move |id: EntityId, _: Option<Arc<Entity>>| {
            let (Some(storage), Some(live)) = (weak_storage.upgrade(), live.upgrade()) else {
                return;
            };
            live.refresh(|handles| {
                let policies = load_policies(storage.as_ref());
                debug!(policy = %id, instances = handles.len(), "refreshing row policies");
                for enabled in handles {
                    fill(enabled, &policies);
                }
            });
        }),
    )
}

impl RowPolicyProvider for StorageRowPolicyProvider {
    fn row_policies(&self, user: UserId, enabled_roles: &BTreeSet<RoleId>) -> Arc<EnabledRowPolicies> {
        let key = (user, enabled_roles.iter().copied().collect());
        self.cache.get_or_insert_with(key, Instant::now(), || {
            debug!(%user, "computing row policies");
            let enabled = Arc::new(EnabledRowPolicies::new(user, enabled_roles.clone()));
            self.live.register(&enabled, |enabled| {
                fill(enabled, &load_policies(self.storage.as_ref()));
            });
            enabled
        })
    }
}

impl fmt::Debug for StorageRowPolicyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRowPolicyProvider")
            .field("cached", &self.cache.len())
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Role, RoleSet, User};
    use crate::storage::MemoryStorage;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        alice: UserId,
        analyst: RoleId,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let alice = storage.insert(User::new("alice").into()).unwrap();
        let analyst = storage.insert(Role::new("analyst").into()).unwrap();
        Fixture {
            storage,
            alice,
            analyst,
        }
    }

    fn provider(f: &Fixture) -> StorageRowPolicyProvider {
        StorageRowPolicyProvider::new(f.storage.clone(), 16, Duration::from_secs(60))
    }

    #[test]
    fn conditions_are_or_combined() {
        let f = fixture();
        f.storage
            .insert(
                RowPolicy::new("own", "db", "t")
                    .with_condition(ConditionType::SelectFilter, "owner = 'alice'")
                    .to(RoleSet::from_ids([f.alice]))
                    .into(),
            )
            .unwrap();
        f.storage
            .insert(
                RowPolicy::new("public", "db", "t")
                    .with_condition(ConditionType::SelectFilter, "public")
                    .to(RoleSet::from_ids([f.analyst]))
                    .into(),
            )
            .unwrap();
        f.storage
            .insert(
                RowPolicy::new("others", "db", "t")
                    .with_condition(ConditionType::SelectFilter, "1 = 0")
                    .to(RoleSet::all().except([f.alice]))
                    .into(),
            )
            .unwrap();

        let provider = provider(&f);
        let only_user = provider.row_policies(f.alice, &BTreeSet::new());
        assert_eq!(
            only_user.condition("db", "t", ConditionType::SelectFilter).as_deref(),
            Some("owner = 'alice'")
        );
        assert_eq!(only_user.policy_ids_for("db", "t").len(), 1);

        let with_role = provider.row_policies(f.alice, &BTreeSet::from([f.analyst]));
        // The analyst role also matches `ALL EXCEPT alice`.
        assert_eq!(
            with_role.condition("db", "t", ConditionType::SelectFilter).as_deref(),
            Some("(1 = 0) OR (owner = 'alice') OR (public)")
        );
        assert_eq!(with_role.policy_ids().len(), 3);
        assert!(with_role.condition("db", "t", ConditionType::InsertCheck).is_none());
        assert!(with_role.condition("db", "other", ConditionType::SelectFilter).is_none());
    }

    #[test]
    fn extra_condition_is_and_combined() {
        let f = fixture();
        f.storage
            .insert(
                RowPolicy::new("own", "db", "t")
                    .with_condition(ConditionType::SelectFilter, "a = 1")
                    .to(RoleSet::all())
                    .into(),
            )
            .unwrap();
        let policies = provider(&f).row_policies(f.alice, &BTreeSet::new());
        assert_eq!(
            policies
                .condition_with("db", "t", ConditionType::SelectFilter, Some("b = 2"))
                .as_deref(),
            Some("(a = 1) AND (b = 2)")
        );
        assert_eq!(
            policies
                .condition_with("db", "u", ConditionType::SelectFilter, Some("b = 2"))
                .as_deref(),
            Some("b = 2")
        );
    }

    #[test]
    fn handed_out_policies_follow_changes() {
        let f = fixture();
        let provider = provider(&f);
        let before = provider.row_policies(f.alice, &BTreeSet::new());
        assert!(before.policy_ids().is_empty());
        assert!(Arc::ptr_eq(&before, &provider.row_policies(f.alice, &BTreeSet::new())));

        let id = f
            .storage
            .insert(
                RowPolicy::new("p", "db", "t")
                    .with_condition(ConditionType::SelectFilter, "level >= 3")
                    .to(RoleSet::all())
                    .into(),
            )
            .unwrap();
        assert_eq!(before.policy_ids(), vec![id]);
        assert_eq!(
            before.condition("db", "t", ConditionType::SelectFilter).as_deref(),
            Some("level >= 3")
        );

        f.storage.remove(id).unwrap();
        assert!(before.condition("db", "t", ConditionType::SelectFilter).is_none());
    }

    #[test]
    fn expired_instances_are_still_refreshed() {
        let f = fixture();
        let provider = StorageRowPolicyProvider::new(f.storage.clone(), 1, Duration::from_secs(60));
        let held = provider.row_policies(f.alice, &BTreeSet::new());
        // Evicts the first instance from the one-entry cache.
        let other = provider.row_policies(f.alice, &BTreeSet::from([f.analyst]));
        assert_eq!(provider.live_count(), 2);

        f.storage
            .insert(RowPolicy::new("p", "db", "t").to(RoleSet::from_ids([f.alice])).into())
            .unwrap();
        assert_eq!(held.policy_ids_for("db", "t").len(), 1);
        assert_eq!(other.policy_ids_for("db", "t").len(), 1);

        drop(held);
        assert_eq!(provider.live_count(), 1);
    }

    #[test]
    fn empty_principal_matches_nothing() {
        let f = fixture();
        f.storage
            .insert(RowPolicy::new("p", "db", "t").to(RoleSet::all()).into())
            .unwrap();
        let empty = EnabledRowPolicies::empty();
        let policies = load_policies(f.storage.as_ref());
        fill(&empty, &policies);
        assert!(empty.policy_ids().is_empty());
        assert_eq!(empty.user(), None);
    }
}
