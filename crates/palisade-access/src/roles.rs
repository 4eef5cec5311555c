//! Role resolution: from the roles a session activates to every role they
//! transitively enable, and the union of their privileges.
//!
//! ```text
//!   current roles ──▶ BFS over granted roles ──▶ EnabledRolesInfo
//!        │                  (visited set)           │
//!        └── RoleCache key ◀── EnabledRoles ◀────────┘
//!                               │ subscribes to every reached role
//!                               ▼
//!                         storage notifications
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use palisade_types::RoleId;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheStats, ExpiringCache};
use crate::entities::SettingsProfileElement;
use crate::rights::AccessRights;
use crate::storage::{AccessStorage, Subscription};

// ============================================================================
// EnabledRolesInfo
// ============================================================================

/// The roles a session ends up with and what they grant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnabledRolesInfo {
    /// Activated roles that exist.
    pub current_roles: BTreeSet<RoleId>,
    /// Every role reachable from the current roles, current roles included.
    pub enabled_roles: BTreeSet<RoleId>,
    /// Enabled roles reached along a path ending in an admin-option grant.
    pub enabled_roles_with_admin_option: BTreeSet<RoleId>,
    pub names_of_roles: BTreeMap<RoleId, String>,
    /// Union of the enabled roles' privileges.
    pub access: AccessRights,
    pub access_with_grant_option: AccessRights,
    /// Settings attached to the enabled roles, in resolution order.
    pub settings_from_enabled_roles: Vec<SettingsProfileElement>,
}

impl EnabledRolesInfo {
    pub fn is_enabled(&self, role: RoleId) -> bool {
        self.enabled_roles.contains(&role)
    }

    pub fn has_admin_option(&self, role: RoleId) -> bool {
        self.enabled_roles_with_admin_option.contains(&role)
    }

    pub fn role_name(&self, role: RoleId) -> Option<&str> {
        self.names_of_roles.get(&role).map(String::as_str)
    }

    pub fn current_role_names(&self) -> Vec<String> {
        self.names_of(&self.current_roles)
    }

    pub fn enabled_role_names(&self) -> Vec<String> {
        self.names_of(&self.enabled_roles)
    }

    fn names_of(&self, ids: &BTreeSet<RoleId>) -> Vec<String> {
        let mut names: Vec<String> = ids
            .iter()
            .filter_map(|id| self.names_of_roles.get(id).cloned())
            .collect();
        names.sort();
        names
    }
}

/// Resolves `current` breadth-first over granted roles.
///
/// Returns the info and every id the walk touched, including ids whose role
/// no longer exists.
fn resolve(
    storage: &dyn AccessStorage,
    current: &[RoleId],
    current_with_admin_option: &[RoleId],
) -> (EnabledRolesInfo, BTreeSet<RoleId>) {
    let mut info = EnabledRolesInfo::default();
    let mut touched = BTreeSet::new();
    let mut admin_by_role: HashMap<RoleId, bool> = HashMap::new();
    let mut queue: VecDeque<(RoleId, bool)> = current
        .iter()
        .map(|id| (*id, current_with_admin_option.contains(id)))
        .collect();
    let current: BTreeSet<RoleId> = current.iter().copied().collect();

    while let Some((id, with_admin_option)) = queue.pop_front() {
        touched.insert(id);
        if let Some(admin) = admin_by_role.get_mut(&id) {
            // Already expanded; only the admin option can still improve.
            *admin |= with_admin_option;
            continue;
        }

        let entity = storage.try_read(id);
        let Some(role) = entity.as_deref().and_then(|entity| entity.as_role()) else {
            debug!(role = %id, "skipping missing role");
            continue;
        };

        admin_by_role.insert(id, with_admin_option);
        if current.contains(&id) {
            info.current_roles.insert(id);
        }
        info.names_of_roles.insert(id, role.name.clone());
        info.access.merge(&role.privileges.access);
        info.access_with_grant_option
            .merge(&role.privileges.access_with_grant_option);
        info.settings_from_enabled_roles
            .extend(role.settings.iter().cloned());

        let granted = &role.privileges.granted_roles;
        for granted_role in granted.roles() {
            queue.push_back((*granted_role, granted.has_admin_option(*granted_role)));
        }
    }

    for (id, with_admin_option) in admin_by_role {
        info.enabled_roles.insert(id);
        if with_admin_option {
            info.enabled_roles_with_admin_option.insert(id);
        }
    }
    (info, touched)
}

// ============================================================================
// EnabledRoles
// ============================================================================

/// Callback invoked with the new info when enabled roles change.
pub type RolesChangeHandler = Arc<dyn Fn(&Arc<EnabledRolesInfo>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_token: u64,
    list: Vec<(u64, RolesChangeHandler)>,
}

struct State {
    info: Arc<EnabledRolesInfo>,
    subscriptions: BTreeMap<RoleId, Subscription>,
}

/// A resolved role set that keeps itself current.
///
/// It watches every role it reached and re-resolves when one of them
/// changes. Subscribers hear about it only when the resolved info differs.
///
/// A role is watched before the resolution that is kept has read it, so no
/// change falls between a read and its subscription.
pub struct EnabledRoles {
    storage: Arc<dyn AccessStorage>,
    current_roles: Vec<RoleId>,
    current_roles_with_admin_option: Vec<RoleId>,
    state: Mutex<State>,
    handlers: Arc<Mutex<Handlers>>,
    this: Weak<EnabledRoles>,
}

impl EnabledRoles {
    pub fn new(
        storage: Arc<dyn AccessStorage>,
        current_roles: Vec<RoleId>,
        current_roles_with_admin_option: Vec<RoleId>,
    ) -> Arc<Self> {
        let enabled_roles = Arc::new_cyclic(|this| Self {
            storage,
            current_roles,
            current_roles_with_admin_option,
            state: Mutex::new(State {
                info: Arc::new(EnabledRolesInfo::default()),
                subscriptions: BTreeMap::new(),
            }),
            handlers: Arc::new(Mutex::new(Handlers::default())),
            this: this.clone(),
        });
        // Watches can only be set up once `this` upgrades.
        enabled_roles.update();
        enabled_roles
    }

    fn watch(storage: &dyn AccessStorage, this: &Weak<EnabledRoles>, role: RoleId) -> Subscription {
        let this = this.clone();
        storage.subscribe(
            role,
            Arc::new(move |_, _| {
                if let Some(enabled_roles) = this.upgrade() {
                    enabled_roles.update();
                }
            }),
        )
    }

    pub fn info(&self) -> Arc<EnabledRolesInfo> {
        Arc::clone(&self.state.lock().info)
    }

    pub fn current_roles(&self) -> &[RoleId] {
        &self.current_roles
    }

    /// Calls `handler` with the new info whenever it changes.
    pub fn subscribe(&self, handler: RolesChangeHandler) -> Subscription {
        let token = {
            let mut handlers = self.handlers.lock();
            let token = handlers.next_token;
            handlers.next_token += 1;
            handlers.list.push((token, handler));
            token
        };
        let handlers = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.lock().list.retain(|(t, _)| *t != token);
            }
        })
    }

    /// Re-resolves the roles and notifies subscribers if anything changed.
    pub fn update(&self) {
        let changed = {
            let mut state = self.state.lock();
            // Resolve again whenever the walk reached a role it did not watch
            // yet: that role may have changed before the watch existed.
            let info = loop {
                let (info, touched) = resolve(
                    self.storage.as_ref(),
                    &self.current_roles,
                    &self.current_roles_with_admin_option,
                );
                state.subscriptions.retain(|id, _| touched.contains(id));
                let mut watched_new = false;
                for id in touched {
                    if !state.subscriptions.contains_key(&id) {
                        let subscription = Self::watch(self.storage.as_ref(), &self.this, id);
                        state.subscriptions.insert(id, subscription);
                        watched_new = true;
                    }
                }
                if !watched_new {
                    break info;
                }
            };

            if *state.info == info {
                None
            } else {
                let info = Arc::new(info);
                state.info = Arc::clone(&info);
                Some(info)
            }
        };

        if let Some(info) = changed {
            debug!(
                current_roles = ?self.current_roles,
                enabled_roles = info.enabled_roles.len(),
                "enabled roles changed"
            );
            let handlers: Vec<RolesChangeHandler> = self
                .handlers
                .lock()
                .list
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            for handler in handlers {
                handler(&info);
            }
        }
    }
}

impl fmt::Debug for EnabledRoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnabledRoles")
            .field("current_roles", &self.current_roles)
            .field("current_roles_with_admin_option", &self.current_roles_with_admin_option)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RoleCache
// ============================================================================

type RolesKey = (Vec<RoleId>, Vec<RoleId>);

/// Shares [`EnabledRoles`] between sessions activating the same roles.
pub struct RoleCache {
    storage: Arc<dyn AccessStorage>,
    cache: ExpiringCache<RolesKey, Arc<EnabledRoles>>,
}

impl RoleCache {
    pub fn new(storage: Arc<dyn AccessStorage>, capacity: usize, ttl: Duration) -> Self {
        Self {
            storage,
            cache: ExpiringCache::new(capacity, ttl),
        }
    }

    /// Enabled roles for `current_roles`, the ones in
    /// `current_roles_with_admin_option` carrying admin option.
    ///
    /// Order and duplicates do not matter; admin roles that are not current
    /// are ignored.
    pub fn enabled_roles(
        &self,
        current_roles: &[RoleId],
        current_roles_with_admin_option: &[RoleId],
    ) -> Arc<EnabledRoles> {
        let current: BTreeSet<RoleId> = current_roles.iter().copied().collect();
        let with_admin_option: Vec<RoleId> = current_roles_with_admin_option
            .iter()
            .copied()
            .filter(|id| current.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let key = (current.into_iter().collect::<Vec<_>>(), with_admin_option);

        let now = Instant::now();
        if let Some(enabled_roles) = self.cache.get(&key, now) {
            debug!(roles = key.0.len(), "role cache hit");
            return enabled_roles;
        }
        debug!(roles = key.0.len(), "role cache miss");
        let enabled_roles = EnabledRoles::new(Arc::clone(&self.storage), key.0.clone(), key.1.clone());
        self.cache.insert(key, Arc::clone(&enabled_roles), now);
        enabled_roles
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl fmt::Debug for RoleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
