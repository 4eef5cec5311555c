//! Per-session access evaluation.
//!
//! A [`ContextAccess`] combines a user's own privileges with those of its
//! enabled roles, masks them by the session's restrictions and answers
//! access checks. The combined tree is built lazily, once per variant of
//! (grant option, readonly, allow DDL, allow introspection), and thrown away
//! when the user or any enabled role changes.
//!
//! ```text
//!   storage ──(user changed)──────┐
//!   EnabledRoles ──(info changed)─┴─▶ refresh: re-read user, roles,
//!                                     policies, quota, settings
//!                                        │ install if still the latest
//!                                        │ clears memo, bumps generation
//!   check_access ──▶ result_access(slot) ┴─▶ build outside the lock
//!                                             publish if generation held
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use palisade_types::{EntityId, RoleId, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::element::{AccessRightsElement, DatabaseScope};
use crate::entities::{ConditionType, Entity, SettingsProfileElement, User};
use crate::error::{AccessError, Result};
use crate::flags::AccessFlags;
use crate::hosts::HostResolver;
use crate::policies::{EnabledRowPolicies, RowPolicyProvider};
use crate::quota::{EnabledQuota, QuotaParams, QuotaProvider};
use crate::rights::AccessRights;
use crate::roles::{EnabledRoles, EnabledRolesInfo, RoleCache};
use crate::settings::{EnabledSettings, SettingChange, SettingsParams, SettingsProfilesCache};
use crate::storage::{AccessStorage, Subscription};

// ============================================================================
// Parameters
// ============================================================================

/// Protocol the client connected with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientInterface {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMethod {
    #[default]
    Unknown,
    Get,
    Post,
}

/// Everything a [`ContextAccess`] depends on. Contexts are cached by this
/// value, so two sessions with equal params share one context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextAccessParams {
    pub user_id: Option<UserId>,
    /// Sorted and deduplicated; ignored when `use_default_roles` is set.
    pub current_roles: Vec<RoleId>,
    pub use_default_roles: bool,
    /// 0 allows writes, 1 forbids them, 2 forbids them but keeps temporary
    /// tables.
    pub readonly: u64,
    pub allow_ddl: bool,
    pub allow_introspection: bool,
    /// Database that an empty database name refers to.
    pub current_database: String,
    pub interface: ClientInterface,
    pub http_method: HttpMethod,
    pub address: Option<IpAddr>,
    pub quota_key: String,
    pub default_profile_name: String,
}

impl Default for ContextAccessParams {
    fn default() -> Self {
        Self {
            user_id: None,
            current_roles: Vec::new(),
            use_default_roles: true,
            readonly: 0,
            allow_ddl: true,
            allow_introspection: false,
            current_database: String::new(),
            interface: ClientInterface::Tcp,
            http_method: HttpMethod::Unknown,
            address: None,
            quota_key: String::new(),
            default_profile_name: String::new(),
        }
    }
}

impl ContextAccessParams {
    /// Params of a session of `user` with its default roles.
    pub fn for_user(user: UserId) -> Self {
        Self {
            user_id: Some(user),
            ..Self::default()
        }
    }

    /// Activates exactly `roles` instead of the user's default roles.
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = RoleId>) -> Self {
        let roles: BTreeSet<RoleId> = roles.into_iter().collect();
        self.current_roles = roles.into_iter().collect();
        self.use_default_roles = false;
        self
    }

    pub fn with_readonly(mut self, readonly: u64) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_allow_ddl(mut self, allow_ddl: bool) -> Self {
        self.allow_ddl = allow_ddl;
        self
    }

    pub fn with_allow_introspection(mut self, allow_introspection: bool) -> Self {
        self.allow_introspection = allow_introspection;
        self
    }

    pub fn with_current_database(mut self, database: impl Into<String>) -> Self {
        self.current_database = database.into();
        self
    }

    pub fn with_http_method(mut self, method: HttpMethod) -> Self {
        self.interface = ClientInterface::Http;
        self.http_method = method;
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_quota_key(mut self, quota_key: impl Into<String>) -> Self {
        self.quota_key = quota_key.into();
        self
    }

    pub fn with_default_profile(mut self, profile: impl Into<String>) -> Self {
        self.default_profile_name = profile.into();
        self
    }
}

// ============================================================================
// Restrictions
// ============================================================================

/// Session settings that take privileges away regardless of grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessRestrictions {
    /// 0, 1 or 2.
    pub readonly: u8,
    pub allow_ddl: bool,
    pub allow_introspection: bool,
}

impl AccessRestrictions {
    /// No restrictions at all.
    pub const NONE: AccessRestrictions = AccessRestrictions {
        readonly: 0,
        allow_ddl: true,
        allow_introspection: true,
    };

    const SLOTS: usize = 2 * 3 * 2 * 2;

    /// Restrictions of a session. A plain HTTP GET is read-only even when the
    /// settings say otherwise, since GET requests must not change state.
    pub fn from_params(params: &ContextAccessParams) -> Self {
        let mut readonly = u8::try_from(params.readonly.min(2)).unwrap_or(1);
        if readonly == 0
            && params.interface == ClientInterface::Http
            && params.http_method == HttpMethod::Get
        {
            readonly = 2;
        }
        Self {
            readonly,
            allow_ddl: params.allow_ddl,
            allow_introspection: params.allow_introspection,
        }
    }

    /// Privileges these restrictions take away.
    pub fn denied(self) -> AccessFlags {
        let mut denied = AccessFlags::empty();
        if self.readonly > 0 {
            denied |= AccessFlags::INSERT
                | AccessFlags::ALTER
                | AccessFlags::CREATE
                | AccessFlags::DROP
                | AccessFlags::TRUNCATE
                | AccessFlags::OPTIMIZE
                | AccessFlags::SYSTEM
                | AccessFlags::KILL_QUERY
                | (AccessFlags::ACCESS_MANAGEMENT - AccessFlags::SHOW_ACCESS);
            if self.readonly == 2 {
                denied -= AccessFlags::CREATE_TEMPORARY_TABLE;
            }
        }
        if !self.allow_ddl {
            denied |= AccessFlags::CREATE | AccessFlags::DROP | AccessFlags::ALTER | AccessFlags::TRUNCATE;
        }
        if !self.allow_introspection {
            denied |= AccessFlags::INTROSPECTION;
        }
        denied
    }

    fn slot(self, grant_option: bool) -> usize {
        let readonly = usize::from(self.readonly.min(2));
        ((usize::from(grant_option) * 3 + readonly) * 2 + usize::from(self.allow_ddl)) * 2
            + usize::from(self.allow_introspection)
    }
}

// ============================================================================
// ContextAccess
// ============================================================================

/// Services a context reads from. Shared by all contexts of one manager.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub storage: Arc<dyn AccessStorage>,
    pub role_cache: Arc<RoleCache>,
    pub row_policies: Arc<dyn RowPolicyProvider>,
    pub quotas: Arc<dyn QuotaProvider>,
    pub settings: Arc<SettingsProfilesCache>,
    /// Profile every session starts from, unless the session names one.
    pub default_profile: Option<EntityId>,
    pub resolver: Arc<dyn HostResolver>,
}

type ResultAccessSlots = [Option<Arc<AccessRights>>; AccessRestrictions::SLOTS];

/// Everything a context derives from its user and enabled roles.
struct Derived {
    user: Option<Arc<Entity>>,
    user_name: String,
    /// Held so the shared instance keeps resolving while the context lives.
    _enabled_roles: Option<Arc<EnabledRoles>>,
    roles_info: Arc<EnabledRolesInfo>,
    row_policies: Arc<EnabledRowPolicies>,
    quota: Arc<EnabledQuota>,
    settings: Arc<EnabledSettings>,
}

impl Derived {
    fn empty() -> Self {
        Self {
            user: None,
            user_name: String::new(),
            _enabled_roles: None,
            roles_info: Arc::new(EnabledRolesInfo::default()),
            row_policies: Arc::new(EnabledRowPolicies::empty()),
            quota: Arc::new(EnabledQuota::empty()),
            settings: Arc::new(EnabledSettings::empty()),
        }
    }

    fn user(&self) -> Option<&User> {
        self.user.as_deref().and_then(Entity::as_user)
    }
}

struct State {
    derived: Derived,
    result_access: ResultAccessSlots,
    generation: u64,
    user_subscription: Subscription,
    roles_subscription: Subscription,
}

impl State {
    fn empty() -> Self {
        Self {
            derived: Derived::empty(),
            result_access: Default::default(),
            generation: 0,
            user_subscription: Subscription::empty(),
            roles_subscription: Subscription::empty(),
        }
    }

    fn invalidate(&mut self) {
        self.result_access = Default::default();
        self.generation += 1;
    }
}

/// The access rights of one session.
pub struct ContextAccess {
    params: ContextAccessParams,
    restrictions: AccessRestrictions,
    collaborators: Option<Collaborators>,
    full_access: bool,
    state: Mutex<State>,
    /// Number of refreshes started. Only the latest one may install.
    epoch: AtomicU64,
    this: Weak<ContextAccess>,
}

impl ContextAccess {
    /// A context that allows everything, for internal queries.
    pub fn full_access() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            params: ContextAccessParams::default(),
            restrictions: AccessRestrictions::NONE,
            collaborators: None,
            full_access: true,
            state: Mutex::new(State::empty()),
            epoch: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub(crate) fn new(collaborators: Collaborators, params: ContextAccessParams) -> Arc<Self> {
        let restrictions = AccessRestrictions::from_params(&params);
        let context = Arc::new_cyclic(|this| Self {
            params,
            restrictions,
            collaborators: Some(collaborators),
            full_access: false,
            state: Mutex::new(State::empty()),
            epoch: AtomicU64::new(0),
            this: this.clone(),
        });
        context.watch_user();
        context.refresh();
        context
    }

    fn watch_user(&self) {
        let (Some(collaborators), Some(user_id)) = (&self.collaborators, self.params.user_id) else {
            return;
        };
        let this = self.this.clone();
        let subscription = collaborators.storage.subscribe(
            user_id,
            Arc::new(move |_: EntityId, _: Option<Arc<Entity>>| {
                if let Some(context) = this.upgrade() {
                    context.refresh();
                }
            }),
        );
        let previous = std::mem::replace(&mut self.state.lock().user_subscription, subscription);
        drop(previous);
    }

    /// Re-reads the user and everything that follows from it.
    ///
    /// Runs without holding the state lock and installs only if no later
    /// refresh has started meanwhile, so the last refresh started wins.
    fn refresh(&self) {
        let Some(collaborators) = &self.collaborators else {
            return;
        };
        let epoch = self.epoch.fetch_add(1, AtomicOrdering::SeqCst) + 1;

        let user = self
            .params
            .user_id
            .and_then(|id| collaborators.storage.try_read(id))
            .filter(|entity| entity.as_user().is_some());
        let (derived, roles_subscription) = match user {
            Some(user) => self.derive(collaborators, user),
            None => {
                debug!(user = ?self.params.user_id, "context user not found");
                (Derived::empty(), Subscription::empty())
            }
        };

        let stale = {
            let mut state = self.state.lock();
            if self.epoch.load(AtomicOrdering::SeqCst) == epoch {
                let previous = std::mem::replace(&mut state.derived, derived);
                let previous_subscription = std::mem::replace(&mut state.roles_subscription, roles_subscription);
                state.invalidate();
                debug!(
                    user = %state.derived.user_name,
                    enabled_roles = state.derived.roles_info.enabled_roles.len(),
                    generation = state.generation,
                    "context access invalidated"
                );
                (previous, previous_subscription)
            } else {
                trace!(epoch, "dropping superseded context refresh");
                (derived, roles_subscription)
            }
        };
        // Released outside the lock: dropping may unsubscribe.
        drop(stale);
    }

    fn derive(&self, collaborators: &Collaborators, user_entity: Arc<Entity>) -> (Derived, Subscription) {
        let Some(user) = user_entity.as_user() else {
            return (Derived::empty(), Subscription::empty());
        };
        let user_id = self.params.user_id.unwrap_or(EntityId::NIL);

        let granted = &user.privileges.granted_roles;
        let current: Vec<RoleId> = if self.params.use_default_roles {
            user.default_role_ids().into_iter().collect()
        } else {
            self.params
                .current_roles
                .iter()
                .copied()
                .filter(|id| granted.contains(*id))
                .collect()
        };
        let with_admin_option: Vec<RoleId> = current
            .iter()
            .copied()
            .filter(|id| granted.has_admin_option(*id))
            .collect();

        let enabled_roles = collaborators.role_cache.enabled_roles(&current, &with_admin_option);
        let this = self.this.clone();
        let roles_subscription = enabled_roles.subscribe(Arc::new(move |_: &Arc<EnabledRolesInfo>| {
            if let Some(context) = this.upgrade() {
                context.refresh();
            }
        }));
        // Read after subscribing so a change in between is not lost.
        let roles_info = enabled_roles.info();

        let row_policies = collaborators
            .row_policies
            .row_policies(user_id, &roles_info.enabled_roles);
        let quota = collaborators.quotas.quota(&QuotaParams {
            user: user_id,
            user_name: user.name.clone(),
            enabled_roles: roles_info.enabled_roles.clone(),
            address: self.params.address,
            client_key: self.params.quota_key.clone(),
        });
        let settings = collaborators
            .settings
            .enabled_settings(self.settings_params(collaborators, user_id, user, &roles_info));

        let derived = Derived {
            user_name: user.name.clone(),
            user: Some(Arc::clone(&user_entity)),
            _enabled_roles: Some(enabled_roles),
            roles_info,
            row_policies,
            quota,
            settings,
        };
        (derived, roles_subscription)
    }

    fn settings_params(
        &self,
        collaborators: &Collaborators,
        user_id: UserId,
        user: &User,
        roles_info: &EnabledRolesInfo,
    ) -> SettingsParams {
        let find_profile = |name: &str| match collaborators.settings.profile_id(name) {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(%error, "ignoring settings profile");
                None
            }
        };
        let default_profile = if self.params.default_profile_name.is_empty() {
            collaborators.default_profile
        } else {
            find_profile(self.params.default_profile_name.as_str())
        };

        let mut elements = Vec::new();
        if let Some(profile) = user.profile.as_deref().and_then(find_profile) {
            elements.push(SettingsProfileElement::parent(profile));
        }
        elements.extend(user.settings.iter().cloned());
        elements.extend(roles_info.settings_from_enabled_roles.iter().cloned());
        SettingsParams {
            user: user_id,
            enabled_roles: roles_info.enabled_roles.clone(),
            default_profile,
            settings_from_user_and_roles: elements,
        }
    }

    // ========================================================================
    // Effective access
    // ========================================================================

    /// The effective tree for the session's own restrictions.
    pub fn access(&self) -> Arc<AccessRights> {
        self.result_access(false, self.restrictions)
    }

    /// The effective grant-option tree for the session's own restrictions.
    pub fn access_with_grant_option(&self) -> Arc<AccessRights> {
        self.result_access(true, self.restrictions)
    }

    /// The effective tree for any restrictions, built on first use and kept
    /// until the user or its roles change.
    pub fn result_access(&self, grant_option: bool, restrictions: AccessRestrictions) -> Arc<AccessRights> {
        let slot = restrictions.slot(grant_option);
        loop {
            let (user, roles_info, generation) = {
                let state = self.state.lock();
                if let Some(access) = &state.result_access[slot] {
                    return Arc::clone(access);
                }
                (state.derived.user.clone(), Arc::clone(&state.derived.roles_info), state.generation)
            };

            let computed = Arc::new(self.calculate(grant_option, restrictions, user.as_deref(), &roles_info));

            let mut state = self.state.lock();
            if state.generation == generation {
                // Another thread may have published first; keep its tree.
                return Arc::clone(state.result_access[slot].get_or_insert(computed));
            }
        }
    }

    fn calculate(
        &self,
        grant_option: bool,
        restrictions: AccessRestrictions,
        user: Option<&Entity>,
        roles_info: &EnabledRolesInfo,
    ) -> AccessRights {
        let mut access = if self.full_access {
            AccessRights::full()
        } else {
            let Some(user) = user.and_then(Entity::as_user) else {
                return AccessRights::new();
            };
            let (own, from_roles) = if grant_option {
                (&user.privileges.access_with_grant_option, &roles_info.access_with_grant_option)
            } else {
                (&user.privileges.access, &roles_info.access)
            };
            let mut access = own.clone();
            access.merge(from_roles);
            access
        };
        access.revoke_everywhere(restrictions.denied());
        access
    }

    // ========================================================================
    // Checks
    // ========================================================================

    /// Fails unless `flags` are granted on `path`. An empty database name
    /// means the current database.
    pub fn check_access(&self, flags: AccessFlags, path: &[&str]) -> Result<()> {
        self.check_path(false, flags, path)
    }

    pub fn check_access_columns(&self, flags: AccessFlags, database: &str, table: &str, columns: &[&str]) -> Result<()> {
        self.check_columns(false, flags, database, table, columns)
    }

    pub fn check_access_element(&self, element: &AccessRightsElement) -> Result<()> {
        self.check_element(false, element)
    }

    pub fn check_access_elements(&self, elements: &[AccessRightsElement]) -> Result<()> {
        elements.iter().try_for_each(|element| self.check_element(false, element))
    }

    pub fn is_granted(&self, flags: AccessFlags, path: &[&str]) -> bool {
        self.check_path(false, flags, path).is_ok()
    }

    pub fn is_granted_columns(&self, flags: AccessFlags, database: &str, table: &str, columns: &[&str]) -> bool {
        self.check_columns(false, flags, database, table, columns).is_ok()
    }

    pub fn is_granted_element(&self, element: &AccessRightsElement) -> bool {
        self.check_element(false, element).is_ok()
    }

    /// Fails unless `flags` on `path` may be granted further.
    pub fn check_grant_option(&self, flags: AccessFlags, path: &[&str]) -> Result<()> {
        self.check_path(true, flags, path)
    }

    pub fn check_grant_option_columns(
        &self,
        flags: AccessFlags,
        database: &str,
        table: &str,
        columns: &[&str],
    ) -> Result<()> {
        self.check_columns(true, flags, database, table, columns)
    }

    pub fn check_grant_option_element(&self, element: &AccessRightsElement) -> Result<()> {
        self.check_element(true, element)
    }

    pub fn check_grant_option_elements(&self, elements: &[AccessRightsElement]) -> Result<()> {
        elements.iter().try_for_each(|element| self.check_element(true, element))
    }

    /// Fails unless the session may grant `role` further, through an enabled
    /// role held with admin option or the ROLE ADMIN privilege.
    pub fn check_admin_option(&self, role: RoleId) -> Result<()> {
        if self.full_access {
            return Ok(());
        }
        let roles_info = self.roles_info();
        if roles_info.has_admin_option(role) {
            trace!(user = %self.user_name(), %role, "admin option granted");
            return Ok(());
        }
        if self.access().is_granted(AccessFlags::ROLE_ADMIN, &[]) {
            return Ok(());
        }

        let role_name = self
            .collaborators
            .as_ref()
            .and_then(|c| c.storage.try_read(role))
            .map_or_else(|| role.to_string(), |entity| entity.name());
        let user = self.user_name();
        warn!(%user, role = %role_name, "admin option denied");
        Err(AccessError::NotEnoughAdminOption { user, role: role_name })
    }

    pub fn check_password(&self, password: &str) -> Result<()> {
        if self.full_access {
            return Ok(());
        }
        let user = self.require_user()?;
        let Some(user) = user.as_user() else {
            return Err(self.user_not_found());
        };
        if user.authentication.is_correct_password(password) {
            Ok(())
        } else {
            warn!(user = %user.name, "wrong password");
            Err(AccessError::WrongPassword(user.name.clone()))
        }
    }

    /// Fails unless the client address is among the user's allowed hosts. A
    /// session without an address passes.
    pub fn check_host_is_allowed(&self) -> Result<()> {
        let (Some(collaborators), Some(address)) = (&self.collaborators, self.params.address) else {
            return Ok(());
        };
        let user = self.require_user()?;
        let Some(user) = user.as_user() else {
            return Err(self.user_not_found());
        };
        if user
            .allowed_client_hosts
            .matches(address, collaborators.resolver.as_ref())?
        {
            Ok(())
        } else {
            warn!(user = %user.name, %address, "host not allowed");
            Err(AccessError::HostNotAllowed {
                user: user.name.clone(),
                address,
            })
        }
    }

    fn check_path(&self, grant_option: bool, flags: AccessFlags, path: &[&str]) -> Result<()> {
        let path = self.resolve_path(path)?;
        let access = self.result_access(grant_option, self.restrictions);
        let denied = flags - access.get_access(&path);
        if denied.is_empty() {
            trace!(user = %self.user_name(), %flags, ?path, "access granted");
            return Ok(());
        }
        let missing = match path.as_slice() {
            [] => AccessRightsElement::global(denied),
            [database] => AccessRightsElement::database(denied, *database),
            [database, table] => AccessRightsElement::table(denied, *database, *table),
            [database, table, column] => AccessRightsElement::columns(denied, *database, *table, [*column]),
            _ => return Err(AccessError::InvalidPath(path.len())),
        };
        Err(self.denial(missing, grant_option))
    }

    fn check_columns(
        &self,
        grant_option: bool,
        flags: AccessFlags,
        database: &str,
        table: &str,
        columns: &[&str],
    ) -> Result<()> {
        if columns.is_empty() {
            return self.check_path(grant_option, flags, &[database, table]);
        }
        let database = self.resolve_database(database)?;
        let access = self.result_access(grant_option, self.restrictions);

        let mut denied = AccessFlags::empty();
        let mut lacking = Vec::new();
        for column in columns {
            let column_denied = flags - access.get_access(&[database, table, *column]);
            if !column_denied.is_empty() {
                denied |= column_denied;
                lacking.push(*column);
            }
        }
        if denied.is_empty() {
            trace!(user = %self.user_name(), %flags, database, table, ?columns, "access granted");
            return Ok(());
        }
        let missing = AccessRightsElement::columns(denied, database, table, lacking);
        Err(self.denial(missing, grant_option))
    }

    fn check_element(&self, grant_option: bool, element: &AccessRightsElement) -> Result<()> {
        let database = match &element.database {
            DatabaseScope::Any => return self.check_path(grant_option, element.access_flags, &[]),
            DatabaseScope::Current => "",
            DatabaseScope::Named(name) => name.as_str(),
        };
        match (&element.table, &element.columns) {
            (None, _) => self.check_path(grant_option, element.access_flags, &[database]),
            (Some(table), None) => {
                self.check_path(grant_option, element.access_flags, &[database, table.as_str()])
            }
            (Some(table), Some(columns)) => {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                self.check_columns(grant_option, element.access_flags, database, table, &columns)
            }
        }
    }

    fn resolve_database<'a>(&'a self, database: &'a str) -> Result<&'a str> {
        if !database.is_empty() {
            return Ok(database);
        }
        if self.params.current_database.is_empty() {
            return Err(AccessError::CurrentDatabaseNotSet);
        }
        Ok(&self.params.current_database)
    }

    fn resolve_path<'a>(&'a self, path: &[&'a str]) -> Result<Vec<&'a str>> {
        let mut resolved = path.to_vec();
        if let Some(database) = resolved.first_mut() {
            *database = self.resolve_database(*database)?;
        }
        Ok(resolved)
    }

    fn denial(&self, missing: AccessRightsElement, grant_option: bool) -> AccessError {
        let user = self.user_name();
        warn!(%user, %missing, grant_option, "not enough privileges");
        AccessError::NotEnoughPrivileges {
            user,
            missing,
            grant_option,
        }
    }

    fn require_user(&self) -> Result<Arc<Entity>> {
        self.state.lock().derived.user.clone().ok_or_else(|| self.user_not_found())
    }

    fn user_not_found(&self) -> AccessError {
        AccessError::UserNotFound(self.params.user_id.unwrap_or(EntityId::NIL))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn params(&self) -> &ContextAccessParams {
        &self.params
    }

    pub fn restrictions(&self) -> AccessRestrictions {
        self.restrictions
    }

    pub fn is_full_access(&self) -> bool {
        self.full_access
    }

    /// Snapshot of the user entity, `None` if it does not exist.
    pub fn user(&self) -> Option<Arc<Entity>> {
        self.state.lock().derived.user.clone()
    }

    pub fn user_name(&self) -> String {
        self.state.lock().derived.user_name.clone()
    }

    pub fn roles_info(&self) -> Arc<EnabledRolesInfo> {
        Arc::clone(&self.state.lock().derived.roles_info)
    }

    pub fn current_roles(&self) -> Vec<RoleId> {
        self.roles_info().current_roles.iter().copied().collect()
    }

    pub fn current_role_names(&self) -> Vec<String> {
        self.roles_info().current_role_names()
    }

    pub fn enabled_roles(&self) -> Vec<RoleId> {
        self.roles_info().enabled_roles.iter().copied().collect()
    }

    pub fn enabled_role_names(&self) -> Vec<String> {
        self.roles_info().enabled_role_names()
    }

    pub fn row_policies(&self) -> Arc<EnabledRowPolicies> {
        Arc::clone(&self.state.lock().derived.row_policies)
    }

    /// Combined row-policy condition for a table, with an optional extra
    /// condition AND-ed on.
    pub fn row_policy_condition(
        &self,
        database: &str,
        table: &str,
        kind: ConditionType,
        extra: Option<&str>,
    ) -> Option<String> {
        self.row_policies().condition_with(database, table, kind, extra)
    }

    pub fn quota(&self) -> Arc<EnabledQuota> {
        Arc::clone(&self.state.lock().derived.quota)
    }

    /// Default settings and constraints of the session.
    pub fn settings(&self) -> Arc<EnabledSettings> {
        Arc::clone(&self.state.lock().derived.settings)
    }

    /// Fails if the session may not change a setting as requested.
    pub fn check_setting_change(&self, change: &SettingChange) -> Result<()> {
        if self.full_access {
            return Ok(());
        }
        self.settings().check(change, self.restrictions)
    }

    /// Moves an out-of-range value to the nearest allowed bound. Returns false
    /// if the change must be dropped.
    pub fn clamp_setting_change(&self, change: &mut SettingChange) -> bool {
        self.full_access || self.settings().clamp(change, self.restrictions)
    }

    /// Whether the user entity has a default settings profile or the session
    /// named one.
    pub fn default_profile_name(&self) -> Option<String> {
        if !self.params.default_profile_name.is_empty() {
            return Some(self.params.default_profile_name.clone());
        }
        let state = self.state.lock();
        state.derived.user().and_then(|user| user.profile.clone())
    }
}

impl fmt::Debug for ContextAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAccess")
            .field("params", &self.params)
            .field("full_access", &self.full_access)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn full_access_allows_everything() {
        let context = ContextAccess::full_access();
        assert!(context.is_full_access());
        assert!(context.is_granted(AccessFlags::ALL, &[]));
        assert!(context.check_grant_option(AccessFlags::CREATE_USER, &[]).is_ok());
        assert!(context.check_admin_option(RoleId::from_u128(1)).is_ok());
        assert!(context.check_password("anything").is_ok());
        assert!(context.check_host_is_allowed().is_ok());
    }

    #[test]
    fn full_access_resolves_current_database() {
        let context = ContextAccess::full_access();
        assert_eq!(
            context.check_access(AccessFlags::SELECT, &["", "t"]),
            Err(AccessError::CurrentDatabaseNotSet)
        );
    }

    #[test_case(0, false, AccessFlags::INSERT, true; "writable")]
    #[test_case(1, false, AccessFlags::INSERT, false; "readonly blocks insert")]
    #[test_case(1, false, AccessFlags::SELECT, true; "readonly keeps select")]
    #[test_case(1, false, AccessFlags::SHOW_ACCESS, true; "readonly keeps show access")]
    #[test_case(1, false, AccessFlags::CREATE_USER, false; "readonly blocks access management")]
    #[test_case(1, false, AccessFlags::CREATE_TEMPORARY_TABLE, false; "readonly 1 blocks temporary tables")]
    #[test_case(2, false, AccessFlags::CREATE_TEMPORARY_TABLE, true; "readonly 2 keeps temporary tables")]
    #[test_case(2, false, AccessFlags::KILL_QUERY, false; "readonly 2 blocks kill")]
    #[test_case(0, true, AccessFlags::DROP_TABLE, false; "no ddl blocks drop")]
    #[test_case(0, true, AccessFlags::INSERT, true; "no ddl keeps insert")]
    fn restrictions_mask(readonly: u8, no_ddl: bool, flags: AccessFlags, allowed: bool) {
        let restrictions = AccessRestrictions {
            readonly,
            allow_ddl: !no_ddl,
            allow_introspection: true,
        };
        assert_eq!(!restrictions.denied().intersects(flags), allowed);
    }

    #[test]
    fn introspection_needs_setting() {
        let restrictions = AccessRestrictions {
            allow_introspection: false,
            ..AccessRestrictions::NONE
        };
        assert!(restrictions.denied().contains(AccessFlags::INTROSPECTION));
        assert!(AccessRestrictions::NONE.denied().is_empty());
    }

    #[test]
    fn http_get_is_readonly() {
        let get = ContextAccessParams::default().with_http_method(HttpMethod::Get);
        assert_eq!(AccessRestrictions::from_params(&get).readonly, 2);

        let post = ContextAccessParams::default().with_http_method(HttpMethod::Post);
        assert_eq!(AccessRestrictions::from_params(&post).readonly, 0);

        let strict_get = get.with_readonly(1);
        assert_eq!(AccessRestrictions::from_params(&strict_get).readonly, 1);

        let large = ContextAccessParams::default().with_readonly(7);
        assert_eq!(AccessRestrictions::from_params(&large).readonly, 2);
    }

    #[test]
    fn slots_are_distinct() {
        let mut seen = BTreeSet::new();
        for grant_option in [false, true] {
            for readonly in 0..=2 {
                for allow_ddl in [false, true] {
                    for allow_introspection in [false, true] {
                        let restrictions = AccessRestrictions {
                            readonly,
                            allow_ddl,
                            allow_introspection,
                        };
                        let slot = restrictions.slot(grant_option);
                        assert!(slot < AccessRestrictions::SLOTS);
                        assert!(seen.insert(slot));
                    }
                }
            }
        }
    }

    #[test]
    fn params_sort_roles() {
        let a = RoleId::from_u128(1);
        let b = RoleId::from_u128(2);
        let params = ContextAccessParams::for_user(UserId::from_u128(9)).with_roles([b, a, b]);
        assert_eq!(params.current_roles, vec![a, b]);
        assert!(!params.use_default_roles);
        assert_eq!(
            params,
            ContextAccessParams::for_user(UserId::from_u128(9)).with_roles([a, b])
        );
    }
}
