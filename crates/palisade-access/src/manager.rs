//! The process-wide entry point: entity storage plus the caches that turn
//! session parameters into [`ContextAccess`] objects.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use palisade_config::{AccessControlConfig, PalisadeConfig};
use palisade_types::{EntityId, EntityKind, RoleId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ExpiringCache};
use crate::context::{Collaborators, ContextAccess, ContextAccessParams};
use crate::element::{AccessRightsElement, AccessRightsElements};
use crate::entities::{Entity, Privileges};
use crate::error::{AccessError, Result};
use crate::hosts::{HostResolver, SystemResolver};
use crate::policies::{EnabledRowPolicies, RowPolicyProvider, StorageRowPolicyProvider};
use crate::quota::{EnabledQuota, QuotaParams, QuotaProvider, StorageQuotaProvider};
use crate::roles::{EnabledRoles, RoleCache};
use crate::settings::{EnabledSettings, SettingsParams, SettingsProfilesCache};
use crate::storage::AccessStorage;

// ============================================================================
// Grant requests
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    #[default]
    Grant,
    Revoke,
}

/// A parsed `GRANT` or `REVOKE` statement.
///
/// `GRANT SELECT ON db.t TO u WITH GRANT OPTION` carries one element, no
/// roles and `grant_option` set. An element may also carry its own grant
/// option, which then applies to that element alone. `REVOKE GRANT OPTION FOR ...` is a revoke
/// with `grant_option` set, and `REVOKE ADMIN OPTION FOR r FROM u` a revoke
/// with `admin_option` set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub kind: GrantKind,
    pub elements: AccessRightsElements,
    pub roles: Vec<RoleId>,
    pub grantees: Vec<EntityId>,
    pub grant_option: bool,
    pub admin_option: bool,
    /// Resolves elements written against the current database. Falls back to
    /// the issuing context's database and then the configured default.
    pub current_database: String,
}

impl GrantRequest {
    pub fn grant(elements: impl IntoIterator<Item = AccessRightsElement>) -> Self {
        Self {
            kind: GrantKind::Grant,
            elements: elements.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn revoke(elements: impl IntoIterator<Item = AccessRightsElement>) -> Self {
        Self {
            kind: GrantKind::Revoke,
            elements: elements.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn grant_roles(roles: impl IntoIterator<Item = RoleId>) -> Self {
        Self {
            kind: GrantKind::Grant,
            roles: roles.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn revoke_roles(roles: impl IntoIterator<Item = RoleId>) -> Self {
        Self {
            kind: GrantKind::Revoke,
            roles: roles.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn to(mut self, grantees: impl IntoIterator<Item = EntityId>) -> Self {
        self.grantees.extend(grantees);
        self
    }

    pub fn with_grant_option(mut self) -> Self {
        self.grant_option = true;
        self
    }

    pub fn with_admin_option(mut self) -> Self {
        self.admin_option = true;
        self
    }

    pub fn with_current_database(mut self, database: impl Into<String>) -> Self {
        self.current_database = database.into();
        self
    }
}

// ============================================================================
// AccessControlManager
// ============================================================================

/// Owns the entity storage and hands out cached [`ContextAccess`] objects.
///
/// Construct it once and share it; every cache it holds is keyed by value,
/// so concurrent callers asking for the same context get the same object
/// unless they race on a miss.
pub struct AccessControlManager {
    config: AccessControlConfig,
    default_user: String,
    storage: Arc<dyn AccessStorage>,
    role_cache: Arc<RoleCache>,
    row_policies: Arc<dyn RowPolicyProvider>,
    quotas: Arc<dyn QuotaProvider>,
    settings: Arc<SettingsProfilesCache>,
    default_profile: String,
    resolver: Arc<dyn HostResolver>,
    contexts: ExpiringCache<ContextAccessParams, Arc<ContextAccess>>,
}

impl AccessControlManager {
    pub fn new(storage: Arc<dyn AccessStorage>, config: &PalisadeConfig) -> Self {
        let access = &config.access_control;
        let role_cache = Arc::new(RoleCache::new(
            Arc::clone(&storage),
            access.role_cache_capacity,
            access.role_cache_ttl(),
        ));
        let row_policies = Arc::new(StorageRowPolicyProvider::new(
            Arc::clone(&storage),
            access.policy_cache_capacity,
            access.policy_cache_ttl(),
        ));
        let quotas = Arc::new(StorageQuotaProvider::new(
            Arc::clone(&storage),
            access.policy_cache_capacity,
            access.policy_cache_ttl(),
        ));
        let settings = Arc::new(SettingsProfilesCache::new(Arc::clone(&storage)));
        Self {
            config: access.clone(),
            default_user: config.users.default_user.clone(),
            storage,
            role_cache,
            row_policies,
            quotas,
            settings,
            default_profile: config.users.default_profile.clone(),
            resolver: Arc::new(SystemResolver),
            contexts: ExpiringCache::new(access.context_cache_capacity, access.context_cache_ttl()),
        }
    }

    pub fn with_row_policy_provider(mut self, provider: Arc<dyn RowPolicyProvider>) -> Self {
        self.row_policies = provider;
        self.contexts.clear();
        self
    }

    pub fn with_quota_provider(mut self, provider: Arc<dyn QuotaProvider>) -> Self {
        self.quotas = provider;
        self.contexts.clear();
        self
    }

    /// Makes every session start from the settings profile `name`.
    pub fn with_default_profile(mut self, name: &str) -> Result<Self> {
        self.settings.profile_id(name)?;
        self.default_profile = name.to_string();
        self.contexts.clear();
        Ok(self)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self.contexts.clear();
        self
    }

    pub fn storage(&self) -> &Arc<dyn AccessStorage> {
        &self.storage
    }

    pub fn config(&self) -> &AccessControlConfig {
        &self.config
    }

    /// The context for `params`, shared with every session that has equal
    /// params.
    ///
    /// A request without a user runs as the configured default user, and a
    /// request without a database uses the configured default database.
    pub fn context_access(&self, params: ContextAccessParams) -> Arc<ContextAccess> {
        self.context_access_at(params, Instant::now())
    }

    /// [`context_access`](Self::context_access) with the cache consulted at
    /// `now`.
    pub fn context_access_at(&self, mut params: ContextAccessParams, now: Instant) -> Arc<ContextAccess> {
        if params.user_id.is_none() {
            params.user_id = self.storage.find(EntityKind::User, &self.default_user);
            if params.user_id.is_none() {
                warn!(user = %self.default_user, "default user not found");
            }
        }
        if params.current_database.is_empty() {
            params.current_database = self.config.default_database.clone();
        }

        if let Some(context) = self.contexts.get(&params, now) {
            debug!(user = ?params.user_id, "context cache hit");
            return context;
        }
        debug!(user = ?params.user_id, "context cache miss");
        let context = ContextAccess::new(self.collaborators(), params.clone());
        self.contexts.insert(params, Arc::clone(&context), now);
        context
    }

    pub fn enabled_roles(&self, current_roles: &[RoleId], with_admin_option: &[RoleId]) -> Arc<EnabledRoles> {
        self.role_cache.enabled_roles(current_roles, with_admin_option)
    }

    pub fn enabled_row_policies(&self, user: UserId, enabled_roles: &BTreeSet<RoleId>) -> Arc<EnabledRowPolicies> {
        self.row_policies.row_policies(user, enabled_roles)
    }

    pub fn enabled_quota(&self, params: &QuotaParams) -> Arc<EnabledQuota> {
        self.quotas.quota(params)
    }

    pub fn enabled_settings(&self, params: SettingsParams) -> Arc<EnabledSettings> {
        self.settings.enabled_settings(params)
    }

    pub fn context_cache_stats(&self) -> CacheStats {
        self.contexts.stats()
    }

    pub fn role_cache_stats(&self) -> CacheStats {
        self.role_cache.stats()
    }

    /// Looks a user up by name, checks its password and client address and
    /// returns its id.
    pub fn authenticate(&self, user_name: &str, password: &str, address: Option<IpAddr>) -> Result<UserId> {
        let Some(id) = self.storage.find(EntityKind::User, user_name) else {
            warn!(user = user_name, "login of unknown user");
            return Err(AccessError::UserNotFound(EntityId::NIL));
        };
        let mut params = ContextAccessParams::for_user(id);
        params.address = address;
        let context = self.context_access(params);
        context.check_password(password)?;
        context.check_host_is_allowed()?;
        info!(user = user_name, "user authenticated");
        Ok(id)
    }

    /// Applies a GRANT or REVOKE to every grantee.
    ///
    /// When `by` is given, the issuing session must hold every privilege with
    /// grant option and every role with admin option. Validation happens
    /// before anything is written, so an invalid request changes nothing.
    pub fn execute_grant(&self, request: &GrantRequest, by: Option<&ContextAccess>) -> Result<()> {
        let current_database = if !request.current_database.is_empty() {
            request.current_database.as_str()
        } else {
            match by.map(|context| context.params().current_database.as_str()) {
                Some(database) if !database.is_empty() => database,
                _ => self.config.default_database.as_str(),
            }
        };
        let mut elements = request.elements.clone();
        elements.resolve_current_database(current_database)?;

        for &role in &request.roles {
            self.storage
                .read_kind(role, EntityKind::Role)
                .map_err(|_| AccessError::RoleNotFound(role))?;
        }
        for &grantee in &request.grantees {
            let entity = self.storage.read(grantee)?;
            if entity.privileges().is_none() {
                return Err(AccessError::WrongEntityKind {
                    id: grantee,
                    expected: EntityKind::Role,
                });
            }
        }

        if let Some(by) = by {
            by.check_grant_option_elements(&elements)?;
            for &role in &request.roles {
                by.check_admin_option(role)?;
            }
        }

        // Dry run on an empty tree so bad levels fail before any write.
        if request.kind == GrantKind::Grant {
            Privileges::default().grant(&elements, false)?;
        }

        let partial_revokes = self.config.partial_revokes;
        for &grantee in &request.grantees {
            self.storage.update(grantee, &mut |entity: &mut Entity| -> Result<()> {
                let Some(privileges) = entity.privileges_mut() else {
                    return Err(AccessError::WrongEntityKind {
                        id: grantee,
                        expected: EntityKind::Role,
                    });
                };
                match request.kind {
                    GrantKind::Grant => {
                        privileges.grant(&elements, request.grant_option)?;
                        for &role in &request.roles {
                            privileges.grant_role(role, request.admin_option);
                        }
                    }
                    GrantKind::Revoke => {
                        privileges.revoke(&elements, partial_revokes, request.grant_option)?;
                        for &role in &request.roles {
                            privileges.revoke_role(role, request.admin_option);
                        }
                    }
                }
                Ok(())
            })?;
            info!(
                %grantee,
                kind = ?request.kind,
                elements = elements.len(),
                roles = request.roles.len(),
                "privileges updated"
            );
        }
        Ok(())
    }

    /// `SHOW GRANTS FOR` a user or role.
    pub fn show_grants(&self, entity_id: EntityId, current_database: Option<&str>) -> Result<Vec<String>> {
        crate::grants::show_grants(self.storage.as_ref(), entity_id, current_database)
    }

    fn collaborators(&self) -> Collaborators {
        let default_profile = if self.default_profile.is_empty() {
            None
        } else {
            match self.settings.profile_id(&self.default_profile) {
                Ok(id) => Some(id),
                Err(error) => {
                    warn!(%error, "default settings profile not applied");
                    None
                }
            }
        };
        Collaborators {
            storage: Arc::clone(&self.storage),
            role_cache: Arc::clone(&self.role_cache),
            row_policies: Arc::clone(&self.row_policies),
            quotas: Arc::clone(&self.quotas),
            settings: Arc::clone(&self.settings),
            default_profile,
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl fmt::Debug for AccessControlManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControlManager")
            .field("config", &self.config)
            .field("default_user", &self.default_user)
            .field("default_profile", &self.default_profile)
            .field("contexts", &self.contexts.stats())
            .field("roles", &self.role_cache.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::entities::{Authentication, Role, SettingValue, SettingsProfile, SettingsProfileElement, User};
    use crate::flags::AccessFlags;
    use crate::hosts::{AllowedClientHosts, StaticResolver};
    use crate::storage::MemoryStorage;

    fn manager() -> (Arc<MemoryStorage>, AccessControlManager) {
        let storage = Arc::new(MemoryStorage::new());
        let manager = AccessControlManager::new(storage.clone(), &PalisadeConfig::default());
        (storage, manager)
    }

    #[test]
    fn equal_params_share_a_context() {
        let (storage, manager) = manager();
        let alice = storage.insert(User::new("alice").into()).unwrap();

        let first = manager.context_access(ContextAccessParams::for_user(alice));
        let second = manager.context_access(ContextAccessParams::for_user(alice));
        assert!(Arc::ptr_eq(&first, &second));

        let readonly = manager.context_access(ContextAccessParams::for_user(alice).with_readonly(1));
        assert!(!Arc::ptr_eq(&first, &readonly));

        let stats = manager.context_cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 2, 2));
    }

    #[test]
    fn missing_user_falls_back_to_default_user() {
        let (storage, manager) = manager();
        let default = storage.insert(User::new("default").into()).unwrap();

        let context = manager.context_access(ContextAccessParams::default());
        assert_eq!(context.params().user_id, Some(default));
        assert_eq!(context.params().current_database, "default");
        assert_eq!(context.user_name(), "default");
    }

    #[test]
    fn unknown_default_user_grants_nothing() {
        let (_storage, manager) = manager();
        let context = manager.context_access(ContextAccessParams::default());
        assert!(!context.is_granted(AccessFlags::SELECT, &[]));
        assert_eq!(
            context.check_password(""),
            Err(AccessError::UserNotFound(EntityId::NIL))
        );
    }

    #[test]
    fn grant_and_revoke_privileges() {
        let (storage, manager) = manager();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let context = manager.context_access(ContextAccessParams::for_user(bob));
        assert!(!context.is_granted(AccessFlags::SELECT, &["db", "t"]));

        let grant = GrantRequest::grant([AccessRightsElement::database(AccessFlags::SELECT, "db")]).to([bob]);
        manager.execute_grant(&grant, None).unwrap();
        assert!(context.is_granted(AccessFlags::SELECT, &["db", "t"]));

        let revoke = GrantRequest::revoke([AccessRightsElement::table(AccessFlags::SELECT, "db", "t")]).to([bob]);
        manager.execute_grant(&revoke, None).unwrap();
        assert!(!context.is_granted(AccessFlags::SELECT, &["db", "t"]));
        assert!(context.is_granted(AccessFlags::SELECT, &["db", "t2"]));
    }

    #[test]
    fn partial_revokes_can_be_disabled() {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = PalisadeConfig::default();
        config.access_control.partial_revokes = false;
        let manager = AccessControlManager::new(storage.clone(), &config);
        let bob = storage.insert(User::new("bob").into()).unwrap();

        let grant = GrantRequest::grant([AccessRightsElement::database(AccessFlags::SELECT, "db")]).to([bob]);
        manager.execute_grant(&grant, None).unwrap();
        let revoke = GrantRequest::revoke([AccessRightsElement::table(AccessFlags::SELECT, "db", "t")]).to([bob]);
        manager.execute_grant(&revoke, None).unwrap();

        let context = manager.context_access(ContextAccessParams::for_user(bob));
        assert!(context.is_granted(AccessFlags::SELECT, &["db", "t"]));
    }

    #[test]
    fn invalid_grant_changes_nothing() {
        let (storage, manager) = manager();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let request = GrantRequest::grant([
            AccessRightsElement::table(AccessFlags::SELECT, "db", "t"),
            AccessRightsElement::table(AccessFlags::CREATE_USER, "db", "t"),
        ])
        .to([bob]);

        let err = manager.execute_grant(&request, None).unwrap_err();
        assert!(matches!(err, AccessError::InvalidGrant { .. }));
        let user = storage.read(bob).unwrap();
        assert!(user.privileges().unwrap().access.is_empty());
    }

    #[test]
    fn current_database_elements_resolve() {
        let (storage, manager) = manager();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let request = GrantRequest::grant([AccessRightsElement::current_table(AccessFlags::INSERT, "t")])
            .to([bob])
            .with_current_database("sales");
        manager.execute_grant(&request, None).unwrap();

        let context = manager.context_access(ContextAccessParams::for_user(bob));
        assert!(context.is_granted(AccessFlags::INSERT, &["sales", "t"]));
        assert!(!context.is_granted(AccessFlags::INSERT, &["default", "t"]));
    }

    #[test]
    fn issuer_needs_grant_option() {
        let (storage, manager) = manager();
        let admin = storage.insert(User::new("admin").into()).unwrap();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let select = AccessRightsElement::database(AccessFlags::SELECT, "db");

        manager
            .execute_grant(&GrantRequest::grant([select.clone()]).to([admin]), None)
            .unwrap();
        let by = manager.context_access(ContextAccessParams::for_user(admin));
        let request = GrantRequest::grant([select.clone()]).to([bob]);
        let err = manager.execute_grant(&request, Some(by.as_ref())).unwrap_err();
        assert!(matches!(err, AccessError::NotEnoughPrivileges { grant_option: true, .. }));

        manager
            .execute_grant(&GrantRequest::grant([select]).to([admin]).with_grant_option(), None)
            .unwrap();
        manager.execute_grant(&request, Some(by.as_ref())).unwrap();
    }

    #[test]
    fn issuer_needs_admin_option() {
        let (storage, manager) = manager();
        let role = storage.insert(Role::new("analyst").into()).unwrap();
        let admin = storage.insert(User::new("admin").into()).unwrap();
        let bob = storage.insert(User::new("bob").into()).unwrap();

        manager
            .execute_grant(&GrantRequest::grant_roles([role]).to([admin]), None)
            .unwrap();
        let by = manager.context_access(ContextAccessParams::for_user(admin));
        let request = GrantRequest::grant_roles([role]).to([bob]);
        let err = manager.execute_grant(&request, Some(by.as_ref())).unwrap_err();
        assert!(matches!(err, AccessError::NotEnoughAdminOption { .. }));

        manager
            .execute_grant(&GrantRequest::grant_roles([role]).to([admin]).with_admin_option(), None)
            .unwrap();
        manager.execute_grant(&request, Some(by.as_ref())).unwrap();
        let user = storage.read(bob).unwrap();
        assert!(user.privileges().unwrap().granted_roles.contains(role));
    }

    #[test]
    fn revoke_admin_option_keeps_role() {
        let (storage, manager) = manager();
        let role = storage.insert(Role::new("analyst").into()).unwrap();
        let bob = storage.insert(User::new("bob").into()).unwrap();

        manager
            .execute_grant(&GrantRequest::grant_roles([role]).to([bob]).with_admin_option(), None)
            .unwrap();
        manager
            .execute_grant(&GrantRequest::revoke_roles([role]).to([bob]).with_admin_option(), None)
            .unwrap();

        let user = storage.read(bob).unwrap();
        let granted = &user.privileges().unwrap().granted_roles;
        assert!(granted.contains(role));
        assert!(!granted.has_admin_option(role));
    }

    #[test]
    fn revoke_grant_option_keeps_access() {
        let (storage, manager) = manager();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let select = AccessRightsElement::global(AccessFlags::SELECT);

        manager
            .execute_grant(&GrantRequest::grant([select.clone()]).to([bob]).with_grant_option(), None)
            .unwrap();
        manager
            .execute_grant(&GrantRequest::revoke([select]).to([bob]).with_grant_option(), None)
            .unwrap();

        let context = manager.context_access(ContextAccessParams::for_user(bob));
        assert!(context.is_granted(AccessFlags::SELECT, &[]));
        assert!(context.check_grant_option(AccessFlags::SELECT, &[]).is_err());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let (storage, manager) = manager();
        let bob = storage.insert(User::new("bob").into()).unwrap();
        let missing = RoleId::from_u128(404);
        let err = manager
            .execute_grant(&GrantRequest::grant_roles([missing]).to([bob]), None)
            .unwrap_err();
        assert_eq!(err, AccessError::RoleNotFound(missing));
    }

    #[test]
    fn authenticate_checks_password_and_host() {
        let storage = Arc::new(MemoryStorage::new());
        let resolver = StaticResolver::new().with_host("office", ["10.0.0.5".parse::<IpAddr>().unwrap()]);
        let manager =
            AccessControlManager::new(storage.clone(), &PalisadeConfig::default()).with_resolver(Arc::new(resolver));
        let alice = storage
            .insert(
                User::new("alice")
                    .with_authentication(Authentication::sha256_password("qwerty"))
                    .with_allowed_client_hosts(AllowedClientHosts::new().with_name("office"))
                    .into(),
            )
            .unwrap();

        let office: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(manager.authenticate("alice", "qwerty", Some(office)), Ok(alice));
        assert_eq!(
            manager.authenticate("alice", "wrong", Some(office)),
            Err(AccessError::WrongPassword("alice".to_string()))
        );
        assert!(matches!(
            manager.authenticate("alice", "qwerty", Some("10.0.0.6".parse().unwrap())),
            Err(AccessError::HostNotAllowed { .. })
        ));
        assert!(manager.authenticate("mallory", "", None).is_err());
    }

    #[test]
    fn contexts_expire() {
        let (storage, manager) = {
            let storage = Arc::new(MemoryStorage::new());
            let manager = AccessControlManager::new(storage.clone(), &PalisadeConfig::testing());
            (storage, manager)
        };
        let alice = storage.insert(User::new("alice").into()).unwrap();
        let ttl = manager.config().context_cache_ttl();
        assert_eq!(ttl, Duration::from_secs(1));

        let t0 = Instant::now();
        let first = manager.context_access_at(ContextAccessParams::for_user(alice), t0);
        let fresh = manager.context_access_at(ContextAccessParams::for_user(alice), t0 + ttl / 2);
        assert!(Arc::ptr_eq(&first, &fresh));
        let expired = manager.context_access_at(ContextAccessParams::for_user(alice), t0 + ttl + Duration::from_millis(1));
        assert!(!Arc::ptr_eq(&first, &expired));
    }

    #[test]
    fn element_grant_option_applies_to_that_element() {
        let (storage, manager) = manager();
        let alice = storage.insert(User::new("alice").into()).unwrap();
        let request = GrantRequest::grant([
            AccessRightsElement::table(AccessFlags::SELECT, "db", "t").with_grant_option(),
            AccessRightsElement::table(AccessFlags::INSERT, "db", "t"),
        ])
        .to([alice]);
        manager.execute_grant(&request, None).unwrap();

        let context = manager.context_access(ContextAccessParams::for_user(alice));
        assert!(context.check_grant_option(AccessFlags::SELECT, &["db", "t"]).is_ok());
        assert!(context.check_grant_option(AccessFlags::INSERT, &["db", "t"]).is_err());
        assert!(context.is_granted(AccessFlags::INSERT, &["db", "t"]));
        assert_eq!(
            manager.show_grants(alice, None).unwrap(),
            vec![
                "GRANT SELECT, INSERT ON db.t TO alice",
                "GRANT SELECT ON db.t TO alice WITH GRANT OPTION",
            ]
        );
    }

    #[test]
    fn default_profile_must_exist() {
        let (storage, manager) = manager();
        assert_eq!(
            manager.with_default_profile("web").unwrap_err(),
            AccessError::SettingsProfileNotFound("web".to_string())
        );

        storage
            .insert(
                SettingsProfile::new("web")
                    .with_element(SettingsProfileElement::setting("max_threads").value(4))
                    .into(),
            )
            .unwrap();
        let manager = AccessControlManager::new(storage.clone(), &PalisadeConfig::default())
            .with_default_profile("web")
            .unwrap();
        let alice = storage.insert(User::new("alice").into()).unwrap();
        let context = manager.context_access(ContextAccessParams::for_user(alice));
        assert_eq!(context.settings().value("max_threads"), Some(SettingValue::Int(4)));
    }
}
