//! Access entities: users, roles, row policies, quotas and settings profiles.
//!
//! Entities are plain values. The storage hands out shared snapshots and
//! replaces them wholesale on every change, so nothing here is ever mutated
//! while an access check is reading it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::time::Duration;

use palisade_types::{EntityId, EntityKind, RoleId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::element::AccessRightsElement;
use crate::error::Result;
use crate::hosts::AllowedClientHosts;
use crate::rights::AccessRights;

// ============================================================================
// Role sets
// ============================================================================

/// Roles granted to a user or to another role.
///
/// Roles held with admin option are always also held plainly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedRoles {
    roles: BTreeSet<RoleId>,
    roles_with_admin_option: BTreeSet<RoleId>,
}

impl GrantedRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, role: RoleId, with_admin_option: bool) -> bool {
        let mut changed = self.roles.insert(role);
        if with_admin_option {
            changed |= self.roles_with_admin_option.insert(role);
        }
        changed
    }

    pub fn revoke(&mut self, role: RoleId) -> bool {
        self.roles_with_admin_option.remove(&role);
        self.roles.remove(&role)
    }

    /// Keeps the role but takes away the right to grant it further.
    pub fn revoke_admin_option(&mut self, role: RoleId) -> bool {
        self.roles_with_admin_option.remove(&role)
    }

    pub fn contains(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_admin_option(&self, role: RoleId) -> bool {
        self.roles_with_admin_option.contains(&role)
    }

    pub fn roles(&self) -> &BTreeSet<RoleId> {
        &self.roles
    }

    pub fn roles_with_admin_option(&self) -> &BTreeSet<RoleId> {
        &self.roles_with_admin_option
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// A set of roles written as `r1, r2`, `ALL` or `ALL EXCEPT r1`.
///
/// Used for default roles and for the targets of row policies and quotas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    pub all: bool,
    pub ids: BTreeSet<EntityId>,
    pub except_ids: BTreeSet<EntityId>,
}

impl RoleSet {
    /// Matches nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn except(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.except_ids.extend(ids);
        self
    }

    pub fn matches(&self, id: EntityId) -> bool {
        (self.all || self.ids.contains(&id)) && !self.except_ids.contains(&id)
    }

    /// Matches a principal directly or through any of its enabled roles.
    pub fn matches_any<'a>(
        &self,
        user: EntityId,
        enabled_roles: impl IntoIterator<Item = &'a RoleId>,
    ) -> bool {
        self.matches(user) || enabled_roles.into_iter().any(|role| self.matches(*role))
    }
}

// ============================================================================
// Privileges
// ============================================================================

/// Everything that can be granted to a user or a role.
///
/// `access_with_grant_option` is kept a subset of `access`: a grant with
/// grant option lands in both trees and a revoke always clears both.
/// An element's own `grant_option` flag counts the same as the statement-wide
/// one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Privileges {
    pub access: AccessRights,
    pub access_with_grant_option: AccessRights,
    pub granted_roles: GrantedRoles,
}

impl Privileges {
    pub fn grant(&mut self, elements: &[AccessRightsElement], with_grant_option: bool) -> Result<bool> {
        let mut changed = self.access.grant_elements(elements)?;
        let grantable = with_grant_option_flag(elements, with_grant_option);
        if !grantable.is_empty() {
            changed |= self.access_with_grant_option.grant_elements(&grantable)?;
        }
        Ok(changed)
    }

    /// Revokes the privileges, or only the right to grant them further when
    /// `grant_option_only` is set (for the whole statement or per element).
    pub fn revoke(
        &mut self,
        elements: &[AccessRightsElement],
        partial_revokes: bool,
        grant_option_only: bool,
    ) -> Result<bool> {
        let mut changed = self
            .access_with_grant_option
            .revoke_elements(elements, partial_revokes)?;
        if !grant_option_only {
            let full: Vec<AccessRightsElement> = elements
                .iter()
                .filter(|element| !element.grant_option)
                .cloned()
                .collect();
            if !full.is_empty() {
                changed |= self.access.revoke_elements(&full, partial_revokes)?;
            }
        }
        Ok(changed)
    }

    pub fn grant_role(&mut self, role: RoleId, with_admin_option: bool) -> bool {
        self.granted_roles.grant(role, with_admin_option)
    }

    pub fn revoke_role(&mut self, role: RoleId, admin_option_only: bool) -> bool {
        if admin_option_only {
            self.granted_roles.revoke_admin_option(role)
        } else {
            self.granted_roles.revoke(role)
        }
    }
}

fn with_grant_option_flag(elements: &[AccessRightsElement], all: bool) -> Vec<AccessRightsElement> {
    elements
        .iter()
        .filter(|element| all || element.grant_option)
        .cloned()
        .collect()
}

// ============================================================================
// Entities
// ============================================================================

/// How a user proves its identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authentication {
    #[default]
    NoPassword,
    PlainText {
        password: String,
    },
    /// Lowercase hex SHA-256 of the password.
    Sha256Hex {
        hash: String,
    },
}

impl Authentication {
    pub fn plain_text(password: impl Into<String>) -> Self {
        Authentication::PlainText {
            password: password.into(),
        }
    }

    /// Stores only the SHA-256 digest of `password`.
    pub fn sha256_password(password: &str) -> Self {
        Authentication::Sha256Hex {
            hash: sha256_hex(password),
        }
    }

    pub fn sha256_hex(hash: impl Into<String>) -> Self {
        Authentication::Sha256Hex {
            hash: hash.into().to_ascii_lowercase(),
        }
    }

    pub fn is_correct_password(&self, password: &str) -> bool {
        match self {
            Authentication::NoPassword => true,
            Authentication::PlainText { password: expected } => {
                password.as_bytes().ct_eq(expected.as_bytes()).into()
            }
            Authentication::Sha256Hex { hash } => sha256_hex(password)
                .as_bytes()
                .ct_eq(hash.as_bytes())
                .into(),
        }
    }
}

fn sha256_hex(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub allowed_client_hosts: AllowedClientHosts,
    #[serde(default)]
    pub privileges: Privileges,
    /// Roles enabled when a session does not pick its own. Defaults to every
    /// granted role.
    #[serde(default = "RoleSet::all")]
    pub default_roles: RoleSet,
    /// Settings profile applied before the user's own settings.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub settings: Vec<SettingsProfileElement>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authentication: Authentication::NoPassword,
            allowed_client_hosts: AllowedClientHosts::any(),
            privileges: Privileges::default(),
            default_roles: RoleSet::all(),
            profile: None,
            settings: Vec::new(),
        }
    }

    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    pub fn with_allowed_client_hosts(mut self, hosts: AllowedClientHosts) -> Self {
        self.allowed_client_hosts = hosts;
        self
    }

    pub fn with_default_roles(mut self, default_roles: RoleSet) -> Self {
        self.default_roles = default_roles;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_setting(mut self, element: SettingsProfileElement) -> Self {
        self.settings.push(element);
        self
    }

    /// Granted roles that are also default roles.
    pub fn default_role_ids(&self) -> BTreeSet<RoleId> {
        self.privileges
            .granted_roles
            .roles()
            .iter()
            .copied()
            .filter(|id| self.default_roles.matches(*id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub privileges: Privileges,
    #[serde(default)]
    pub settings: Vec<SettingsProfileElement>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            privileges: Privileges::default(),
            settings: Vec::new(),
        }
    }

    pub fn with_setting(mut self, element: SettingsProfileElement) -> Self {
        self.settings.push(element);
        self
    }
}

/// Which statements a row-policy condition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    SelectFilter,
    InsertCheck,
    UpdateFilter,
    UpdateCheck,
    DeleteFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPolicy {
    pub short_name: String,
    pub database: String,
    pub table: String,
    /// Condition expressions, kept as text; evaluation happens elsewhere.
    pub conditions: BTreeMap<ConditionType, String>,
    pub to: RoleSet,
}

impl RowPolicy {
    pub fn new(
        short_name: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            short_name: short_name.into(),
            database: database.into(),
            table: table.into(),
            conditions: BTreeMap::new(),
            to: RoleSet::none(),
        }
    }

    pub fn with_condition(mut self, kind: ConditionType, expression: impl Into<String>) -> Self {
        self.conditions.insert(kind, expression.into());
        self
    }

    pub fn to(mut self, roles: RoleSet) -> Self {
        self.to = roles;
        self
    }

    /// `name ON db.table`, unique among row policies.
    pub fn full_name(&self) -> String {
        format!("{} ON {}.{}", self.short_name, self.database, self.table)
    }
}

/// What quota consumption is tracked by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKeyType {
    #[default]
    None,
    UserName,
    IpAddress,
    ClientKey,
    ClientKeyOrUserName,
    ClientKeyOrIpAddress,
}

/// A resource whose consumption a quota limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Queries,
    Errors,
    ResultRows,
    ResultBytes,
    ReadRows,
    ReadBytes,
    /// Nanoseconds.
    ExecutionTime,
}

impl QuotaResource {
    pub const ALL: [QuotaResource; 7] = [
        QuotaResource::Queries,
        QuotaResource::Errors,
        QuotaResource::ResultRows,
        QuotaResource::ResultBytes,
        QuotaResource::ReadRows,
        QuotaResource::ReadBytes,
        QuotaResource::ExecutionTime,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QuotaResource::Queries => "queries",
            QuotaResource::Errors => "errors",
            QuotaResource::ResultRows => "result_rows",
            QuotaResource::ResultBytes => "result_bytes",
            QuotaResource::ReadRows => "read_rows",
            QuotaResource::ReadBytes => "read_bytes",
            QuotaResource::ExecutionTime => "execution_time",
        };
        f.write_str(name)
    }
}

/// Maximum consumption allowed within one interval. A missing or zero
/// maximum means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub duration: Duration,
    #[serde(default)]
    pub max: BTreeMap<QuotaResource, u64>,
}

impl QuotaLimits {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            max: BTreeMap::new(),
        }
    }

    pub fn with_max(mut self, resource: QuotaResource, max: u64) -> Self {
        self.max.insert(resource, max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub name: String,
    #[serde(default)]
    pub key_type: QuotaKeyType,
    #[serde(default)]
    pub limits: Vec<QuotaLimits>,
    pub to: RoleSet,
}

impl Quota {
    pub fn new(name: impl Into<String>, key_type: QuotaKeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
            limits: Vec::new(),
            to: RoleSet::none(),
        }
    }

    pub fn with_limits(mut self, limits: QuotaLimits) -> Self {
        self.limits.push(limits);
        self
    }

    pub fn to(mut self, roles: RoleSet) -> Self {
        self.to = roles;
        self
    }
}

/// Value of a session setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl SettingValue {
    /// Orders numbers with numbers (booleans count as 0 and 1) and strings
    /// with strings.
    pub fn partial_cmp_value(&self, other: &SettingValue) -> Option<std::cmp::Ordering> {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => match (self, other) {
                (SettingValue::String(a), SettingValue::String(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Bool(value) => Some(i64::from(*value)),
            SettingValue::Int(value) => Some(*value),
            SettingValue::String(_) => None,
        }
    }
}

impl Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingValue::Bool(value) => write!(f, "{}", u8::from(*value)),
            SettingValue::Int(value) => write!(f, "{value}"),
            SettingValue::String(value) => write!(f, "'{value}'"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        SettingValue::Int(i64::from(value))
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::String(value.to_string())
    }
}

/// One line of a settings profile: either a reference to a parent profile or
/// a setting with an optional value and constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsProfileElement {
    pub parent_profile: Option<EntityId>,
    pub setting_name: String,
    pub value: Option<SettingValue>,
    pub min_value: Option<SettingValue>,
    pub max_value: Option<SettingValue>,
    pub readonly: Option<bool>,
}

impl SettingsProfileElement {
    pub fn parent(profile: EntityId) -> Self {
        Self {
            parent_profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn setting(name: impl Into<String>) -> Self {
        Self {
            setting_name: name.into(),
            ..Self::default()
        }
    }

    pub fn value(mut self, value: impl Into<SettingValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn min(mut self, value: impl Into<SettingValue>) -> Self {
        self.min_value = Some(value.into());
        self
    }

    pub fn max(mut self, value: impl Into<SettingValue>) -> Self {
        self.max_value = Some(value.into());
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsProfile {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<SettingsProfileElement>,
    /// Users and roles the profile applies to on its own.
    #[serde(default)]
    pub to: RoleSet,
}

impl SettingsProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
            to: RoleSet::none(),
        }
    }

    pub fn with_element(mut self, element: SettingsProfileElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn to(mut self, roles: RoleSet) -> Self {
        self.to = roles;
        self
    }
}

/// Any access entity held by the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    User(User),
    Role(Role),
    RowPolicy(RowPolicy),
    Quota(Quota),
    SettingsProfile(SettingsProfile),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Role(_) => EntityKind::Role,
            Entity::RowPolicy(_) => EntityKind::RowPolicy,
            Entity::Quota(_) => EntityKind::Quota,
            Entity::SettingsProfile(_) => EntityKind::SettingsProfile,
        }
    }

    /// Name under which the entity is looked up, unique per kind.
    pub fn name(&self) -> String {
        match self {
            Entity::User(user) => user.name.clone(),
            Entity::Role(role) => role.name.clone(),
            Entity::RowPolicy(policy) => policy.full_name(),
            Entity::Quota(quota) => quota.name.clone(),
            Entity::SettingsProfile(profile) => profile.name.clone(),
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Entity::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_role(&self) -> Option<&Role> {
        match self {
            Entity::Role(role) => Some(role),
            _ => None,
        }
    }

    pub fn as_row_policy(&self) -> Option<&RowPolicy> {
        match self {
            Entity::RowPolicy(policy) => Some(policy),
            _ => None,
        }
    }

    pub fn as_quota(&self) -> Option<&Quota> {
        match self {
            Entity::Quota(quota) => Some(quota),
            _ => None,
        }
    }

    pub fn as_settings_profile(&self) -> Option<&SettingsProfile> {
        match self {
            Entity::SettingsProfile(profile) => Some(profile),
            _ => None,
        }
    }

    /// Settings attached directly to users and roles.
    pub fn settings(&self) -> &[SettingsProfileElement] {
        match self {
            Entity::User(user) => &user.settings,
            Entity::Role(role) => &role.settings,
            Entity::RowPolicy(_) | Entity::Quota(_) | Entity::SettingsProfile(_) => &[],
        }
    }

    /// Privileges of users and roles; `None` for everything else.
    pub fn privileges(&self) -> Option<&Privileges> {
        match self {
            Entity::User(user) => Some(&user.privileges),
            Entity::Role(role) => Some(&role.privileges),
            Entity::RowPolicy(_) | Entity::Quota(_) | Entity::SettingsProfile(_) => None,
        }
    }

    pub fn privileges_mut(&mut self) -> Option<&mut Privileges> {
        match self {
            Entity::User(user) => Some(&mut user.privileges),
            Entity::Role(role) => Some(&mut role.privileges),
            Entity::RowPolicy(_) | Entity::Quota(_) | Entity::SettingsProfile(_) => None,
        }
    }
}

impl From<User> for Entity {
    fn from(user: User) -> Self {
        Entity::User(user)
    }
}

impl From<Role> for Entity {
    fn from(role: Role) -> Self {
        Entity::Role(role)
    }
}

impl From<RowPolicy> for Entity {
    fn from(policy: RowPolicy) -> Self {
        Entity::RowPolicy(policy)
    }
}

impl From<Quota> for Entity {
    fn from(quota: Quota) -> Self {
        Entity::Quota(quota)
    }
}

impl From<SettingsProfile> for Entity {
    fn from(profile: SettingsProfile) -> Self {
        Entity::SettingsProfile(profile)
    }
}
