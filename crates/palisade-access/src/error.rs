//! Error types for access evaluation.

use std::net::IpAddr;

use palisade_types::{EntityId, EntityKind};
use thiserror::Error;

use crate::element::AccessRightsElement;
use crate::entities::QuotaResource;
use crate::flags::{AccessFlags, AccessLevel};

/// Errors raised while building or evaluating access rights.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Unknown access type: {0}")]
    UnknownAccessType(String),

    #[error("{flags} cannot be granted on the {level} level")]
    InvalidGrant {
        flags: AccessFlags,
        level: AccessLevel,
    },

    #[error("resource path has {0} components, at most database, table and column are allowed")]
    InvalidPath(usize),

    #[error("Current database is not set")]
    CurrentDatabaseNotSet,

    #[error(
        "{user}: Not enough privileges. To execute this query it's necessary to have the grant {missing}{}",
        grant_option_suffix(.grant_option)
    )]
    NotEnoughPrivileges {
        user: String,
        missing: AccessRightsElement,
        grant_option: bool,
    },

    #[error(
        "{user}: Not enough privileges. To execute this query it's necessary to have the role {role} granted with ADMIN option"
    )]
    NotEnoughAdminOption { user: String, role: String },

    #[error("{0}: Authentication failed: password is incorrect")]
    WrongPassword(String),

    #[error("{user}: Authentication failed: connections from {address} are not allowed")]
    HostNotAllowed { user: String, address: IpAddr },

    #[error("DNS error while resolving {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("invalid host pattern: {0}")]
    InvalidHostPattern(String),

    #[error("user {0} not found")]
    UserNotFound(EntityId),

    #[error("role {0} not found")]
    RoleNotFound(EntityId),

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("entity {id} is not a {expected}")]
    WrongEntityKind { id: EntityId, expected: EntityKind },

    #[error("{kind} `{name}` already exists")]
    NameCollision { kind: EntityKind, name: String },

    #[error(
        "Quota for user `{user}` for {interval_secs} seconds has been exceeded: {resource} = {used}/{max}. Name of quota template: `{quota}`"
    )]
    QuotaExceeded {
        user: String,
        quota: String,
        resource: QuotaResource,
        used: u64,
        max: u64,
        interval_secs: u64,
    },

    #[error("Settings profile `{0}` not found")]
    SettingsProfileNotFound(String),

    #[error("Cannot modify '{0}' setting in readonly mode")]
    SettingReadonly(String),

    #[error("Cannot modify 'allow_ddl' setting when DDL queries are prohibited for the user")]
    DdlSettingProhibited,

    #[error("Setting {setting} {reason}")]
    SettingConstraintViolation { setting: String, reason: String },
}

impl AccessError {
    /// Returns true for the terminal denials raised by access checks.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            AccessError::NotEnoughPrivileges { .. } | AccessError::NotEnoughAdminOption { .. }
        )
    }

    /// Returns true for rejected changes of session settings.
    pub fn is_setting_violation(&self) -> bool {
        matches!(
            self,
            AccessError::SettingReadonly(_)
                | AccessError::DdlSettingProhibited
                | AccessError::SettingConstraintViolation { .. }
        )
    }
}

fn grant_option_suffix(grant_option: &bool) -> &'static str {
    if *grant_option { " WITH GRANT OPTION" } else { "" }
}

pub type Result<T> = std::result::Result<T, AccessError>;
