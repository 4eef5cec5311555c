//! `SHOW GRANTS`: rebuilds the GRANT and REVOKE statements that would
//! recreate an entity's privileges.

use std::fmt;

use palisade_types::{EntityId, EntityKind};

use crate::element::{AccessRightsElement, backquote_if_needed};
use crate::entities::{Entity, GrantedRoles};
use crate::error::{AccessError, Result};
use crate::manager::GrantKind;
use crate::rights::AccessRights;
use crate::storage::AccessStorage;

/// One line of `SHOW GRANTS` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantStatement {
    /// Privileges on one target. All elements share database and table.
    Privileges {
        kind: GrantKind,
        grant_option: bool,
        elements: Vec<AccessRightsElement>,
        grantee: String,
    },
    Roles {
        roles: Vec<String>,
        admin_option: bool,
        grantee: String,
    },
}

impl GrantStatement {
    pub fn to_string_with_current_database(&self, current_database: Option<&str>) -> String {
        match self {
            GrantStatement::Privileges {
                kind,
                grant_option,
                elements,
                grantee,
            } => {
                let keywords: Vec<String> = elements.iter().map(AccessRightsElement::keywords_to_string).collect();
                let target = elements
                    .first()
                    .map_or_else(|| "*.*".to_string(), |e| e.target_to_string(current_database));
                let grantee = backquote_if_needed(grantee);
                match (kind, grant_option) {
                    (GrantKind::Grant, false) => format!("GRANT {} ON {target} TO {grantee}", keywords.join(", ")),
                    (GrantKind::Grant, true) => format!(
                        "GRANT {} ON {target} TO {grantee} WITH GRANT OPTION",
                        keywords.join(", ")
                    ),
                    (GrantKind::Revoke, false) => format!("REVOKE {} ON {target} FROM {grantee}", keywords.join(", ")),
                    (GrantKind::Revoke, true) => format!(
                        "REVOKE GRANT OPTION FOR {} ON {target} FROM {grantee}",
                        keywords.join(", ")
                    ),
                }
            }
            GrantStatement::Roles {
                roles,
                admin_option,
                grantee,
            } => {
                let roles: Vec<_> = roles.iter().map(|role| backquote_if_needed(role)).collect();
                let suffix = if *admin_option { " WITH ADMIN OPTION" } else { "" };
                format!("GRANT {} TO {}{suffix}", roles.join(", "), backquote_if_needed(grantee))
            }
        }
    }
}

impl fmt::Display for GrantStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_current_database(None))
    }
}

/// Statements for one privilege tree, grouping consecutive elements that fit
/// one statement.
pub fn privilege_statements(grantee: &str, access: &AccessRights, grant_option: bool) -> Vec<GrantStatement> {
    let mut statements: Vec<GrantStatement> = Vec::new();
    for mut element in access.elements() {
        element.grant_option = grant_option;
        let kind = if element.is_partial_revoke {
            GrantKind::Revoke
        } else {
            GrantKind::Grant
        };
        if let Some(GrantStatement::Privileges { elements, .. }) = statements.last_mut()
            && elements.last().is_some_and(|last| last.same_statement(&element))
        {
            elements.push(element);
            continue;
        }
        statements.push(GrantStatement::Privileges {
            kind,
            grant_option,
            elements: vec![element],
            grantee: grantee.to_string(),
        });
    }
    statements
}

/// One `GRANT r1, r2 TO x` line and one `... WITH ADMIN OPTION` line, role
/// names sorted. Roles missing from `storage` are left out.
pub fn role_statements(grantee: &str, granted_roles: &GrantedRoles, storage: &dyn AccessStorage) -> Vec<GrantStatement> {
    let plain = role_names(
        storage,
        granted_roles
            .roles()
            .iter()
            .copied()
            .filter(|id| !granted_roles.has_admin_option(*id)),
    );
    let with_admin = role_names(storage, granted_roles.roles_with_admin_option().iter().copied());

    [(plain, false), (with_admin, true)]
        .into_iter()
        .filter(|(roles, _)| !roles.is_empty())
        .map(|(roles, admin_option)| GrantStatement::Roles {
            roles,
            admin_option,
            grantee: grantee.to_string(),
        })
        .collect()
}

fn role_names(storage: &dyn AccessStorage, ids: impl Iterator<Item = EntityId>) -> Vec<String> {
    let mut names: Vec<String> = ids
        .filter_map(|id| storage.try_read(id))
        .map(|entity| entity.name())
        .collect();
    names.sort();
    names
}

/// `SHOW GRANTS FOR entity`, rendered against `current_database`.
pub fn show_grants(
    storage: &dyn AccessStorage,
    entity_id: EntityId,
    current_database: Option<&str>,
) -> Result<Vec<String>> {
    let entity = storage.read(entity_id)?;
    let statements = grant_statements(&entity, storage).ok_or(AccessError::WrongEntityKind {
        id: entity_id,
        expected: EntityKind::Role,
    })?;
    Ok(statements
        .iter()
        .map(|statement| statement.to_string_with_current_database(current_database))
        .collect())
}

/// Statements that recreate a user's or role's privileges; `None` for other
/// entities.
pub fn grant_statements(entity: &Entity, storage: &dyn AccessStorage) -> Option<Vec<GrantStatement>> {
    let privileges = entity.privileges()?;
    let name = entity.name();
    let mut statements = privilege_statements(&name, &privileges.access, false);
    statements.extend(privilege_statements(&name, &privileges.access_with_grant_option, true));
    statements.extend(role_statements(&name, &privileges.granted_roles, storage));
    Some(statements)
}
