//! # palisade-types: Core identifiers for Palisade
//!
//! Every access entity (user, role, row policy, quota, settings profile) lives in one id space
//! keyed by [`EntityId`]. The aliases [`UserId`] and [`RoleId`] document which
//! kind of entity an id is expected to name; the storage layer checks the kind
//! when an entity is read.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Entity identifiers
// ============================================================================

/// Unique identifier of an access entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// The all-zero id. Never generated, so it names no stored entity.
    pub const NIL: EntityId = EntityId(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an identifier from a small integer. Useful for fixtures where
    /// stable, readable ids matter more than uniqueness across processes.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a user entity.
pub type UserId = EntityId;

/// Identifier of a role entity.
pub type RoleId = EntityId;

// ============================================================================
// Entity kinds
// ============================================================================

/// The kind of an access entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Role,
    RowPolicy,
    Quota,
    SettingsProfile,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Role,
        EntityKind::RowPolicy,
        EntityKind::Quota,
        EntityKind::SettingsProfile,
    ];

    /// Keyword used in SQL statements for this kind (`USER`, `ROW POLICY`, ...).
    pub fn keyword(self) -> &'static str {
        match self {
            EntityKind::User => "USER",
            EntityKind::Role => "ROLE",
            EntityKind::RowPolicy => "ROW POLICY",
            EntityKind::Quota => "QUOTA",
            EntityKind::SettingsProfile => "SETTINGS PROFILE",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::RowPolicy => "row policy",
            EntityKind::Quota => "quota",
            EntityKind::SettingsProfile => "settings profile",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn entity_id_parses_its_display_form() {
        let id = EntityId::generate();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn fixture_ids_are_stable_and_ordered() {
        assert_eq!(EntityId::from_u128(7), EntityId::from_u128(7));
        assert!(EntityId::from_u128(1) < EntityId::from_u128(2));
    }

    #[test]
    fn entity_id_serializes_as_uuid_string() {
        let id = EntityId::from_u128(1);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000001\"");
    }

    #[test_case(EntityKind::User, "USER")]
    #[test_case(EntityKind::Role, "ROLE")]
    #[test_case(EntityKind::RowPolicy, "ROW POLICY")]
    #[test_case(EntityKind::Quota, "QUOTA")]
    #[test_case(EntityKind::SettingsProfile, "SETTINGS PROFILE")]
    fn kind_keywords(kind: EntityKind, keyword: &str) {
        assert_eq!(kind.keyword(), keyword);
    }

    proptest! {
        #[test]
        fn id_order_follows_numeric_order(a in any::<u128>(), b in any::<u128>()) {
            prop_assert_eq!(EntityId::from_u128(a).cmp(&EntityId::from_u128(b)), a.cmp(&b));
        }
    }
}
