//! Privilege flags and the keyword tree.
//!
//! Every privilege kind is one bit of [`AccessFlags`]. Only leaf privileges own
//! a bit; composite keywords such as `ALTER` or `ALL` are the union of their
//! descendants and are reconstructed for display by [`AccessFlags::to_keywords`].
//!
//! ```text
//! ALL
//! ├─ SHOW ─────────── SHOW DATABASES, SHOW TABLES, SHOW COLUMNS, SHOW DICTIONARIES
//! ├─ SELECT, INSERT
//! ├─ ALTER
//! │  ├─ ALTER TABLE ── ALTER UPDATE, ALTER DELETE, ALTER COLUMN, ALTER INDEX, ...
//! │  └─ ALTER VIEW ─── ALTER VIEW REFRESH, ALTER VIEW MODIFY QUERY
//! ├─ CREATE, DROP, TRUNCATE, OPTIMIZE, KILL QUERY
//! ├─ ACCESS MANAGEMENT, SYSTEM, INTROSPECTION, SOURCES
//! └─ dictGet
//! ```
//!
//! Each leaf declares the most specific [`AccessLevel`] it can be granted on.
//! `SELECT` is a column privilege and may be granted anywhere; `CREATE USER`
//! is a global privilege and may only be granted `ON *.*`.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub, SubAssign};
use std::sync::LazyLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AccessError, Result};

// ============================================================================
// Levels
// ============================================================================

/// Resource hierarchy level, from the whole server down to a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Global,
    Database,
    Table,
    Column,
}

impl AccessLevel {
    pub const ALL: [AccessLevel; 4] = [
        AccessLevel::Global,
        AccessLevel::Database,
        AccessLevel::Table,
        AccessLevel::Column,
    ];

    /// Level addressed by a resource path of the given length.
    pub fn from_depth(depth: usize) -> Result<Self> {
        Self::ALL
            .get(depth)
            .copied()
            .ok_or(AccessError::InvalidPath(depth))
    }

    pub fn depth(self) -> usize {
        self as usize
    }
}

impl Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessLevel::Global => "global",
            AccessLevel::Database => "database",
            AccessLevel::Table => "table",
            AccessLevel::Column => "column",
        })
    }
}

// ============================================================================
// AccessFlags
// ============================================================================

/// A set of privileges.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessFlags(u64);

const fn bit(n: u32) -> AccessFlags {
    AccessFlags(1 << n)
}

const fn union(parts: &[AccessFlags]) -> AccessFlags {
    let mut bits = 0;
    let mut i = 0;
    while i < parts.len() {
        bits |= parts[i].0;
        i += 1;
    }
    AccessFlags(bits)
}

impl AccessFlags {
    pub const SHOW_DATABASES: Self = bit(0);
    pub const SHOW_TABLES: Self = bit(1);
    pub const SHOW_COLUMNS: Self = bit(2);
    pub const SHOW_DICTIONARIES: Self = bit(3);
    pub const SELECT: Self = bit(4);
    pub const INSERT: Self = bit(5);
    pub const ALTER_UPDATE: Self = bit(6);
    pub const ALTER_DELETE: Self = bit(7);
    pub const ALTER_ADD_COLUMN: Self = bit(8);
    pub const ALTER_MODIFY_COLUMN: Self = bit(9);
    pub const ALTER_DROP_COLUMN: Self = bit(10);
    pub const ALTER_COMMENT_COLUMN: Self = bit(11);
    pub const ALTER_CLEAR_COLUMN: Self = bit(12);
    pub const ALTER_RENAME_COLUMN: Self = bit(13);
    pub const ALTER_ORDER_BY: Self = bit(14);
    pub const ALTER_ADD_INDEX: Self = bit(15);
    pub const ALTER_DROP_INDEX: Self = bit(16);
    pub const ALTER_SETTINGS: Self = bit(17);
    pub const ALTER_TTL: Self = bit(18);
    pub const ALTER_FREEZE_PARTITION: Self = bit(19);
    pub const ALTER_MOVE_PARTITION: Self = bit(20);
    pub const ALTER_FETCH_PARTITION: Self = bit(21);
    pub const ALTER_VIEW_REFRESH: Self = bit(22);
    pub const ALTER_VIEW_MODIFY_QUERY: Self = bit(23);
    pub const CREATE_DATABASE: Self = bit(24);
    pub const CREATE_TABLE: Self = bit(25);
    pub const CREATE_VIEW: Self = bit(26);
    pub const CREATE_DICTIONARY: Self = bit(27);
    pub const CREATE_TEMPORARY_TABLE: Self = bit(28);
    pub const DROP_DATABASE: Self = bit(29);
    pub const DROP_TABLE: Self = bit(30);
    pub const DROP_VIEW: Self = bit(31);
    pub const DROP_DICTIONARY: Self = bit(32);
    pub const TRUNCATE: Self = bit(33);
    pub const OPTIMIZE: Self = bit(34);
    pub const KILL_QUERY: Self = bit(35);
    pub const CREATE_USER: Self = bit(36);
    pub const ALTER_USER: Self = bit(37);
    pub const DROP_USER: Self = bit(38);
    pub const CREATE_ROLE: Self = bit(39);
    pub const ALTER_ROLE: Self = bit(40);
    pub const DROP_ROLE: Self = bit(41);
    pub const ROLE_ADMIN: Self = bit(42);
    pub const CREATE_ROW_POLICY: Self = bit(43);
    pub const ALTER_ROW_POLICY: Self = bit(44);
    pub const DROP_ROW_POLICY: Self = bit(45);
    pub const CREATE_QUOTA: Self = bit(46);
    pub const ALTER_QUOTA: Self = bit(47);
    pub const DROP_QUOTA: Self = bit(48);
    pub const SHOW_ACCESS: Self = bit(49);
    pub const SYSTEM_SHUTDOWN: Self = bit(50);
    pub const SYSTEM_DROP_CACHE: Self = bit(51);
    pub const SYSTEM_RELOAD: Self = bit(52);
    pub const SYSTEM_FLUSH_LOGS: Self = bit(53);
    pub const ADDRESS_TO_LINE: Self = bit(54);
    pub const ADDRESS_TO_SYMBOL: Self = bit(55);
    pub const DEMANGLE: Self = bit(56);
    pub const FILE: Self = bit(57);
    pub const URL: Self = bit(58);
    pub const REMOTE: Self = bit(59);
    pub const DICT_GET: Self = bit(60);

    pub const SHOW: Self = union(&[
        Self::SHOW_DATABASES,
        Self::SHOW_TABLES,
        Self::SHOW_COLUMNS,
        Self::SHOW_DICTIONARIES,
    ]);
    pub const ALTER_COLUMN: Self = union(&[
        Self::ALTER_ADD_COLUMN,
        Self::ALTER_MODIFY_COLUMN,
        Self::ALTER_DROP_COLUMN,
        Self::ALTER_COMMENT_COLUMN,
        Self::ALTER_CLEAR_COLUMN,
        Self::ALTER_RENAME_COLUMN,
    ]);
    pub const ALTER_INDEX: Self = union(&[
        Self::ALTER_ORDER_BY,
        Self::ALTER_ADD_INDEX,
        Self::ALTER_DROP_INDEX,
    ]);
    pub const ALTER_TABLE: Self = union(&[
        Self::ALTER_UPDATE,
        Self::ALTER_DELETE,
        Self::ALTER_COLUMN,
        Self::ALTER_INDEX,
        Self::ALTER_SETTINGS,
        Self::ALTER_TTL,
        Self::ALTER_FREEZE_PARTITION,
        Self::ALTER_MOVE_PARTITION,
        Self::ALTER_FETCH_PARTITION,
    ]);
    pub const ALTER_VIEW: Self = union(&[Self::ALTER_VIEW_REFRESH, Self::ALTER_VIEW_MODIFY_QUERY]);
    pub const ALTER: Self = union(&[Self::ALTER_TABLE, Self::ALTER_VIEW]);
    pub const CREATE: Self = union(&[
        Self::CREATE_DATABASE,
        Self::CREATE_TABLE,
        Self::CREATE_VIEW,
        Self::CREATE_DICTIONARY,
        Self::CREATE_TEMPORARY_TABLE,
    ]);
    pub const DROP: Self = union(&[
        Self::DROP_DATABASE,
        Self::DROP_TABLE,
        Self::DROP_VIEW,
        Self::DROP_DICTIONARY,
    ]);
    pub const ACCESS_MANAGEMENT: Self = union(&[
        Self::CREATE_USER,
        Self::ALTER_USER,
        Self::DROP_USER,
        Self::CREATE_ROLE,
        Self::ALTER_ROLE,
        Self::DROP_ROLE,
        Self::ROLE_ADMIN,
        Self::CREATE_ROW_POLICY,
        Self::ALTER_ROW_POLICY,
        Self::DROP_ROW_POLICY,
        Self::CREATE_QUOTA,
        Self::ALTER_QUOTA,
        Self::DROP_QUOTA,
        Self::SHOW_ACCESS,
    ]);
    pub const SYSTEM: Self = union(&[
        Self::SYSTEM_SHUTDOWN,
        Self::SYSTEM_DROP_CACHE,
        Self::SYSTEM_RELOAD,
        Self::SYSTEM_FLUSH_LOGS,
    ]);
    pub const INTROSPECTION: Self = union(&[
        Self::ADDRESS_TO_LINE,
        Self::ADDRESS_TO_SYMBOL,
        Self::DEMANGLE,
    ]);
    pub const SOURCES: Self = union(&[Self::FILE, Self::URL, Self::REMOTE]);

    /// Every privilege.
    pub const ALL: Self = AccessFlags((1 << 61) - 1);

    pub const fn empty() -> Self {
        AccessFlags(0)
    }

    /// Builds flags from raw bits, dropping bits that name no privilege.
    pub const fn from_bits_truncate(bits: u64) -> Self {
        AccessFlags(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every flag of `other` is also set in `self`.
    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: AccessFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Number of leaf privileges in the set.
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Parses a single keyword or alias, case-insensitively.
    ///
    /// `USAGE`, `NONE` and `NO PRIVILEGES` denote the empty set and
    /// `ALL EXCEPT INSERT AND ALTER` denotes a difference.
    pub fn from_keyword(keyword: &str) -> Result<Self> {
        let upper = keyword
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        if let Some((base, excluded)) = upper.split_once(" EXCEPT ") {
            let mut flags = Self::from_keyword(base)?;
            for part in excluded.split(" AND ") {
                flags -= Self::from_keyword(part)?;
            }
            return Ok(flags);
        }

        if matches!(upper.as_str(), "USAGE" | "NONE" | "NO PRIVILEGES") {
            return Ok(Self::empty());
        }

        KEYWORDS
            .by_name
            .get(&upper)
            .copied()
            .ok_or_else(|| AccessError::UnknownAccessType(keyword.trim().to_string()))
    }

    /// Parses a list of keywords into their union.
    pub fn from_keywords<I, S>(keywords: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keywords
            .into_iter()
            .try_fold(Self::empty(), |acc, kw| Ok(acc | Self::from_keyword(kw.as_ref())?))
    }

    /// The minimal covering set of keywords, largest composites first.
    ///
    /// An empty set is displayed as `USAGE`.
    pub fn to_keywords(self) -> Vec<&'static str> {
        if self.is_empty() {
            return vec!["USAGE"];
        }
        self.covering().into_iter().map(|(kw, _)| kw).collect()
    }

    /// Covering keywords paired with the flags each one stands for.
    pub fn covering(self) -> Vec<(&'static str, AccessFlags)> {
        let mut out = Vec::new();
        KEYWORDS.cover(ROOT, self, &mut out);
        out
    }

    /// Flags that may be granted on the given level.
    pub fn all_grantable_on_level(level: AccessLevel) -> Self {
        KEYWORDS.grantable[level.depth()]
    }

    /// Restricts the flags to those grantable on `level`.
    ///
    /// Each covering keyword must have at least one leaf grantable there, so
    /// `ALL` on a table keeps its table privileges while `CREATE USER` on a
    /// table is rejected outright.
    pub fn grantable_on(self, level: AccessLevel) -> Result<Self> {
        let grantable = Self::all_grantable_on_level(level);
        let mut result = Self::empty();
        for (_, flags) in self.covering() {
            let part = flags & grantable;
            if part.is_empty() {
                return Err(AccessError::InvalidGrant { flags, level });
            }
            result |= part;
        }
        Ok(result)
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        AccessFlags(self.0 & rhs.0)
    }
}

impl BitAndAssign for AccessFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Sub for AccessFlags {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        AccessFlags(self.0 & !rhs.0)
    }
}

impl SubAssign for AccessFlags {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl Not for AccessFlags {
    type Output = Self;

    /// Complement within the set of known privileges.
    fn not(self) -> Self {
        AccessFlags(!self.0 & Self::ALL.0)
    }
}

impl Display for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_keywords().join(", "))
    }
}

impl Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessFlags({self})")
    }
}

impl Serialize for AccessFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let keywords = if self.is_empty() {
            Vec::new()
        } else {
            self.to_keywords()
        };
        keywords.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AccessFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let keywords = Vec::<String>::deserialize(deserializer)?;
        Self::from_keywords(&keywords).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Keyword table
// ============================================================================

/// One entry of the declarative keyword table. Parents precede their children.
struct KeywordDecl {
    keyword: &'static str,
    parent: Option<&'static str>,
    aliases: &'static [&'static str],
    leaf: Option<(AccessFlags, AccessLevel)>,
}

const fn group(
    keyword: &'static str,
    parent: Option<&'static str>,
    aliases: &'static [&'static str],
) -> KeywordDecl {
    KeywordDecl {
        keyword,
        parent,
        aliases,
        leaf: None,
    }
}

const fn leaf(
    keyword: &'static str,
    parent: &'static str,
    flags: AccessFlags,
    level: AccessLevel,
    aliases: &'static [&'static str],
) -> KeywordDecl {
    KeywordDecl {
        keyword,
        parent: Some(parent),
        aliases,
        leaf: Some((flags, level)),
    }
}

use AccessLevel::{Column, Database, Global, Table};

#[rustfmt::skip]
static KEYWORD_TABLE: &[KeywordDecl] = &[
    group("ALL", None, &["ALL PRIVILEGES"]),

    group("SHOW", Some("ALL"), &[]),
    leaf("SHOW DATABASES", "SHOW", AccessFlags::SHOW_DATABASES, Database, &[]),
    leaf("SHOW TABLES", "SHOW", AccessFlags::SHOW_TABLES, Table, &[]),
    leaf("SHOW COLUMNS", "SHOW", AccessFlags::SHOW_COLUMNS, Column, &[]),
    leaf("SHOW DICTIONARIES", "SHOW", AccessFlags::SHOW_DICTIONARIES, Table, &[]),

    leaf("SELECT", "ALL", AccessFlags::SELECT, Column, &[]),
    leaf("INSERT", "ALL", AccessFlags::INSERT, Column, &[]),

    group("ALTER", Some("ALL"), &[]),
    group("ALTER TABLE", Some("ALTER"), &[]),
    leaf("ALTER UPDATE", "ALTER TABLE", AccessFlags::ALTER_UPDATE, Column, &["UPDATE"]),
    leaf("ALTER DELETE", "ALTER TABLE", AccessFlags::ALTER_DELETE, Column, &["DELETE"]),
    group("ALTER COLUMN", Some("ALTER TABLE"), &[]),
    leaf("ALTER ADD COLUMN", "ALTER COLUMN", AccessFlags::ALTER_ADD_COLUMN, Column, &[]),
    leaf("ALTER MODIFY COLUMN", "ALTER COLUMN", AccessFlags::ALTER_MODIFY_COLUMN, Column, &[]),
    leaf("ALTER DROP COLUMN", "ALTER COLUMN", AccessFlags::ALTER_DROP_COLUMN, Column, &[]),
    leaf("ALTER COMMENT COLUMN", "ALTER COLUMN", AccessFlags::ALTER_COMMENT_COLUMN, Column, &[]),
    leaf("ALTER CLEAR COLUMN", "ALTER COLUMN", AccessFlags::ALTER_CLEAR_COLUMN, Column, &[]),
    leaf("ALTER RENAME COLUMN", "ALTER COLUMN", AccessFlags::ALTER_RENAME_COLUMN, Column, &[]),
    group("ALTER INDEX", Some("ALTER TABLE"), &[]),
    leaf("ALTER ORDER BY", "ALTER INDEX", AccessFlags::ALTER_ORDER_BY, Table, &[]),
    leaf("ALTER ADD INDEX", "ALTER INDEX", AccessFlags::ALTER_ADD_INDEX, Table, &[]),
    leaf("ALTER DROP INDEX", "ALTER INDEX", AccessFlags::ALTER_DROP_INDEX, Table, &[]),
    leaf("ALTER SETTINGS", "ALTER TABLE", AccessFlags::ALTER_SETTINGS, Table, &[]),
    leaf("ALTER TTL", "ALTER TABLE", AccessFlags::ALTER_TTL, Table, &[]),
    leaf("ALTER FREEZE PARTITION", "ALTER TABLE", AccessFlags::ALTER_FREEZE_PARTITION, Table, &[]),
    leaf("ALTER MOVE PARTITION", "ALTER TABLE", AccessFlags::ALTER_MOVE_PARTITION, Table, &[]),
    leaf("ALTER FETCH PARTITION", "ALTER TABLE", AccessFlags::ALTER_FETCH_PARTITION, Table, &[]),
    group("ALTER VIEW", Some("ALTER"), &[]),
    leaf("ALTER VIEW REFRESH", "ALTER VIEW", AccessFlags::ALTER_VIEW_REFRESH, Table, &[]),
    leaf("ALTER VIEW MODIFY QUERY", "ALTER VIEW", AccessFlags::ALTER_VIEW_MODIFY_QUERY, Table, &[]),

    group("CREATE", Some("ALL"), &[]),
    leaf("CREATE DATABASE", "CREATE", AccessFlags::CREATE_DATABASE, Database, &[]),
    leaf("CREATE TABLE", "CREATE", AccessFlags::CREATE_TABLE, Table, &[]),
    leaf("CREATE VIEW", "CREATE", AccessFlags::CREATE_VIEW, Table, &[]),
    leaf("CREATE DICTIONARY", "CREATE", AccessFlags::CREATE_DICTIONARY, Table, &[]),
    leaf("CREATE TEMPORARY TABLE", "CREATE", AccessFlags::CREATE_TEMPORARY_TABLE, Global, &[]),

    group("DROP", Some("ALL"), &[]),
    leaf("DROP DATABASE", "DROP", AccessFlags::DROP_DATABASE, Database, &[]),
    leaf("DROP TABLE", "DROP", AccessFlags::DROP_TABLE, Table, &[]),
    leaf("DROP VIEW", "DROP", AccessFlags::DROP_VIEW, Table, &[]),
    leaf("DROP DICTIONARY", "DROP", AccessFlags::DROP_DICTIONARY, Table, &[]),

    leaf("TRUNCATE", "ALL", AccessFlags::TRUNCATE, Table, &[]),
    leaf("OPTIMIZE", "ALL", AccessFlags::OPTIMIZE, Table, &[]),
    leaf("KILL QUERY", "ALL", AccessFlags::KILL_QUERY, Global, &["KILL"]),

    group("ACCESS MANAGEMENT", Some("ALL"), &[]),
    leaf("CREATE USER", "ACCESS MANAGEMENT", AccessFlags::CREATE_USER, Global, &[]),
    leaf("ALTER USER", "ACCESS MANAGEMENT", AccessFlags::ALTER_USER, Global, &[]),
    leaf("DROP USER", "ACCESS MANAGEMENT", AccessFlags::DROP_USER, Global, &[]),
    leaf("CREATE ROLE", "ACCESS MANAGEMENT", AccessFlags::CREATE_ROLE, Global, &[]),
    leaf("ALTER ROLE", "ACCESS MANAGEMENT", AccessFlags::ALTER_ROLE, Global, &[]),
    leaf("DROP ROLE", "ACCESS MANAGEMENT", AccessFlags::DROP_ROLE, Global, &[]),
    leaf("ROLE ADMIN", "ACCESS MANAGEMENT", AccessFlags::ROLE_ADMIN, Global, &[]),
    leaf("CREATE ROW POLICY", "ACCESS MANAGEMENT", AccessFlags::CREATE_ROW_POLICY, Global, &[]),
    leaf("ALTER ROW POLICY", "ACCESS MANAGEMENT", AccessFlags::ALTER_ROW_POLICY, Global, &[]),
    leaf("DROP ROW POLICY", "ACCESS MANAGEMENT", AccessFlags::DROP_ROW_POLICY, Global, &[]),
    leaf("CREATE QUOTA", "ACCESS MANAGEMENT", AccessFlags::CREATE_QUOTA, Global, &[]),
    leaf("ALTER QUOTA", "ACCESS MANAGEMENT", AccessFlags::ALTER_QUOTA, Global, &[]),
    leaf("DROP QUOTA", "ACCESS MANAGEMENT", AccessFlags::DROP_QUOTA, Global, &[]),
    leaf("SHOW ACCESS", "ACCESS MANAGEMENT", AccessFlags::SHOW_ACCESS, Global, &[]),

    group("SYSTEM", Some("ALL"), &[]),
    leaf("SYSTEM SHUTDOWN", "SYSTEM", AccessFlags::SYSTEM_SHUTDOWN, Global, &[]),
    leaf("SYSTEM DROP CACHE", "SYSTEM", AccessFlags::SYSTEM_DROP_CACHE, Global, &[]),
    leaf("SYSTEM RELOAD", "SYSTEM", AccessFlags::SYSTEM_RELOAD, Global, &[]),
    leaf("SYSTEM FLUSH LOGS", "SYSTEM", AccessFlags::SYSTEM_FLUSH_LOGS, Global, &[]),

    group("INTROSPECTION", Some("ALL"), &["INTROSPECTION FUNCTIONS"]),
    leaf("addressToLine", "INTROSPECTION", AccessFlags::ADDRESS_TO_LINE, Global, &[]),
    leaf("addressToSymbol", "INTROSPECTION", AccessFlags::ADDRESS_TO_SYMBOL, Global, &[]),
    leaf("demangle", "INTROSPECTION", AccessFlags::DEMANGLE, Global, &[]),

    group("SOURCES", Some("ALL"), &[]),
    leaf("FILE", "SOURCES", AccessFlags::FILE, Global, &[]),
    leaf("URL", "SOURCES", AccessFlags::URL, Global, &[]),
    leaf("REMOTE", "SOURCES", AccessFlags::REMOTE, Global, &[]),

    leaf("dictGet", "ALL", AccessFlags::DICT_GET, Table, &["dictHas", "dictGetHierarchy", "dictIsIn"]),
];

const ROOT: usize = 0;

/// Keyword tree flattened into index-linked nodes, built once from [`KEYWORD_TABLE`].
struct KeywordIndex {
    nodes: Vec<KeywordNode>,
    by_name: HashMap<String, AccessFlags>,
    grantable: [AccessFlags; 4],
}

struct KeywordNode {
    keyword: &'static str,
    flags: AccessFlags,
    children: Vec<usize>,
}

static KEYWORDS: LazyLock<KeywordIndex> = LazyLock::new(KeywordIndex::build);

impl KeywordIndex {
    fn build() -> Self {
        let mut ids: HashMap<&'static str, usize> = HashMap::new();
        let mut parents: Vec<Option<usize>> = Vec::with_capacity(KEYWORD_TABLE.len());
        let mut nodes: Vec<KeywordNode> = Vec::with_capacity(KEYWORD_TABLE.len());
        let mut grantable = [AccessFlags::empty(); 4];

        for decl in KEYWORD_TABLE {
            let id = nodes.len();
            let parent = decl.parent.and_then(|name| ids.get(name).copied());
            debug_assert!(
                decl.parent.is_none() || parent.is_some(),
                "{} is declared before its parent",
                decl.keyword
            );
            if let Some(parent) = parent {
                nodes[parent].children.push(id);
            }

            let mut flags = AccessFlags::empty();
            if let Some((leaf_flags, level)) = decl.leaf {
                // A leaf is grantable on its own level and on every coarser one.
                for mask in &mut grantable[..=level.depth()] {
                    *mask |= leaf_flags;
                }
                flags = leaf_flags;
            }

            ids.insert(decl.keyword, id);
            parents.push(parent);
            nodes.push(KeywordNode {
                keyword: decl.keyword,
                flags,
                children: Vec::new(),
            });
        }

        // Children follow their parents, so one reverse pass folds leaves upward.
        for id in (0..nodes.len()).rev() {
            if let Some(parent) = parents[id] {
                let flags = nodes[id].flags;
                nodes[parent].flags |= flags;
            }
        }

        let mut by_name = HashMap::new();
        for (decl, node) in KEYWORD_TABLE.iter().zip(&nodes) {
            for name in std::iter::once(&decl.keyword).chain(decl.aliases) {
                by_name.insert(name.to_ascii_uppercase(), node.flags);
            }
        }

        Self {
            nodes,
            by_name,
            grantable,
        }
    }

    fn cover(&self, id: usize, flags: AccessFlags, out: &mut Vec<(&'static str, AccessFlags)>) {
        let node = &self.nodes[id];
        if !flags.intersects(node.flags) {
            return;
        }
        if flags.contains(node.flags) {
            out.push((node.keyword, node.flags));
            return;
        }
        for &child in &node.children {
            self.cover(child, flags, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn tree_covers_every_declared_bit() {
        assert_eq!(KEYWORDS.nodes[ROOT].flags, AccessFlags::ALL);
        assert_eq!(AccessFlags::from_keyword("ALL").unwrap(), AccessFlags::ALL);
    }

    #[test]
    fn leaf_bits_are_distinct() {
        let leaves: Vec<_> = KEYWORDS
            .nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| n.flags)
            .collect();
        assert_eq!(leaves.len(), 61);
        let total = leaves.iter().fold(AccessFlags::empty(), |acc, f| acc | *f);
        assert_eq!(total.count(), 61);
    }

    #[test]
    fn group_constants_match_tree() {
        for (name, flags) in [
            ("SHOW", AccessFlags::SHOW),
            ("ALTER", AccessFlags::ALTER),
            ("ALTER TABLE", AccessFlags::ALTER_TABLE),
            ("CREATE", AccessFlags::CREATE),
            ("DROP", AccessFlags::DROP),
            ("ACCESS MANAGEMENT", AccessFlags::ACCESS_MANAGEMENT),
            ("SYSTEM", AccessFlags::SYSTEM),
            ("INTROSPECTION", AccessFlags::INTROSPECTION),
            ("SOURCES", AccessFlags::SOURCES),
        ] {
            assert_eq!(AccessFlags::from_keyword(name).unwrap(), flags, "{name}");
        }
    }

    #[test_case("select", AccessFlags::SELECT; "lowercase")]
    #[test_case("  Select  ", AccessFlags::SELECT; "padded")]
    #[test_case("ALL PRIVILEGES", AccessFlags::ALL; "all privileges alias")]
    #[test_case("UPDATE", AccessFlags::ALTER_UPDATE; "update alias")]
    #[test_case("kill", AccessFlags::KILL_QUERY; "kill alias")]
    #[test_case("dictHas", AccessFlags::DICT_GET; "dict alias")]
    #[test_case("DEMANGLE", AccessFlags::DEMANGLE; "mixed case keyword")]
    #[test_case("USAGE", AccessFlags::empty(); "usage")]
    #[test_case("NO   PRIVILEGES", AccessFlags::empty(); "no privileges")]
    #[test_case("ALL EXCEPT ALTER AND DROP", AccessFlags::ALL - AccessFlags::ALTER - AccessFlags::DROP; "except")]
    fn keyword_parsing(keyword: &str, expected: AccessFlags) {
        assert_eq!(AccessFlags::from_keyword(keyword).unwrap(), expected);
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = AccessFlags::from_keyword("SELEKT").unwrap_err();
        assert_eq!(err, AccessError::UnknownAccessType("SELEKT".to_string()));
        assert_eq!(err.to_string(), "Unknown access type: SELEKT");
    }

    #[test]
    fn keywords_prefer_largest_composite() {
        let flags = AccessFlags::ALTER | AccessFlags::SELECT;
        assert_eq!(flags.to_keywords(), vec!["SELECT", "ALTER"]);

        let partial_alter = AccessFlags::ALTER_TABLE | AccessFlags::ALTER_VIEW_REFRESH;
        assert_eq!(
            partial_alter.to_keywords(),
            vec!["ALTER TABLE", "ALTER VIEW REFRESH"]
        );

        assert_eq!(AccessFlags::ALL.to_keywords(), vec!["ALL"]);
        assert_eq!(AccessFlags::empty().to_keywords(), vec!["USAGE"]);
    }

    #[test]
    fn display_joins_keywords() {
        let flags = AccessFlags::SELECT | AccessFlags::INSERT | AccessFlags::CREATE_USER;
        assert_eq!(flags.to_string(), "SELECT, INSERT, CREATE USER");
    }

    #[test_case(AccessLevel::Global, AccessFlags::CREATE_USER, true)]
    #[test_case(AccessLevel::Database, AccessFlags::CREATE_USER, false)]
    #[test_case(AccessLevel::Database, AccessFlags::CREATE_DATABASE, true)]
    #[test_case(AccessLevel::Table, AccessFlags::CREATE_DATABASE, false)]
    #[test_case(AccessLevel::Table, AccessFlags::DROP_TABLE, true)]
    #[test_case(AccessLevel::Column, AccessFlags::DROP_TABLE, false)]
    #[test_case(AccessLevel::Column, AccessFlags::SELECT, true)]
    #[test_case(AccessLevel::Global, AccessFlags::SELECT, true)]
    fn grantable_levels(level: AccessLevel, flags: AccessFlags, grantable: bool) {
        assert_eq!(
            AccessFlags::all_grantable_on_level(level).contains(flags),
            grantable
        );
    }

    #[test]
    fn grantable_levels_narrow_monotonically() {
        for pair in AccessLevel::ALL.windows(2) {
            let coarse = AccessFlags::all_grantable_on_level(pair[0]);
            let fine = AccessFlags::all_grantable_on_level(pair[1]);
            assert!(coarse.contains(fine));
        }
        assert_eq!(
            AccessFlags::all_grantable_on_level(AccessLevel::Global),
            AccessFlags::ALL
        );
    }

    #[test]
    fn composite_keeps_grantable_part_on_table() {
        let granted = AccessFlags::ALL.grantable_on(AccessLevel::Table).unwrap();
        assert!(granted.contains(AccessFlags::SELECT | AccessFlags::DROP_TABLE));
        assert!(!granted.intersects(AccessFlags::CREATE_USER | AccessFlags::DROP_DATABASE));
    }

    #[test]
    fn global_only_keyword_is_rejected_on_table() {
        let err = (AccessFlags::SELECT | AccessFlags::CREATE_USER)
            .grantable_on(AccessLevel::Table)
            .unwrap_err();
        assert_eq!(
            err,
            AccessError::InvalidGrant {
                flags: AccessFlags::CREATE_USER,
                level: AccessLevel::Table,
            }
        );
        assert_eq!(
            err.to_string(),
            "CREATE USER cannot be granted on the table level"
        );
    }

    #[test]
    fn serde_uses_keywords() {
        let flags = AccessFlags::SELECT | AccessFlags::ALTER;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, r#"["SELECT","ALTER"]"#);
        let back: AccessFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);

        assert_eq!(serde_json::to_string(&AccessFlags::empty()).unwrap(), "[]");
        assert!(serde_json::from_str::<AccessFlags>(r#"["NOPE"]"#).is_err());
    }

    #[test]
    fn complement_stays_within_known_bits() {
        assert_eq!(!AccessFlags::empty(), AccessFlags::ALL);
        assert_eq!(!AccessFlags::ALL, AccessFlags::empty());
        assert_eq!(AccessFlags::from_bits_truncate(u64::MAX), AccessFlags::ALL);
    }

    proptest! {
        #[test]
        fn keywords_round_trip(bits in any::<u64>()) {
            let flags = AccessFlags::from_bits_truncate(bits);
            prop_assert_eq!(AccessFlags::from_keywords(flags.to_keywords()).unwrap(), flags);
        }

        #[test]
        fn covering_is_disjoint(bits in any::<u64>()) {
            let flags = AccessFlags::from_bits_truncate(bits);
            let mut seen = AccessFlags::empty();
            for (_, part) in flags.covering() {
                prop_assert!(!seen.intersects(part));
                seen |= part;
            }
            prop_assert_eq!(seen, flags);
        }

        #[test]
        fn difference_and_intersection_partition(a in any::<u64>(), b in any::<u64>()) {
            let a = AccessFlags::from_bits_truncate(a);
            let b = AccessFlags::from_bits_truncate(b);
            prop_assert_eq!((a - b) | (a & b), a);
            prop_assert!(!(a - b).intersects(b));
        }
    }
}
