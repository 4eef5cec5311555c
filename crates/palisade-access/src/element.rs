//! Access requests and grants scoped to a resource.

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::flags::{AccessFlags, AccessLevel};

/// Which database an element targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseScope {
    /// `*.*`
    Any,
    /// The session's current database, resolved when the element is applied.
    Current,
    Named(String),
}

/// Privileges on one resource: `SELECT(a,b), INSERT(a,b) ON db.t`.
///
/// A table requires a database other than [`DatabaseScope::Any`] and columns
/// require a table; the constructors keep that shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRightsElement {
    pub access_flags: AccessFlags,
    pub database: DatabaseScope,
    /// `None` means every table of the database.
    pub table: Option<String>,
    /// `None` means every column of the table.
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub grant_option: bool,
    #[serde(default)]
    pub is_partial_revoke: bool,
}

impl AccessRightsElement {
    fn scoped(
        access_flags: AccessFlags,
        database: DatabaseScope,
        table: Option<String>,
        columns: Option<Vec<String>>,
    ) -> Self {
        Self {
            access_flags,
            database,
            table,
            columns,
            grant_option: false,
            is_partial_revoke: false,
        }
    }

    /// `ON *.*`
    pub fn global(access_flags: AccessFlags) -> Self {
        Self::scoped(access_flags, DatabaseScope::Any, None, None)
    }

    /// `ON db.*`
    pub fn database(access_flags: AccessFlags, database: impl Into<String>) -> Self {
        Self::scoped(
            access_flags,
            DatabaseScope::Named(database.into()),
            None,
            None,
        )
    }

    /// `ON db.table`
    pub fn table(
        access_flags: AccessFlags,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self::scoped(
            access_flags,
            DatabaseScope::Named(database.into()),
            Some(table.into()),
            None,
        )
    }

    /// `(c1,c2) ON db.table`
    pub fn columns<I, S>(
        access_flags: AccessFlags,
        database: impl Into<String>,
        table: impl Into<String>,
        columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scoped(
            access_flags,
            DatabaseScope::Named(database.into()),
            Some(table.into()),
            Some(columns.into_iter().map(Into::into).collect()),
        )
    }

    /// `ON *`, every table of the current database.
    pub fn current_database(access_flags: AccessFlags) -> Self {
        Self::scoped(access_flags, DatabaseScope::Current, None, None)
    }

    /// `ON table` in the current database.
    pub fn current_table(access_flags: AccessFlags, table: impl Into<String>) -> Self {
        Self::scoped(
            access_flags,
            DatabaseScope::Current,
            Some(table.into()),
            None,
        )
    }

    /// Narrows a table element to the given columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_grant_option(mut self) -> Self {
        self.grant_option = true;
        self
    }

    pub fn as_partial_revoke(mut self) -> Self {
        self.is_partial_revoke = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.access_flags.is_empty()
    }

    /// The most specific level this element addresses.
    pub fn level(&self) -> AccessLevel {
        if self.database == DatabaseScope::Any {
            AccessLevel::Global
        } else if self.table.is_none() {
            AccessLevel::Database
        } else if self.columns.is_none() {
            AccessLevel::Table
        } else {
            AccessLevel::Column
        }
    }

    /// Replaces [`DatabaseScope::Current`] with the named database.
    pub fn resolve_current_database(&mut self, current_database: &str) -> Result<()> {
        if self.database == DatabaseScope::Current {
            if current_database.is_empty() {
                return Err(AccessError::CurrentDatabaseNotSet);
            }
            self.database = DatabaseScope::Named(current_database.to_string());
        }
        Ok(())
    }

    /// Resource paths this element covers, one per column.
    ///
    /// Fails if the element still refers to the current database.
    pub fn paths(&self) -> Result<Vec<Vec<&str>>> {
        let database = match &self.database {
            DatabaseScope::Any => return Ok(vec![Vec::new()]),
            DatabaseScope::Current => return Err(AccessError::CurrentDatabaseNotSet),
            DatabaseScope::Named(name) => name.as_str(),
        };
        let Some(table) = self.table.as_deref() else {
            return Ok(vec![vec![database]]);
        };
        match &self.columns {
            None => Ok(vec![vec![database, table]]),
            Some(columns) => Ok(columns
                .iter()
                .map(|column| vec![database, table, column.as_str()])
                .collect()),
        }
    }

    /// True if both elements name the same database and table.
    pub fn same_target(&self, other: &Self) -> bool {
        self.database == other.database && self.table == other.table
    }

    /// True if both elements can be printed in one GRANT or REVOKE statement.
    pub fn same_statement(&self, other: &Self) -> bool {
        self.same_target(other)
            && self.grant_option == other.grant_option
            && self.is_partial_revoke == other.is_partial_revoke
    }

    /// The privilege part: `SELECT(a,b), INSERT(a,b)`.
    pub fn keywords_to_string(&self) -> String {
        let suffix = self.columns.as_ref().map(|columns| {
            let quoted: Vec<_> = columns.iter().map(|c| backquote_if_needed(c)).collect();
            format!("({})", quoted.join(","))
        });
        self.access_flags
            .to_keywords()
            .iter()
            .map(|kw| match &suffix {
                Some(suffix) => format!("{kw}{suffix}"),
                None => (*kw).to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The target part: `*.*`, `db.*`, `db.t`, `*` or `t`.
    ///
    /// A database equal to `current_database` is left out, as if the element
    /// had been written against the current database.
    pub fn target_to_string(&self, current_database: Option<&str>) -> String {
        let table = self
            .table
            .as_deref()
            .map_or(Cow::Borrowed("*"), backquote_if_needed);
        match &self.database {
            DatabaseScope::Any => "*.*".to_string(),
            DatabaseScope::Named(db) if Some(db.as_str()) != current_database => {
                format!("{}.{table}", backquote_if_needed(db))
            }
            DatabaseScope::Named(_) | DatabaseScope::Current => table.into_owned(),
        }
    }

    pub fn to_string_with_current_database(&self, current_database: Option<&str>) -> String {
        format!(
            "{} ON {}",
            self.keywords_to_string(),
            self.target_to_string(current_database)
        )
    }
}

impl Display for AccessRightsElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_current_database(None))
    }
}

/// A list of elements, as carried by one GRANT or REVOKE statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessRightsElements(Vec<AccessRightsElement>);

impl AccessRightsElements {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn into_vec(self) -> Vec<AccessRightsElement> {
        self.0
    }

    pub fn resolve_current_database(&mut self, current_database: &str) -> Result<()> {
        self.0
            .iter_mut()
            .try_for_each(|element| element.resolve_current_database(current_database))
    }
}

impl Deref for AccessRightsElements {
    type Target = Vec<AccessRightsElement>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AccessRightsElements {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<AccessRightsElement>> for AccessRightsElements {
    fn from(elements: Vec<AccessRightsElement>) -> Self {
        Self(elements)
    }
}

impl FromIterator<AccessRightsElement> for AccessRightsElements {
    fn from_iter<T: IntoIterator<Item = AccessRightsElement>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AccessRightsElements {
    type Item = AccessRightsElement;
    type IntoIter = std::vec::IntoIter<AccessRightsElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Display for AccessRightsElements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("USAGE ON *.*");
        }
        let parts: Vec<_> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

/// Wraps an identifier in backquotes unless it is a plain word.
pub fn backquote_if_needed(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("`{}`", name.replace('`', "\\`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(AccessRightsElement::global(AccessFlags::SELECT), "SELECT ON *.*")]
    #[test_case(AccessRightsElement::database(AccessFlags::SELECT, "db"), "SELECT ON db.*")]
    #[test_case(AccessRightsElement::table(AccessFlags::SELECT | AccessFlags::INSERT, "db", "t"), "SELECT, INSERT ON db.t")]
    #[test_case(AccessRightsElement::columns(AccessFlags::SELECT | AccessFlags::INSERT, "db", "t", ["a", "b"]), "SELECT(a,b), INSERT(a,b) ON db.t")]
    #[test_case(AccessRightsElement::current_database(AccessFlags::DROP_TABLE), "DROP TABLE ON *")]
    #[test_case(AccessRightsElement::current_table(AccessFlags::SELECT, "t"), "SELECT ON t")]
    #[test_case(AccessRightsElement::table(AccessFlags::SELECT, "my-db", "1t"), "SELECT ON `my-db`.`1t`")]
    #[test_case(AccessRightsElement::global(AccessFlags::empty()), "USAGE ON *.*")]
    fn element_display(element: AccessRightsElement, expected: &str) {
        assert_eq!(element.to_string(), expected);
    }

    #[test]
    fn current_database_is_elided() {
        let element = AccessRightsElement::columns(AccessFlags::SELECT, "default", "t", ["x"]);
        assert_eq!(
            element.to_string_with_current_database(Some("default")),
            "SELECT(x) ON t"
        );
        assert_eq!(
            element.to_string_with_current_database(Some("other")),
            "SELECT(x) ON default.t"
        );
    }

    #[test]
    fn levels_follow_scope() {
        assert_eq!(
            AccessRightsElement::global(AccessFlags::SELECT).level(),
            AccessLevel::Global
        );
        assert_eq!(
            AccessRightsElement::current_database(AccessFlags::SELECT).level(),
            AccessLevel::Database
        );
        assert_eq!(
            AccessRightsElement::table(AccessFlags::SELECT, "db", "t").level(),
            AccessLevel::Table
        );
        assert_eq!(
            AccessRightsElement::current_table(AccessFlags::SELECT, "t")
                .with_columns(["a"])
                .level(),
            AccessLevel::Column
        );
    }

    #[test]
    fn resolving_current_database() {
        let mut element = AccessRightsElement::current_table(AccessFlags::SELECT, "t");
        assert_eq!(element.paths(), Err(AccessError::CurrentDatabaseNotSet));
        assert_eq!(
            element.clone().resolve_current_database(""),
            Err(AccessError::CurrentDatabaseNotSet)
        );

        element.resolve_current_database("db").unwrap();
        assert_eq!(element.database, DatabaseScope::Named("db".to_string()));
        assert_eq!(element.paths().unwrap(), vec![vec!["db", "t"]]);
    }

    #[test]
    fn paths_expand_columns() {
        let element = AccessRightsElement::columns(AccessFlags::SELECT, "db", "t", ["a", "b"]);
        assert_eq!(
            element.paths().unwrap(),
            vec![vec!["db", "t", "a"], vec!["db", "t", "b"]]
        );
        assert_eq!(
            AccessRightsElement::global(AccessFlags::SELECT).paths().unwrap(),
            vec![Vec::<&str>::new()]
        );
    }

    #[test]
    fn element_lists() {
        assert_eq!(AccessRightsElements::new().to_string(), "USAGE ON *.*");

        let mut elements: AccessRightsElements = vec![
            AccessRightsElement::current_table(AccessFlags::SELECT, "t"),
            AccessRightsElement::global(AccessFlags::CREATE_USER),
        ]
        .into();
        elements.resolve_current_database("db").unwrap();
        assert_eq!(elements.to_string(), "SELECT ON db.t, CREATE USER ON *.*");
    }

    #[test]
    fn statement_grouping_respects_kind() {
        let grant = AccessRightsElement::table(AccessFlags::SELECT, "db", "t");
        let other = AccessRightsElement::table(AccessFlags::INSERT, "db", "t");
        assert!(grant.same_statement(&other));
        assert!(!grant.same_statement(&other.clone().with_grant_option()));
        assert!(!grant.same_statement(&other.as_partial_revoke()));
    }

    #[test_case("name", "name")]
    #[test_case("_x1", "_x1")]
    #[test_case("1abc", "`1abc`")]
    #[test_case("with space", "`with space`")]
    #[test_case("", "``")]
    fn quoting(name: &str, expected: &str) {
        assert_eq!(backquote_if_needed(name), expected);
    }
}
