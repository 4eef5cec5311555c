//! The privilege tree: grants, revokes and partial revokes over
//! `server → database → table → column`.
//!
//! ## Node state
//!
//! Every node keeps three sets:
//!
//! - `grants`: privileges granted on exactly this resource
//! - `partial_revokes`: inherited privileges cut out at this resource
//! - `access`: the effective set, `(parent.access - partial_revokes) | grants`
//!
//! A node that grants nothing, revokes nothing and has no children behaves
//! exactly like its parent, so it is removed. The tree therefore holds one node
//! per distinct decision rather than one per resource.
//!
//! ```text
//! GRANT SELECT ON db.*            root     access = {}
//! REVOKE SELECT ON db.t             └─ db  grants = {SELECT}   access = {SELECT}
//!                                      └─ t partial_revokes = {SELECT}  access = {}
//! ```
//!
//! Nodes live in an arena and refer to each other by index, so cloning a tree
//! is a plain vector copy.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::element::AccessRightsElement;
use crate::error::{AccessError, Result};
use crate::flags::{AccessFlags, AccessLevel};

const ROOT: usize = 0;

#[derive(Debug, Clone, Default)]
struct Node {
    name: String,
    parent: Option<usize>,
    children: BTreeMap<String, usize>,
    access: AccessFlags,
    grants: AccessFlags,
    partial_revokes: AccessFlags,
}

impl Node {
    fn is_redundant(&self) -> bool {
        self.grants.is_empty() && self.partial_revokes.is_empty() && self.children.is_empty()
    }
}

/// Hierarchical access rights of one principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    into = "Vec<AccessRightsElement>",
    try_from = "Vec<AccessRightsElement>"
)]
pub struct AccessRights {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl Default for AccessRights {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessRights {
    /// Rights that grant nothing.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            free: Vec::new(),
        }
    }

    /// Rights that grant every privilege on every resource.
    pub fn full() -> Self {
        let mut rights = Self::new();
        rights.nodes[ROOT].grants = AccessFlags::ALL;
        rights.nodes[ROOT].access = AccessFlags::ALL;
        rights
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].is_redundant()
    }

    /// Number of nodes in the tree, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    // ========================================================================
    // Grant / revoke
    // ========================================================================

    /// Grants `flags` on the resource at `path` (`[]`, `[db]`, `[db, table]`
    /// or `[db, table, column]`).
    ///
    /// Returns whether the tree changed. Granting lifts partial revokes of the
    /// same privileges on this resource and everything below it.
    pub fn grant(&mut self, flags: AccessFlags, path: &[&str]) -> Result<bool> {
        let level = AccessLevel::from_depth(path.len())?;
        let flags = flags.grantable_on(level)?;
        Ok(self.grant_validated(flags, path))
    }

    /// Revokes `flags` on the resource at `path`.
    ///
    /// Without partial revokes only privileges granted on exactly this
    /// resource are removed. With partial revokes, privileges inherited from an
    /// ancestor are cut out as well. Grants on more specific resources below
    /// survive either way.
    pub fn revoke(
        &mut self,
        flags: AccessFlags,
        path: &[&str],
        partial_revokes_allowed: bool,
    ) -> Result<bool> {
        let level = AccessLevel::from_depth(path.len())?;
        let flags = flags & AccessFlags::all_grantable_on_level(level);
        Ok(self.revoke_validated(flags, path, partial_revokes_allowed))
    }

    /// Removes `flags` from the resource at `path` and from everything below
    /// it, including grants on more specific resources.
    pub fn full_revoke(&mut self, flags: AccessFlags, path: &[&str]) -> Result<bool> {
        let level = AccessLevel::from_depth(path.len())?;
        let flags = flags & AccessFlags::all_grantable_on_level(level);
        Ok(self.full_revoke_validated(flags, path))
    }

    /// Removes `flags` from every resource.
    pub fn revoke_everywhere(&mut self, flags: AccessFlags) -> bool {
        self.full_revoke_validated(flags, &[])
    }

    fn full_revoke_validated(&mut self, flags: AccessFlags, path: &[&str]) -> bool {
        if flags.is_empty() {
            return false;
        }

        let id = self.get_or_create(path);
        let inherited = self.inherited(id);
        let node = &mut self.nodes[id];
        let revokes = (flags & inherited) - node.partial_revokes;
        let mut changed = node.grants.intersects(flags) || !revokes.is_empty();
        node.grants -= flags;
        node.partial_revokes |= revokes;

        for child in self.descendants(id) {
            let node = &mut self.nodes[child];
            changed |= node.grants.intersects(flags);
            node.grants -= flags;
            node.partial_revokes -= flags;
        }

        self.normalize(id);
        changed
    }

    fn grant_validated(&mut self, flags: AccessFlags, path: &[&str]) -> bool {
        if flags.is_empty() {
            return false;
        }

        let id = self.get_or_create(path);
        let node = &mut self.nodes[id];
        // A revoked bit that is granted again is simply no longer revoked.
        let cancelled = flags & node.partial_revokes;
        let added = flags - cancelled - node.grants;
        node.partial_revokes -= flags;
        node.grants |= added;
        let mut changed = !cancelled.is_empty() || !added.is_empty();

        for child in self.descendants(id) {
            let node = &mut self.nodes[child];
            if node.partial_revokes.intersects(flags) {
                node.partial_revokes -= flags;
                changed = true;
            }
        }

        self.normalize(id);
        changed
    }

    fn revoke_validated(&mut self, flags: AccessFlags, path: &[&str], partial: bool) -> bool {
        if flags.is_empty() {
            return false;
        }

        let id = if partial {
            self.get_or_create(path)
        } else {
            match self.find(path) {
                Some(id) => id,
                None => return false,
            }
        };

        let inherited = self.inherited(id);
        let node = &mut self.nodes[id];
        let removed = node.grants & flags;
        node.grants -= flags;
        let mut revoked = AccessFlags::empty();
        if partial {
            revoked = (flags & inherited) - node.partial_revokes;
            node.partial_revokes |= revoked;
        }

        self.normalize(id);
        !removed.is_empty() || !revoked.is_empty()
    }

    // ========================================================================
    // Element operations
    // ========================================================================

    /// Grants one element. Every column of the element is validated before any
    /// node is touched.
    pub fn grant_element(&mut self, element: &AccessRightsElement) -> Result<bool> {
        self.grant_elements(std::slice::from_ref(element))
    }

    /// Grants a list of elements atomically: either all are applied or, if
    /// any is invalid, none is.
    pub fn grant_elements(&mut self, elements: &[AccessRightsElement]) -> Result<bool> {
        let validated = elements
            .iter()
            .map(|element| {
                let flags = element.access_flags.grantable_on(element.level())?;
                Ok((flags, element.paths()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut changed = false;
        for (flags, paths) in validated {
            for path in paths {
                changed |= self.grant_validated(flags, &path);
            }
        }
        Ok(changed)
    }

    pub fn revoke_element(&mut self, element: &AccessRightsElement, partial: bool) -> Result<bool> {
        self.revoke_elements(std::slice::from_ref(element), partial)
    }

    pub fn revoke_elements(&mut self, elements: &[AccessRightsElement], partial: bool) -> Result<bool> {
        let validated = elements
            .iter()
            .map(|element| {
                let flags =
                    element.access_flags & AccessFlags::all_grantable_on_level(element.level());
                Ok((flags, element.paths()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut changed = false;
        for (flags, paths) in validated {
            for path in paths {
                changed |= self.revoke_validated(flags, &path, partial);
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Folds `other` into `self`: afterwards every resource has the union of
    /// both effective sets.
    ///
    /// Grants and partial revokes are recomputed from the merged access, so a
    /// privilege inherited in one tree and granted locally in the other ends up
    /// recorded wherever the merged parent no longer implies it.
    pub fn merge(&mut self, other: &AccessRights) {
        self.merge_access(ROOT, other, ROOT);
        self.rebuild_grants(ROOT, AccessFlags::empty());
        self.prune_descendants(ROOT);
    }

    fn merge_access(&mut self, id: usize, other: &AccessRights, other_id: usize) {
        let other_node = &other.nodes[other_id];

        for (name, &other_child) in &other_node.children {
            let child = match self.nodes[id].children.get(name) {
                Some(&child) => child,
                None => self.add_child(id, name),
            };
            self.merge_access(child, other, other_child);
        }

        // Where `other` has no node it behaves like this node's counterpart.
        let own_only: Vec<usize> = self.nodes[id]
            .children
            .iter()
            .filter(|(name, _)| !other_node.children.contains_key(*name))
            .map(|(_, &child)| child)
            .collect();
        for child in own_only {
            self.add_access_to_subtree(child, other_node.access);
        }

        self.nodes[id].access |= other_node.access;
    }

    fn add_access_to_subtree(&mut self, id: usize, flags: AccessFlags) {
        self.nodes[id].access |= flags;
        let children: Vec<usize> = self.nodes[id].children.values().copied().collect();
        for child in children {
            self.add_access_to_subtree(child, flags);
        }
    }

    fn rebuild_grants(&mut self, id: usize, inherited: AccessFlags) {
        let node = &mut self.nodes[id];
        node.grants = node.access - inherited;
        node.partial_revokes = inherited - node.access;
        let access = node.access;
        let children: Vec<usize> = node.children.values().copied().collect();
        for child in children {
            self.rebuild_grants(child, access);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Effective privileges on the resource at `path`.
    ///
    /// A resource without its own node has the access of its nearest ancestor.
    pub fn get_access(&self, path: &[&str]) -> AccessFlags {
        self.nodes[self.find_nearest(path)].access
    }

    pub fn is_granted(&self, flags: AccessFlags, path: &[&str]) -> bool {
        self.get_access(path).contains(flags)
    }

    /// Privileges held on every one of `columns`. An empty column list asks
    /// about the table itself.
    pub fn get_columns_access(&self, database: &str, table: &str, columns: &[&str]) -> AccessFlags {
        if columns.is_empty() {
            return self.get_access(&[database, table]);
        }
        columns.iter().fold(AccessFlags::ALL, |acc, column| {
            acc & self.get_access(&[database, table, column])
        })
    }

    /// Privileges granted on exactly this resource.
    pub fn grants_at(&self, path: &[&str]) -> AccessFlags {
        self.find(path)
            .map_or(AccessFlags::empty(), |id| self.nodes[id].grants)
    }

    /// Privileges partially revoked on exactly this resource.
    pub fn partial_revokes_at(&self, path: &[&str]) -> AccessFlags {
        self.find(path)
            .map_or(AccessFlags::empty(), |id| self.nodes[id].partial_revokes)
    }

    /// Grants and partial revokes as elements, in tree pre-order.
    ///
    /// Columns of one table that carry the same privileges are folded into a
    /// single element with sorted column names.
    pub fn elements(&self) -> Vec<AccessRightsElement> {
        let mut out = Vec::new();
        let root = &self.nodes[ROOT];
        push_node_elements(root, &mut out, AccessRightsElement::global);

        for (database, &db_id) in &root.children {
            let db_node = &self.nodes[db_id];
            push_node_elements(db_node, &mut out, |flags| {
                AccessRightsElement::database(flags, database)
            });

            for (table, &table_id) in &db_node.children {
                let table_node = &self.nodes[table_id];
                push_node_elements(table_node, &mut out, |flags| {
                    AccessRightsElement::table(flags, database, table)
                });

                let mut grants: Vec<(AccessFlags, Vec<&str>)> = Vec::new();
                let mut revokes: Vec<(AccessFlags, Vec<&str>)> = Vec::new();
                for (column, &column_id) in &table_node.children {
                    let column_node = &self.nodes[column_id];
                    add_to_group(&mut grants, column_node.grants, column);
                    add_to_group(&mut revokes, column_node.partial_revokes, column);
                }
                out.extend(grants.into_iter().map(|(flags, columns)| {
                    AccessRightsElement::columns(flags, database, table, columns)
                }));
                out.extend(revokes.into_iter().map(|(flags, columns)| {
                    AccessRightsElement::columns(flags, database, table, columns)
                        .as_partial_revoke()
                }));
            }
        }
        out
    }

    // ========================================================================
    // Arena helpers
    // ========================================================================

    fn find(&self, path: &[&str]) -> Option<usize> {
        let mut id = ROOT;
        for name in path {
            id = *self.nodes[id].children.get(*name)?;
        }
        Some(id)
    }

    fn find_nearest(&self, path: &[&str]) -> usize {
        let mut id = ROOT;
        for name in path {
            match self.nodes[id].children.get(*name) {
                Some(&child) => id = child,
                None => break,
            }
        }
        id
    }

    fn get_or_create(&mut self, path: &[&str]) -> usize {
        let mut id = ROOT;
        for name in path {
            id = match self.nodes[id].children.get(*name) {
                Some(&child) => child,
                None => self.add_child(id, name),
            };
        }
        id
    }

    fn add_child(&mut self, parent: usize, name: &str) -> usize {
        let node = Node {
            name: name.to_string(),
            parent: Some(parent),
            access: self.nodes[parent].access,
            ..Node::default()
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    fn inherited(&self, id: usize) -> AccessFlags {
        self.nodes[id]
            .parent
            .map_or(AccessFlags::empty(), |parent| self.nodes[parent].access)
    }

    fn descendants(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[id].children.values().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.values().copied());
        }
        out
    }

    /// Recomputes access below and at `id`, then drops nodes that became
    /// redundant there and on the way up to the root.
    fn normalize(&mut self, id: usize) {
        self.recalculate(id);
        self.prune_descendants(id);
        self.prune_upward(id);
    }

    fn recalculate(&mut self, id: usize) {
        let inherited = self.inherited(id);
        let node = &mut self.nodes[id];
        // A revoke only means something while the parent grants the bit.
        node.partial_revokes &= inherited;
        node.access = (inherited - node.partial_revokes) | node.grants;
        let children: Vec<usize> = node.children.values().copied().collect();
        for child in children {
            self.recalculate(child);
        }
    }

    fn prune_descendants(&mut self, id: usize) {
        let children: Vec<usize> = self.nodes[id].children.values().copied().collect();
        for child in children {
            self.prune_descendants(child);
            if self.nodes[child].is_redundant() {
                self.remove(child);
            }
        }
    }

    fn prune_upward(&mut self, mut id: usize) {
        while id != ROOT && self.nodes[id].is_redundant() {
            let Some(parent) = self.nodes[id].parent else {
                break;
            };
            self.remove(id);
            id = parent;
        }
    }

    fn remove(&mut self, id: usize) {
        let node = std::mem::take(&mut self.nodes[id]);
        if let Some(parent) = node.parent {
            self.nodes[parent].children.remove(&node.name);
        }
        self.free.push(id);
    }

    fn node_eq(&self, id: usize, other: &AccessRights, other_id: usize) -> bool {
        let a = &self.nodes[id];
        let b = &other.nodes[other_id];
        a.access == b.access
            && a.grants == b.grants
            && a.partial_revokes == b.partial_revokes
            && a.children.len() == b.children.len()
            && a.children.iter().all(|(name, &child)| {
                b.children
                    .get(name)
                    .is_some_and(|&other_child| self.node_eq(child, other, other_child))
            })
    }
}

fn push_node_elements(
    node: &Node,
    out: &mut Vec<AccessRightsElement>,
    make: impl Fn(AccessFlags) -> AccessRightsElement,
) {
    if !node.grants.is_empty() {
        out.push(make(node.grants));
    }
    if !node.partial_revokes.is_empty() {
        out.push(make(node.partial_revokes).as_partial_revoke());
    }
}

fn add_to_group<'a>(groups: &mut Vec<(AccessFlags, Vec<&'a str>)>, flags: AccessFlags, column: &'a str) {
    if flags.is_empty() {
        return;
    }
    match groups.iter_mut().find(|(group_flags, _)| *group_flags == flags) {
        Some((_, columns)) => columns.push(column),
        None => groups.push((flags, vec![column])),
    }
}

impl PartialEq for AccessRights {
    fn eq(&self, other: &Self) -> bool {
        self.node_eq(ROOT, other, ROOT)
    }
}

impl Eq for AccessRights {}

impl Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elements = self.elements();
        if elements.is_empty() {
            return f.write_str("GRANT USAGE ON *.*");
        }
        let parts: Vec<String> = elements
            .iter()
            .map(|element| {
                let verb = if element.is_partial_revoke { "REVOKE" } else { "GRANT" };
                format!("{verb} {element}")
            })
            .collect();
        f.write_str(&parts.join(", "))
    }
}

impl From<AccessRights> for Vec<AccessRightsElement> {
    fn from(rights: AccessRights) -> Self {
        rights.elements()
    }
}

impl TryFrom<Vec<AccessRightsElement>> for AccessRights {
    type Error = AccessError;

    /// Replays exported elements; pre-order puts every revoke after the grant it cuts.
    fn try_from(elements: Vec<AccessRightsElement>) -> Result<Self> {
        let mut rights = AccessRights::new();
        for element in &elements {
            if element.is_partial_revoke {
                rights.revoke_element(element, true)?;
            } else {
                rights.grant_element(element)?;
            }
        }
        Ok(rights)
    }
}

#[cfg(test)]
impl AccessRights {
    /// Asserts the structural invariants of every live node.
    pub(crate) fn check_invariants(&self) {
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            let inherited = self.inherited(id);
            assert!(node.access.contains(node.grants), "grants outside access");
            assert!(
                inherited.contains(node.partial_revokes),
                "revoke of a bit the parent does not have"
            );
            assert_eq!(node.access, (inherited - node.partial_revokes) | node.grants);
            if id != ROOT {
                assert!(!node.is_redundant(), "redundant node {}", node.name);
            }
            for (name, &child) in &node.children {
                assert_eq!(&self.nodes[child].name, name);
                assert_eq!(self.nodes[child].parent, Some(id));
                stack.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SELECT: AccessFlags = AccessFlags::SELECT;
    const INSERT: AccessFlags = AccessFlags::INSERT;

    #[test]
    fn grant_then_check() {
        let mut rights = AccessRights::new();
        assert!(rights.is_empty());
        assert!(rights.grant(SELECT, &["db", "t"]).unwrap());
        assert!(rights.is_granted(SELECT, &["db", "t"]));
        assert!(rights.is_granted(SELECT, &["db", "t", "any_column"]));
        assert!(!rights.is_granted(SELECT, &["db"]));
        assert!(!rights.is_granted(SELECT, &["db", "t2"]));
        rights.check_invariants();
    }

    #[test]
    fn grant_is_idempotent() {
        let mut rights = AccessRights::new();
        assert!(rights.grant(SELECT | INSERT, &["db"]).unwrap());
        let snapshot = rights.clone();
        assert!(!rights.grant(SELECT, &["db"]).unwrap());
        assert_eq!(rights, snapshot);
    }

    #[test]
    fn normal_revoke_removes_grant() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db", "t"]).unwrap();
        assert!(rights.revoke(SELECT, &["db", "t"], false).unwrap());
        assert!(!rights.is_granted(SELECT, &["db", "t"]));
        assert!(!rights.grants_at(&["db", "t"]).contains(SELECT));
        assert!(rights.is_empty());
        assert_eq!(rights.node_count(), 1);
    }

    #[test]
    fn normal_revoke_of_ungranted_is_noop() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        let snapshot = rights.clone();
        assert!(!rights.revoke(SELECT, &["db", "t"], false).unwrap());
        assert!(!rights.revoke(INSERT, &["db"], false).unwrap());
        assert_eq!(rights, snapshot);
        // The inherited privilege is untouched
        assert!(rights.is_granted(SELECT, &["db", "t"]));
    }

    #[test]
    fn partial_revoke_punches_hole() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        assert!(rights.revoke(SELECT, &["db", "t"], true).unwrap());

        assert!(rights.is_granted(SELECT, &["db"]));
        assert!(!rights.is_granted(SELECT, &["db", "t"]));
        assert!(!rights.is_granted(SELECT, &["db", "t", "c"]));
        assert!(rights.is_granted(SELECT, &["db", "t2"]));
        assert_eq!(rights.partial_revokes_at(&["db", "t"]), SELECT);
        rights.check_invariants();

        // Granting it again cancels the revoke instead of adding a grant
        assert!(rights.grant(SELECT, &["db", "t"]).unwrap());
        assert!(rights.is_granted(SELECT, &["db", "t"]));
        assert!(!rights.partial_revokes_at(&["db", "t"]).contains(SELECT));
        assert!(rights.grants_at(&["db", "t"]).is_empty());
        assert_eq!(rights.node_count(), 2);
        rights.check_invariants();
    }

    #[test]
    fn partial_revoke_of_nothing_is_noop() {
        let mut rights = AccessRights::new();
        assert!(!rights.revoke(SELECT, &["db", "t"], true).unwrap());
        assert!(rights.is_empty());
        assert_eq!(rights.node_count(), 1);
    }

    #[test]
    fn partial_revoke_keeps_deeper_grants() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &[]).unwrap();
        rights.grant(SELECT, &["db", "t", "id"]).unwrap();
        rights.revoke(SELECT, &["db"], true).unwrap();

        assert!(!rights.is_granted(SELECT, &["db"]));
        assert!(!rights.is_granted(SELECT, &["db", "t"]));
        assert!(rights.is_granted(SELECT, &["db", "t", "id"]));
        assert!(!rights.is_granted(SELECT, &["db", "t", "name"]));
        assert!(rights.is_granted(SELECT, &["other"]));
        rights.check_invariants();
    }

    #[test]
    fn three_level_revoke_and_regrant() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT | INSERT, &[]).unwrap();
        rights.revoke(SELECT, &["db"], true).unwrap();
        rights.grant(SELECT, &["db", "t"]).unwrap();
        rights.revoke(SELECT, &["db", "t", "secret"], true).unwrap();

        assert!(rights.is_granted(SELECT, &["db2", "x"]));
        assert!(!rights.is_granted(SELECT, &["db", "x"]));
        assert!(rights.is_granted(SELECT, &["db", "t", "public"]));
        assert!(!rights.is_granted(SELECT, &["db", "t", "secret"]));
        assert!(rights.is_granted(INSERT, &["db", "t", "secret"]));
        rights.check_invariants();

        // Granting on the database lifts every revoke beneath it
        rights.grant(SELECT, &["db"]).unwrap();
        assert!(rights.is_granted(SELECT, &["db", "t", "secret"]));
        assert!(rights.partial_revokes_at(&["db", "t", "secret"]).is_empty());
        rights.check_invariants();
    }

    #[test]
    fn revoking_parent_grant_drops_meaningless_revokes() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        rights.revoke(SELECT, &["db", "t"], true).unwrap();
        assert!(rights.revoke(SELECT, &["db"], false).unwrap());
        assert!(rights.is_empty());
        rights.check_invariants();
    }

    #[test]
    fn full_revoke_clears_subtree() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &[]).unwrap();
        rights.grant(SELECT | INSERT, &["db", "t"]).unwrap();
        rights.grant(SELECT, &["db", "t", "c"]).unwrap();

        assert!(rights.full_revoke(SELECT, &["db"]).unwrap());
        assert!(rights.is_granted(SELECT, &["other"]));
        assert!(!rights.is_granted(SELECT, &["db", "t"]));
        assert!(!rights.is_granted(SELECT, &["db", "t", "c"]));
        assert!(rights.is_granted(INSERT, &["db", "t"]));
        rights.check_invariants();

        assert!(!rights.full_revoke(SELECT, &["db"]).unwrap());
    }

    #[test]
    fn full_revoke_at_root_masks_everything() {
        let mut rights = AccessRights::full();
        rights.grant(INSERT, &["db", "t"]).unwrap();
        rights.full_revoke(INSERT, &[]).unwrap();
        assert!(!rights.is_granted(INSERT, &["db", "t"]));
        assert!(rights.is_granted(SELECT, &["db", "t"]));
        assert_eq!(rights.node_count(), 1);
    }

    #[test]
    fn invalid_grant_leaves_tree_unchanged() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        let snapshot = rights.clone();

        let err = rights
            .grant(AccessFlags::CREATE_USER, &["db", "t"])
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidGrant { .. }));
        assert_eq!(rights, snapshot);

        let err = rights.grant(SELECT, &["db", "t", "c", "x"]).unwrap_err();
        assert_eq!(err, AccessError::InvalidPath(4));
        assert_eq!(rights, snapshot);
    }

    #[test]
    fn invalid_element_in_list_applies_nothing() {
        let mut rights = AccessRights::new();
        let elements = vec![
            AccessRightsElement::table(SELECT, "db", "t"),
            AccessRightsElement::table(AccessFlags::DROP_DATABASE, "db", "t"),
        ];
        assert!(rights.grant_elements(&elements).is_err());
        assert!(rights.is_empty());
    }

    #[test]
    fn grant_all_on_table_keeps_table_privileges() {
        let mut rights = AccessRights::new();
        rights.grant(AccessFlags::ALL, &["db", "t"]).unwrap();
        let granted = rights.grants_at(&["db", "t"]);
        assert_eq!(
            granted,
            AccessFlags::all_grantable_on_level(AccessLevel::Table)
        );
        assert!(!granted.intersects(AccessFlags::CREATE_USER));
    }

    #[test]
    fn column_elements_are_grouped() {
        let mut rights = AccessRights::new();
        rights
            .grant_element(&AccessRightsElement::columns(SELECT, "db", "t", ["name", "age"]))
            .unwrap();
        rights
            .grant_element(&AccessRightsElement::columns(SELECT, "db", "t", ["address"]))
            .unwrap();
        let elements = rights.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].to_string(), "SELECT(address,age,name) ON db.t");

        rights
            .revoke_element(&AccessRightsElement::columns(SELECT, "db", "t", ["age"]), false)
            .unwrap();
        assert_eq!(
            rights.elements()[0].to_string(),
            "SELECT(address,name) ON db.t"
        );
    }

    #[test]
    fn elements_list_revokes_after_grants() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        rights.revoke(SELECT, &["db", "t"], true).unwrap();
        rights.grant(INSERT, &[]).unwrap();
        assert_eq!(
            rights.to_string(),
            "GRANT INSERT ON *.*, GRANT SELECT ON db.*, REVOKE SELECT ON db.t"
        );
        assert_eq!(AccessRights::new().to_string(), "GRANT USAGE ON *.*");
    }

    #[test]
    fn merge_unions_access() {
        let mut a = AccessRights::new();
        a.grant(SELECT, &["db"]).unwrap();
        a.revoke(SELECT, &["db", "t"], true).unwrap();

        let mut b = AccessRights::new();
        b.grant(SELECT, &["db", "t"]).unwrap();
        b.grant(INSERT, &[]).unwrap();

        a.merge(&b);
        assert!(a.is_granted(SELECT, &["db", "t"]));
        assert!(a.is_granted(SELECT | INSERT, &["db", "x"]));
        assert!(a.is_granted(INSERT, &["other"]));
        assert!(!a.is_granted(SELECT, &["other"]));
        // The hole was filled, so the table node is gone
        assert_eq!(a.node_count(), 2);
        a.check_invariants();
    }

    #[test]
    fn merge_keeps_holes_both_sides_agree_on() {
        let mut a = AccessRights::new();
        a.grant(SELECT, &[]).unwrap();
        a.revoke(SELECT, &["secret"], true).unwrap();
        let b = a.clone();

        a.merge(&b);
        assert_eq!(a, b);
        assert!(!a.is_granted(SELECT, &["secret"]));
    }

    #[test]
    fn serde_replays_elements() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["db"]).unwrap();
        rights.revoke(SELECT, &["db", "t"], true).unwrap();
        rights
            .grant_element(&AccessRightsElement::columns(INSERT, "db", "t", ["a"]))
            .unwrap();

        let json = serde_json::to_string(&rights).unwrap();
        let back: AccessRights = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rights);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut rights = AccessRights::new();
        rights.grant(SELECT, &["a", "b", "c"]).unwrap();
        rights.revoke(SELECT, &["a", "b", "c"], false).unwrap();
        rights.grant(SELECT, &["x", "y"]).unwrap();
        assert_eq!(rights.nodes.len(), 4);
        assert_eq!(rights.node_count(), 3);
        rights.check_invariants();
    }

    // ========================================================================
    // Property tests
    // ========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Grant(AccessFlags, Vec<&'static str>),
        Revoke(AccessFlags, Vec<&'static str>, bool),
        FullRevoke(AccessFlags, Vec<&'static str>),
    }

    fn flags_strategy() -> impl Strategy<Value = AccessFlags> {
        prop_oneof![
            Just(SELECT),
            Just(INSERT),
            Just(SELECT | INSERT),
            Just(AccessFlags::DROP_TABLE),
            Just(AccessFlags::CREATE_DATABASE),
        ]
    }

    fn path_strategy() -> impl Strategy<Value = Vec<&'static str>> {
        prop::collection::vec(prop_oneof![Just("a"), Just("b")], 0..=3)
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (flags_strategy(), path_strategy()).prop_map(|(f, p)| Op::Grant(f, p)),
            (flags_strategy(), path_strategy(), any::<bool>())
                .prop_map(|(f, p, partial)| Op::Revoke(f, p, partial)),
            (flags_strategy(), path_strategy()).prop_map(|(f, p)| Op::FullRevoke(f, p)),
        ]
    }

    fn apply(rights: &mut AccessRights, op: &Op) -> Result<bool> {
        match op {
            Op::Grant(flags, path) => rights.grant(*flags, path),
            Op::Revoke(flags, path, partial) => rights.revoke(*flags, path, *partial),
            Op::FullRevoke(flags, path) => rights.full_revoke(*flags, path),
        }
    }

    fn build(ops: &[Op]) -> AccessRights {
        let mut rights = AccessRights::new();
        for op in ops {
            let _ = apply(&mut rights, op);
        }
        rights
    }

    fn sample_paths() -> Vec<Vec<&'static str>> {
        let names = ["a", "b", "z"];
        let mut paths = vec![vec![]];
        for x in names {
            paths.push(vec![x]);
            for y in names {
                paths.push(vec![x, y]);
                for z in names {
                    paths.push(vec![x, y, z]);
                }
            }
        }
        paths
    }

    proptest! {
        #[test]
        fn invariants_hold_after_any_sequence(ops in prop::collection::vec(op_strategy(), 0..24)) {
            let mut rights = AccessRights::new();
            for op in &ops {
                let before = rights.clone();
                match apply(&mut rights, op) {
                    Ok(false) => prop_assert_eq!(&rights, &before),
                    Ok(true) => {}
                    Err(_) => prop_assert_eq!(&rights, &before),
                }
                rights.check_invariants();
            }
        }

        #[test]
        fn granted_flags_are_visible(ops in prop::collection::vec(op_strategy(), 0..16),
                                     flags in flags_strategy(),
                                     path in path_strategy()) {
            let mut rights = build(&ops);
            let level = AccessLevel::from_depth(path.len()).unwrap();
            if let Ok(valid) = flags.grantable_on(level) {
                rights.grant(flags, &path).unwrap();
                prop_assert!(rights.is_granted(valid, &path));
                prop_assert!(!rights.grant(flags, &path).unwrap());
            }
        }

        #[test]
        fn merge_is_pointwise_union(a in prop::collection::vec(op_strategy(), 0..16),
                                    b in prop::collection::vec(op_strategy(), 0..16)) {
            let a = build(&a);
            let b = build(&b);
            let mut merged = a.clone();
            merged.merge(&b);
            merged.check_invariants();
            for path in sample_paths() {
                prop_assert_eq!(merged.get_access(&path), a.get_access(&path) | b.get_access(&path));
            }

            let mut reversed = b.clone();
            reversed.merge(&a);
            prop_assert_eq!(merged, reversed);
        }
    }
}
