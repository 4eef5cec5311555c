//! Settings profiles: default values and constraints of session settings.
//!
//! A session's settings come from, in order: the default profile, every
//! profile assigned to the user or one of its enabled roles, then the
//! settings attached to the user and to its enabled roles. Later elements
//! override earlier ones. A profile element naming a parent profile is
//! replaced by the parent's elements, each profile at most once.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use palisade_types::{EntityId, EntityKind, RoleId, UserId};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::cache::LiveHandles;
use crate::context::AccessRestrictions;
use crate::entities::{Entity, SettingValue, SettingsProfileElement};
use crate::error::{AccessError, Result};
use crate::storage::{AccessStorage, Subscription};

// ============================================================================
// Constraints
// ============================================================================

/// A requested change of one setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub name: String,
    pub value: SettingValue,
}

impl SettingChange {
    pub fn new(name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingConstraint {
    pub min: Option<SettingValue>,
    pub max: Option<SettingValue>,
    pub read_only: bool,
}

/// Bounds on the values a session may give its settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsConstraints {
    constraints: BTreeMap<String, SettingConstraint>,
}

/// A rejected change, with the value clamping would use instead.
struct Violation {
    error: AccessError,
    clamped: Option<SettingValue>,
}

impl Violation {
    fn reject(error: AccessError) -> Self {
        Self { error, clamped: None }
    }

    fn constraint(setting: &str, reason: String, clamped: Option<SettingValue>) -> Self {
        Self {
            error: AccessError::SettingConstraintViolation {
                setting: setting.to_string(),
                reason,
            },
            clamped,
        }
    }
}

impl SettingsConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_min(&mut self, name: &str, min: SettingValue) {
        self.constraints.entry(name.to_string()).or_default().min = Some(min);
    }

    pub fn set_max(&mut self, name: &str, max: SettingValue) {
        self.constraints.entry(name.to_string()).or_default().max = Some(max);
    }

    pub fn set_read_only(&mut self, name: &str, read_only: bool) {
        self.constraints.entry(name.to_string()).or_default().read_only = read_only;
    }

    pub fn get(&self, name: &str) -> Option<&SettingConstraint> {
        self.constraints.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Fails if the session may not make `change`. `current` is the value
    /// the setting has now.
    pub fn check(
        &self,
        change: &SettingChange,
        current: Option<&SettingValue>,
        restrictions: AccessRestrictions,
    ) -> Result<()> {
        self.evaluate(change, current, restrictions)
            .map_err(|violation| violation.error)
    }

    /// Moves an out-of-range value to the nearest bound. Returns false when
    /// the change cannot be made at all and should be dropped.
    pub fn clamp(
        &self,
        change: &mut SettingChange,
        current: Option<&SettingValue>,
        restrictions: AccessRestrictions,
    ) -> bool {
        match self.evaluate(change, current, restrictions) {
            Ok(()) => true,
            Err(Violation {
                clamped: Some(value), ..
            }) => {
                change.value = value;
                true
            }
            Err(_) => false,
        }
    }

    fn evaluate(
        &self,
        change: &SettingChange,
        current: Option<&SettingValue>,
        restrictions: AccessRestrictions,
    ) -> std::result::Result<(), Violation> {
        let name = change.name.as_str();
        if current == Some(&change.value) {
            return Ok(());
        }
        if !restrictions.allow_ddl && name == "allow_ddl" {
            return Err(Violation::reject(AccessError::DdlSettingProhibited));
        }
        if restrictions.readonly == 1 || (restrictions.readonly > 1 && name == "readonly") {
            return Err(Violation::reject(AccessError::SettingReadonly(name.to_string())));
        }

        let Some(constraint) = self.constraints.get(name) else {
            return Ok(());
        };
        if constraint.read_only {
            return Err(Violation::constraint(name, "should not be changed".to_string(), None));
        }
        if let (Some(min), Some(max)) = (&constraint.min, &constraint.max)
            && matches!(max.partial_cmp_value(min), Some(Ordering::Less) | None)
        {
            return Err(Violation::constraint(name, "should not be changed".to_string(), None));
        }
        if let Some(min) = &constraint.min {
            match change.value.partial_cmp_value(min) {
                Some(Ordering::Less) => {
                    return Err(Violation::constraint(
                        name,
                        format!("shouldn't be less than {min}"),
                        Some(min.clone()),
                    ));
                }
                None => return Err(incomparable(name, min)),
                Some(_) => {}
            }
        }
        if let Some(max) = &constraint.max {
            match change.value.partial_cmp_value(max) {
                Some(Ordering::Greater) => {
                    return Err(Violation::constraint(
                        name,
                        format!("shouldn't be greater than {max}"),
                        Some(max.clone()),
                    ));
                }
                None => return Err(incomparable(name, max)),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn incomparable(name: &str, bound: &SettingValue) -> Violation {
    Violation::constraint(name, format!("cannot be compared with {bound}"), None)
}

// ============================================================================
// EnabledSettings
// ============================================================================

/// What a settings lookup knows about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsParams {
    pub user: UserId,
    pub enabled_roles: BTreeSet<RoleId>,
    pub default_profile: Option<EntityId>,
    /// The user's own elements followed by those of its enabled roles.
    pub settings_from_user_and_roles: Vec<SettingsProfileElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MergedSettings {
    values: BTreeMap<String, SettingValue>,
    constraints: SettingsConstraints,
}

/// Settings and constraints in effect for one session.
#[derive(Debug, Default)]
pub struct EnabledSettings {
    params: Option<SettingsParams>,
    merged: RwLock<Arc<MergedSettings>>,
}

impl EnabledSettings {
    /// No settings and no constraints.
    pub fn empty() -> Self {
        Self::default()
    }

    fn new(params: SettingsParams) -> Self {
        Self {
            params: Some(params),
            merged: RwLock::default(),
        }
    }

    fn snapshot(&self) -> Arc<MergedSettings> {
        Arc::clone(&self.merged.read())
    }

    pub fn params(&self) -> Option<&SettingsParams> {
        self.params.as_ref()
    }

    /// Default values, by setting name.
    pub fn values(&self) -> BTreeMap<String, SettingValue> {
        self.snapshot().values.clone()
    }

    pub fn value(&self, name: &str) -> Option<SettingValue> {
        self.snapshot().values.get(name).cloned()
    }

    pub fn constraints(&self) -> SettingsConstraints {
        self.snapshot().constraints.clone()
    }

    /// Checks `change` against the constraints, measured from the default
    /// value.
    pub fn check(&self, change: &SettingChange, restrictions: AccessRestrictions) -> Result<()> {
        let merged = self.snapshot();
        let result = merged
            .constraints
            .check(change, merged.values.get(&change.name), restrictions);
        if let Err(error) = &result {
            warn!(setting = %change.name, %error, "setting change rejected");
        }
        result
    }

    /// Like [`check`](Self::check) but moves out-of-range values to the
    /// nearest bound. Returns false if the change must be dropped.
    pub fn clamp(&self, change: &mut SettingChange, restrictions: AccessRestrictions) -> bool {
        let merged = self.snapshot();
        merged
            .constraints
            .clamp(change, merged.values.get(&change.name), restrictions)
    }

    fn set(&self, merged: MergedSettings) {
        *self.merged.write() = Arc::new(merged);
    }
}

// ============================================================================
// SettingsProfilesCache
// ============================================================================

type Profiles = HashMap<EntityId, Arc<Entity>>;

fn load_profiles(storage: &dyn AccessStorage) -> Profiles {
    storage
        .ids_of_kind(EntityKind::SettingsProfile)
        .into_iter()
        .filter_map(|id| Some((id, storage.try_read(id)?)))
        .filter(|(_, entity)| entity.as_settings_profile().is_some())
        .collect()
}

/// Replaces parent references with the parent's elements, each profile at
/// most once.
fn substitute(
    elements: &[SettingsProfileElement],
    profiles: &Profiles,
    substituted: &mut BTreeSet<EntityId>,
    out: &mut Vec<SettingsProfileElement>,
) {
    for element in elements {
        let Some(parent) = element.parent_profile else {
            out.push(element.clone());
            continue;
        };
        if !substituted.insert(parent) {
            continue;
        }
        match profiles.get(&parent).and_then(|entity| entity.as_settings_profile()) {
            Some(profile) => substitute(&profile.elements, profiles, substituted, out),
            None => debug!(profile = %parent, "skipping missing settings profile"),
        }
    }
}

fn merge(params: &SettingsParams, profiles: &Profiles) -> MergedSettings {
    let mut elements = Vec::new();
    if let Some(default) = params.default_profile {
        elements.push(SettingsProfileElement::parent(default));
    }
    let mut assigned: Vec<(&str, EntityId)> = profiles
        .iter()
        .filter_map(|(id, entity)| {
            let profile = entity.as_settings_profile()?;
            profile
                .to
                .matches_any(params.user, &params.enabled_roles)
                .then_some((profile.name.as_str(), *id))
        })
        .collect();
    assigned.sort_unstable();
    elements.extend(assigned.into_iter().map(|(_, id)| SettingsProfileElement::parent(id)));
    elements.extend(params.settings_from_user_and_roles.iter().cloned());

    let mut flattened = Vec::new();
    substitute(&elements, profiles, &mut BTreeSet::new(), &mut flattened);

    let mut merged = MergedSettings::default();
    for element in flattened.iter().filter(|element| !element.setting_name.is_empty()) {
        let name = element.setting_name.as_str();
        if let Some(value) = &element.value {
            merged.values.insert(name.to_string(), value.clone());
        }
        if let Some(min) = &element.min_value {
            merged.constraints.set_min(name, min.clone());
        }
        if let Some(max) = &element.max_value {
            merged.constraints.set_max(name, max.clone());
        }
        if let Some(readonly) = element.readonly {
            merged.constraints.set_read_only(name, readonly);
        }
    }
    merged
}

/// Hands out [`EnabledSettings`] and keeps every live one current as
/// settings profiles change.
pub struct SettingsProfilesCache {
    storage: Arc<dyn AccessStorage>,
    live: Arc<LiveHandles<EnabledSettings>>,
    _subscription: Subscription,
}

impl SettingsProfilesCache {
    pub fn new(storage: Arc<dyn AccessStorage>) -> Self {
        let live: Arc<LiveHandles<EnabledSettings>> = Arc::new(LiveHandles::new());
        let weak_storage: Weak<dyn AccessStorage> = Arc::downgrade(&storage);
        let weak_live = Arc::downgrade(&live);
        let subscription = storage.subscribe_kind(
            EntityKind::SettingsProfile,
            Arc::new(move |id: EntityId, _: Option<Arc<Entity>>| {
                let (Some(storage), Some(live)) = (weak_storage.upgrade(), weak_live.upgrade()) else {
                    return;
                };
                live.refresh(|handles| {
                    let profiles = load_profiles(storage.as_ref());
                    debug!(profile = %id, instances = handles.len(), "refreshing settings");
                    for enabled in handles {
                        if let Some(params) = enabled.params() {
                            enabled.set(merge(params, &profiles));
                        }
                    }
                });
            }),
        );
        Self {
            storage,
            live,
            _subscription: subscription,
        }
    }

    /// Id of the profile named `name`.
    pub fn profile_id(&self, name: &str) -> Result<EntityId> {
        self.storage
            .find(EntityKind::SettingsProfile, name)
            .ok_or_else(|| AccessError::SettingsProfileNotFound(name.to_string()))
    }

    pub fn enabled_settings(&self, params: SettingsParams) -> Arc<EnabledSettings> {
        trace!(user = %params.user, "merging settings");
        let enabled = Arc::new(EnabledSettings::new(params));
        self.live.register(&enabled, |enabled| {
            if let Some(params) = enabled.params() {
                enabled.set(merge(params, &load_profiles(self.storage.as_ref())));
            }
        });
        enabled
    }
}

impl fmt::Debug for SettingsProfilesCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsProfilesCache")
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}
