//! Quotas: which quotas apply to a session and how much of each it used.
//!
//! Consumption is tracked per quota and key, so sessions that share a key
//! share one budget. Each limit counts within intervals aligned to the Unix
//! epoch; usage resets when an interval ends.
//!
//! ```text
//!   QuotaParams ──▶ StorageQuotaProvider ──▶ EnabledQuota (live)
//!                        │ usage table            │ used / check_exceeded
//!                        ▼                        ▼
//!                  (quota, key) ──────────▶ QuotaIntervals
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use palisade_types::{EntityId, EntityKind, RoleId, UserId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::ExpiringCache;
use crate::entities::{Entity, Quota, QuotaKeyType, QuotaLimits, QuotaResource};
use crate::error::{AccessError, Result};
use crate::storage::{AccessStorage, Subscription};

const RESOURCES: usize = QuotaResource::ALL.len();

// ============================================================================
// Intervals
// ============================================================================

#[derive(Debug)]
struct IntervalState {
    used: [u64; RESOURCES],
    end: SystemTime,
}

#[derive(Debug)]
struct Interval {
    duration: Duration,
    max: [u64; RESOURCES],
    state: Mutex<IntervalState>,
}

impl Interval {
    fn new(limits: &QuotaLimits) -> Self {
        let mut max = [0; RESOURCES];
        for (resource, value) in &limits.max {
            max[resource.index()] = *value;
        }
        Self {
            duration: limits.duration,
            max,
            state: Mutex::new(IntervalState {
                used: [0; RESOURCES],
                end: UNIX_EPOCH,
            }),
        }
    }

    /// Moves to the interval containing `now`, dropping the usage of the
    /// one that ended.
    fn roll(&self, state: &mut IntervalState, now: SystemTime) {
        if now < state.end {
            return;
        }
        let elapsed = now.duration_since(state.end).unwrap_or_default().as_nanos();
        let step = self.duration.as_nanos().max(1);
        let advance = u64::try_from((elapsed / step + 1) * step).unwrap_or(u64::MAX);
        state.end = state.end.checked_add(Duration::from_nanos(advance)).unwrap_or(now);
        state.used = [0; RESOURCES];
    }

    fn exceeded(&self, used: &[u64; RESOURCES]) -> Option<QuotaResource> {
        QuotaResource::ALL.into_iter().find(|resource| {
            let max = self.max[resource.index()];
            max != 0 && used[resource.index()] > max
        })
    }

    fn usage(&self, now: SystemTime) -> IntervalUsage {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        let by_resource = |values: &[u64; RESOURCES]| -> BTreeMap<QuotaResource, u64> {
            QuotaResource::ALL
                .into_iter()
                .map(|resource| (resource, values[resource.index()]))
                .filter(|(_, value)| *value != 0)
                .collect()
        };
        IntervalUsage {
            duration: self.duration,
            end: state.end,
            used: by_resource(&state.used),
            max: by_resource(&self.max),
        }
    }
}

/// The intervals of one quota for one key, largest duration first.
#[derive(Debug)]
struct QuotaIntervals {
    intervals: Vec<Interval>,
}

impl QuotaIntervals {
    fn new(limits: &[QuotaLimits]) -> Self {
        let mut intervals: Vec<Interval> = limits
            .iter()
            .filter(|limits| !limits.duration.is_zero())
            .map(Interval::new)
            .collect();
        intervals.sort_by(|a, b| b.duration.cmp(&a.duration));
        Self { intervals }
    }

    /// New limits that keep the usage of intervals whose duration stayed.
    fn rebuild(limits: &[QuotaLimits], previous: &QuotaIntervals) -> Self {
        let rebuilt = Self::new(limits);
        for interval in &rebuilt.intervals {
            if let Some(old) = previous
                .intervals
                .iter()
                .find(|old| old.duration == interval.duration)
            {
                let old = old.state.lock();
                let mut state = interval.state.lock();
                state.used = old.used;
                state.end = old.end;
            }
        }
        rebuilt
    }
}

/// Usage of one interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalUsage {
    pub duration: Duration,
    /// When the current interval ends and usage resets.
    pub end: SystemTime,
    /// Non-zero usage only.
    pub used: BTreeMap<QuotaResource, u64>,
    /// Limited resources only.
    pub max: BTreeMap<QuotaResource, u64>,
}

/// Usage of one quota under one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsageInfo {
    pub quota: EntityId,
    pub name: String,
    pub key: String,
    pub intervals: Vec<IntervalUsage>,
}

// ============================================================================
// EnabledQuota
// ============================================================================

/// What a quota lookup knows about the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaParams {
    pub user: UserId,
    pub user_name: String,
    pub enabled_roles: BTreeSet<RoleId>,
    pub address: Option<IpAddr>,
    pub client_key: String,
}

/// One quota that applies, with the key its consumption is tracked under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsageKey {
    pub quota: EntityId,
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone)]
struct TrackedUsage {
    key: QuotaUsageKey,
    intervals: Arc<QuotaIntervals>,
}

/// Quotas in effect for one session, with their usage counters.
#[derive(Debug, Default)]
pub struct EnabledQuota {
    params: Option<QuotaParams>,
    usages: RwLock<Arc<Vec<TrackedUsage>>>,
}

impl EnabledQuota {
    /// No quotas; every use is allowed.
    pub fn empty() -> Self {
        Self::default()
    }

    fn new(params: QuotaParams) -> Self {
        Self {
            params: Some(params),
            usages: RwLock::default(),
        }
    }

    fn set_usages(&self, usages: Vec<TrackedUsage>) {
        *self.usages.write() = Arc::new(usages);
    }

    fn snapshot(&self) -> Arc<Vec<TrackedUsage>> {
        Arc::clone(&self.usages.read())
    }

    pub fn params(&self) -> Option<&QuotaParams> {
        self.params.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn quotas(&self) -> Vec<QuotaUsageKey> {
        self.snapshot().iter().map(|usage| usage.key.clone()).collect()
    }

    pub fn quota_ids(&self) -> Vec<EntityId> {
        self.snapshot().iter().map(|usage| usage.key.quota).collect()
    }

    /// Adds `amount` of `resource` and fails if any limit is now exceeded.
    pub fn used(&self, resource: QuotaResource, amount: u64) -> Result<()> {
        self.used_at(resource, amount, SystemTime::now(), true)
    }

    /// Adds `amount` of `resource` to every interval of every quota. With
    /// `check_exceeded` set, reports the first limit that is now exceeded;
    /// the usage is counted either way.
    pub fn used_at(&self, resource: QuotaResource, amount: u64, now: SystemTime, check_exceeded: bool) -> Result<()> {
        let mut first_error = None;
        for usage in self.snapshot().iter() {
            for interval in &usage.intervals.intervals {
                let mut state = interval.state.lock();
                interval.roll(&mut state, now);
                let used = &mut state.used[resource.index()];
                *used = used.saturating_add(amount);
                let max = interval.max[resource.index()];
                if check_exceeded && first_error.is_none() && max != 0 && *used > max {
                    first_error = Some(self.exceeded(usage, interval, resource, *used));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fails if any limit is already exceeded.
    pub fn check_exceeded(&self) -> Result<()> {
        self.check_exceeded_at(SystemTime::now())
    }

    pub fn check_exceeded_at(&self, now: SystemTime) -> Result<()> {
        for usage in self.snapshot().iter() {
            for interval in &usage.intervals.intervals {
                let mut state = interval.state.lock();
                interval.roll(&mut state, now);
                if let Some(resource) = interval.exceeded(&state.used) {
                    let used = state.used[resource.index()];
                    return Err(self.exceeded(usage, interval, resource, used));
                }
            }
        }
        Ok(())
    }

    /// Current usage of every quota.
    pub fn usage_at(&self, now: SystemTime) -> Vec<QuotaUsageInfo> {
        self.snapshot()
            .iter()
            .map(|usage| QuotaUsageInfo {
                quota: usage.key.quota,
                name: usage.key.name.clone(),
                key: usage.key.key.clone(),
                intervals: usage
                    .intervals
                    .intervals
                    .iter()
                    .map(|interval| interval.usage(now))
                    .collect(),
            })
            .collect()
    }

    fn exceeded(&self, usage: &TrackedUsage, interval: &Interval, resource: QuotaResource, used: u64) -> AccessError {
        let user = self
            .params
            .as_ref()
            .map(|params| params.user_name.clone())
            .unwrap_or_default();
        warn!(%user, quota = %usage.key.name, %resource, used, "quota exceeded");
        AccessError::QuotaExceeded {
            user,
            quota: usage.key.name.clone(),
            resource,
            used,
            max: interval.max[resource.index()],
            interval_secs: interval.duration.as_secs(),
        }
    }
}

/// Supplies the quotas of a principal.
pub trait QuotaProvider: Send + Sync {
    fn quota(&self, params: &QuotaParams) -> Arc<EnabledQuota>;
}

fn quota_key(key_type: QuotaKeyType, params: &QuotaParams) -> String {
    let address = || params.address.map(|a| a.to_string()).unwrap_or_default();
    let client_key_or = |fallback: String| {
        if params.client_key.is_empty() {
            fallback
        } else {
            params.client_key.clone()
        }
    };
    match key_type {
        QuotaKeyType::None => String::new(),
        QuotaKeyType::UserName => params.user_name.clone(),
        QuotaKeyType::IpAddress => address(),
        QuotaKeyType::ClientKey => params.client_key.clone(),
        QuotaKeyType::ClientKeyOrUserName => client_key_or(params.user_name.clone()),
        QuotaKeyType::ClientKeyOrIpAddress => client_key_or(address()),
    }
}

// ============================================================================
// StorageQuotaProvider
// ============================================================================

struct TrackedQuota {
    quota: Quota,
    by_key: HashMap<String, Arc<QuotaIntervals>>,
}

#[derive(Default)]
struct UsageTable {
    quotas: BTreeMap<EntityId, TrackedQuota>,
    live: Vec<Weak<EnabledQuota>>,
}

impl UsageTable {
    /// Brings the tracked quotas in line with the storage.
    fn sync(&mut self, storage: &dyn AccessStorage) {
        let current: BTreeMap<EntityId, Quota> = storage
            .ids_of_kind(EntityKind::Quota)
            .into_iter()
            .filter_map(|id| Some((id, storage.try_read(id)?.as_quota()?.clone())))
            .collect();
        self.quotas.retain(|id, _| current.contains_key(id));
        for (id, quota) in current {
            match self.quotas.get_mut(&id) {
                Some(tracked) if tracked.quota == quota => {}
                Some(tracked) => {
                    if tracked.quota.limits != quota.limits {
                        for intervals in tracked.by_key.values_mut() {
                            *intervals = Arc::new(QuotaIntervals::rebuild(&quota.limits, intervals));
                        }
                    }
                    tracked.quota = quota;
                }
                None => {
                    self.quotas.insert(
                        id,
                        TrackedQuota {
                            quota,
                            by_key: HashMap::new(),
                        },
                    );
                }
            }
        }
    }

    /// The quotas that apply to `params`, in name order.
    fn choose(&mut self, params: &QuotaParams) -> Vec<TrackedUsage> {
        let mut usages: Vec<TrackedUsage> = self
            .quotas
            .iter_mut()
            .filter(|(_, tracked)| tracked.quota.to.matches_any(params.user, &params.enabled_roles))
            .map(|(id, TrackedQuota { quota, by_key })| {
                let key = quota_key(quota.key_type, params);
                let intervals = by_key
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(QuotaIntervals::new(&quota.limits)));
                TrackedUsage {
                    key: QuotaUsageKey {
                        quota: *id,
                        name: quota.name.clone(),
                        key,
                    },
                    intervals: Arc::clone(intervals),
                }
            })
            .collect();
        usages.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        usages
    }

    fn register(&mut self, enabled: &Arc<EnabledQuota>) {
        self.live.retain(|weak| weak.strong_count() > 0);
        self.live.push(Arc::downgrade(enabled));
    }

    fn refresh_live(&mut self) {
        self.live.retain(|weak| weak.strong_count() > 0);
        let live: Vec<Arc<EnabledQuota>> = self.live.iter().filter_map(Weak::upgrade).collect();
        for enabled in live {
            if let Some(params) = enabled.params() {
                let usages = self.choose(params);
                enabled.set_usages(usages);
            }
        }
    }
}

/// Computes quotas from the storage and tracks their usage.
///
/// Equal params share one [`EnabledQuota`] while it stays cached. Every
/// instance handed out is refreshed when any quota changes, and usage
/// survives cache expiry since it lives with the provider.
pub struct StorageQuotaProvider {
    storage: Arc<dyn AccessStorage>,
    cache: ExpiringCache<QuotaParams, Arc<EnabledQuota>>,
    table: Arc<Mutex<UsageTable>>,
    _subscription: Subscription,
}

impl StorageQuotaProvider {
    pub fn new(storage: Arc<dyn AccessStorage>, capacity: usize, ttl: Duration) -> Self {
        let table = Arc::new(Mutex::new(UsageTable::default()));
        let weak_storage: Weak<dyn AccessStorage> = Arc::downgrade(&storage);
        let weak_table = Arc::downgrade(&table);
        let subscription = storage.subscribe_kind(
            EntityKind::Quota,
            Arc::new(move |id: EntityId, _: Option<Arc<Entity>>| {
                let (Some(storage), Some(table)) = (weak_storage.upgrade(), weak_table.upgrade()) else {
                    return;
                };
                let mut table = table.lock();
                table.sync(storage.as_ref());
                debug!(quota = %id, instances = table.live.len(), "refreshing quotas");
                table.refresh_live();
            }),
        );
        Self {
            storage,
            cache: ExpiringCache::new(capacity, ttl),
            table,
            _subscription: subscription,
        }
    }
}

impl QuotaProvider for StorageQuotaProvider {
    fn quota(&self, params: &QuotaParams) -> Arc<EnabledQuota> {
        self.cache.get_or_insert_with(params.clone(), Instant::now(), || {
            debug!(user = %params.user, "computing quotas");
            let enabled = Arc::new(EnabledQuota::new(params.clone()));
            let mut table = self.table.lock();
            table.sync(self.storage.as_ref());
            enabled.set_usages(table.choose(params));
            table.register(&enabled);
            enabled
        })
    }
}

impl fmt::Debug for StorageQuotaProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageQuotaProvider")
            .field("cached", &self.cache.len())
            .field("tracked", &self.table.lock().quotas.len())
            .finish_non_exhaustive()
    }
}
