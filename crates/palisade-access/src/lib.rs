//! # palisade-access: Access-control evaluation
//!
//! Decides whether a session may run an operation on a resource of the
//! server → database → table → column hierarchy:
//! - **Privilege trees** with grants, MySQL-style partial revokes and
//!   separate grant-option tracking
//! - **Role graphs** resolved transitively, cycles included
//! - **Session contexts** that memoize the effective rights per setting mask
//!   and follow entity changes through subscriptions
//! - **Row policies, quotas and settings profiles** handed out per principal
//!   and kept current as the underlying entities change
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  AccessControlManager                         │
//! │  ├─ AccessStorage (users, roles, policies)    │
//! │  ├─ RoleCache ──▶ EnabledRoles                │
//! │  ├─ RowPolicyProvider / QuotaProvider         │
//! │  ├─ SettingsProfilesCache                     │
//! │  └─ ContextAccess cache (keyed by params)     │
//! └──────────────────┬───────────────────────────┘
//!                    │ context_access(params)
//!                    ▼
//! ┌──────────────────────────────────────────────┐
//! │  ContextAccess                                │
//! │  user tree ∪ role trees − restrictions        │
//! │  check_access / check_grant_option / ...      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use palisade_access::{
//!     AccessControlManager, AccessFlags, AccessRightsElement, AccessStorage, ContextAccessParams,
//!     GrantRequest, MemoryStorage, User,
//! };
//! use palisade_config::PalisadeConfig;
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let manager = AccessControlManager::new(storage.clone(), &PalisadeConfig::default());
//! let alice = storage.insert(User::new("alice").into())?;
//!
//! let grant = GrantRequest::grant([AccessRightsElement::database(AccessFlags::SELECT, "sales")]).to([alice]);
//! manager.execute_grant(&grant, None)?;
//!
//! let context = manager.context_access(ContextAccessParams::for_user(alice));
//! context.check_access(AccessFlags::SELECT, &["sales", "orders"])?;
//! assert!(!context.is_granted(AccessFlags::INSERT, &["sales", "orders"]));
//! # Ok::<(), palisade_access::AccessError>(())
//! ```

pub mod cache;
pub mod context;
pub mod element;
pub mod entities;
pub mod error;
pub mod flags;
pub mod grants;
pub mod hosts;
pub mod manager;
pub mod policies;
pub mod quota;
pub mod rights;
pub mod roles;
pub mod settings;
pub mod storage;

pub use cache::{CacheStats, ExpiringCache, LiveHandles};
pub use context::{AccessRestrictions, ClientInterface, ContextAccess, ContextAccessParams, HttpMethod};
pub use element::{AccessRightsElement, AccessRightsElements, DatabaseScope};
pub use entities::{
    Authentication, ConditionType, Entity, GrantedRoles, Privileges, Quota, QuotaKeyType, QuotaLimits,
    QuotaResource, Role, RoleSet, RowPolicy, SettingValue, SettingsProfile, SettingsProfileElement, User,
};
pub use error::{AccessError, Result};
pub use flags::{AccessFlags, AccessLevel};
pub use grants::{GrantStatement, show_grants};
pub use hosts::{AllowedClientHosts, HostResolver, IpSubnet, StaticResolver, SystemResolver};
pub use manager::{AccessControlManager, GrantKind, GrantRequest};
pub use policies::{EnabledRowPolicies, RowPolicyProvider, StorageRowPolicyProvider};
pub use quota::{
    EnabledQuota, IntervalUsage, QuotaParams, QuotaProvider, QuotaUsageInfo, QuotaUsageKey, StorageQuotaProvider,
};
pub use rights::AccessRights;
pub use roles::{EnabledRoles, EnabledRolesInfo, RoleCache};
pub use settings::{
    EnabledSettings, SettingChange, SettingConstraint, SettingsConstraints, SettingsParams, SettingsProfilesCache,
};
pub use storage::{AccessStorage, ChangeHandler, MemoryStorage, Subscription};

pub use palisade_types::{EntityId, EntityKind, RoleId, UserId};

// Kani proofs for bounded model checking
#[cfg(kani)]
mod kani_proofs;
