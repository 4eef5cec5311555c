//! Kani bounded model checking proofs for the flag algebra and session
//! restrictions.
//!
//! - Proof #1: Difference and intersection partition a flag set
//! - Proof #2: Composite keywords are unions of their leaves
//! - Proof #3: Restrictions never take away reads
//! - Proof #4: Readonly 2 is never stricter than readonly 1

use crate::context::AccessRestrictions;
use crate::flags::AccessFlags;

fn any_flags() -> AccessFlags {
    AccessFlags::from_bits_truncate(kani::any())
}

fn any_restrictions() -> AccessRestrictions {
    let readonly: u8 = kani::any();
    kani::assume(readonly <= 2);
    AccessRestrictions {
        readonly,
        allow_ddl: kani::any(),
        allow_introspection: kani::any(),
    }
}

//=============================================================================
// Proof #1: Partition
//=============================================================================

/// **Property**: `(a - b) | (a & b) == a` and the two parts are disjoint.
#[cfg(kani)]
#[kani::proof]
fn verify_difference_partition() {
    let a = any_flags();
    let b = any_flags();

    assert_eq!((a - b) | (a & b), a);
    assert!(((a - b) & (a & b)).is_empty());
    assert!(!(a - b).intersects(b));
    assert!(AccessFlags::ALL.contains(a));
}

//=============================================================================
// Proof #2: Composite keywords
//=============================================================================

/// **Property**: A set contains a composite exactly when it contains each of
/// its parts.
#[cfg(kani)]
#[kani::proof]
fn verify_composite_containment() {
    let a = any_flags();

    let has_alter = a.contains(AccessFlags::ALTER);
    let has_parts = a.contains(AccessFlags::ALTER_TABLE) && a.contains(AccessFlags::ALTER_VIEW);
    assert_eq!(has_alter, has_parts);

    let has_show = a.contains(AccessFlags::SHOW);
    assert!(!has_show || a.contains(AccessFlags::SHOW_DATABASES));
}

//=============================================================================
// Proof #3: Reads survive restrictions
//=============================================================================

/// **Property**: No combination of readonly, allow_ddl and allow_introspection
/// denies SELECT or SHOW ACCESS, and the denied set stays inside ALL.
#[cfg(kani)]
#[kani::proof]
fn verify_restrictions_keep_reads() {
    let restrictions = any_restrictions();
    let denied = restrictions.denied();

    assert!(!denied.intersects(AccessFlags::SELECT));
    assert!(!denied.intersects(AccessFlags::SHOW_ACCESS));
    assert!(AccessFlags::ALL.contains(denied));
    if restrictions.readonly > 0 {
        assert!(denied.contains(AccessFlags::INSERT));
    }
}

//=============================================================================
// Proof #4: Readonly levels are ordered
//=============================================================================

/// **Property**: Everything readonly 2 denies is also denied by readonly 1.
#[cfg(kani)]
#[kani::proof]
fn verify_readonly_levels_ordered() {
    let base = any_restrictions();
    let strict = AccessRestrictions { readonly: 1, ..base };
    let relaxed = AccessRestrictions { readonly: 2, ..base };

    assert!(strict.denied().contains(relaxed.denied()));
    assert!(!relaxed.denied().intersects(AccessFlags::CREATE_TEMPORARY_TABLE) || !base.allow_ddl);
}
