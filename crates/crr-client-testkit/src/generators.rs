//! Proptest generators for property-based testing.

use std::collections::HashSet;

use proptest::prelude::*;

use crr_client_core::{Changeset, SiteId, Value};

use crate::fixtures::site;

/// Generate a random SiteId.
pub fn site_id() -> impl Strategy<Value = SiteId> {
    any::<[u8; 16]>().prop_map(SiteId::from_bytes)
}

/// Generate a scalar value (no blobs, finite reals).
pub fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e6f64..1.0e6).prop_map(Value::Real),
        "[a-z]{0,8}".prop_map(Value::Text),
    ]
}

/// One write against `foo`, drawn from a small key space so that
/// generated histories actually conflict.
pub fn foo_change() -> impl Strategy<Value = Changeset> {
    (
        1i64..=3,
        prop_oneof![
            2 => Just(Some("bar")),
            2 => Just(Some("baz")),
            1 => Just(None),
        ],
        value(),
        0i64..4,
        1u8..=3,
    )
        .prop_map(|(pk, cid, val, col_version, site_byte)| Changeset {
            table: "foo".into(),
            pk: Value::Integer(pk),
            cid: cid.map(String::from),
            val: if cid.is_some() { val } else { Value::Null },
            col_version,
            db_version: 0,
            site_id: site(site_byte),
        })
}

/// One write against `mail`. Two addresses shared by three rows keep the
/// UNIQUE constraint busy.
pub fn mail_change() -> impl Strategy<Value = Changeset> {
    (
        1i64..=3,
        prop_oneof![4 => Just(Some("email")), 1 => Just(None)],
        prop_oneof![
            4 => prop_oneof![Just("a@x"), Just("b@x")].prop_map(Value::text),
            1 => Just(Value::Null),
        ],
        0i64..4,
        1u8..=3,
    )
        .prop_map(|(pk, cid, val, col_version, site_byte)| Changeset {
            table: "mail".into(),
            pk: Value::Integer(pk),
            cid: cid.map(String::from),
            val: if cid.is_some() { val } else { Value::Null },
            col_version,
            db_version: 0,
            site_id: site(site_byte),
        })
}

/// A change history as the server would produce it.
///
/// A `(pk, cid, col_version, site_id)` slot is written at most once and
/// `db_version` increases along the history.
pub fn foo_history(max_len: usize) -> impl Strategy<Value = Vec<Changeset>> {
    history(foo_change(), max_len)
}

/// A history of `mail` writes, shaped like [`foo_history`].
pub fn mail_history(max_len: usize) -> impl Strategy<Value = Vec<Changeset>> {
    history(mail_change(), max_len)
}

fn history(
    change: impl Strategy<Value = Changeset>,
    max_len: usize,
) -> impl Strategy<Value = Vec<Changeset>> {
    prop::collection::vec(change, 0..=max_len).prop_map(|changes| {
        let mut seen = HashSet::new();
        changes
            .into_iter()
            .filter(|c| {
                seen.insert((
                    format!("{:?}", c.pk),
                    c.cid.clone(),
                    c.col_version,
                    c.site_id,
                ))
            })
            .enumerate()
            .map(|(i, mut c)| {
                c.db_version = i as i64 + 1;
                c
            })
            .collect()
    })
}

/// A history together with one permutation of it.
pub fn foo_history_and_permutation(
    max_len: usize,
) -> impl Strategy<Value = (Vec<Changeset>, Vec<Changeset>)> {
    with_permutation(foo_history(max_len))
}

/// A `mail` history together with one permutation of it.
pub fn mail_history_and_permutation(
    max_len: usize,
) -> impl Strategy<Value = (Vec<Changeset>, Vec<Changeset>)> {
    with_permutation(mail_history(max_len))
}

fn with_permutation(
    histories: impl Strategy<Value = Vec<Changeset>>,
) -> impl Strategy<Value = (Vec<Changeset>, Vec<Changeset>)> {
    histories.prop_flat_map(|history| {
        let shuffled = Just(history.clone()).prop_shuffle();
        (Just(history), shuffled)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn history_slots_are_unique(history in foo_history(40)) {
            let mut slots = HashSet::new();
            for c in &history {
                let inserted = slots.insert((format!("{:?}", c.pk), c.cid.clone(), c.col_version, c.site_id));
                prop_assert!(inserted);
            }
        }

        #[test]
        fn history_db_versions_increase(history in foo_history(40)) {
            for pair in history.windows(2) {
                prop_assert!(pair[0].db_version < pair[1].db_version);
            }
        }

        #[test]
        fn mail_history_stays_on_mail(history in mail_history(40)) {
            prop_assert!(history.iter().all(|c| c.table == "mail"));
        }

        #[test]
        fn tombstones_carry_null(c in foo_change()) {
            if c.is_tombstone() {
                prop_assert!(c.val.is_null());
            }
        }
    }
}
