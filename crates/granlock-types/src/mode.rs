//! The lock-mode algebra for hierarchical (intent) locking.
//!
//! Six modes, following the classic Gray intent-lock protocol: `NL` (no
//! lock), the intent modes `IS`/`IX`, shared `S`, `SIX` (shared with
//! intent to write below), and exclusive `X`. The four relations defined
//! here (compatibility, parent-mode inference, parent/child legality,
//! substitutability) are the whole of the protocol; everything the
//! engine does is driven by these tables.

use std::fmt;

/// A lock mode. `NL` represents the absence of a lock and is never stored
/// in the lock table; it only appears in queries and in the algebra.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    /// No lock.
    NL,
    /// Intention shared: the transaction will take `S`/`IS` locks below.
    IS,
    /// Intention exclusive: the transaction will take locks of any mode below.
    IX,
    /// Shared: the whole subtree is readable.
    S,
    /// Shared + intention exclusive: readable subtree, writes declared below.
    SIX,
    /// Exclusive: the whole subtree is read/write owned.
    X,
}

impl LockMode {
    /// Every mode, for table-driven tests and strategies.
    pub const ALL: [LockMode; 6] = [
        LockMode::NL,
        LockMode::IS,
        LockMode::IX,
        LockMode::S,
        LockMode::SIX,
        LockMode::X,
    ];

    /// Whether two *different* transactions may hold `self` and `other`
    /// on the same resource at the same time. Symmetric.
    ///
    /// ```text
    ///       NL  IS  IX  S  SIX  X
    /// NL     T   T   T  T   T   T
    /// IS     T   T   T  T   T   F
    /// IX     T   T   T  F   F   F
    /// S      T   T   F  T   F   F
    /// SIX    T   T   F  F   F   F
    /// X      T   F   F  F   F   F
    /// ```
    #[must_use]
    pub const fn compatible(self, other: LockMode) -> bool {
        match (self, other) {
            (LockMode::NL, _) | (_, LockMode::NL) => true,
            (LockMode::X, _) | (_, LockMode::X) => false,
            (LockMode::IS, _) | (_, LockMode::IS) => true,
            (LockMode::SIX, _) | (_, LockMode::SIX) => false,
            (LockMode::IX, LockMode::IX) | (LockMode::S, LockMode::S) => true,
            (LockMode::IX, LockMode::S) | (LockMode::S, LockMode::IX) => false,
        }
    }

    /// The minimum mode a parent must hold for a child lock of mode `self`
    /// to be legal beneath it.
    #[must_use]
    pub const fn parent_mode(self) -> LockMode {
        match self {
            LockMode::NL => LockMode::NL,
            LockMode::IS | LockMode::S => LockMode::IS,
            LockMode::IX | LockMode::SIX | LockMode::X => LockMode::IX,
        }
    }

    /// Whether a parent holding `self` may have a child holding `child`.
    ///
    /// `S` and `X` parents own their whole subtree, so they admit only
    /// `NL` children; `IX` admits everything; `SIX` admits only the write
    /// intents (`IX`/`X`) since the shared half already covers reads.
    #[must_use]
    pub const fn can_be_parent_of(self, child: LockMode) -> bool {
        match (self, child) {
            (_, LockMode::NL) => true,
            (LockMode::NL | LockMode::S | LockMode::X, _) => false,
            (LockMode::IX, _) => true,
            (LockMode::IS, LockMode::IS | LockMode::S) => true,
            (LockMode::IS, _) => false,
            (LockMode::SIX, LockMode::IX | LockMode::X) => true,
            (LockMode::SIX, _) => false,
        }
    }

    /// Whether `self` confers every right `required` confers, i.e. whether
    /// a lock of mode `self` can stand in where `required` is needed.
    /// Reflexive; this relation defines the legal promotions.
    #[must_use]
    pub const fn substitutes(self, required: LockMode) -> bool {
        match (self, required) {
            (LockMode::NL, LockMode::NL)
            | (LockMode::IS, LockMode::NL | LockMode::IS)
            | (LockMode::IX, LockMode::NL | LockMode::IS | LockMode::IX)
            | (LockMode::S, LockMode::NL | LockMode::S)
            | (LockMode::SIX, LockMode::NL | LockMode::S | LockMode::SIX)
            | (LockMode::X, LockMode::NL | LockMode::S | LockMode::X) => true,
            _ => false,
        }
    }

    /// Whether this is one of the intent modes (`IS`, `IX`, `SIX`).
    #[must_use]
    pub const fn is_intent(self) -> bool {
        matches!(self, LockMode::IS | LockMode::IX | LockMode::SIX)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::NL => "NL",
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::SIX => "SIX",
            LockMode::X => "X",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::LockMode::{self, IS, IX, NL, S, SIX, X};

    /// Rows of the compatibility matrix, in `ALL` order.
    const COMPAT: [(LockMode, [bool; 6]); 6] = [
        (NL, [true, true, true, true, true, true]),
        (IS, [true, true, true, true, true, false]),
        (IX, [true, true, true, false, false, false]),
        (S, [true, true, false, true, false, false]),
        (SIX, [true, true, false, false, false, false]),
        (X, [true, false, false, false, false, false]),
    ];

    #[test]
    fn compatibility_matrix() {
        for (a, row) in COMPAT {
            for (b, expected) in LockMode::ALL.iter().zip(row) {
                assert_eq!(
                    a.compatible(*b),
                    expected,
                    "compatible({a}, {b}) should be {expected}"
                );
            }
        }
    }

    #[test]
    fn parent_mode_mapping() {
        assert_eq!(S.parent_mode(), IS);
        assert_eq!(IS.parent_mode(), IS);
        assert_eq!(X.parent_mode(), IX);
        assert_eq!(IX.parent_mode(), IX);
        assert_eq!(SIX.parent_mode(), IX);
        assert_eq!(NL.parent_mode(), NL);
    }

    /// Rows of the parent/child legality matrix, in `ALL` order.
    const PARENT: [(LockMode, [bool; 6]); 6] = [
        (NL, [true, false, false, false, false, false]),
        (IS, [true, true, false, true, false, false]),
        (IX, [true, true, true, true, true, true]),
        (S, [true, false, false, false, false, false]),
        (SIX, [true, false, true, false, false, true]),
        (X, [true, false, false, false, false, false]),
    ];

    #[test]
    fn parent_child_matrix() {
        for (parent, row) in PARENT {
            for (child, expected) in LockMode::ALL.iter().zip(row) {
                assert_eq!(
                    parent.can_be_parent_of(*child),
                    expected,
                    "can_be_parent_of({parent}, {child}) should be {expected}"
                );
            }
        }
    }

    /// Rows of the substitutability matrix, in `ALL` order.
    const SUBSTITUTES: [(LockMode, [bool; 6]); 6] = [
        (NL, [true, false, false, false, false, false]),
        (IS, [true, true, false, false, false, false]),
        (IX, [true, true, true, false, false, false]),
        (S, [true, false, false, true, false, false]),
        (SIX, [true, false, false, true, true, false]),
        (X, [true, false, false, true, false, true]),
    ];

    #[test]
    fn substitutability_matrix() {
        for (have, row) in SUBSTITUTES {
            for (need, expected) in LockMode::ALL.iter().zip(row) {
                assert_eq!(
                    have.substitutes(*need),
                    expected,
                    "substitutes({have}, {need}) should be {expected}"
                );
            }
        }
    }

    #[test]
    fn intent_classification() {
        assert!(IS.is_intent());
        assert!(IX.is_intent());
        assert!(SIX.is_intent());
        assert!(!NL.is_intent());
        assert!(!S.is_intent());
        assert!(!X.is_intent());
    }

    #[test]
    fn display_names() {
        let rendered: Vec<String> = LockMode::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["NL", "IS", "IX", "S", "SIX", "X"]);
    }

    mod properties {
        use proptest::prelude::*;

        use super::LockMode;

        fn any_mode() -> impl Strategy<Value = LockMode> {
            prop::sample::select(LockMode::ALL.to_vec())
        }

        proptest! {
            #[test]
            fn compatibility_is_symmetric(a in any_mode(), b in any_mode()) {
                prop_assert_eq!(a.compatible(b), b.compatible(a));
            }

            #[test]
            fn nl_is_compatible_with_everything(m in any_mode()) {
                prop_assert!(LockMode::NL.compatible(m));
            }

            #[test]
            fn x_is_compatible_only_with_nl(m in any_mode()) {
                prop_assert_eq!(LockMode::X.compatible(m), m == LockMode::NL);
            }

            #[test]
            fn substitutability_is_reflexive(m in any_mode()) {
                prop_assert!(m.substitutes(m));
            }

            #[test]
            fn substitutability_is_transitive(
                a in any_mode(),
                b in any_mode(),
                c in any_mode(),
            ) {
                if a.substitutes(b) && b.substitutes(c) {
                    prop_assert!(a.substitutes(c));
                }
            }

            #[test]
            fn everything_substitutes_nl(m in any_mode()) {
                prop_assert!(m.substitutes(LockMode::NL));
            }

            #[test]
            fn inferred_parent_mode_is_legal(m in any_mode()) {
                prop_assert!(m.parent_mode().can_be_parent_of(m));
            }

            #[test]
            fn stronger_substitute_stays_compatible(
                weak in any_mode(),
                strong in any_mode(),
                other in any_mode(),
            ) {
                // Whatever conflicts with a weak mode also conflicts with
                // anything that substitutes it.
                if strong.substitutes(weak) && strong.compatible(other) {
                    prop_assert!(weak.compatible(other));
                }
            }
        }
    }
}
