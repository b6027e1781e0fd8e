use crate::model::*;

// ── Availability predicate ────────────────────────────────────────
//
// A workstation is unavailable at `t` iff some membership claims it:
//
//     ∃ m. active(m) ∧ in_progress(g(m), t)
//
// Its availability is the De Morgan complement, so the two can never drift:
//
//     ∀ m. ¬active(m) ∨ ¬in_progress(g(m), t)
//   = ∀ m. removed(m) ∨ scheduled(g(m), t) ∨ ended(g(m), t)
//
// (the second line because the three window phases partition time). An empty
// membership set is vacuously available.

/// True when some `(membership, window)` pair holds the workstation at `t`.
pub fn is_unavailable<'a, I>(memberships: I, t: Ms) -> bool
where
    I: IntoIterator<Item = (&'a Membership, &'a Window)>,
{
    memberships.into_iter().any(|(m, w)| m.claims_at(w, t))
}

/// Complement of [`is_unavailable`].
pub fn is_available<'a, I>(memberships: I, t: Ms) -> bool
where
    I: IntoIterator<Item = (&'a Membership, &'a Window)>,
{
    memberships.into_iter().all(|(m, w)| !m.claims_at(w, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn member(time_removed: Option<Ms>) -> Membership {
        Membership {
            id: Ulid::new(),
            workgroup_id: Ulid::new(),
            workstation_id: Ulid::new(),
            time_added: 0,
            time_removed,
            sharing_enabled: true,
        }
    }

    /// Availability spelled out phase by phase, as the room view describes it.
    fn available_by_phases(pairs: &[(Membership, Window)], t: Ms) -> bool {
        pairs.is_empty()
            || pairs.iter().all(|(m, w)| {
                w.phase_at(t) == Phase::Scheduled
                    || w.phase_at(t) == Phase::Ended
                    || !m.is_active()
            })
    }

    #[test]
    fn no_memberships_is_available() {
        let none: Vec<(Membership, Window)> = Vec::new();
        assert!(is_available(none.iter().map(|(m, w)| (m, w)), 0));
        assert!(!is_unavailable(none.iter().map(|(m, w)| (m, w)), 0));
    }

    #[test]
    fn active_member_of_running_workgroup_is_unavailable() {
        let pairs = [(member(None), Window::new(100, 200))];
        let iter = || pairs.iter().map(|(m, w)| (m, w));
        assert!(is_unavailable(iter(), 100));
        assert!(is_unavailable(iter(), 150));
        assert!(!is_unavailable(iter(), 99));
        assert!(!is_unavailable(iter(), 200));
    }

    #[test]
    fn removed_member_frees_workstation() {
        let pairs = [(member(Some(120)), Window::new(100, 200))];
        assert!(is_available(pairs.iter().map(|(m, w)| (m, w)), 150));
    }

    #[test]
    fn complement_holds_for_every_configuration() {
        let windows = [
            Window::new(100, 200),
            Window::new(150, 300),
            Window::new(400, 500),
        ];
        let instants = [0, 99, 100, 149, 150, 199, 200, 250, 299, 300, 400, 499, 500, 1_000];

        // Each of the three windows is either absent, joined and active, or
        // joined and removed: 27 membership configurations.
        for code in 0..27u32 {
            let mut pairs = Vec::new();
            let mut c = code;
            for w in &windows {
                match c % 3 {
                    1 => pairs.push((member(None), *w)),
                    2 => pairs.push((member(Some(w.started)), *w)),
                    _ => {}
                }
                c /= 3;
            }
            for &t in &instants {
                let iter = || pairs.iter().map(|(m, w)| (m, w));
                let available = is_available(iter(), t);
                assert_eq!(available, !is_unavailable(iter(), t), "code={code} t={t}");
                assert_eq!(available, available_by_phases(&pairs, t), "code={code} t={t}");
            }
        }
    }
}
