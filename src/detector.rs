use std::collections::{BTreeSet, HashMap};

use ulid::Ulid;

use crate::model::*;

// ── Overlap Detection ─────────────────────────────────────────────

/// Find every pair of allocations that share a resource and whose event
/// windows overlap (half-open, so back-to-back events never conflict).
///
/// Allocations pointing at a missing event or resource are skipped.
/// Output is deduplicated and sorted by `(first, second)`.
///
/// Per resource: sort by `(start, allocation id)`, then sweep while keeping the
/// allocations whose window is still open. Each new allocation conflicts with
/// exactly the open ones, so the cost is O(n log n + k) for k reported pairs.
pub fn find_conflicts(
    allocations: &[Allocation],
    events: &HashMap<Ulid, Event>,
    resources: &HashMap<Ulid, Resource>,
) -> Vec<Conflict> {
    let mut by_resource: HashMap<Ulid, Vec<(Span, Ulid)>> = HashMap::new();
    for alloc in allocations {
        if !resources.contains_key(&alloc.resource_id) {
            continue;
        }
        let Some(event) = events.get(&alloc.event_id) else {
            continue;
        };
        by_resource
            .entry(alloc.resource_id)
            .or_default()
            .push((event.span, alloc.id));
    }

    let mut found = BTreeSet::new();
    for (resource_id, mut group) in by_resource {
        group.sort_by(|a, b| a.0.start.cmp(&b.0.start).then(a.1.cmp(&b.1)));
        sweep(resource_id, &group, &mut found);
    }
    found.into_iter().collect()
}

/// Sweep one resource's allocations, sorted by start.
fn sweep(resource_id: Ulid, sorted: &[(Span, Ulid)], found: &mut BTreeSet<Conflict>) {
    // (end, allocation id) of windows not yet closed at the current start.
    let mut open: Vec<(Ms, Ulid)> = Vec::new();
    for &(span, id) in sorted {
        open.retain(|&(end, _)| end > span.start);
        for &(_, other) in &open {
            if other != id {
                found.insert(Conflict::new(other, id, resource_id));
            }
        }
        open.push((span.end, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000; // 1 hour in ms
    const M: Ms = 60_000; // 1 minute in ms

    struct Fixture {
        events: HashMap<Ulid, Event>,
        resources: HashMap<Ulid, Resource>,
        allocations: Vec<Allocation>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                events: HashMap::new(),
                resources: HashMap::new(),
                allocations: Vec::new(),
            }
        }

        fn resource(&mut self, name: &str) -> Ulid {
            let id = Ulid::new();
            self.resources.insert(
                id,
                Resource {
                    id,
                    name: name.into(),
                    kind: "room".into(),
                },
            );
            id
        }

        /// Book `resource_id` for a fresh event `[start, end)`. Returns the allocation id.
        fn book(&mut self, resource_id: Ulid, start: Ms, end: Ms) -> Ulid {
            let event_id = Ulid::new();
            self.events.insert(
                event_id,
                Event {
                    id: event_id,
                    title: format!("event {start}-{end}"),
                    span: Span::new(start, end),
                    description: None,
                },
            );
            self.allocate(event_id, resource_id)
        }

        fn allocate(&mut self, event_id: Ulid, resource_id: Ulid) -> Ulid {
            let id = Ulid::new();
            self.allocations.push(Allocation {
                id,
                event_id,
                resource_id,
            });
            id
        }

        fn conflicts(&self) -> Vec<Conflict> {
            find_conflicts(&self.allocations, &self.events, &self.resources)
        }
    }

    fn pair(a: Ulid, b: Ulid, r: Ulid) -> Conflict {
        Conflict::new(a, b, r)
    }

    #[test]
    fn empty_input() {
        let f = Fixture::new();
        assert!(f.conflicts().is_empty());
    }

    #[test]
    fn back_to_back_no_conflict() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        f.book(r, 10 * H, 11 * H);
        f.book(r, 11 * H, 12 * H);
        assert!(f.conflicts().is_empty());
    }

    #[test]
    fn simple_overlap() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let a1 = f.book(r, 10 * H, 11 * H);
        let a2 = f.book(r, 10 * H + 30 * M, 11 * H + 30 * M);
        assert_eq!(f.conflicts(), vec![pair(a1, a2, r)]);
    }

    #[test]
    fn three_way_overlap() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let a1 = f.book(r, 10 * H, 12 * H);
        let a2 = f.book(r, 10 * H + 30 * M, 11 * H);
        let a3 = f.book(r, 11 * H + 30 * M, 12 * H + 30 * M);

        let got = f.conflicts();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&pair(a1, a2, r)));
        assert!(got.contains(&pair(a1, a3, r)));
        assert!(!got.contains(&pair(a2, a3, r)));
    }

    #[test]
    fn different_resources_never_conflict() {
        let mut f = Fixture::new();
        let r1 = f.resource("R1");
        let r2 = f.resource("R2");
        f.book(r1, 10 * H, 12 * H);
        f.book(r2, 10 * H, 12 * H);
        assert!(f.conflicts().is_empty());
    }

    #[test]
    fn same_event_twice_on_one_resource_conflicts() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let a1 = f.book(r, 10 * H, 11 * H);
        let event_id = f.allocations[0].event_id;
        let a2 = f.allocate(event_id, r);
        assert_eq!(f.conflicts(), vec![pair(a1, a2, r)]);
    }

    #[test]
    fn shared_event_on_two_resources_no_conflict() {
        let mut f = Fixture::new();
        let r1 = f.resource("R1");
        let r2 = f.resource("R2");
        f.book(r1, 10 * H, 11 * H);
        let event_id = f.allocations[0].event_id;
        f.allocate(event_id, r2);
        assert!(f.conflicts().is_empty());
    }

    #[test]
    fn dangling_event_excluded() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        f.book(r, 10 * H, 12 * H);
        let a2 = f.book(r, 11 * H, 13 * H);
        // Delete the second allocation's event.
        let gone = f.allocations[1].event_id;
        f.events.remove(&gone);

        let got = f.conflicts();
        assert!(got.is_empty());
        assert!(!got.iter().any(|c| c.first == a2 || c.second == a2));
    }

    #[test]
    fn dangling_resource_excluded() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        f.book(r, 10 * H, 12 * H);
        f.book(r, 11 * H, 13 * H);
        f.resources.remove(&r);
        assert!(f.conflicts().is_empty());
    }

    #[test]
    fn identical_windows_conflict() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let a1 = f.book(r, 10 * H, 11 * H);
        let a2 = f.book(r, 10 * H, 11 * H);
        assert_eq!(f.conflicts(), vec![pair(a1, a2, r)]);
    }

    #[test]
    fn long_window_covers_many() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let long = f.book(r, 0, 10 * H);
        let shorts: Vec<Ulid> = (0..5).map(|i| f.book(r, i * 2 * H, i * 2 * H + H)).collect();

        let got = f.conflicts();
        assert_eq!(got.len(), 5);
        for s in shorts {
            assert!(got.contains(&pair(long, s, r)));
        }
    }

    #[test]
    fn single_ms_overlap() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        let a1 = f.book(r, 100, 201);
        let a2 = f.book(r, 200, 300);
        assert_eq!(f.conflicts(), vec![pair(a1, a2, r)]);
    }

    #[test]
    fn pairs_are_ordered_and_sorted() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        for i in 0..6 {
            f.book(r, i * 10 * M, i * 10 * M + 25 * M);
        }
        let got = f.conflicts();
        assert!(!got.is_empty());
        for c in &got {
            assert!(c.first < c.second);
        }
        let mut sorted = got.clone();
        sorted.sort();
        assert_eq!(got, sorted);
    }

    #[test]
    fn idempotent() {
        let mut f = Fixture::new();
        let r1 = f.resource("R1");
        let r2 = f.resource("R2");
        for i in 0..20 {
            let r = if i % 3 == 0 { r2 } else { r1 };
            f.book(r, (i * 37 % 11) * H, (i * 37 % 11) * H + (i % 4 + 1) * H);
        }
        assert_eq!(f.conflicts(), f.conflicts());
    }

    /// Compare against the naive pairwise check on a pseudo-random layout.
    #[test]
    fn matches_pairwise_reference() {
        let mut f = Fixture::new();
        let rs: Vec<Ulid> = (0..3).map(|i| f.resource(&format!("R{i}"))).collect();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..60 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let r = rs[(seed % 3) as usize];
            let start = ((seed >> 8) % 48) as Ms * 30 * M;
            let len = ((seed >> 20) % 6 + 1) as Ms * 30 * M;
            f.book(r, start, start + len);
        }

        let mut expected = BTreeSet::new();
        for (i, a) in f.allocations.iter().enumerate() {
            for b in &f.allocations[i + 1..] {
                if a.resource_id != b.resource_id {
                    continue;
                }
                let sa = f.events[&a.event_id].span;
                let sb = f.events[&b.event_id].span;
                if sa.overlaps(&sb) {
                    expected.insert(pair(a.id, b.id, a.resource_id));
                }
            }
        }

        let got = f.conflicts();
        assert_eq!(got, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn disjoint_windows_never_reported() {
        let mut f = Fixture::new();
        let r = f.resource("R");
        for i in 0..10 {
            f.book(r, i * H, i * H + 59 * M);
        }
        assert!(f.conflicts().is_empty());
    }
}
