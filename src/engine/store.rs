use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// In-memory schedule for one tenant. The engine wraps the whole
/// thing in one lock so readers always see a consistent snapshot.
#[derive(Debug, Default)]
pub struct ScheduleState {
    pub events: HashMap<Ulid, Event>,
    pub resources: HashMap<Ulid, Resource>,
    pub allocations: HashMap<Ulid, Allocation>,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change. Replay and live mutations share this path, so it never
    /// fails: deletes of missing ids are no-ops and creates overwrite.
    pub fn apply(&mut self, change: &Change) {
        match change {
            Change::EventCreated(event) | Change::EventUpdated(event) => {
                self.events.insert(event.id, event.clone());
            }
            Change::EventDeleted { id } => {
                self.events.remove(id);
            }
            Change::ResourceCreated(resource) | Change::ResourceUpdated(resource) => {
                self.resources.insert(resource.id, resource.clone());
            }
            Change::ResourceDeleted { id } => {
                self.resources.remove(id);
            }
            Change::AllocationCreated(alloc) | Change::AllocationUpdated(alloc) => {
                self.allocations.insert(alloc.id, *alloc);
            }
            Change::AllocationsCreated(allocs) => {
                self.allocations.extend(allocs.iter().map(|a| (a.id, *a)));
            }
            Change::AllocationDeleted { id } => {
                self.allocations.remove(id);
            }
        }
    }

    /// Minimal change list that recreates this state. Resources and events come
    /// before the allocations that reference them; each group is ordered by id.
    pub fn to_changes(&self) -> Vec<Change> {
        let mut resources: Vec<&Resource> = self.resources.values().collect();
        resources.sort_by_key(|r| r.id);
        let mut events: Vec<&Event> = self.events.values().collect();
        events.sort_by_key(|e| e.id);
        let mut allocations: Vec<&Allocation> = self.allocations.values().collect();
        allocations.sort_by_key(|a| a.id);

        let mut changes =
            Vec::with_capacity(resources.len() + events.len() + allocations.len());
        changes.extend(resources.into_iter().cloned().map(Change::ResourceCreated));
        changes.extend(events.into_iter().cloned().map(Change::EventCreated));
        changes.extend(allocations.into_iter().copied().map(Change::AllocationCreated));
        changes
    }

    /// Allocations in id order. The detector's output is independent of input
    /// order, but callers listing them want something stable.
    pub fn sorted_allocations(&self) -> Vec<Allocation> {
        let mut allocs: Vec<Allocation> = self.allocations.values().copied().collect();
        allocs.sort_by_key(|a| a.id);
        allocs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(start: Ms, end: Ms) -> Event {
        Event {
            id: Ulid::new(),
            title: "e".into(),
            span: Span::new(start, end),
            description: None,
        }
    }

    #[test]
    fn apply_create_update_delete() {
        let mut st = ScheduleState::new();
        let mut e = event(0, 100);
        st.apply(&Change::EventCreated(e.clone()));
        assert_eq!(st.events.len(), 1);

        e.title = "renamed".into();
        st.apply(&Change::EventUpdated(e.clone()));
        assert_eq!(st.events[&e.id].title, "renamed");

        st.apply(&Change::EventDeleted { id: e.id });
        assert!(st.events.is_empty());

        // Deleting again is a no-op
        st.apply(&Change::EventDeleted { id: e.id });
        assert!(st.events.is_empty());
    }

    #[test]
    fn to_changes_rebuilds_same_state() {
        let mut st = ScheduleState::new();
        let e = event(0, 100);
        let r = Resource {
            id: Ulid::new(),
            name: "Hall".into(),
            kind: "room".into(),
        };
        let a = Allocation {
            id: Ulid::new(),
            event_id: e.id,
            resource_id: r.id,
        };
        st.apply(&Change::EventCreated(e));
        st.apply(&Change::ResourceCreated(r));
        st.apply(&Change::AllocationCreated(a));

        let changes = st.to_changes();
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[2], Change::AllocationCreated(_)));

        let mut rebuilt = ScheduleState::new();
        for c in &changes {
            rebuilt.apply(c);
        }
        assert_eq!(rebuilt.events, st.events);
        assert_eq!(rebuilt.resources, st.resources);
        assert_eq!(rebuilt.allocations, st.allocations);
    }

    #[test]
    fn batch_record_inserts_every_allocation() {
        let mut st = ScheduleState::new();
        let allocs: Vec<Allocation> = (0..4)
            .map(|_| Allocation {
                id: Ulid::new(),
                event_id: Ulid::new(),
                resource_id: Ulid::new(),
            })
            .collect();
        st.apply(&Change::AllocationsCreated(allocs.clone()));
        assert_eq!(st.allocations.len(), 4);
        for a in &allocs {
            assert_eq!(st.allocations[&a.id], *a);
        }
    }
}
