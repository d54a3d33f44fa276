use ulid::Ulid;

use crate::detector::find_conflicts;
use crate::limits::*;
use crate::model::*;

use super::Engine;

impl Engine {
    pub async fn get_event(&self, id: Ulid) -> Option<Event> {
        self.state.read().await.events.get(&id).cloned()
    }

    pub async fn get_resource(&self, id: Ulid) -> Option<Resource> {
        self.state.read().await.resources.get(&id).cloned()
    }

    pub async fn get_allocation(&self, id: Ulid) -> Option<Allocation> {
        self.state.read().await.allocations.get(&id).copied()
    }

    /// Events ordered by start time, ties by id. With `from`, only events
    /// starting at or after it.
    pub async fn list_events(&self, from: Option<Ms>) -> Vec<Event> {
        let guard = self.state.read().await;
        let mut events: Vec<Event> = guard
            .events
            .values()
            .filter(|e| from.is_none_or(|t| e.span.start >= t))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        events
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let guard = self.state.read().await;
        let mut resources: Vec<Resource> = guard.resources.values().cloned().collect();
        resources.sort_by_key(|r| r.id);
        resources
    }

    pub async fn list_allocations(&self) -> Vec<Allocation> {
        self.state.read().await.sorted_allocations()
    }

    /// Totals plus the next few events starting at or after `now`.
    pub async fn dashboard(&self, now: Ms) -> Dashboard {
        let guard = self.state.read().await;
        let mut upcoming: Vec<Event> = guard
            .events
            .values()
            .filter(|e| e.span.start >= now)
            .cloned()
            .collect();
        upcoming.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        upcoming.truncate(UPCOMING_EVENTS);

        Dashboard {
            total_events: guard.events.len(),
            total_resources: guard.resources.len(),
            total_allocations: guard.allocations.len(),
            upcoming,
        }
    }

    /// Run overlap detection over the current snapshot.
    pub async fn conflicts(&self) -> Vec<Conflict> {
        let guard = self.state.read().await;
        let allocations = guard.sorted_allocations();
        let found = find_conflicts(&allocations, &guard.events, &guard.resources);
        metrics::histogram!(crate::observability::CONFLICTS_DETECTED).record(found.len() as f64);
        found
    }

    /// Conflicts joined with event titles and the shared resource's name.
    pub async fn conflict_rows(&self) -> Vec<ConflictRow> {
        let guard = self.state.read().await;
        let allocations = guard.sorted_allocations();
        let found = find_conflicts(&allocations, &guard.events, &guard.resources);
        metrics::histogram!(crate::observability::CONFLICTS_DETECTED).record(found.len() as f64);

        let title = |alloc_id: &Ulid| -> String {
            guard
                .allocations
                .get(alloc_id)
                .and_then(|a| guard.events.get(&a.event_id))
                .map(|e| e.title.clone())
                .unwrap_or_default()
        };

        found
            .into_iter()
            .map(|conflict| ConflictRow {
                resource_name: guard
                    .resources
                    .get(&conflict.resource_id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default(),
                first_title: title(&conflict.first),
                second_title: title(&conflict.second),
                conflict,
            })
            .collect()
    }

    /// One row per allocation with whatever of its event and resource still exists.
    pub async fn report(&self) -> Vec<ReportRow> {
        let guard = self.state.read().await;
        guard
            .sorted_allocations()
            .into_iter()
            .map(|a| {
                let event = guard.events.get(&a.event_id);
                let resource = guard.resources.get(&a.resource_id);
                ReportRow {
                    allocation_id: a.id,
                    event_id: a.event_id,
                    resource_id: a.resource_id,
                    event_title: event.map(|e| e.title.clone()),
                    span: event.map(|e| e.span),
                    resource_name: resource.map(|r| r.name.clone()),
                    resource_kind: resource.map(|r| r.kind.clone()),
                }
            })
            .collect()
    }
}
