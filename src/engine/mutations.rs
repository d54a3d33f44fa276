use std::collections::HashSet;

use tokio::sync::{oneshot, RwLockWriteGuard};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::ScheduleState;
use super::validate::{validate_event, validate_resource};
use super::{Engine, EngineError, WalCommand};

/// Both ends of an allocation must exist when it is written. They may be
/// deleted later, leaving the allocation dangling.
fn check_references(st: &ScheduleState, alloc: &Allocation) -> Result<(), EngineError> {
    if !st.events.contains_key(&alloc.event_id) {
        return Err(EngineError::NotFound(alloc.event_id));
    }
    if !st.resources.contains_key(&alloc.resource_id) {
        return Err(EngineError::NotFound(alloc.resource_id));
    }
    Ok(())
}

impl Engine {
    // ── Events ───────────────────────────────────────────────

    pub async fn create_event(
        &self,
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        let event = Event { id, title, span, description };
        validate_event(&event)?;

        let mut guard = self.state.write().await;
        if guard.events.len() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if guard.events.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(&mut guard, Change::EventCreated(event)).await
    }

    /// Replace an event's fields. Allocations follow the new window.
    pub async fn update_event(
        &self,
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        let event = Event { id, title, span, description };
        validate_event(&event)?;

        let mut guard = self.state.write().await;
        if !guard.events.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Change::EventUpdated(event)).await
    }

    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        if !guard.events.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Change::EventDeleted { id }).await
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<(), EngineError> {
        let resource = Resource { id, name, kind };
        validate_resource(&resource)?;

        let mut guard = self.state.write().await;
        if guard.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if guard.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(&mut guard, Change::ResourceCreated(resource)).await
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<(), EngineError> {
        let resource = Resource { id, name, kind };
        validate_resource(&resource)?;

        let mut guard = self.state.write().await;
        if !guard.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Change::ResourceUpdated(resource)).await
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        if !guard.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Change::ResourceDeleted { id }).await
    }

    // ── Allocations ──────────────────────────────────────────

    pub async fn create_allocation(
        &self,
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        let alloc = Allocation { id, event_id, resource_id };
        let mut guard = self.state.write().await;
        if guard.allocations.len() >= MAX_ALLOCATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many allocations"));
        }
        if guard.allocations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_references(&guard, &alloc)?;
        self.persist_and_apply(&mut guard, Change::AllocationCreated(alloc)).await
    }

    /// Atomically create several allocations. All-or-nothing: if any row fails
    /// validation, none are written.
    pub async fn batch_create_allocations(
        &self,
        allocations: Vec<Allocation>,
    ) -> Result<(), EngineError> {
        if allocations.is_empty() {
            return Ok(());
        }
        if allocations.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut guard = self.state.write().await;
        if guard.allocations.len() + allocations.len() > MAX_ALLOCATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many allocations"));
        }

        // Phase 1: validate everything against current state + intra-batch.
        let mut seen = HashSet::with_capacity(allocations.len());
        for alloc in &allocations {
            if guard.allocations.contains_key(&alloc.id) || !seen.insert(alloc.id) {
                return Err(EngineError::AlreadyExists(alloc.id));
            }
            check_references(&guard, alloc)?;
        }

        // Phase 2: commit as a single WAL record.
        self.persist_and_apply(&mut guard, Change::AllocationsCreated(allocations))
            .await
    }

    /// Point an existing allocation at a different event and/or resource.
    pub async fn update_allocation(
        &self,
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        let alloc = Allocation { id, event_id, resource_id };
        let mut guard = self.state.write().await;
        if !guard.allocations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        check_references(&guard, &alloc)?;
        self.persist_and_apply(&mut guard, Change::AllocationUpdated(alloc)).await
    }

    pub async fn delete_allocation(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        if !guard.allocations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, Change::AllocationDeleted { id }).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold the write lock so no append can slip between snapshot and swap.
        let guard: RwLockWriteGuard<'_, ScheduleState> = self.state.write().await;
        let changes = guard.to_changes();
        debug!("compacting WAL to {} changes", changes.len());

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guard);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
