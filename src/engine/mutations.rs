use std::time::Instant;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{ADMISSIONS_TOTAL, ALLOCATOR_WAIT_SECONDS};

use super::conflict::validate_duration;
use super::{Engine, EngineError, Entity, WalCommand};

fn record_admission(op: &'static str, result: &Result<impl Sized, EngineError>) {
    let outcome = match result {
        Ok(_) => "admitted",
        Err(e) => e.kind(),
    };
    metrics::counter!(ADMISSIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Admit a new workgroup with its initial workstations.
    ///
    /// References are validated before the allocator lock is taken. Under the
    /// lock the requested workstations are checked against every in-progress
    /// claim at `now`, and the workgroup plus all memberships are committed as
    /// one WAL record. On conflict nothing is written.
    pub async fn create_workgroup(&self, req: NewWorkgroup) -> Result<Ulid, EngineError> {
        let result = self.admit_workgroup(req).await;
        record_admission("create_workgroup", &result);
        result
    }

    async fn admit_workgroup(&self, req: NewWorkgroup) -> Result<Ulid, EngineError> {
        let (workstations, applications) = self.validate_new_workgroup(&req)?;
        let duration = validate_duration(req.duration_minutes)?;

        let _gate = self.commit_gate.read().await;
        let wait = Instant::now();
        let _allocator = self.allocator.lock().await;
        metrics::histogram!(ALLOCATOR_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());

        let now = self.now();
        let conflicts = self.claimed_workstations(&workstations, now).await;
        if !conflicts.is_empty() {
            tracing::debug!(
                "workgroup for {} rejected, {} workstation(s) claimed",
                req.owner_id,
                conflicts.len()
            );
            return Err(EngineError::Conflict(conflicts));
        }

        let id = Ulid::new();
        let event = Event::WorkgroupCreated {
            id,
            owner_id: req.owner_id,
            room_id: req.room_id,
            started: now,
            expires: now + duration,
            applications,
            sharing_default: req.sharing_default,
            members: workstations.iter().map(|ws| (Ulid::new(), *ws)).collect(),
        };
        self.persist_and_insert(&event).await?;
        tracing::info!(
            "workgroup {id} created by {} with {} workstation(s) for {} min",
            req.owner_id,
            workstations.len(),
            req.duration_minutes
        );
        Ok(id)
    }

    /// Admit one more workstation into an in-progress workgroup.
    pub async fn add_workstation(
        &self,
        workgroup_id: Ulid,
        workstation_id: Ulid,
    ) -> Result<(), EngineError> {
        let result = self.admit_workstation(workgroup_id, workstation_id).await;
        record_admission("add_workstation", &result);
        result
    }

    async fn admit_workstation(
        &self,
        workgroup_id: Ulid,
        workstation_id: Ulid,
    ) -> Result<(), EngineError> {
        let shared = self.require_workgroup(&workgroup_id)?;
        if !self.store.workstation_exists(&workstation_id) {
            return Err(EngineError::NotFound(Entity::Workstation, workstation_id));
        }
        // A window never changes once created, so this check needs no lock.
        if !shared.read().await.window().in_progress(self.now()) {
            return Err(EngineError::InvalidState(workgroup_id));
        }

        let _gate = self.commit_gate.read().await;
        let wait = Instant::now();
        let _allocator = self.allocator.lock().await;
        metrics::histogram!(ALLOCATOR_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());

        let now = self.now();
        if self.workstation_claimed(&workstation_id, now).await {
            return Err(EngineError::WorkstationUnavailable(workstation_id));
        }

        let mut guard = shared.write().await;
        // The lock wait may have outlasted the window.
        if !guard.window().in_progress(now) {
            return Err(EngineError::InvalidState(workgroup_id));
        }
        let event = Event::MemberAdded {
            id: Ulid::new(),
            workgroup_id,
            workstation_id,
            at: now,
            sharing_enabled: true,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("workstation {workstation_id} joined workgroup {workgroup_id}");
        Ok(())
    }

    /// End a workstation's membership. Only narrows claims, so it never needs
    /// the allocator lock.
    pub async fn remove_workstation(
        &self,
        workgroup_id: Ulid,
        workstation_id: Ulid,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.require_workgroup(&workgroup_id)?;
        let mut guard = shared.write().await;
        let now = self.now();

        let membership_id = guard
            .window()
            .in_progress(now)
            .then(|| guard.active_member(&workstation_id).map(|m| m.id))
            .flatten()
            .ok_or(EngineError::NotFound(Entity::Membership, workstation_id))?;

        let event = Event::MemberRemoved {
            id: membership_id,
            workgroup_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("workstation {workstation_id} left workgroup {workgroup_id}");
        Ok(())
    }

    pub async fn set_member_sharing(
        &self,
        workgroup_id: Ulid,
        workstation_id: Ulid,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.require_workgroup(&workgroup_id)?;
        let mut guard = shared.write().await;
        if !guard.window().in_progress(self.now()) {
            return Err(EngineError::InvalidState(workgroup_id));
        }
        let membership_id = guard
            .active_member(&workstation_id)
            .map(|m| m.id)
            .ok_or(EngineError::NotFound(Entity::Membership, workstation_id))?;

        let event = Event::MemberSharingSet {
            id: membership_id,
            workgroup_id,
            enabled,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Set the sharing flag of every active member in one record. Returns the
    /// number of members updated; an empty workgroup is left untouched.
    pub async fn set_group_sharing(
        &self,
        workgroup_id: Ulid,
        enabled: bool,
    ) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.require_workgroup(&workgroup_id)?;
        let mut guard = shared.write().await;
        if !guard.window().in_progress(self.now()) {
            return Err(EngineError::InvalidState(workgroup_id));
        }
        let count = guard.active_members().count();
        if count == 0 {
            return Ok(0);
        }
        let event = Event::GroupSharingSet {
            workgroup_id,
            enabled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(count)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    ///
    /// Every writer holds the commit gate for reading across its WAL append and
    /// apply, so with the gate held for writing no event can land between the
    /// snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for room in self.store.rooms() {
            events.push(Event::RoomCreated {
                id: room.id,
                name: room.name,
            });
        }
        for user in self.store.users() {
            events.push(Event::UserCreated {
                id: user.id,
                username: user.username,
            });
        }
        for app in self.store.applications() {
            events.push(Event::ApplicationCreated {
                id: app.id,
                name: app.name,
            });
        }
        for ws in self.store.workstations() {
            events.push(Event::WorkstationCreated {
                id: ws.id,
                room_id: ws.room_id,
                identifier: ws.identifier,
                name: ws.name,
                colour: ws.colour,
                offset_x: ws.offset_x,
                offset_y: ws.offset_y,
            });
            if let Some(at) = ws.last_seen {
                events.push(Event::WorkstationSeen { id: ws.id, at });
            }
        }

        for wg_id in self.store.workgroup_ids() {
            let Some(shared) = self.store.workgroup(&wg_id) else {
                continue;
            };
            let guard = shared.read().await;
            let wg = &guard.workgroup;
            events.push(Event::WorkgroupCreated {
                id: wg.id,
                owner_id: wg.owner_id,
                room_id: wg.room_id,
                started: wg.window.started,
                expires: wg.window.expires,
                applications: wg.applications.clone(),
                sharing_default: wg.sharing_default,
                members: Vec::new(),
            });
            for m in &guard.members {
                events.push(Event::MemberAdded {
                    id: m.id,
                    workgroup_id: wg.id,
                    workstation_id: m.workstation_id,
                    at: m.time_added,
                    sharing_enabled: m.sharing_enabled,
                });
                if let Some(at) = m.time_removed {
                    events.push(Event::MemberRemoved {
                        id: m.id,
                        workgroup_id: wg.id,
                        at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
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
