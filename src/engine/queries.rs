use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Whether `workstation_id` is free at `t`. Reads each joined workgroup
    /// under its own read lock and never touches the allocator, so the answer
    /// may be stale by the time the caller acts on it.
    pub async fn is_available(&self, workstation_id: &Ulid, t: Ms) -> bool {
        let mut pairs = Vec::new();
        for wg in self.store.workgroups_of_workstation(workstation_id) {
            let Some(shared) = self.store.workgroup(&wg) else {
                continue;
            };
            let guard = shared.read().await;
            let window = *guard.window();
            pairs.extend(
                guard
                    .members
                    .iter()
                    .filter(|m| m.workstation_id == *workstation_id)
                    .map(|m| (m.clone(), window)),
            );
        }
        availability::is_available(pairs.iter().map(|(m, w)| (m, w)), t)
    }

    /// Every workstation of a room with its map metadata and availability now.
    pub async fn room_availability(
        &self,
        room_id: &Ulid,
    ) -> Result<Vec<WorkstationStatus>, EngineError> {
        if self.store.room(room_id).is_none() {
            return Err(EngineError::NotFound(Entity::Room, *room_id));
        }
        let now = self.now();
        let mut workstations = self.store.workstations_in_room(room_id);
        workstations.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        let mut out = Vec::with_capacity(workstations.len());
        for ws in workstations {
            let available = self.is_available(&ws.id, now).await;
            out.push(WorkstationStatus {
                id: ws.id,
                identifier: ws.identifier,
                name: ws.name,
                colour: ws.colour,
                offset_x: ws.offset_x,
                offset_y: ws.offset_y,
                last_seen: ws.last_seen,
                available,
            });
        }
        Ok(out)
    }

    /// Active members of a workgroup, oldest first.
    pub async fn get_members(&self, workgroup_id: &Ulid) -> Result<Vec<MemberInfo>, EngineError> {
        let shared = self.require_workgroup(workgroup_id)?;
        let guard = shared.read().await;
        Ok(self.member_infos(&guard))
    }

    /// The user's ended workgroups, most recently started first.
    pub async fn list_past_workgroups(
        &self,
        user_id: &Ulid,
        count: Option<usize>,
    ) -> Result<Vec<WorkgroupSummary>, EngineError> {
        let count = count.unwrap_or(DEFAULT_HISTORY_COUNT);
        if count > MAX_HISTORY_COUNT {
            return Err(EngineError::LimitExceeded("history count too large"));
        }
        if !self.store.user_exists(user_id) {
            return Err(EngineError::NotFound(Entity::User, *user_id));
        }

        let now = self.now();
        let mut past = Vec::new();
        for wg in self.store.workgroups_of_owner(user_id) {
            let Some(shared) = self.store.workgroup(&wg) else {
                continue;
            };
            let guard = shared.read().await;
            let workgroup = &guard.workgroup;
            if workgroup.window.has_ended(now) {
                past.push(WorkgroupSummary {
                    id: workgroup.id,
                    room: self.room_ref(workgroup.room_id),
                    started: workgroup.window.started,
                });
            }
        }
        // Ulids break ties between workgroups started in the same millisecond.
        past.sort_by(|a, b| b.started.cmp(&a.started).then(b.id.cmp(&a.id)));
        past.truncate(count);
        Ok(past)
    }

    /// Full view of one workgroup for its owner. An unknown id and a
    /// workgroup owned by someone else are indistinguishable to the caller.
    pub async fn get_workgroup(
        &self,
        user_id: &Ulid,
        workgroup_id: &Ulid,
    ) -> Result<WorkgroupDetail, EngineError> {
        let shared = self
            .store
            .workgroup(workgroup_id)
            .ok_or(EngineError::Unauthorized(*workgroup_id))?;
        let guard = shared.read().await;
        let workgroup = &guard.workgroup;
        if workgroup.owner_id != *user_id {
            return Err(EngineError::Unauthorized(*workgroup_id));
        }

        let applications = workgroup
            .applications
            .iter()
            .filter_map(|id| self.store.application(id))
            .map(|app| NamedRef {
                id: app.id,
                name: app.name,
            })
            .collect();

        Ok(WorkgroupDetail {
            id: workgroup.id,
            owner_id: workgroup.owner_id,
            started: workgroup.window.started,
            expires: workgroup.window.expires,
            duration_minutes: workgroup.window.duration_minutes(),
            applications,
            room: self.room_ref(workgroup.room_id),
            members: self.member_infos(&guard),
        })
    }

    fn room_ref(&self, room_id: Option<Ulid>) -> Option<NamedRef> {
        let room = self.store.room(&room_id?)?;
        Some(NamedRef {
            id: room.id,
            name: room.name,
        })
    }

    fn member_infos(&self, state: &WorkgroupState) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = state
            .active_members()
            .filter_map(|m| {
                let ws = self.store.workstation(&m.workstation_id)?;
                Some(MemberInfo {
                    membership_id: m.id,
                    workstation_id: ws.id,
                    name: ws.name,
                    colour: ws.colour,
                    offset_x: ws.offset_x,
                    offset_y: ws.offset_y,
                    last_seen: ws.last_seen,
                    time_added: m.time_added,
                    sharing_enabled: m.sharing_enabled,
                })
            })
            .collect();
        members.sort_by(|a, b| {
            a.time_added
                .cmp(&b.time_added)
                .then(a.workstation_id.cmp(&b.workstation_id))
        });
        members
    }
}
