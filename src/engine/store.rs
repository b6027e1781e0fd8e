use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedWorkgroupState = Arc<RwLock<WorkgroupState>>;

/// Every record the engine knows, keyed by id. Relations are id references
/// resolved through the indexes below; no record owns another.
pub struct InMemoryStore {
    rooms: DashMap<Ulid, Room>,
    users: DashMap<Ulid, User>,
    applications: DashMap<Ulid, Application>,
    application_names: DashMap<String, Ulid>,
    workstations: DashMap<Ulid, Workstation>,
    workgroups: DashMap<Ulid, SharedWorkgroupState>,
    /// Room → workstations located in it.
    room_workstations: DashMap<Ulid, Vec<Ulid>>,
    /// Workstation → every workgroup it has ever joined.
    workstation_workgroups: DashMap<Ulid, Vec<Ulid>>,
    /// Owner → workgroups they created.
    owner_workgroups: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_unique(index: &DashMap<Ulid, Vec<Ulid>>, key: Ulid, value: Ulid) {
    let mut entry = index.entry(key).or_default();
    if !entry.contains(&value) {
        entry.push(value);
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            applications: DashMap::new(),
            application_names: DashMap::new(),
            workstations: DashMap::new(),
            workgroups: DashMap::new(),
            room_workstations: DashMap::new(),
            workstation_workgroups: DashMap::new(),
            owner_workgroups: DashMap::new(),
        }
    }

    // ── Catalog lookup ───────────────────────────────────────

    pub fn room(&self, id: &Ulid) -> Option<Room> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn user_exists(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn application(&self, id: &Ulid) -> Option<Application> {
        self.applications.get(id).map(|e| e.value().clone())
    }

    pub fn application_by_name(&self, name: &str) -> Option<Ulid> {
        self.application_names.get(name).map(|e| *e.value())
    }

    pub fn workstation(&self, id: &Ulid) -> Option<Workstation> {
        self.workstations.get(id).map(|e| e.value().clone())
    }

    pub fn workstation_exists(&self, id: &Ulid) -> bool {
        self.workstations.contains_key(id)
    }

    /// True if any catalog record already uses `id`.
    pub fn catalog_id_taken(&self, id: &Ulid) -> bool {
        self.rooms.contains_key(id)
            || self.users.contains_key(id)
            || self.applications.contains_key(id)
            || self.workstations.contains_key(id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn workstation_count(&self) -> usize {
        self.workstations.len()
    }

    pub fn workstations_in_room(&self, room_id: &Ulid) -> Vec<Workstation> {
        let ids = self
            .room_workstations
            .get(room_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.workstation(id)).collect()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    pub fn applications(&self) -> Vec<Application> {
        self.applications.iter().map(|e| e.value().clone()).collect()
    }

    pub fn workstations(&self) -> Vec<Workstation> {
        self.workstations.iter().map(|e| e.value().clone()).collect()
    }

    // ── Workgroups ───────────────────────────────────────────

    pub fn workgroup(&self, id: &Ulid) -> Option<SharedWorkgroupState> {
        self.workgroups.get(id).map(|e| e.value().clone())
    }

    pub fn workgroup_ids(&self) -> Vec<Ulid> {
        self.workgroups.iter().map(|e| *e.key()).collect()
    }

    pub fn workgroup_count(&self) -> usize {
        self.workgroups.len()
    }

    pub fn workgroups_of_workstation(&self, workstation_id: &Ulid) -> Vec<Ulid> {
        self.workstation_workgroups
            .get(workstation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn workgroups_of_owner(&self, owner_id: &Ulid) -> Vec<Ulid> {
        self.owner_workgroups
            .get(owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a catalog event, or create a workgroup. Membership events need the
    /// workgroup's write guard and go through [`InMemoryStore::apply_to_workgroup`].
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::RoomCreated { id, name } => {
                self.rooms.insert(
                    *id,
                    Room {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::UserCreated { id, username } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        username: username.clone(),
                    },
                );
            }
            Event::ApplicationCreated { id, name } => {
                self.applications.insert(
                    *id,
                    Application {
                        id: *id,
                        name: name.clone(),
                    },
                );
                self.application_names.insert(name.clone(), *id);
            }
            Event::WorkstationCreated {
                id,
                room_id,
                identifier,
                name,
                colour,
                offset_x,
                offset_y,
            } => {
                self.workstations.insert(
                    *id,
                    Workstation {
                        id: *id,
                        identifier: identifier.clone(),
                        room_id: *room_id,
                        name: name.clone(),
                        colour: colour.clone(),
                        offset_x: *offset_x,
                        offset_y: *offset_y,
                        last_seen: None,
                    },
                );
                push_unique(&self.room_workstations, *room_id, *id);
            }
            Event::WorkstationSeen { id, at } => {
                if let Some(mut ws) = self.workstations.get_mut(id) {
                    ws.last_seen = Some(ws.last_seen.map_or(*at, |prev| prev.max(*at)));
                }
            }
            Event::WorkgroupCreated {
                id,
                owner_id,
                room_id,
                started,
                expires,
                applications,
                sharing_default,
                members,
            } => {
                let mut state = WorkgroupState::new(Workgroup {
                    id: *id,
                    owner_id: *owner_id,
                    room_id: *room_id,
                    window: Window::new(*started, *expires),
                    applications: applications.clone(),
                    sharing_default: *sharing_default,
                });
                for (membership_id, workstation_id) in members {
                    state.members.push(Membership {
                        id: *membership_id,
                        workgroup_id: *id,
                        workstation_id: *workstation_id,
                        time_added: *started,
                        time_removed: None,
                        sharing_enabled: *sharing_default,
                    });
                    push_unique(&self.workstation_workgroups, *workstation_id, *id);
                }
                self.workgroups.insert(*id, Arc::new(RwLock::new(state)));
                push_unique(&self.owner_workgroups, *owner_id, *id);
            }
            Event::MemberAdded { .. }
            | Event::MemberRemoved { .. }
            | Event::MemberSharingSet { .. }
            | Event::GroupSharingSet { .. } => {}
        }
    }

    /// Apply a membership event to a workgroup (caller holds the write guard).
    pub fn apply_to_workgroup(&self, state: &mut WorkgroupState, event: &Event) {
        match event {
            Event::MemberAdded {
                id,
                workgroup_id,
                workstation_id,
                at,
                sharing_enabled,
            } => {
                state.members.push(Membership {
                    id: *id,
                    workgroup_id: *workgroup_id,
                    workstation_id: *workstation_id,
                    time_added: *at,
                    time_removed: None,
                    sharing_enabled: *sharing_enabled,
                });
                push_unique(&self.workstation_workgroups, *workstation_id, *workgroup_id);
            }
            Event::MemberRemoved { id, at, .. } => {
                if let Some(m) = state.member_mut(id)
                    && m.time_removed.is_none()
                {
                    m.time_removed = Some(*at);
                }
            }
            Event::MemberSharingSet { id, enabled, .. } => {
                if let Some(m) = state.member_mut(id) {
                    m.sharing_enabled = *enabled;
                }
            }
            Event::GroupSharingSet { enabled, .. } => {
                for m in state.members.iter_mut().filter(|m| m.is_active()) {
                    m.sharing_enabled = *enabled;
                }
            }
            _ => {}
        }
    }
}
