use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open reservation window `[started, expires)`.
///
/// A workgroup is in progress from the instant it starts up to, but not
/// including, the instant it expires. Every predicate in the engine goes
/// through [`Window::phase_at`], so the three phases partition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub started: Ms,
    pub expires: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scheduled,
    InProgress,
    Ended,
}

impl Window {
    pub fn new(started: Ms, expires: Ms) -> Self {
        debug_assert!(started < expires, "Window must expire after it starts");
        Self { started, expires }
    }

    pub fn phase_at(&self, t: Ms) -> Phase {
        if t < self.started {
            Phase::Scheduled
        } else if t < self.expires {
            Phase::InProgress
        } else {
            Phase::Ended
        }
    }

    pub fn in_progress(&self, t: Ms) -> bool {
        self.phase_at(t) == Phase::InProgress
    }

    pub fn has_ended(&self, t: Ms) -> bool {
        self.phase_at(t) == Phase::Ended
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.expires - self.started) / MINUTE_MS
    }
}

// ── Catalog records ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workstation {
    pub id: Ulid,
    /// IT-issued identifier (hostname, asset tag).
    pub identifier: String,
    pub room_id: Ulid,
    pub name: Option<String>,
    pub colour: Option<String>,
    /// Percent offsets from the top-left corner of the room plan.
    pub offset_x: f32,
    pub offset_y: f32,
    pub last_seen: Option<Ms>,
}

// ── Reservation records ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workgroup {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub room_id: Option<Ulid>,
    pub window: Window,
    pub applications: Vec<Ulid>,
    pub sharing_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub id: Ulid,
    pub workgroup_id: Ulid,
    pub workstation_id: Ulid,
    pub time_added: Ms,
    /// `None` while the membership is active.
    pub time_removed: Option<Ms>,
    pub sharing_enabled: bool,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        self.time_removed.is_none()
    }

    /// True when this membership holds its workstation at `t`: still active,
    /// and its workgroup's window is in progress.
    pub fn claims_at(&self, window: &Window, t: Ms) -> bool {
        self.is_active() && window.in_progress(t)
    }
}

/// A workgroup together with every membership it ever had, in insertion order.
#[derive(Debug, Clone)]
pub struct WorkgroupState {
    pub workgroup: Workgroup,
    pub members: Vec<Membership>,
}

impl WorkgroupState {
    pub fn new(workgroup: Workgroup) -> Self {
        Self {
            workgroup,
            members: Vec::new(),
        }
    }

    pub fn window(&self) -> &Window {
        &self.workgroup.window
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Membership> {
        self.members.iter().filter(|m| m.is_active())
    }

    pub fn active_member(&self, workstation_id: &Ulid) -> Option<&Membership> {
        self.active_members()
            .find(|m| m.workstation_id == *workstation_id)
    }

    pub fn member_mut(&mut self, membership_id: &Ulid) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.id == *membership_id)
    }

    /// Active memberships of `workstation_id` that hold it at `t`.
    pub fn claims_of(&self, workstation_id: &Ulid, t: Ms) -> impl Iterator<Item = &Membership> {
        let window = self.workgroup.window;
        self.members
            .iter()
            .filter(move |m| m.workstation_id == *workstation_id && m.claims_at(&window, t))
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
    },
    UserCreated {
        id: Ulid,
        username: String,
    },
    ApplicationCreated {
        id: Ulid,
        name: String,
    },
    WorkstationCreated {
        id: Ulid,
        room_id: Ulid,
        identifier: String,
        name: Option<String>,
        colour: Option<String>,
        offset_x: f32,
        offset_y: f32,
    },
    WorkstationSeen {
        id: Ulid,
        at: Ms,
    },
    /// A workgroup and its initial members, committed as one record.
    /// `members` holds `(membership_id, workstation_id)` pairs added at `started`.
    WorkgroupCreated {
        id: Ulid,
        owner_id: Ulid,
        room_id: Option<Ulid>,
        started: Ms,
        expires: Ms,
        applications: Vec<Ulid>,
        sharing_default: bool,
        members: Vec<(Ulid, Ulid)>,
    },
    MemberAdded {
        id: Ulid,
        workgroup_id: Ulid,
        workstation_id: Ulid,
        at: Ms,
        sharing_enabled: bool,
    },
    MemberRemoved {
        id: Ulid,
        workgroup_id: Ulid,
        at: Ms,
    },
    MemberSharingSet {
        id: Ulid,
        workgroup_id: Ulid,
        enabled: bool,
    },
    /// Applies to every membership of the workgroup that is active when replayed.
    GroupSharingSet {
        workgroup_id: Ulid,
        enabled: bool,
    },
}

impl Event {
    /// Workgroup a reservation event belongs to. Catalog events have none.
    pub fn workgroup_id(&self) -> Option<Ulid> {
        match self {
            Event::WorkgroupCreated { id, .. } => Some(*id),
            Event::MemberAdded { workgroup_id, .. }
            | Event::MemberRemoved { workgroup_id, .. }
            | Event::MemberSharingSet { workgroup_id, .. }
            | Event::GroupSharingSet { workgroup_id, .. } => Some(*workgroup_id),
            Event::RoomCreated { .. }
            | Event::UserCreated { .. }
            | Event::ApplicationCreated { .. }
            | Event::WorkstationCreated { .. }
            | Event::WorkstationSeen { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub id: Ulid,
    pub name: String,
}

/// One row of a room's availability map.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkstationStatus {
    pub id: Ulid,
    pub identifier: String,
    pub name: Option<String>,
    pub colour: Option<String>,
    pub offset_x: f32,
    pub offset_y: f32,
    pub last_seen: Option<Ms>,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub membership_id: Ulid,
    pub workstation_id: Ulid,
    pub name: Option<String>,
    pub colour: Option<String>,
    pub offset_x: f32,
    pub offset_y: f32,
    pub last_seen: Option<Ms>,
    pub time_added: Ms,
    pub sharing_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkgroupSummary {
    pub id: Ulid,
    pub room: Option<NamedRef>,
    pub started: Ms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkgroupDetail {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub started: Ms,
    pub expires: Ms,
    pub duration_minutes: i64,
    pub applications: Vec<NamedRef>,
    pub room: Option<NamedRef>,
    pub members: Vec<MemberInfo>,
}

/// Arguments of a workgroup admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkgroup {
    pub owner_id: Ulid,
    pub room_id: Option<Ulid>,
    pub duration_minutes: i64,
    pub workstations: Vec<Ulid>,
    pub sharing_default: bool,
    pub applications: Vec<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(time_removed: Option<Ms>) -> Membership {
        Membership {
            id: Ulid::new(),
            workgroup_id: Ulid::new(),
            workstation_id: Ulid::new(),
            time_added: 100,
            time_removed,
            sharing_enabled: true,
        }
    }

    #[test]
    fn window_phases_are_half_open() {
        let w = Window::new(100, 200);
        assert_eq!(w.phase_at(99), Phase::Scheduled);
        assert_eq!(w.phase_at(100), Phase::InProgress);
        assert_eq!(w.phase_at(199), Phase::InProgress);
        assert_eq!(w.phase_at(200), Phase::Ended);
        assert!(w.has_ended(201));
    }

    #[test]
    fn window_phases_partition_time() {
        let w = Window::new(1_000, 2_000);
        for t in [0, 999, 1_000, 1_001, 1_999, 2_000, 5_000] {
            let hits = [
                w.phase_at(t) == Phase::Scheduled,
                w.in_progress(t),
                w.has_ended(t),
            ];
            assert_eq!(hits.iter().filter(|h| **h).count(), 1, "t={t}");
        }
    }

    #[test]
    fn window_duration_in_whole_minutes() {
        let w = Window::new(0, 90 * MINUTE_MS);
        assert_eq!(w.duration_minutes(), 90);
    }

    #[test]
    fn removed_membership_never_claims() {
        let w = Window::new(100, 200);
        assert!(membership(None).claims_at(&w, 150));
        assert!(!membership(Some(120)).claims_at(&w, 150));
        assert!(!membership(None).claims_at(&w, 250));
    }

    #[test]
    fn workgroup_state_active_member_lookup() {
        let wg = Workgroup {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            room_id: None,
            window: Window::new(100, 200),
            applications: vec![],
            sharing_default: true,
        };
        let mut state = WorkgroupState::new(wg);
        let ws = Ulid::new();
        let mut old = membership(Some(150));
        old.workstation_id = ws;
        let mut current = membership(None);
        current.workstation_id = ws;
        state.members.push(old);
        state.members.push(current.clone());

        assert_eq!(state.active_member(&ws).map(|m| m.id), Some(current.id));
        assert_eq!(state.claims_of(&ws, 160).count(), 1);
        assert_eq!(state.active_members().count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WorkgroupCreated {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            room_id: None,
            started: 1_000,
            expires: 2_000,
            applications: vec![Ulid::new()],
            sharing_default: false,
            members: vec![(Ulid::new(), Ulid::new())],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
