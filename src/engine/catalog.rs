use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity};

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::Invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_optional_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn check_offset(v: f32) -> Result<(), EngineError> {
    if !(0.0..=100.0).contains(&v) {
        return Err(EngineError::Invalid("room offset must be a percentage"));
    }
    Ok(())
}

/// Provisioning of the records the engine only validates against. Rooms,
/// users and applications are existence-only; workstations carry the display
/// metadata shown on room maps.
impl Engine {
    fn check_new_id(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.catalog_id_taken(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Commit a new catalog record. `checks` runs under the catalog lock and
    /// the lock is held through apply, so two creates of one id (or one
    /// application name) cannot both pass.
    async fn insert_catalog(
        &self,
        event: Event,
        checks: impl FnOnce(&Self) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        checks(self)?;
        self.persist_and_insert(&event).await
    }

    pub async fn create_room(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.insert_catalog(Event::RoomCreated { id, name }, |engine| {
            if engine.store.room_count() >= MAX_ROOMS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many rooms"));
            }
            engine.check_new_id(id)
        })
        .await
    }

    pub async fn create_user(&self, id: Ulid, username: String) -> Result<(), EngineError> {
        check_name(&username)?;
        self.insert_catalog(Event::UserCreated { id, username }, |engine| {
            engine.check_new_id(id)
        })
        .await
    }

    pub async fn create_application(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        let event = Event::ApplicationCreated {
            id,
            name: name.clone(),
        };
        self.insert_catalog(event, |engine| {
            engine.check_new_id(id)?;
            if engine.store.application_by_name(&name).is_some() {
                return Err(EngineError::Invalid("application name already registered"));
            }
            Ok(())
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_workstation(
        &self,
        id: Ulid,
        room_id: Ulid,
        identifier: String,
        name: Option<String>,
        colour: Option<String>,
        offset_x: f32,
        offset_y: f32,
    ) -> Result<(), EngineError> {
        check_name(&identifier)?;
        check_optional_name(&name)?;
        check_optional_name(&colour)?;
        check_offset(offset_x)?;
        check_offset(offset_y)?;
        let event = Event::WorkstationCreated {
            id,
            room_id,
            identifier,
            name,
            colour,
            offset_x,
            offset_y,
        };
        self.insert_catalog(event, |engine| {
            if engine.store.workstation_count() >= MAX_WORKSTATIONS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many workstations"));
            }
            if engine.store.room(&room_id).is_none() {
                return Err(EngineError::NotFound(Entity::Room, room_id));
            }
            engine.check_new_id(id)
        })
        .await
    }

    /// Record that a workstation checked in at `at`. Older timestamps than the
    /// current `last_seen` are accepted but leave it unchanged.
    pub async fn record_heartbeat(&self, id: Ulid, at: Ms) -> Result<(), EngineError> {
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&at) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if !self.store.workstation_exists(&id) {
            return Err(EngineError::NotFound(Entity::Workstation, id));
        }
        self.persist_catalog(&Event::WorkstationSeen { id, at }).await
    }
}
