use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity};

/// Application attached to a workgroup created without an explicit list.
pub(crate) const DEFAULT_APPLICATION_NAME: &str = "FileSharer";

/// Collapse duplicate ids, keeping first-seen order.
pub(crate) fn dedup_ids(ids: &[Ulid]) -> Vec<Ulid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub(crate) fn validate_duration(minutes: i64) -> Result<Ms, EngineError> {
    if minutes <= 0 {
        return Err(EngineError::Invalid("duration must be positive"));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(minutes * MINUTE_MS)
}

impl Engine {
    /// Resolve every reference of an admission request against the catalog.
    /// Returns the deduplicated workstation and application lists.
    pub(super) fn validate_new_workgroup(
        &self,
        req: &NewWorkgroup,
    ) -> Result<(Vec<Ulid>, Vec<Ulid>), EngineError> {
        if let Some(room_id) = req.room_id
            && self.store.room(&room_id).is_none()
        {
            return Err(EngineError::NotFound(Entity::Room, room_id));
        }
        if !self.store.user_exists(&req.owner_id) {
            return Err(EngineError::NotFound(Entity::User, req.owner_id));
        }
        validate_duration(req.duration_minutes)?;

        let workstations = dedup_ids(&req.workstations);
        if workstations.len() > MAX_WORKSTATIONS_PER_WORKGROUP {
            return Err(EngineError::LimitExceeded("too many workstations in workgroup"));
        }
        if let Some(missing) = workstations
            .iter()
            .find(|id| !self.store.workstation_exists(id))
        {
            return Err(EngineError::NotFound(Entity::Workstation, *missing));
        }

        let mut applications = dedup_ids(&req.applications);
        if applications.len() > MAX_APPLICATIONS_PER_WORKGROUP {
            return Err(EngineError::LimitExceeded("too many applications in workgroup"));
        }
        if let Some(missing) = applications
            .iter()
            .find(|id| self.store.application(id).is_none())
        {
            return Err(EngineError::NotFound(Entity::Application, *missing));
        }
        if applications.is_empty()
            && let Some(default_app) = self.store.application_by_name(DEFAULT_APPLICATION_NAME)
        {
            applications.push(default_app);
        }

        Ok((workstations, applications))
    }

    /// Workstations among `ids` held at `t` by an active membership of an
    /// in-progress workgroup. Sorted, no duplicates.
    ///
    /// Admission calls this while holding the allocator lock.
    pub async fn claimed_workstations(&self, ids: &[Ulid], t: Ms) -> Vec<Ulid> {
        let mut claimed = Vec::new();
        for ws in ids {
            if self.workstation_claimed(ws, t).await {
                claimed.push(*ws);
            }
        }
        claimed.sort();
        claimed.dedup();
        claimed
    }

    pub(super) async fn workstation_claimed(&self, workstation_id: &Ulid, t: Ms) -> bool {
        for wg in self.store.workgroups_of_workstation(workstation_id) {
            let Some(shared) = self.store.workgroup(&wg) else {
                continue;
            };
            let guard = shared.read().await;
            if guard.claims_of(workstation_id, t).next().is_some() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let a = Ulid::new();
        let b = Ulid::new();
        assert_eq!(dedup_ids(&[b, a, b, a]), vec![b, a]);
    }

    #[test]
    fn duration_bounds() {
        assert_eq!(validate_duration(30), Ok(30 * MINUTE_MS));
        assert_eq!(
            validate_duration(0),
            Err(EngineError::Invalid("duration must be positive"))
        );
        assert!(validate_duration(-5).is_err());
        assert_eq!(
            validate_duration(MAX_DURATION_MINUTES + 1),
            Err(EngineError::LimitExceeded("duration too long"))
        );
    }
}
