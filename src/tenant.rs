use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::limits::*;
use crate::maintenance;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// compactor, and its own allocator lock: admissions in one tenant never wait
/// on another. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    clock: Arc<dyn Clock>,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_clock(data_dir, compact_threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(data_dir: PathBuf, compact_threshold: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            clock,
        }
    }

    /// Get or lazily create an engine for the given tenant. Names that
    /// sanitize to the same file name share one engine, since they share one
    /// WAL.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry guard is held across creation so two connections racing on
        // a new tenant cannot open the same WAL twice.
        let entry = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.clock.clone(),
        )?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            maintenance::run_compactor(compactor_engine, threshold).await;
        });

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same catalog ids in both tenants
        let room = Ulid::new();
        let owner = Ulid::new();
        let ws = Ulid::new();
        for eng in [&eng_a, &eng_b] {
            eng.create_room(room, "Lab".into()).await.unwrap();
            eng.create_user(owner, "owner".into()).await.unwrap();
            eng.create_workstation(ws, room, "pc-1".into(), None, None, 0.0, 0.0)
                .await
                .unwrap();
        }

        // Claim the workstation in tenant A only
        eng_a
            .create_workgroup(NewWorkgroup {
                owner_id: owner,
                room_id: Some(room),
                duration_minutes: 30,
                workstations: vec![ws],
                sharing_default: true,
                applications: Vec::new(),
            })
            .await
            .unwrap();

        assert!(!eng_a.is_available(&ws, eng_a.now()).await);
        assert!(eng_b.is_available(&ws, eng_b.now()).await);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_wal_share_an_engine() {
        let dir = test_data_dir("shared_wal");
        let room = Ulid::new();
        let owner = Ulid::new();
        let ws = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let plain = tm.get_or_create("lab").unwrap();
            let dotted = tm.get_or_create("l.ab").unwrap();
            assert!(Arc::ptr_eq(&plain, &dotted));
            assert_eq!(tm.tenant_count(), 1);

            plain.create_room(room, "Lab".into()).await.unwrap();
            plain.create_user(owner, "owner".into()).await.unwrap();
            plain
                .create_workstation(ws, room, "pc-1".into(), None, None, 0.0, 0.0)
                .await
                .unwrap();
            let req = NewWorkgroup {
                owner_id: owner,
                room_id: Some(room),
                duration_minutes: 30,
                workstations: vec![ws],
                sharing_default: true,
                applications: Vec::new(),
            };
            plain.create_workgroup(req.clone()).await.unwrap();
            assert!(matches!(
                dotted.create_workgroup(req).await,
                Err(crate::engine::EngineError::Conflict(_))
            ));
        }

        let tm = TenantManager::new(dir, 1000);
        let eng = tm.get_or_create("lab").unwrap();
        let now = eng.now();
        assert_eq!(eng.claimed_workstations(&[ws], now).await, vec![ws]);
        assert_eq!(eng.store.workgroups_of_workstation(&ws).len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reload() {
        let dir = test_data_dir("reload");
        let room = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let eng = tm.get_or_create("school").unwrap();
            eng.create_room(room, "Library".into()).await.unwrap();
        }
        let tm = TenantManager::new(dir, 1000);
        let eng = tm.get_or_create("school").unwrap();
        assert_eq!(eng.store.room(&room).map(|r| r.name), Some("Library".to_string()));
    }
}
