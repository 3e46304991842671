use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::{CalendarKind, Config};
use crate::engine::{Engine, Services};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::ratelimit::{InMemoryWindowStore, RateLimiter};
use crate::reaper;
use crate::token::TokenSigner;

/// One tenant's engine and the hub its notices go out on.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub notify: Arc<NotifyHub>,
    reaper: JoinHandle<()>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + reaper.
/// Tenant = database name from the pgwire connection.
///
/// The token signer, clock and rate limiter are shared by every tenant; the
/// calendar provider and notify hub are per tenant.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    calendar: CalendarKind,
    calendar_timeout: Duration,
    signer: Arc<TokenSigner>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TenantManager {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(InMemoryWindowStore::new()),
            config.rate_policies,
            clock.clone(),
        ));
        let purge = tokio::spawn(reaper::run_limiter_purge(limiter.clone()));
        Self {
            tenants: DashMap::new(),
            data_dir: config.data_dir.clone(),
            compact_threshold: config.compact_threshold,
            calendar: config.calendar,
            calendar_timeout: config.calendar_timeout,
            signer: Arc::new(TokenSigner::new(&config.token_secret, config.token_ttl_ms)),
            clock,
            limiter,
            background: Mutex::new(vec![purge]),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Get or lazily create the given tenant. Concurrent first connections to
    /// the same tenant open its WAL once.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let created = match self.tenants.entry(tenant.to_string()) {
            Entry::Occupied(o) => return Ok(o.get().clone()),
            Entry::Vacant(v) => {
                let t = Arc::new(self.open(&safe_name)?);
                v.insert(t.clone());
                t
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        info!(tenant, "tenant loaded");
        Ok(created)
    }

    fn open(&self, safe_name: &str) -> std::io::Result<Tenant> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let services = Services {
            calendar: self.calendar.build(),
            dispatcher: notify.clone(),
            signer: self.signer.clone(),
            clock: self.clock.clone(),
            calendar_timeout: self.calendar_timeout,
        };
        let engine = Arc::new(Engine::new(wal_path, services)?);
        let reaper = tokio::spawn(reaper::run_reaper(
            engine.clone(),
            notify.clone(),
            self.compact_threshold,
        ));
        Ok(Tenant {
            engine,
            notify,
            reaper,
        })
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Stop every background task and unload all tenants.
    pub fn shutdown(&self) {
        for t in self.tenants.iter() {
            t.reaper.abort();
        }
        self.tenants.clear();
        if let Ok(mut tasks) = self.background.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(0.0);
        info!("tenant manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{AvailabilityRequest, NewBooking};
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    /// 2025-06-02 (Monday) 09:00 UTC.
    const MON_9AM_UTC: Ms = 1_748_854_800_000;

    fn test_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Config {
            data_dir: dir,
            token_secret: b"tenant-tests-secret".to_vec(),
            ..Config::default()
        }
    }

    fn manager(name: &str) -> TenantManager {
        TenantManager::new(&test_config(name), Arc::new(ManualClock::new(MON_9AM_UTC - 86_400_000)))
    }

    fn profile(host_id: Ulid) -> SchedulingProfile {
        SchedulingProfile {
            host_id,
            timezone: "UTC".into(),
            working_hours: WorkingHours::from_json(r#"{"mon": ["09:00-12:00"]}"#).unwrap(),
            slot_minutes: 60,
            buffer_minutes: 0,
            min_notice_minutes: 0,
            calendars: vec!["main".into()],
            reminders: Vec::new(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager("isolation");
        let a = tm.get_or_create("tenant_a").unwrap();
        let b = tm.get_or_create("tenant_b").unwrap();

        let host = Ulid::new();
        a.engine.upsert_profile(profile(host)).await.unwrap();
        b.engine.upsert_profile(profile(host)).await.unwrap();

        a.engine
            .create_booking(NewBooking {
                host_id: host,
                event_type: None,
                span: Span::new(MON_9AM_UTC, MON_9AM_UTC + 3_600_000),
                guest: Guest {
                    name: "Ada".into(),
                    email: "ada@example.com".into(),
                    phone: None,
                },
                timezone: None,
                source: BookingSource::Direct,
            })
            .await
            .unwrap();

        let req = AvailabilityRequest {
            host_id: host,
            date: "2025-06-02".into(),
            ..Default::default()
        };
        // Same host id, separate calendars and ledgers
        assert_eq!(a.engine.compute_availability(&req).await.unwrap().slots.len(), 2);
        assert_eq!(b.engine.compute_availability(&req).await.unwrap().slots.len(), 3);
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let cfg = test_config("lazy");
        let tm = TenantManager::new(&cfg, Arc::new(ManualClock::new(0)));

        let entries: Vec<_> = fs::read_dir(&cfg.data_dir).unwrap().collect();
        assert!(entries.is_empty());

        let _t = tm.get_or_create("my_db").unwrap();
        assert!(cfg.data_dir.join("my_db.wal").exists());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager("same_eng");
        let t1 = tm.get_or_create("foo").unwrap();
        let t2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&t1.engine, &t2.engine));
        assert!(Arc::ptr_eq(&t1.notify, &t2.notify));
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let cfg = test_config("sanitize");
        let tm = TenantManager::new(&cfg, Arc::new(ManualClock::new(0)));

        let _t = tm.get_or_create("../evil").unwrap();
        assert!(cfg.data_dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager("name_too_long");
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
        tm.shutdown();
    }

    #[tokio::test]
    async fn shutdown_unloads_tenants() {
        let tm = manager("shutdown");
        tm.get_or_create("one").unwrap();
        tm.get_or_create("two").unwrap();
        assert_eq!(tm.tenant_count(), 2);
        tm.shutdown();
        assert_eq!(tm.tenant_count(), 0);
    }
}
