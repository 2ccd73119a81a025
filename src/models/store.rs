use crate::models::{
    AuthAttempt, DeliveryAttempt, DkimKeyRecord, Domain, EmailRecord, QueueFailure, SecurityEvent,
    User,
};
use sqlx::PgPool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Handle to the durable store. Repositories dispatch over this so a
/// single-node deployment (and the test-suite) can run without Postgres.
#[derive(Clone)]
pub enum Store {
    Postgres(PgPool),
    Memory(Arc<MemoryStore>),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(Arc::new(MemoryStore::default()))
    }

    pub fn postgres(pool: PgPool) -> Self {
        Store::Postgres(pool)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Store::Postgres(_) => write!(f, "Store::Postgres"),
            Store::Memory(_) => write!(f, "Store::Memory"),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub(crate) users: Mutex<Vec<User>>,
    pub(crate) domains: Mutex<Vec<Domain>>,
    pub(crate) dkim_keys: Mutex<Vec<DkimKeyRecord>>,
    pub(crate) emails: Mutex<HashMap<String, EmailRecord>>,
    pub(crate) security_events: Mutex<Vec<SecurityEvent>>,
    pub(crate) auth_attempts: Mutex<Vec<AuthAttempt>>,
    pub(crate) delivery_attempts: Mutex<Vec<DeliveryAttempt>>,
    pub(crate) queue_failures: Mutex<Vec<QueueFailure>>,
}
