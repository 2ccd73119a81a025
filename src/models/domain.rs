use crate::models::{Error, Store, TenantId, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    From,
    Display,
    Deref,
    FromStr,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct DomainId(Uuid);

/// A sending domain claimed by a user. At most one verified owner per name;
/// verification itself happens outside the mail-plane.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Domain {
    id: DomainId,
    tenant_id: TenantId,
    user_id: UserId,
    pub name: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_method: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(tenant_id: TenantId, user_id: UserId, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().into(),
            tenant_id,
            user_id,
            name,
            verified: false,
            verified_at: None,
            verification_method: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn verified(mut self, method: &str) -> Self {
        self.verified = true;
        self.verified_at = Some(Utc::now());
        self.verification_method = Some(method.to_string());
        self
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

/// One DKIM keypair per (domain, selector). The private key is confidential:
/// it never appears in logs, errors, or Debug output.
#[derive(Clone, sqlx::FromRow)]
pub struct DkimKeyRecord {
    id: Uuid,
    pub domain_id: DomainId,
    pub selector: String,
    pub algorithm: String,
    pub canonicalization: String,
    pub key_size: i32,
    pub(crate) pkcs8_der: Vec<u8>,
    pub active: bool,
    created_at: DateTime<Utc>,
}

impl Debug for DkimKeyRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimKeyRecord")
            .field("domain_id", &self.domain_id)
            .field("selector", &self.selector)
            .field("algorithm", &self.algorithm)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl DkimKeyRecord {
    pub fn new(domain_id: DomainId, selector: &str, key_size: i32, pkcs8_der: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain_id,
            selector: selector.to_string(),
            algorithm: "rsa-sha256".to_string(),
            canonicalization: "relaxed/relaxed".to_string(),
            key_size,
            pkcs8_der,
            active: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct DomainRepository {
    store: Store,
}

impl DomainRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, domain: &Domain) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO domains (id, tenant_id, user_id, name, verified, verified_at, verification_method, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(domain.id)
                .bind(domain.tenant_id)
                .bind(domain.user_id)
                .bind(&domain.name)
                .bind(domain.verified)
                .bind(domain.verified_at)
                .bind(&domain.verification_method)
                .bind(domain.created_at)
                .bind(domain.updated_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => {
                let mut domains = mem.domains.lock().unwrap();
                if domains.iter().any(|d| d.name == domain.name) {
                    return Err(Error::Conflict);
                }
                domains.push(domain.clone());
            }
        }
        Ok(())
    }

    /// Global lookup by name; domain names are unique across tenants.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let domain = sqlx::query_as::<_, Domain>(
                    r#"
                    SELECT id, tenant_id, user_id, name, verified, verified_at, verification_method, created_at, updated_at
                    FROM domains
                    WHERE name = $1
                    "#,
                )
                .bind(name)
                .fetch_optional(pool)
                .await?;
                Ok(domain)
            }
            Store::Memory(mem) => Ok(mem
                .domains
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.name == name)
                .cloned()),
        }
    }

    /// Tenant-scoped ownership lookup used by the domain validator.
    pub async fn find_owned(
        &self,
        tenant_id: TenantId,
        name: &str,
    ) -> Result<Option<Domain>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let domain = sqlx::query_as::<_, Domain>(
                    r#"
                    SELECT id, tenant_id, user_id, name, verified, verified_at, verification_method, created_at, updated_at
                    FROM domains
                    WHERE tenant_id = $1 AND name = $2
                    "#,
                )
                .bind(tenant_id)
                .bind(name)
                .fetch_optional(pool)
                .await?;
                Ok(domain)
            }
            Store::Memory(mem) => Ok(mem
                .domains
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.tenant_id == tenant_id && d.name == name)
                .cloned()),
        }
    }

    /// Stores a freshly generated key, deactivating any previously active
    /// key for the same (domain, selector).
    pub async fn insert_key(&self, key: &DkimKeyRecord) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "UPDATE dkim_keys SET active = FALSE WHERE domain_id = $1 AND selector = $2 AND active",
                )
                .bind(key.domain_id)
                .bind(&key.selector)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    INSERT INTO dkim_keys (id, domain_id, selector, algorithm, canonicalization, key_size, pkcs8_der, active, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(key.id)
                .bind(key.domain_id)
                .bind(&key.selector)
                .bind(&key.algorithm)
                .bind(&key.canonicalization)
                .bind(key.key_size)
                .bind(&key.pkcs8_der)
                .bind(key.active)
                .bind(key.created_at)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
            }
            Store::Memory(mem) => {
                let mut keys = mem.dkim_keys.lock().unwrap();
                for existing in keys.iter_mut() {
                    if existing.domain_id == key.domain_id && existing.selector == key.selector {
                        existing.active = false;
                    }
                }
                keys.push(key.clone());
            }
        }
        Ok(())
    }

    pub async fn deactivate_keys(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    "UPDATE dkim_keys SET active = FALSE WHERE domain_id = $1 AND selector = $2 AND active",
                )
                .bind(domain_id)
                .bind(selector)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => {
                for key in mem.dkim_keys.lock().unwrap().iter_mut() {
                    if key.domain_id == domain_id && key.selector == selector {
                        key.active = false;
                    }
                }
            }
        }
        Ok(())
    }

    /// The most recently created active key for a domain, across selectors.
    pub async fn active_key(&self, domain_id: DomainId) -> Result<Option<DkimKeyRecord>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let key = sqlx::query_as::<_, DkimKeyRecord>(
                    r#"
                    SELECT id, domain_id, selector, algorithm, canonicalization, key_size, pkcs8_der, active, created_at
                    FROM dkim_keys
                    WHERE domain_id = $1 AND active
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(domain_id)
                .fetch_optional(pool)
                .await?;
                Ok(key)
            }
            Store::Memory(mem) => Ok(mem
                .dkim_keys
                .lock()
                .unwrap()
                .iter()
                .filter(|k| k.domain_id == domain_id && k.active)
                .max_by_key(|k| k.created_at)
                .cloned()),
        }
    }

    pub async fn active_key_by_selector(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<Option<DkimKeyRecord>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let key = sqlx::query_as::<_, DkimKeyRecord>(
                    r#"
                    SELECT id, domain_id, selector, algorithm, canonicalization, key_size, pkcs8_der, active, created_at
                    FROM dkim_keys
                    WHERE domain_id = $1 AND selector = $2 AND active
                    "#,
                )
                .bind(domain_id)
                .bind(selector)
                .fetch_optional(pool)
                .await?;
                Ok(key)
            }
            Store::Memory(mem) => Ok(mem
                .dkim_keys
                .lock()
                .unwrap()
                .iter()
                .find(|k| k.domain_id == domain_id && k.selector == selector && k.active)
                .cloned()),
        }
    }
}
