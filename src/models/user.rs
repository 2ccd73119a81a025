use crate::models::{Error, Store};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
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
pub struct UserId(Uuid);

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
pub struct TenantId(Uuid);

/// A tenant-owner identity. The mail-plane only reads this during SMTP AUTH;
/// account lifecycle is managed elsewhere.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    id: UserId,
    tenant_id: TenantId,
    pub email: String,
    password_hash: String,
    pub verified: bool,
    pub active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(tenant_id: TenantId, email: String, password: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().into(),
            tenant_id,
            email,
            password_hash: password_auth::generate_hash(password.as_bytes()),
            verified: true,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn verify_password(&self, password: &str) -> bool {
        password_auth::verify_password(password.as_bytes(), &self.password_hash).is_ok()
    }
}

#[derive(Clone)]
pub struct UserRepository {
    store: Store,
}

impl UserRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, user: &User) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, tenant_id, email, password_hash, verified, active, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(user.id)
                .bind(user.tenant_id)
                .bind(&user.email)
                .bind(&user.password_hash)
                .bind(user.verified)
                .bind(user.active)
                .bind(user.created_at)
                .bind(user.updated_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => {
                let mut users = mem.users.lock().unwrap();
                if users.iter().any(|u| u.email == user.email) {
                    return Err(Error::Conflict);
                }
                users.push(user.clone());
            }
        }
        Ok(())
    }

    /// Lookup for SMTP AUTH. Disabled accounts are filtered here so the
    /// session layer treats them exactly like unknown users.
    pub async fn find_active_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let user = sqlx::query_as::<_, User>(
                    r#"
                    SELECT id, tenant_id, email, password_hash, verified, active, created_at, updated_at
                    FROM users
                    WHERE email = $1 AND active
                    "#,
                )
                .bind(email)
                .fetch_optional(pool)
                .await?;
                Ok(user)
            }
            Store::Memory(mem) => Ok(mem
                .users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.email == email && u.active)
                .cloned()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Store;

    #[tokio::test]
    async fn password_verification() {
        let user = User::new(Uuid::new_v4().into(), "alice@verified.tld".into(), "s3cret");

        assert!(user.verify_password("s3cret"));
        assert!(!user.verify_password("guess"));
    }

    #[tokio::test]
    async fn inactive_users_are_invisible_to_auth() {
        let store = Store::memory();
        let repository = UserRepository::new(store);

        let mut user = User::new(Uuid::new_v4().into(), "bob@verified.tld".into(), "pw");
        user.active = false;
        repository.create(&user).await.unwrap();

        assert!(
            repository
                .find_active_by_email("bob@verified.tld")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let repository = UserRepository::new(Store::memory());
        let tenant = TenantId::from(Uuid::new_v4());

        let user = User::new(tenant, "carol@verified.tld".into(), "pw");
        repository.create(&user).await.unwrap();

        let duplicate = User::new(tenant, "carol@verified.tld".into(), "pw2");
        assert!(matches!(
            repository.create(&duplicate).await,
            Err(Error::Conflict)
        ));
    }
}
