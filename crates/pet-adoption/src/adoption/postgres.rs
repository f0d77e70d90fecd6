//! PostgreSQL backend.
//!
//! Every statement is parameterized. Partial animal updates are assembled with `QueryBuilder`
//! from the allow-listed [`AnimalPatch`] fields only.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use super::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalPatch, AnimalStatus,
    ApplicantDetails, NewAdoptionRequest, NewAnimal, OrganizationId, Photo, PhotoId, RequestId,
    Scope,
};
use super::repository::{AdoptionLedger, AnimalStore, StoreError, Transition};
use crate::config::StorageConfig;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS animals (
        id BIGSERIAL PRIMARY KEY,
        organization_fk BIGINT,
        type TEXT NOT NULL CHECK (type IN ('Cat', 'Dog')),
        name TEXT,
        description TEXT,
        age TEXT,
        gender TEXT,
        size TEXT,
        primary_color TEXT,
        secondary_color TEXT,
        tertiary_color TEXT,
        breed TEXT,
        spayed_neutered BOOLEAN NOT NULL DEFAULT FALSE,
        shots_current BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL DEFAULT 'adoptable' CHECK (status IN ('adoptable', 'unavailable')),
        status_changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        published_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS photos (
        id BIGSERIAL PRIMARY KEY,
        animal_id BIGINT NOT NULL REFERENCES animals (id),
        url TEXT NOT NULL,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS adoption_requests (
        id BIGSERIAL PRIMARY KEY,
        pet_id BIGINT NOT NULL REFERENCES animals (id),
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT NOT NULL DEFAULT '',
        address TEXT NOT NULL DEFAULT '',
        experience TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'approved', 'denied')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS photos_animal_idx ON photos (animal_id)",
    "CREATE INDEX IF NOT EXISTS adoption_requests_pet_idx
        ON adoption_requests (pet_id, created_at DESC)",
    "CREATE UNIQUE INDEX IF NOT EXISTS adoption_requests_single_approved
        ON adoption_requests (pet_id) WHERE status = 'approved'",
];

const ANIMAL_COLUMNS: &str = "id, organization_fk, type, name, description, age, gender, size, \
     primary_color, secondary_color, tertiary_color, breed, spayed_neutered, shots_current, \
     status, status_changed_at, published_at";

const REQUEST_COLUMNS: &str =
    "id, pet_id, name, email, phone, address, experience, message, status, created_at";

/// Connection pool handle shared by every request task.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and makes sure the tables exist.
    pub async fn connect(url: &str, config: &StorageConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!(max_connections = config.max_connections, "postgres store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn push_scope(builder: &mut QueryBuilder<'_, Postgres>, scope: Scope) {
    if let Scope::Organization(organization) = scope {
        builder
            .push(" AND (organization_fk IS NULL OR organization_fk = ")
            .push_bind(organization.0)
            .push(")");
    }
}

fn animal_from_row(row: &PgRow) -> Result<Animal, StoreError> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    let organization: Option<i64> = row.try_get("organization_fk")?;
    Ok(Animal {
        id: AnimalId(row.try_get("id")?),
        organization_id: organization.map(OrganizationId),
        kind: kind
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        age: row.try_get("age")?,
        gender: row.try_get("gender")?,
        size: row.try_get("size")?,
        primary_color: row.try_get("primary_color")?,
        secondary_color: row.try_get("secondary_color")?,
        tertiary_color: row.try_get("tertiary_color")?,
        breed: row.try_get("breed")?,
        spayed_neutered: row.try_get("spayed_neutered")?,
        shots_current: row.try_get("shots_current")?,
        status: status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        status_changed_at: row.try_get("status_changed_at")?,
        published_at: row.try_get("published_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<AdoptionRequest, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(AdoptionRequest {
        id: RequestId(row.try_get("id")?),
        animal_id: AnimalId(row.try_get("pet_id")?),
        applicant: ApplicantDetails {
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            address: row.try_get("address")?,
            experience: row.try_get("experience")?,
            message: row.try_get("message")?,
        },
        status: status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn photo_from_row(row: &PgRow) -> Result<Photo, StoreError> {
    Ok(Photo {
        id: PhotoId(row.try_get("id")?),
        animal_id: AnimalId(row.try_get("animal_id")?),
        url: row.try_get("url")?,
        is_primary: row.try_get("is_primary")?,
    })
}

#[async_trait]
impl AnimalStore for PostgresStore {
    async fn get_animal(&self, id: AnimalId) -> Result<Option<Animal>, StoreError> {
        let sql = format!("SELECT {ANIMAL_COLUMNS} FROM animals WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(animal_from_row).transpose()
    }

    async fn list_animals(&self, scope: Scope) -> Result<Vec<Animal>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ANIMAL_COLUMNS} FROM animals WHERE TRUE"
        ));
        push_scope(&mut builder, scope);
        builder.push(" ORDER BY id");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(animal_from_row).collect()
    }

    async fn create_animal(&self, animal: NewAnimal) -> Result<Animal, StoreError> {
        let mut tx = self.pool.begin().await?;
        let explicit_id = animal.id.is_some();
        let status = animal.status.unwrap_or(AnimalStatus::Adoptable);

        let sql = format!(
            "INSERT INTO animals (id, organization_fk, type, name, description, age, gender, size,
                 primary_color, secondary_color, tertiary_color, breed, spayed_neutered,
                 shots_current, status, status_changed_at, published_at)
             VALUES (COALESCE($1, nextval(pg_get_serial_sequence('animals', 'id'))),
                 $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), NOW())
             RETURNING {ANIMAL_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(animal.id.map(|id| id.0))
            .bind(animal.organization_id.map(|id| id.0))
            .bind(animal.kind.label())
            .bind(animal.name)
            .bind(animal.description)
            .bind(animal.age)
            .bind(animal.gender)
            .bind(animal.size)
            .bind(animal.primary_color)
            .bind(animal.secondary_color)
            .bind(animal.tertiary_color)
            .bind(animal.breed)
            .bind(animal.spayed_neutered)
            .bind(animal.shots_current)
            .bind(status.label())
            .fetch_one(&mut *tx)
            .await?;

        if explicit_id {
            sqlx::query(
                "SELECT setval(pg_get_serial_sequence('animals', 'id'),
                     GREATEST((SELECT MAX(id) FROM animals), 1))",
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        animal_from_row(&row)
    }

    async fn update_fields(
        &self,
        id: AnimalId,
        patch: AnimalPatch,
        scope: Scope,
    ) -> Result<Option<Animal>, StoreError> {
        if patch.is_empty() {
            return Ok(self
                .get_animal(id)
                .await?
                .filter(|animal| scope.permits(animal)));
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE animals SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(kind) = patch.kind {
                set.push("type = ").push_bind_unseparated(kind.label());
            }
            let text_fields = [
                ("name", patch.name),
                ("description", patch.description),
                ("age", patch.age),
                ("gender", patch.gender),
                ("size", patch.size),
                ("primary_color", patch.primary_color),
                ("secondary_color", patch.secondary_color),
                ("tertiary_color", patch.tertiary_color),
                ("breed", patch.breed),
            ];
            for (column, value) in text_fields {
                if let Some(value) = value {
                    set.push(format!("{column} = ")).push_bind_unseparated(value);
                }
            }
            if let Some(value) = patch.spayed_neutered {
                set.push("spayed_neutered = ").push_bind_unseparated(value);
            }
            if let Some(value) = patch.shots_current {
                set.push("shots_current = ").push_bind_unseparated(value);
            }
            if let Some(status) = patch.status {
                set.push("status = ").push_bind_unseparated(status.label());
                set.push("status_changed_at = GREATEST(NOW(), status_changed_at)");
            }
        }
        builder.push(" WHERE id = ").push_bind(id.0);
        push_scope(&mut builder, scope);
        builder.push(format!(" RETURNING {ANIMAL_COLUMNS}"));

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(animal_from_row).transpose()
    }

    async fn remove_animal(&self, id: AnimalId, scope: Scope) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut lookup = QueryBuilder::<Postgres>::new("SELECT id FROM animals WHERE id = ");
        lookup.push_bind(id.0);
        push_scope(&mut lookup, scope);
        lookup.push(" FOR UPDATE");
        if lookup.build().fetch_optional(&mut *tx).await?.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM photos WHERE animal_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM adoption_requests WHERE pet_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM animals WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn attach_photo(
        &self,
        id: AnimalId,
        url: String,
        scope: Scope,
    ) -> Result<Option<Photo>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut lookup = QueryBuilder::<Postgres>::new("SELECT id FROM animals WHERE id = ");
        lookup.push_bind(id.0);
        push_scope(&mut lookup, scope);
        lookup.push(" FOR UPDATE");
        if lookup.build().fetch_optional(&mut *tx).await?.is_none() {
            return Ok(None);
        }

        let row = sqlx::query(
            "INSERT INTO photos (animal_id, url, is_primary)
             VALUES ($1, $2, NOT EXISTS (SELECT 1 FROM photos WHERE animal_id = $1))
             RETURNING id, animal_id, url, is_primary",
        )
        .bind(id.0)
        .bind(url)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        photo_from_row(&row).map(Some)
    }

    async fn photos(&self, id: AnimalId) -> Result<Vec<Photo>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, animal_id, url, is_primary FROM photos WHERE animal_id = $1 ORDER BY id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(photo_from_row).collect()
    }
}

#[async_trait]
impl AdoptionLedger for PostgresStore {
    async fn create_request(&self, request: NewAdoptionRequest) -> Result<AdoptionRequest, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Share-lock the animal so a concurrent delete cannot orphan the new row.
        let exists = sqlx::query("SELECT id FROM animals WHERE id = $1 FOR SHARE")
            .bind(request.animal_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::UnknownAnimal(request.animal_id));
        }

        let sql = format!(
            "INSERT INTO adoption_requests
                 (pet_id, name, email, phone, address, experience, message, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW())
             RETURNING {REQUEST_COLUMNS}"
        );
        let applicant = request.applicant;
        let row = sqlx::query(&sql)
            .bind(request.animal_id.0)
            .bind(applicant.name)
            .bind(applicant.email)
            .bind(applicant.phone)
            .bind(applicant.address)
            .bind(applicant.experience)
            .bind(applicant.message)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        request_from_row(&row)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<AdoptionRequest>, StoreError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM adoption_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_by_animal(&self, animal: AnimalId) -> Result<Vec<AdoptionRequest>, StoreError> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM adoption_requests
             WHERE pet_id = $1
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(animal.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn set_status(
        &self,
        id: RequestId,
        status: AdoptionStatus,
    ) -> Result<Option<AdoptionRequest>, StoreError> {
        let sql = format!(
            "UPDATE adoption_requests SET status = $1 WHERE id = $2 RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(status.label())
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn deny_all_pending_except(
        &self,
        animal: AnimalId,
        except: RequestId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE adoption_requests
                SET status = 'denied'
              WHERE pet_id = $1
                AND id <> $2
                AND status = 'pending'",
        )
        .bind(animal.0)
        .bind(except.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_request(&self, id: RequestId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM adoption_requests WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_pending(
        &self,
        animal: AnimalId,
        id: RequestId,
        target: AdoptionStatus,
    ) -> Result<Transition, StoreError> {
        // The animal row lock serializes every claim against the same animal; dropping the
        // transaction without commit rolls it back.
        let mut tx = self.pool.begin().await?;

        let animal_status: Option<String> =
            sqlx::query_scalar("SELECT status FROM animals WHERE id = $1 FOR UPDATE")
                .bind(animal.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(animal_status) = animal_status else {
            return Ok(Transition::Missing);
        };
        let animal_status: AnimalStatus = animal_status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?;

        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM adoption_requests WHERE id = $1 AND pet_id = $2 FOR UPDATE"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(id.0)
            .bind(animal.0)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(Transition::Missing);
        };
        let current = request_from_row(&row)?;
        if current.status != AdoptionStatus::Pending {
            return Ok(Transition::AlreadyDecided(current));
        }

        if target == AdoptionStatus::Approved {
            let approved: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM adoption_requests WHERE pet_id = $1 AND status = 'approved' LIMIT 1",
            )
            .bind(animal.0)
            .fetch_optional(&mut *tx)
            .await?;
            if approved.is_some() || animal_status == AnimalStatus::Unavailable {
                return Ok(Transition::AnimalClosed {
                    approved: approved.map(RequestId),
                });
            }
        }

        let sql = format!(
            "UPDATE adoption_requests SET status = $1
             WHERE id = $2 AND status = 'pending'
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(target.label())
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        request_from_row(&row).map(Transition::Applied)
    }
}
