use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::domain::{
    AdoptionRequest, AdoptionStatus, Animal, AnimalId, AnimalPatch, AnimalStatus,
    NewAdoptionRequest, NewAnimal, Photo, PhotoId, RequestId, Scope,
};
use super::repository::{AdoptionLedger, AnimalStore, StoreError, Transition};

/// Process-local backend used when no database is configured.
///
/// All tables sit behind one mutex, so every operation is atomic with respect to the others.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    animals: BTreeMap<AnimalId, Animal>,
    photos: BTreeMap<PhotoId, Photo>,
    requests: BTreeMap<RequestId, AdoptionRequest>,
    last_animal_id: i64,
    last_photo_id: i64,
    last_request_id: i64,
}

impl Tables {
    fn scoped_animal_mut(&mut self, id: AnimalId, scope: Scope) -> Option<&mut Animal> {
        self.animals
            .get_mut(&id)
            .filter(|animal| scope.permits(animal))
    }

    fn approved_for(&self, animal: AnimalId) -> Option<RequestId> {
        self.requests
            .values()
            .find(|request| {
                request.animal_id == animal && request.status == AdoptionStatus::Approved
            })
            .map(|request| request.id)
    }
}

impl MemoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl AnimalStore for MemoryStore {
    async fn get_animal(&self, id: AnimalId) -> Result<Option<Animal>, StoreError> {
        Ok(self.lock()?.animals.get(&id).cloned())
    }

    async fn list_animals(&self, scope: Scope) -> Result<Vec<Animal>, StoreError> {
        Ok(self
            .lock()?
            .animals
            .values()
            .filter(|animal| scope.permits(animal))
            .cloned()
            .collect())
    }

    async fn create_animal(&self, animal: NewAnimal) -> Result<Animal, StoreError> {
        let mut tables = self.lock()?;
        let id = match animal.id {
            Some(id) if tables.animals.contains_key(&id) => return Err(StoreError::Conflict),
            Some(id) => id,
            None => AnimalId(tables.last_animal_id + 1),
        };
        tables.last_animal_id = tables.last_animal_id.max(id.0);

        let record = animal.into_animal(id, Utc::now());
        tables.animals.insert(id, record.clone());
        Ok(record)
    }

    async fn update_fields(
        &self,
        id: AnimalId,
        patch: AnimalPatch,
        scope: Scope,
    ) -> Result<Option<Animal>, StoreError> {
        let mut tables = self.lock()?;
        let Some(animal) = tables.scoped_animal_mut(id, scope) else {
            return Ok(None);
        };
        patch.apply(animal, Utc::now());
        Ok(Some(animal.clone()))
    }

    async fn remove_animal(&self, id: AnimalId, scope: Scope) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        if tables.scoped_animal_mut(id, scope).is_none() {
            return Ok(false);
        }
        tables.photos.retain(|_, photo| photo.animal_id != id);
        tables.requests.retain(|_, request| request.animal_id != id);
        Ok(tables.animals.remove(&id).is_some())
    }

    async fn attach_photo(
        &self,
        id: AnimalId,
        url: String,
        scope: Scope,
    ) -> Result<Option<Photo>, StoreError> {
        let mut tables = self.lock()?;
        if tables.scoped_animal_mut(id, scope).is_none() {
            return Ok(None);
        }
        let is_primary = !tables.photos.values().any(|photo| photo.animal_id == id);
        tables.last_photo_id += 1;
        let photo = Photo {
            id: PhotoId(tables.last_photo_id),
            animal_id: id,
            url,
            is_primary,
        };
        tables.photos.insert(photo.id, photo.clone());
        Ok(Some(photo))
    }

    async fn photos(&self, id: AnimalId) -> Result<Vec<Photo>, StoreError> {
        Ok(self
            .lock()?
            .photos
            .values()
            .filter(|photo| photo.animal_id == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AdoptionLedger for MemoryStore {
    async fn create_request(&self, request: NewAdoptionRequest) -> Result<AdoptionRequest, StoreError> {
        let mut tables = self.lock()?;
        if !tables.animals.contains_key(&request.animal_id) {
            return Err(StoreError::UnknownAnimal(request.animal_id));
        }
        tables.last_request_id += 1;
        let record = AdoptionRequest {
            id: RequestId(tables.last_request_id),
            animal_id: request.animal_id,
            applicant: request.applicant,
            status: AdoptionStatus::Pending,
            created_at: Utc::now(),
        };
        tables.requests.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<AdoptionRequest>, StoreError> {
        Ok(self.lock()?.requests.get(&id).cloned())
    }

    async fn list_by_animal(&self, animal: AnimalId) -> Result<Vec<AdoptionRequest>, StoreError> {
        let mut requests: Vec<_> = self
            .lock()?
            .requests
            .values()
            .filter(|request| request.animal_id == animal)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(requests)
    }

    async fn set_status(
        &self,
        id: RequestId,
        status: AdoptionStatus,
    ) -> Result<Option<AdoptionRequest>, StoreError> {
        let mut tables = self.lock()?;
        Ok(tables.requests.get_mut(&id).map(|request| {
            request.status = status;
            request.clone()
        }))
    }

    async fn deny_all_pending_except(
        &self,
        animal: AnimalId,
        except: RequestId,
    ) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        let mut denied = 0;
        for request in tables.requests.values_mut().filter(|request| {
            request.animal_id == animal
                && request.id != except
                && request.status == AdoptionStatus::Pending
        }) {
            request.status = AdoptionStatus::Denied;
            denied += 1;
        }
        Ok(denied)
    }

    async fn remove_request(&self, id: RequestId) -> Result<bool, StoreError> {
        Ok(self.lock()?.requests.remove(&id).is_some())
    }

    async fn transition_pending(
        &self,
        animal: AnimalId,
        id: RequestId,
        target: AdoptionStatus,
    ) -> Result<Transition, StoreError> {
        let mut tables = self.lock()?;
        let Some(animal_status) = tables.animals.get(&animal).map(|record| record.status) else {
            return Ok(Transition::Missing);
        };
        let current = match tables.requests.get(&id) {
            Some(request) if request.animal_id == animal => request.clone(),
            _ => return Ok(Transition::Missing),
        };
        if current.status != AdoptionStatus::Pending {
            return Ok(Transition::AlreadyDecided(current));
        }
        if target == AdoptionStatus::Approved {
            let approved = tables.approved_for(animal);
            if approved.is_some() || animal_status == AnimalStatus::Unavailable {
                return Ok(Transition::AnimalClosed { approved });
            }
        }

        let Some(request) = tables.requests.get_mut(&id) else {
            return Ok(Transition::Missing);
        };
        request.status = target;
        Ok(Transition::Applied(request.clone()))
    }
}
