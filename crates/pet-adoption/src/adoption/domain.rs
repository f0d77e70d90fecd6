use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an adoptable animal. Caller-supplied on create or store-generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnimalId(pub i64);

/// Store-generated identifier of an adoption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

/// Shelter that listed an animal. Owned by the authentication collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(pub i64);

macro_rules! display_id {
    ($($name:ident),*) => {
        $(impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(AnimalId, RequestId, OrganizationId, PhotoId);

/// Error returned when a stored or submitted label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnimalKind {
    Cat,
    Dog,
}

impl AnimalKind {
    pub const fn label(self) -> &'static str {
        match self {
            AnimalKind::Cat => "Cat",
            AnimalKind::Dog => "Dog",
        }
    }
}

impl FromStr for AnimalKind {
    type Err = UnknownLabel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Cat" => Ok(AnimalKind::Cat),
            "Dog" => Ok(AnimalKind::Dog),
            other => Err(UnknownLabel {
                kind: "animal type",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the animal is still listed for adoption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimalStatus {
    Adoptable,
    Unavailable,
}

impl AnimalStatus {
    pub const fn label(self) -> &'static str {
        match self {
            AnimalStatus::Adoptable => "adoptable",
            AnimalStatus::Unavailable => "unavailable",
        }
    }
}

impl FromStr for AnimalStatus {
    type Err = UnknownLabel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "adoptable" => Ok(AnimalStatus::Adoptable),
            "unavailable" => Ok(AnimalStatus::Unavailable),
            other => Err(UnknownLabel {
                kind: "animal status",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of an adoption request. `Approved` and `Denied` are terminal.
///
/// The Portuguese labels used by older shelter dashboards are accepted on input only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionStatus {
    #[serde(alias = "em_analise")]
    Pending,
    #[serde(alias = "deferido")]
    Approved,
    #[serde(alias = "indeferido")]
    Denied,
}

impl AdoptionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            AdoptionStatus::Pending => "pending",
            AdoptionStatus::Approved => "approved",
            AdoptionStatus::Denied => "denied",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, AdoptionStatus::Approved | AdoptionStatus::Denied)
    }
}

impl fmt::Display for AdoptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AdoptionStatus {
    type Err = UnknownLabel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "em_analise" => Ok(AdoptionStatus::Pending),
            "approved" | "deferido" => Ok(AdoptionStatus::Approved),
            "denied" | "indeferido" => Ok(AdoptionStatus::Denied),
            _ => Err(UnknownLabel {
                kind: "adoption status",
                value: value.to_string(),
            }),
        }
    }
}

/// Limits which animals a caller may see or mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Any,
    Organization(OrganizationId),
}

impl Scope {
    /// Unowned animals are visible to every organization; owned ones only to their owner.
    pub fn permits(self, animal: &Animal) -> bool {
        match (self, animal.organization_id) {
            (Scope::Any, _) | (Scope::Organization(_), None) => true,
            (Scope::Organization(caller), Some(owner)) => caller == owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Animal {
    pub id: AnimalId,
    pub organization_id: Option<OrganizationId>,
    #[serde(rename = "type")]
    pub kind: AnimalKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub size: Option<String>,
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    pub tertiary_color: Option<String>,
    pub breed: Option<String>,
    pub spayed_neutered: bool,
    pub shots_current: bool,
    pub status: AnimalStatus,
    pub status_changed_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
}

/// Fields accepted when listing a new animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAnimal {
    #[serde(default)]
    pub id: Option<AnimalId>,
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
    #[serde(rename = "type")]
    pub kind: AnimalKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub secondary_color: Option<String>,
    #[serde(default)]
    pub tertiary_color: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub spayed_neutered: bool,
    #[serde(default)]
    pub shots_current: bool,
    #[serde(default)]
    pub status: Option<AnimalStatus>,
}

impl NewAnimal {
    pub fn of_kind(kind: AnimalKind) -> Self {
        Self {
            id: None,
            organization_id: None,
            kind,
            name: None,
            description: None,
            age: None,
            gender: None,
            size: None,
            primary_color: None,
            secondary_color: None,
            tertiary_color: None,
            breed: None,
            spayed_neutered: false,
            shots_current: false,
            status: None,
        }
    }

    pub(crate) fn into_animal(self, id: AnimalId, now: DateTime<Utc>) -> Animal {
        Animal {
            id,
            organization_id: self.organization_id,
            kind: self.kind,
            name: self.name,
            description: self.description,
            age: self.age,
            gender: self.gender,
            size: self.size,
            primary_color: self.primary_color,
            secondary_color: self.secondary_color,
            tertiary_color: self.tertiary_color,
            breed: self.breed,
            spayed_neutered: self.spayed_neutered,
            shots_current: self.shots_current,
            status: self.status.unwrap_or(AnimalStatus::Adoptable),
            status_changed_at: now,
            published_at: now,
        }
    }
}

/// Allow-listed partial update. Absent fields are left untouched; unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnimalPatch {
    #[serde(default, rename = "type")]
    pub kind: Option<AnimalKind>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub secondary_color: Option<String>,
    #[serde(default)]
    pub tertiary_color: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub spayed_neutered: Option<bool>,
    #[serde(default)]
    pub shots_current: Option<bool>,
    #[serde(default)]
    pub status: Option<AnimalStatus>,
}

impl AnimalPatch {
    pub fn status(status: AnimalStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges the supplied fields. Any status write refreshes `status_changed_at`, never
    /// moving it backwards.
    pub(crate) fn apply(self, animal: &mut Animal, now: DateTime<Utc>) {
        fn merge<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        fn merge_text(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }

        merge(&mut animal.kind, self.kind);
        merge_text(&mut animal.name, self.name);
        merge_text(&mut animal.description, self.description);
        merge_text(&mut animal.age, self.age);
        merge_text(&mut animal.gender, self.gender);
        merge_text(&mut animal.size, self.size);
        merge_text(&mut animal.primary_color, self.primary_color);
        merge_text(&mut animal.secondary_color, self.secondary_color);
        merge_text(&mut animal.tertiary_color, self.tertiary_color);
        merge_text(&mut animal.breed, self.breed);
        merge(&mut animal.spayed_neutered, self.spayed_neutered);
        merge(&mut animal.shots_current, self.shots_current);
        if let Some(status) = self.status {
            animal.status = status;
            animal.status_changed_at = now.max(animal.status_changed_at);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub animal_id: AnimalId,
    pub url: String,
    pub is_primary: bool,
}

/// Contact and background details supplied by the applicant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantDetails {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub experience: String,
    #[serde(default)]
    pub message: String,
}

/// Body of an anonymous adoption application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAdoptionRequest {
    #[serde(rename = "petId", alias = "pet_id")]
    pub animal_id: AnimalId,
    #[serde(flatten)]
    pub applicant: ApplicantDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptionRequest {
    pub id: RequestId,
    #[serde(rename = "pet_id")]
    pub animal_id: AnimalId,
    #[serde(flatten)]
    pub applicant: ApplicantDetails,
    pub status: AdoptionStatus,
    pub created_at: DateTime<Utc>,
}
