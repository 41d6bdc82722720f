//! Patient identity and persona types.
//!
//! Identity fields (name, email, phone) are personally identifying and are
//! only ever persisted as opaque cipher tokens. The persona carries
//! non-identifying demographics and survives account deletion in
//! anonymized form for aggregate analytics; the identity row does not.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::new_entity_id;

/// Encrypted-at-rest identity record, 1:1 with a user. Hard-deleted when
/// the account is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedIdentity {
    pub user_id: String,
    /// Opaque cipher tokens; never parse, never log.
    pub full_name_encrypted: Option<String>,
    pub email_encrypted: Option<String>,
    pub phone_number_encrypted: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted view of a [`ProtectedIdentity`]. Only ever materialized in
/// memory on an audited read path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiProfile {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

/// Field-wise identity update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct PiiUpdate {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl PiiUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.email.is_none() && self.phone_number.is_none()
    }

    /// Names of the fields this update touches, for the audit payload.
    #[must_use]
    pub fn modified_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.full_name.is_some() {
            fields.push("full_name");
        }
        if self.email.is_some() {
            fields.push("email");
        }
        if self.phone_number.is_some() {
            fields.push("phone_number");
        }
        fields
    }
}

/// Non-identifying demographic and health attributes.
///
/// `user_id` is nullable: account deletion detaches the row from its owner
/// and stamps `anonymized_at`, but the row itself is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPersona {
    pub id: String,
    pub user_id: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub blood_group: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub location: Option<String>,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HealthPersona {
    /// A fresh persona owned by `user_id`.
    #[must_use]
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_entity_id(),
            user_id: Some(user_id.into()),
            gender: None,
            date_of_birth: None,
            blood_group: None,
            height_cm: None,
            weight_kg: None,
            location: None,
            anonymized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Age in whole years as of `today`, derived from the date of birth.
    #[must_use]
    pub fn age(&self, today: NaiveDate) -> Option<i32> {
        let dob = self.date_of_birth?;
        let mut age = today.year() - dob.year();
        if (today.month(), today.day()) < (dob.month(), dob.day()) {
            age -= 1;
        }
        Some(age)
    }
}

/// Field-wise persona update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct PersonaUpdate {
    pub gender: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub blood_group: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub location: Option<String>,
}

impl PersonaUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gender.is_none()
            && self.date_of_birth.is_none()
            && self.blood_group.is_none()
            && self.height_cm.is_none()
            && self.weight_kg.is_none()
            && self.location.is_none()
    }

    #[must_use]
    pub fn modified_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.gender.is_some() {
            fields.push("gender");
        }
        if self.date_of_birth.is_some() {
            fields.push("date_of_birth");
        }
        if self.blood_group.is_some() {
            fields.push("blood_group");
        }
        if self.height_cm.is_some() {
            fields.push("height_cm");
        }
        if self.weight_kg.is_some() {
            fields.push("weight_kg");
        }
        if self.location.is_some() {
            fields.push("location");
        }
        fields
    }

    /// Apply the update to a persona in place.
    pub fn apply(&self, persona: &mut HealthPersona, now: DateTime<Utc>) {
        if let Some(gender) = &self.gender {
            persona.gender = Some(gender.clone());
        }
        if let Some(dob) = self.date_of_birth {
            persona.date_of_birth = Some(dob);
        }
        if let Some(blood_group) = &self.blood_group {
            persona.blood_group = Some(blood_group.clone());
        }
        if let Some(height) = self.height_cm {
            persona.height_cm = Some(height);
        }
        if let Some(weight) = self.weight_kg {
            persona.weight_kg = Some(weight);
        }
        if let Some(location) = &self.location {
            persona.location = Some(location.clone());
        }
        persona.updated_at = now;
    }
}
