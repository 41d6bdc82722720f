//! Protected identity and persona management.
//!
//! Every operation here touches PHI, so every operation produces exactly
//! one audit entry describing who touched whose data. Identity fields
//! cross this service boundary as plaintext and are stored only as cipher
//! tokens; the persona carries no identifying fields and survives account
//! deletion anonymized.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{storage, AuditPolicy};
use crate::adapters::StorageError;
use crate::domain::{
    AuditAction, AuditContext, AuditEntry, FieldCipher, HealthPersona, PersonaUpdate, PiiProfile,
    PiiUpdate, ProtectedIdentity,
};
use crate::ports::{AuditSink, PatientStore};
use crate::{CoreError, Result};

const IDENTITY_RESOURCE: &str = "protected_identity";
const PERSONA_RESOURCE: &str = "health_persona";

/// Service owning encrypted identities, personas and their audit trail.
pub struct PatientService<S, A> {
    store: Arc<S>,
    audit: Arc<A>,
    cipher: Arc<FieldCipher>,
    policy: AuditPolicy,
}

impl<S, A> PatientService<S, A>
where
    S: PatientStore,
    S::Error: Into<StorageError>,
    A: AuditSink,
{
    pub fn new(store: Arc<S>, audit: Arc<A>, cipher: Arc<FieldCipher>) -> Self {
        Self {
            store,
            audit,
            cipher,
            policy: AuditPolicy::default(),
        }
    }

    /// Set how audit-write failures on mutations are handled.
    #[must_use]
    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create the identity and persona rows for a new user.
    ///
    /// Identity fields are encrypted before they are stored; absent fields
    /// stay absent rather than becoming encrypted empty strings.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyExists`] if the user already has an
    /// identity row.
    pub fn create_profile(
        &self,
        user_id: &str,
        pii: &PiiUpdate,
        context: &AuditContext,
    ) -> Result<()> {
        self.create_profile_at(user_id, pii, context, Utc::now())
    }

    pub fn create_profile_at(
        &self,
        user_id: &str,
        pii: &PiiUpdate,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.store.identity(user_id).map_err(storage)?.is_some() {
            return Err(CoreError::AlreadyExists(format!(
                "protected identity for user {user_id}"
            )));
        }

        let identity = ProtectedIdentity {
            user_id: user_id.to_string(),
            full_name_encrypted: self.cipher.encrypt(pii.full_name.as_deref())?,
            email_encrypted: self.cipher.encrypt(pii.email.as_deref())?,
            phone_number_encrypted: self.cipher.encrypt(pii.phone_number.as_deref())?,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_identity(&identity).map_err(storage)?;
        self.store
            .insert_persona(&HealthPersona::new(user_id, now))
            .map_err(storage)?;

        tracing::info!(user_id = %user_id, "Created protected profile");
        self.record_mutation(
            AuditEntry::new(
                Some(user_id),
                user_id,
                AuditAction::PhiCreate,
                IDENTITY_RESOURCE,
                context.clone(),
            )
            .with_detail(serde_json::json!({
                "fields": pii.modified_fields(),
            }))
            .at(now),
        )
    }

    /// Decrypt and return the user's identity fields.
    ///
    /// The read is audited best-effort: an audit failure is logged but
    /// never blocks the read, regardless of policy.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if the user has no identity row, or
    /// [`CoreError::Crypto`] if a stored token fails authentication.
    pub fn profile(&self, user_id: &str, context: &AuditContext) -> Result<PiiProfile> {
        let identity = self
            .store
            .identity(user_id)
            .map_err(storage)?
            .ok_or_else(|| CoreError::NotFound(format!("protected identity for user {user_id}")))?;

        let profile = PiiProfile {
            full_name: self.cipher.decrypt(identity.full_name_encrypted.as_deref())?,
            email: self.cipher.decrypt(identity.email_encrypted.as_deref())?,
            phone_number: self
                .cipher
                .decrypt(identity.phone_number_encrypted.as_deref())?,
        };

        self.record_read(AuditEntry::new(
            Some(user_id),
            user_id,
            AuditAction::PhiAccess,
            IDENTITY_RESOURCE,
            context.clone(),
        ));

        Ok(profile)
    }

    /// Re-encrypt and store the identity fields named in the update.
    ///
    /// An empty update is a no-op and produces no audit entry.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if the user has no identity row.
    pub fn update_identity(
        &self,
        user_id: &str,
        update: &PiiUpdate,
        context: &AuditContext,
    ) -> Result<()> {
        self.update_identity_at(user_id, update, context, Utc::now())
    }

    pub fn update_identity_at(
        &self,
        user_id: &str,
        update: &PiiUpdate,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut identity = self
            .store
            .identity(user_id)
            .map_err(storage)?
            .ok_or_else(|| CoreError::NotFound(format!("protected identity for user {user_id}")))?;

        if let Some(full_name) = update.full_name.as_deref() {
            identity.full_name_encrypted = self.cipher.encrypt(Some(full_name))?;
        }
        if let Some(email) = update.email.as_deref() {
            identity.email_encrypted = self.cipher.encrypt(Some(email))?;
        }
        if let Some(phone) = update.phone_number.as_deref() {
            identity.phone_number_encrypted = self.cipher.encrypt(Some(phone))?;
        }
        identity.updated_at = now;
        self.store.update_identity(&identity).map_err(storage)?;

        // The audit payload names which fields changed, never their values.
        self.record_mutation(
            AuditEntry::new(
                Some(user_id),
                user_id,
                AuditAction::PhiUpdate,
                IDENTITY_RESOURCE,
                context.clone(),
            )
            .with_detail(serde_json::json!({
                "fields_modified": update.modified_fields(),
            }))
            .at(now),
        )
    }

    /// The user's persona (demographics), if any.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn persona(&self, user_id: &str) -> Result<Option<HealthPersona>> {
        self.store.persona_for_user(user_id).map_err(storage)
    }

    /// Apply a field-wise persona update.
    ///
    /// An empty update is a no-op and produces no audit entry.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if the user has no persona.
    pub fn update_persona(
        &self,
        user_id: &str,
        update: &PersonaUpdate,
        context: &AuditContext,
    ) -> Result<HealthPersona> {
        self.update_persona_at(user_id, update, context, Utc::now())
    }

    pub fn update_persona_at(
        &self,
        user_id: &str,
        update: &PersonaUpdate,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<HealthPersona> {
        let mut persona = self
            .store
            .persona_for_user(user_id)
            .map_err(storage)?
            .ok_or_else(|| CoreError::NotFound(format!("health persona for user {user_id}")))?;

        if update.is_empty() {
            return Ok(persona);
        }

        update.apply(&mut persona, now);
        self.store.update_persona(&persona).map_err(storage)?;

        self.record_mutation(
            AuditEntry::new(
                Some(user_id),
                user_id,
                AuditAction::PhiUpdate,
                PERSONA_RESOURCE,
                context.clone(),
            )
            .with_detail(serde_json::json!({
                "fields_modified": update.modified_fields(),
            }))
            .at(now),
        )?;

        Ok(persona)
    }

    /// Account-deletion data handling: hard-delete the identity row and
    /// detach the persona from its owner (`user_id` cleared,
    /// `anonymized_at` stamped, row retained for aggregate analytics).
    ///
    /// The identity hard-delete is recorded as `phi_delete`, and exactly
    /// one `phi_anonymize` entry covers the whole operation. The audit
    /// trail itself is never touched.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn anonymize_account(&self, user_id: &str, context: &AuditContext) -> Result<()> {
        self.anonymize_account_at(user_id, context, Utc::now())
    }

    pub fn anonymize_account_at(
        &self,
        user_id: &str,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let identity_deleted = self.store.delete_identity(user_id).map_err(storage)?;
        let persona_anonymized = self
            .store
            .anonymize_persona(user_id, now)
            .map_err(storage)?;

        tracing::info!(
            user_id = %user_id,
            identity_deleted,
            persona_anonymized,
            "Anonymized account data"
        );

        if identity_deleted {
            self.record_mutation(
                AuditEntry::new(
                    None,
                    user_id,
                    AuditAction::PhiDelete,
                    IDENTITY_RESOURCE,
                    context.clone(),
                )
                .at(now),
            )?;
        }

        self.record_mutation(
            AuditEntry::new(
                None,
                user_id,
                AuditAction::PhiAnonymize,
                "patient_data",
                context.clone(),
            )
            .with_detail(serde_json::json!({
                "reason": "user_account_deletion",
                "identity_deleted": identity_deleted,
                "persona_anonymized": persona_anonymized,
            }))
            .at(now),
        )
    }

    fn record_mutation(&self, entry: AuditEntry) -> Result<()> {
        if let Err(err) = self.audit.record(&entry) {
            tracing::error!(
                action = %entry.action,
                subject = %entry.subject_user_id,
                error = %err,
                "Audit write failed"
            );
            if self.policy == AuditPolicy::Required {
                return Err(CoreError::AuditWrite(err.to_string()));
            }
        }
        Ok(())
    }

    fn record_read(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(&entry) {
            tracing::error!(
                action = %entry.action,
                subject = %entry.subject_user_id,
                error = %err,
                "Audit write failed"
            );
        }
    }
}
