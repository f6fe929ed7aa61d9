// =============================================================================
// Configuration Store — versioned CRUD with rollback and audit trail
// =============================================================================
//
// Every mutation commits three effects in one transaction: the row change,
// an immutable version snapshot of the prior value (for update/rollback),
// and one audit row. Rollback is an update to a prior snapshot — the
// version counter keeps climbing, preserving a linear history.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::bus::{self, Bus};
use crate::config::model::{
    ActorContext, AuditAction, AuditLogEntry, ConfigFormat, ConfigType, ConfigUpdateEvent,
    Configuration, ConfigurationVersion, ListFilter,
};
use crate::config::validation::ValidatorRegistry;
use crate::error::ConfigError;

const DEFAULT_PAGE_SIZE: i64 = 50;

pub struct ConfigStore {
    pool: PgPool,
    validators: ValidatorRegistry,
    bus: Option<Arc<Bus>>,
}

impl ConfigStore {
    /// `bus` is optional so the store can run before the bus is up;
    /// subscribers poll-reconcile to cover the gap.
    pub fn new(pool: PgPool, bus: Option<Arc<Bus>>) -> Self {
        Self {
            pool,
            validators: ValidatorRegistry::with_builtin_validators(),
            bus,
        }
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Create a configuration at version 1, active.
    #[instrument(skip(self, raw_value, actor), name = "config::create")]
    pub async fn create(
        &self,
        key: &str,
        config_type: ConfigType,
        raw_value: &str,
        format: ConfigFormat,
        actor: &ActorContext,
    ) -> Result<Configuration, ConfigError> {
        let value = self.validators.validate(config_type, raw_value, format)?;

        let mut tx = self.pool.begin().await?;

        let duplicate = sqlx::query(
            "SELECT id FROM configurations WHERE key = $1 AND active AND NOT deleted",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        if duplicate.is_some() {
            return Err(ConfigError::DuplicateKey(key.to_string()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO configurations \
             (id, key, type, value, format, version, active, deleted, \
              created_at, updated_at, created_by, updated_by) \
             VALUES ($1, $2, $3, $4, $5, 1, TRUE, FALSE, $6, $6, $7, $7)",
        )
        .bind(id)
        .bind(key)
        .bind(config_type.to_string())
        .bind(&value)
        .bind(format.to_string())
        .bind(now)
        .bind(&actor.actor)
        .execute(&mut *tx)
        .await?;

        self.write_audit(&mut tx, id, actor, AuditAction::Create, None, Some(&value), None)
            .await?;
        tx.commit().await?;

        let config = self.get(id).await?;
        info!(key, config_type = %config_type, "configuration created");
        self.publish(&config, AuditAction::Create).await;
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Update
    // -------------------------------------------------------------------------

    /// Replace the value: version bumps by one and the prior value is
    /// snapshotted as a ConfigurationVersion row.
    #[instrument(skip(self, raw_value, actor), name = "config::update")]
    pub async fn update(
        &self,
        id: Uuid,
        raw_value: &str,
        change_reason: Option<&str>,
        actor: &ActorContext,
    ) -> Result<Configuration, ConfigError> {
        let mut tx = self.pool.begin().await?;
        let current = self.fetch_for_update(&mut tx, id).await?;

        let value = self
            .validators
            .validate(current.config_type, raw_value, current.format)?;

        self.snapshot_version(&mut tx, &current, actor).await?;

        sqlx::query(
            "UPDATE configurations \
             SET value = $2, version = version + 1, updated_at = $3, updated_by = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&value)
        .bind(Utc::now())
        .bind(&actor.actor)
        .execute(&mut *tx)
        .await?;

        self.write_audit(
            &mut tx,
            id,
            actor,
            AuditAction::Update,
            Some(&current.value),
            Some(&value),
            change_reason,
        )
        .await?;
        tx.commit().await?;

        let config = self.get(id).await?;
        info!(key = %config.key, version = config.version, "configuration updated");
        self.publish(&config, AuditAction::Update).await;
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Activate / deactivate
    // -------------------------------------------------------------------------

    #[instrument(skip(self, actor), name = "config::set_active")]
    pub async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        actor: &ActorContext,
    ) -> Result<Configuration, ConfigError> {
        let mut tx = self.pool.begin().await?;
        let current = self.fetch_for_update(&mut tx, id).await?;

        if current.active == active {
            tx.commit().await?;
            return Ok(current);
        }

        // Reactivation must not violate active-key uniqueness.
        if active {
            let clash = sqlx::query(
                "SELECT id FROM configurations \
                 WHERE key = $1 AND active AND NOT deleted AND id <> $2",
            )
            .bind(&current.key)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            if clash.is_some() {
                return Err(ConfigError::DuplicateKey(current.key));
            }
        }

        sqlx::query(
            "UPDATE configurations SET active = $2, updated_at = $3, updated_by = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .bind(Utc::now())
        .bind(&actor.actor)
        .execute(&mut *tx)
        .await?;

        let action = if active {
            AuditAction::Activate
        } else {
            AuditAction::Deactivate
        };
        self.write_audit(&mut tx, id, actor, action, None, None, None)
            .await?;
        tx.commit().await?;

        let config = self.get(id).await?;
        info!(key = %config.key, active, "configuration activation changed");
        self.publish(&config, action).await;
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Rollback
    // -------------------------------------------------------------------------

    /// Roll back to `target_version`: implemented as an update carrying the
    /// target snapshot, so the version becomes current + 1 and the audit
    /// trail stays linear.
    #[instrument(skip(self, actor), name = "config::rollback")]
    pub async fn rollback(
        &self,
        id: Uuid,
        target_version: i32,
        actor: &ActorContext,
        reason: Option<&str>,
    ) -> Result<Configuration, ConfigError> {
        let mut tx = self.pool.begin().await?;
        let current = self.fetch_for_update(&mut tx, id).await?;

        let snapshot = sqlx::query(
            "SELECT value FROM configuration_versions WHERE config_id = $1 AND version = $2",
        )
        .bind(id)
        .bind(target_version)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ConfigError::VersionMissing {
            config_id: id,
            version: target_version,
        })?;
        let target_value: serde_json::Value = snapshot.try_get("value")?;

        self.snapshot_version(&mut tx, &current, actor).await?;

        sqlx::query(
            "UPDATE configurations \
             SET value = $2, version = version + 1, updated_at = $3, updated_by = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&target_value)
        .bind(Utc::now())
        .bind(&actor.actor)
        .execute(&mut *tx)
        .await?;

        self.write_audit(
            &mut tx,
            id,
            actor,
            AuditAction::Rollback,
            Some(&current.value),
            Some(&target_value),
            reason,
        )
        .await?;
        tx.commit().await?;

        let config = self.get(id).await?;
        info!(
            key = %config.key,
            target_version,
            new_version = config.version,
            "configuration rolled back"
        );
        self.publish(&config, AuditAction::Rollback).await;
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Delete (soft)
    // -------------------------------------------------------------------------

    /// Soft delete. Versions and audit rows are retained indefinitely.
    /// Fails when another active configuration lists this key in its
    /// `depends_on` array.
    #[instrument(skip(self, actor), name = "config::delete")]
    pub async fn delete(&self, id: Uuid, actor: &ActorContext) -> Result<(), ConfigError> {
        let mut tx = self.pool.begin().await?;
        let current = self.fetch_for_update(&mut tx, id).await?;

        let referenced = sqlx::query(
            "SELECT id FROM configurations \
             WHERE active AND NOT deleted AND id <> $1 AND value -> 'depends_on' ? $2",
        )
        .bind(id)
        .bind(&current.key)
        .fetch_optional(&mut *tx)
        .await?;
        if referenced.is_some() {
            return Err(ConfigError::Referenced(id));
        }

        sqlx::query(
            "UPDATE configurations \
             SET deleted = TRUE, active = FALSE, updated_at = $2, updated_by = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(&actor.actor)
        .execute(&mut *tx)
        .await?;

        self.write_audit(
            &mut tx,
            id,
            actor,
            AuditAction::Delete,
            Some(&current.value),
            None,
            None,
        )
        .await?;
        tx.commit().await?;

        info!(key = %current.key, "configuration deleted");
        let mut tombstone = current;
        tombstone.active = false;
        self.publish(&tombstone, AuditAction::Delete).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Configuration, ConfigError> {
        let row = sqlx::query("SELECT * FROM configurations WHERE id = $1 AND NOT deleted")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ConfigError::NotFound(id))?;
        row_to_configuration(&row)
    }

    /// Active configuration by key.
    pub async fn get_by_key(&self, key: &str) -> Result<Option<Configuration>, ConfigError> {
        let row = sqlx::query(
            "SELECT * FROM configurations WHERE key = $1 AND active AND NOT deleted",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_configuration(&r)).transpose()
    }

    /// Filtered, paginated listing.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Configuration>, ConfigError> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);

        let rows = sqlx::query(
            "SELECT * FROM configurations \
             WHERE NOT deleted \
               AND ($1::text IS NULL OR type = $1) \
               AND ($2::boolean IS NULL OR active = $2) \
               AND ($3::text IS NULL OR key LIKE $3 || '%') \
             ORDER BY key \
             LIMIT $4 OFFSET $5",
        )
        .bind(filter.config_type.map(|t| t.to_string()))
        .bind(filter.active)
        .bind(filter.key_prefix.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_configuration).collect()
    }

    /// All retained snapshots for a configuration, oldest first.
    pub async fn versions(&self, id: Uuid) -> Result<Vec<ConfigurationVersion>, ConfigError> {
        let rows = sqlx::query(
            "SELECT * FROM configuration_versions WHERE config_id = $1 ORDER BY version",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    /// Audit trail for a configuration, oldest first.
    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditLogEntry>, ConfigError> {
        let rows = sqlx::query("SELECT * FROM audit_logs WHERE config_id = $1 ORDER BY ts")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_audit).collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn fetch_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
    ) -> Result<Configuration, ConfigError> {
        let row = sqlx::query(
            "SELECT * FROM configurations WHERE id = $1 AND NOT deleted FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ConfigError::NotFound(id))?;
        row_to_configuration(&row)
    }

    /// Persist the current value as an immutable version row.
    async fn snapshot_version(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        current: &Configuration,
        actor: &ActorContext,
    ) -> Result<(), ConfigError> {
        sqlx::query(
            "INSERT INTO configuration_versions \
             (id, config_id, version, value, created_at, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(current.id)
        .bind(current.version)
        .bind(&current.value)
        .bind(Utc::now())
        .bind(&actor.actor)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_audit(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        config_id: Uuid,
        actor: &ActorContext,
        action: AuditAction,
        old_value: Option<&serde_json::Value>,
        new_value: Option<&serde_json::Value>,
        reason: Option<&str>,
    ) -> Result<(), ConfigError> {
        sqlx::query(
            "INSERT INTO audit_logs \
             (id, config_id, actor, action, old_value, new_value, reason, ip, user_agent, ts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(config_id)
        .bind(&actor.actor)
        .bind(action.to_string())
        .bind(old_value)
        .bind(new_value)
        .bind(reason)
        .bind(actor.ip.as_deref())
        .bind(actor.user_agent.as_deref())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn publish(&self, config: &Configuration, action: AuditAction) {
        if let Some(bus) = &self.bus {
            let event = ConfigUpdateEvent::from_configuration(config, action);
            bus.publish_json(
                bus::config_updates_subject(&config.config_type.to_string()),
                &event,
            )
            .await;
        }
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_configuration(row: &PgRow) -> Result<Configuration, ConfigError> {
    Ok(Configuration {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        config_type: ConfigType::from_str(row.try_get::<String, _>("type")?.as_str())?,
        value: row.try_get("value")?,
        format: ConfigFormat::from_str(row.try_get::<String, _>("format")?.as_str())?,
        version: row.try_get("version")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        created_by: row.try_get("created_by")?,
        updated_by: row.try_get("updated_by")?,
    })
}

fn row_to_version(row: &PgRow) -> Result<ConfigurationVersion, ConfigError> {
    Ok(ConfigurationVersion {
        id: row.try_get("id")?,
        config_id: row.try_get("config_id")?,
        version: row.try_get("version")?,
        value: row.try_get("value")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditLogEntry, ConfigError> {
    let action_str: String = row.try_get("action")?;
    let action = match action_str.as_str() {
        "create" => AuditAction::Create,
        "update" => AuditAction::Update,
        "activate" => AuditAction::Activate,
        "deactivate" => AuditAction::Deactivate,
        "delete" => AuditAction::Delete,
        "rollback" => AuditAction::Rollback,
        other => {
            return Err(ConfigError::Validation(format!(
                "unknown audit action: {other}"
            )))
        }
    };
    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        config_id: row.try_get("config_id")?,
        actor: row.try_get("actor")?,
        action,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        reason: row.try_get("reason")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        ts: row.try_get("ts")?,
    })
}
