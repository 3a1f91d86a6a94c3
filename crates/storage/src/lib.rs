use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{
        ControlId, ControlPatch, FormId, OrderChange, PlacedControl, Properties, Section,
        SectionId, SectionPatch,
    },
    error::StoreError,
};

/// Async CRUD contract the designer core persists through.
///
/// Every failure is a [`StoreError`]; callers treat a returned error as
/// "nothing happened" except where documented otherwise.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn list(&self, form_id: &FormId) -> Result<Vec<PlacedControl>, StoreError>;
    /// Fails with [`StoreError::Constraint`] when the id is already taken.
    async fn insert(&self, control: &PlacedControl, form_id: &FormId) -> Result<(), StoreError>;
    /// Merges `patch` into the stored record; property keys are merged one by one.
    async fn update(&self, id: &ControlId, patch: &ControlPatch) -> Result<(), StoreError>;
    async fn delete(&self, id: &ControlId) -> Result<(), StoreError>;
    /// Applies every change or none of them.
    async fn bulk_reorder(&self, changes: &[OrderChange]) -> Result<(), StoreError>;

    async fn list_sections(&self, form_id: &FormId) -> Result<Vec<Section>, StoreError>;
    async fn insert_section(&self, section: &Section, form_id: &FormId) -> Result<(), StoreError>;
    async fn update_section(
        &self,
        form_id: &FormId,
        id: &SectionId,
        patch: &SectionPatch,
    ) -> Result<(), StoreError>;
    async fn delete_section(&self, form_id: &FormId, id: &SectionId) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run form designer migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn count_controls(&self, form_id: &FormId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM controls WHERE form_id = ?")
            .bind(form_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn fetch_control(&self, id: &ControlId) -> Result<Option<PlacedControl>, StoreError> {
        let row = sqlx::query(
            "SELECT id, control_kind, display_name, section_id, order_index, properties, width, height
             FROM controls WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(|r| control_from_row(&r)).transpose()
    }
}

#[async_trait]
impl PersistenceGateway for Storage {
    async fn list(&self, form_id: &FormId) -> Result<Vec<PlacedControl>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, c.control_kind, c.display_name, c.section_id, c.order_index, c.properties, c.width, c.height
             FROM controls c
             LEFT JOIN sections s ON s.form_id = c.form_id AND s.id = c.section_id
             WHERE c.form_id = ?
             ORDER BY COALESCE(s.sort_order, 0) ASC, c.section_id ASC, c.order_index ASC, c.id ASC",
        )
        .bind(form_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(control_from_row).collect()
    }

    async fn insert(&self, control: &PlacedControl, form_id: &FormId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO controls (id, form_id, control_kind, display_name, section_id, order_index, properties, width, height)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(control.id.as_str())
        .bind(form_id.as_str())
        .bind(&control.control_kind)
        .bind(&control.display_name)
        .bind(control.section_id.as_str())
        .bind(i64::from(control.order_index))
        .bind(encode_properties(&control.properties)?)
        .bind(control.width.map(i64::from))
        .bind(control.height.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, id: &ControlId, patch: &ControlPatch) -> Result<(), StoreError> {
        let mut control = self
            .fetch_control(id)
            .await?
            .ok_or_else(|| StoreError::not_found("control", id.as_str()))?;
        patch.apply_to(&mut control);

        let result = sqlx::query(
            "UPDATE controls
             SET display_name = ?, section_id = ?, order_index = ?, properties = ?, width = ?, height = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(&control.display_name)
        .bind(control.section_id.as_str())
        .bind(i64::from(control.order_index))
        .bind(encode_properties(&control.properties)?)
        .bind(control.width.map(i64::from))
        .bind(control.height.map(i64::from))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("control", id.as_str()));
        }
        Ok(())
    }

    async fn delete(&self, id: &ControlId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM controls WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("control", id.as_str()));
        }
        Ok(())
    }

    async fn bulk_reorder(&self, changes: &[OrderChange]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for change in changes {
            let result = sqlx::query(
                "UPDATE controls SET section_id = ?, order_index = ?, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?",
            )
            .bind(change.section_id.as_str())
            .bind(i64::from(change.order_index))
            .bind(change.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back the changes applied so far.
                return Err(StoreError::not_found("control", change.id.as_str()));
            }
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn list_sections(&self, form_id: &FormId) -> Result<Vec<Section>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, sort_order, required FROM sections
             WHERE form_id = ?
             ORDER BY sort_order ASC, id ASC",
        )
        .bind(form_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(section_from_row).collect()
    }

    async fn insert_section(&self, section: &Section, form_id: &FormId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sections (form_id, id, name, sort_order, required) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(form_id.as_str())
        .bind(section.id.as_str())
        .bind(&section.name)
        .bind(i64::from(section.order))
        .bind(section.required)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_section(
        &self,
        form_id: &FormId,
        id: &SectionId,
        patch: &SectionPatch,
    ) -> Result<(), StoreError> {
        let row = sqlx::query(
            "SELECT id, name, sort_order, required FROM sections WHERE form_id = ? AND id = ?",
        )
        .bind(form_id.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or_else(|| StoreError::not_found("section", id.as_str()))?;
        let mut section = section_from_row(&row)?;
        patch.apply_to(&mut section);

        sqlx::query(
            "UPDATE sections SET name = ?, sort_order = ?, required = ? WHERE form_id = ? AND id = ?",
        )
        .bind(&section.name)
        .bind(i64::from(section.order))
        .bind(section.required)
        .bind(form_id.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_section(&self, form_id: &FormId, id: &SectionId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sections WHERE form_id = ? AND id = ?")
            .bind(form_id.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("section", id.as_str()));
        }
        Ok(())
    }
}

fn control_from_row(row: &SqliteRow) -> Result<PlacedControl, StoreError> {
    let properties: String = row.try_get("properties").map_err(store_err)?;
    Ok(PlacedControl {
        id: ControlId(row.try_get("id").map_err(store_err)?),
        control_kind: row.try_get("control_kind").map_err(store_err)?,
        display_name: row.try_get("display_name").map_err(store_err)?,
        section_id: SectionId(row.try_get("section_id").map_err(store_err)?),
        order_index: to_u32(row.try_get("order_index").map_err(store_err)?)?,
        properties: decode_properties(&properties)?,
        width: row
            .try_get::<Option<i64>, _>("width")
            .map_err(store_err)?
            .map(to_u32)
            .transpose()?,
        height: row
            .try_get::<Option<i64>, _>("height")
            .map_err(store_err)?
            .map(to_u32)
            .transpose()?,
    })
}

fn section_from_row(row: &SqliteRow) -> Result<Section, StoreError> {
    Ok(Section {
        id: SectionId(row.try_get("id").map_err(store_err)?),
        name: row.try_get("name").map_err(store_err)?,
        order: to_u32(row.try_get("sort_order").map_err(store_err)?)?,
        required: row.try_get("required").map_err(store_err)?,
    })
}

fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::backend(format!("stored value {value} out of range")))
}

fn encode_properties(properties: &Properties) -> Result<String, StoreError> {
    serde_json::to_string(properties)
        .map_err(|err| StoreError::backend(format!("failed to encode properties: {err}")))
}

fn decode_properties(raw: &str) -> Result<Properties, StoreError> {
    serde_json::from_str(raw)
        .map_err(|err| StoreError::backend(format!("failed to decode properties: {err}")))
}

fn store_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::constraint(db.message().to_string())
        }
        _ => StoreError::backend(err.to_string()),
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
