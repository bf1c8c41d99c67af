//! Queries on the `manifests` table

use chrono::Utc;
use ferry_common::ManifestStatus;

use super::{DbError, DbResult, LedgerStore};
use crate::models::{Manifest, NewManifest};

const MANIFEST_COLUMNS: &str = "id, remote_node_id, user_id, user_name, org_id, org_name, \
     dataset_id, dataset_name, status, created_at, updated_at";

impl LedgerStore {
    pub async fn create_manifest(&self, new: &NewManifest) -> DbResult<Manifest> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO manifests (
                user_id, user_name, org_id, org_name, dataset_id, dataset_name,
                status, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(&new.user_id)
        .bind(&new.user_name)
        .bind(&new.org_id)
        .bind(&new.org_name)
        .bind(&new.dataset_id)
        .bind(&new.dataset_name)
        .bind(ManifestStatus::Initiated.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::debug!(manifest_id = id, dataset_id = %new.dataset_id, "Manifest created");

        self.get_manifest(id)
            .await?
            .ok_or_else(|| DbError::not_found("Manifest", id))
    }

    pub async fn get_manifest(&self, manifest_id: i64) -> DbResult<Option<Manifest>> {
        let manifest = sqlx::query_as::<_, Manifest>(&format!(
            "SELECT {} FROM manifests WHERE id = ?1",
            MANIFEST_COLUMNS
        ))
        .bind(manifest_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(manifest)
    }

    pub async fn list_manifests(&self) -> DbResult<Vec<Manifest>> {
        let manifests = sqlx::query_as::<_, Manifest>(&format!(
            "SELECT {} FROM manifests ORDER BY id",
            MANIFEST_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(manifests)
    }

    pub async fn set_remote_node_id(&self, manifest_id: i64, node_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE manifests SET remote_node_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(node_id)
        .bind(Utc::now())
        .bind(manifest_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Manifest", manifest_id));
        }
        Ok(())
    }

    pub async fn set_manifest_status(
        &self,
        manifest_id: i64,
        status: ManifestStatus,
    ) -> DbResult<()> {
        sqlx::query("UPDATE manifests SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete a manifest; its files go with it (cascade)
    pub async fn delete_manifest(&self, manifest_id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM manifests WHERE id = ?1")
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
