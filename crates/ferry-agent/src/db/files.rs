//! Queries on the `manifest_files` table

use std::collections::HashMap;

use chrono::Utc;
use ferry_common::FileStatus;
use futures::stream::{BoxStream, StreamExt};
use sqlx::{QueryBuilder, Sqlite};
use uuid::Uuid;

use super::{DbError, DbResult, LedgerStore};
use crate::models::{ManifestFile, NewManifestFile, RemovalSummary};

/// Upper bound on bound parameters per bulk statement
const BULK_CHUNK: usize = 500;

const FILE_COLUMNS: &str = "id, manifest_id, upload_id, source_path, target_path, target_name, \
     status, created_at, updated_at";

/// States a row must be in for a pipeline status to apply. Empty means the
/// update is unconditional.
fn allowed_sources(status: FileStatus) -> &'static [FileStatus] {
    match status {
        FileStatus::Registered => &[FileStatus::Local],
        FileStatus::Uploaded | FileStatus::Failed => &[FileStatus::Registered],
        FileStatus::Verified => &[FileStatus::Registered, FileStatus::Uploaded],
        FileStatus::Local | FileStatus::Removed | FileStatus::Unknown => &[],
    }
}

impl LedgerStore {
    /// Insert files as `Local`, minting a fresh upload id for each.
    ///
    /// Returns the upload ids in input order.
    pub async fn add_files(
        &self,
        manifest_id: i64,
        files: &[NewManifestFile],
    ) -> DbResult<Vec<String>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut upload_ids = Vec::with_capacity(files.len());

        for file in files {
            let upload_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO manifest_files (
                    manifest_id, upload_id, source_path, target_path, target_name,
                    status, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
            )
            .bind(manifest_id)
            .bind(&upload_id)
            .bind(&file.source_path)
            .bind(&file.target_path)
            .bind(&file.target_name)
            .bind(FileStatus::Local.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            upload_ids.push(upload_id);
        }

        tx.commit().await?;
        Ok(upload_ids)
    }

    /// Lazily stream a manifest's rows in a given status, ordered by id.
    ///
    /// Rows are pulled from the database as the consumer polls, so a slow
    /// consumer never holds the whole result set in memory.
    pub fn stream_files_by_status(
        &self,
        manifest_id: i64,
        status: FileStatus,
    ) -> BoxStream<'_, DbResult<ManifestFile>> {
        sqlx::query_as::<_, ManifestFile>(
            "SELECT id, manifest_id, upload_id, source_path, target_path, target_name, \
             status, created_at, updated_at \
             FROM manifest_files WHERE manifest_id = ?1 AND status = ?2 ORDER BY id",
        )
        .bind(manifest_id)
        .bind(status.as_str())
        .fetch(&self.pool)
        .map(|row| row.map_err(DbError::from))
        .boxed()
    }

    /// One keyset page of a manifest's rows in a given status
    pub async fn list_files_by_status(
        &self,
        manifest_id: i64,
        status: FileStatus,
        after_id: i64,
        limit: i64,
    ) -> DbResult<Vec<ManifestFile>> {
        let files = sqlx::query_as::<_, ManifestFile>(&format!(
            "SELECT {} FROM manifest_files \
             WHERE manifest_id = ?1 AND status = ?2 AND id > ?3 \
             ORDER BY id LIMIT ?4",
            FILE_COLUMNS
        ))
        .bind(manifest_id)
        .bind(status.as_str())
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    pub async fn list_files(&self, manifest_id: i64) -> DbResult<Vec<ManifestFile>> {
        let files = sqlx::query_as::<_, ManifestFile>(&format!(
            "SELECT {} FROM manifest_files WHERE manifest_id = ?1 ORDER BY id",
            FILE_COLUMNS
        ))
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    pub async fn get_file(&self, upload_id: &str) -> DbResult<Option<ManifestFile>> {
        let file = sqlx::query_as::<_, ManifestFile>(&format!(
            "SELECT {} FROM manifest_files WHERE upload_id = ?1",
            FILE_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    /// Set `status` on every row whose upload id is listed.
    ///
    /// Pipeline transitions only apply from their source state: `Registered`
    /// promotes `Local` rows, `Uploaded` and `Failed` settle `Registered`
    /// rows, and `Verified` accepts `Registered` or `Uploaded` rows. Anything
    /// reset, removed or already settled in the meantime is left alone.
    /// Returns the number of rows changed.
    pub async fn set_status_bulk(&self, upload_ids: &[String], status: FileStatus) -> DbResult<u64> {
        let mut updated = 0;
        let now = Utc::now();

        for chunk in upload_ids.chunks(BULK_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE manifest_files SET status = ");
            builder.push_bind(status.as_str());
            builder.push(", updated_at = ");
            builder.push_bind(now);
            builder.push(" WHERE upload_id IN (");
            let mut separated = builder.separated(", ");
            for upload_id in chunk {
                separated.push_bind(upload_id.as_str());
            }
            separated.push_unseparated(")");

            let sources = allowed_sources(status);
            if !sources.is_empty() {
                builder.push(" AND status IN (");
                let mut separated = builder.separated(", ");
                for source in sources {
                    separated.push_bind(source.as_str());
                }
                separated.push_unseparated(")");
            }

            updated += builder.build().execute(&self.pool).await?.rows_affected();
        }

        Ok(updated)
    }

    /// Put every row of the manifest back to `Local`
    pub async fn reset_status_for_manifest(&self, manifest_id: i64) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE manifest_files SET status = ?1, updated_at = ?2 WHERE manifest_id = ?3",
        )
        .bind(FileStatus::Local.as_str())
        .bind(Utc::now())
        .bind(manifest_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            manifest_id,
            rows = result.rows_affected(),
            "Manifest files reset to local"
        );

        Ok(result.rows_affected())
    }

    /// Drop rows whose source path starts with `path_prefix`.
    ///
    /// `Local` rows are deleted, `Registered` rows become `Removed` until the
    /// platform confirms. The prefix is compared literally, so `%` and `_`
    /// have no special meaning.
    pub async fn remove_from_manifest(
        &self,
        manifest_id: i64,
        path_prefix: &str,
    ) -> DbResult<RemovalSummary> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM manifest_files
            WHERE manifest_id = ?1
              AND status = ?2
              AND substr(source_path, 1, length(?3)) = ?3
            "#,
        )
        .bind(manifest_id)
        .bind(FileStatus::Local.as_str())
        .bind(path_prefix)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let marked_removed = sqlx::query(
            r#"
            UPDATE manifest_files
            SET status = ?1, updated_at = ?2
            WHERE manifest_id = ?3
              AND status = ?4
              AND substr(source_path, 1, length(?5)) = ?5
            "#,
        )
        .bind(FileStatus::Removed.as_str())
        .bind(Utc::now())
        .bind(manifest_id)
        .bind(FileStatus::Registered.as_str())
        .bind(path_prefix)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::info!(
            manifest_id,
            path_prefix,
            deleted,
            marked_removed,
            "Removed files from manifest"
        );

        Ok(RemovalSummary {
            deleted,
            marked_removed,
        })
    }

    /// Delete `Removed` rows the platform has confirmed gone
    pub async fn delete_confirmed_removals(&self, upload_ids: &[String]) -> DbResult<u64> {
        let mut deleted = 0;

        for chunk in upload_ids.chunks(BULK_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM manifest_files WHERE status = ");
            builder.push_bind(FileStatus::Removed.as_str());
            builder.push(" AND upload_id IN (");
            let mut separated = builder.separated(", ");
            for upload_id in chunk {
                separated.push_bind(upload_id.as_str());
            }
            separated.push_unseparated(")");

            deleted += builder.build().execute(&self.pool).await?.rows_affected();
        }

        Ok(deleted)
    }

    pub async fn count_by_status(&self, manifest_id: i64) -> DbResult<HashMap<FileStatus, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM manifest_files WHERE manifest_id = ?1 GROUP BY status",
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (label, count) in rows {
            *counts.entry(FileStatus::from_label(&label)).or_insert(0) += count;
        }
        Ok(counts)
    }
}
