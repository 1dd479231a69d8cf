//! libSQL entity store for the recon pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding domains, targets,
//! sources, target/source maps, prompts, pretexts, and the durable job table
//! backing the stage queues.
//!
//! **Write discipline:** no multi-statement transactions. Correctness under
//! concurrent writers comes from idempotent conflict-tolerant upserts and
//! conditional status-transition updates (`WHERE status ...`).

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use reconpipe_shared::{
    Domain, PipelineError, Pretext, PretextStatus, Prompt, Result, SourceData, SourceStatus,
    Target, TargetStatus,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// A job claimed from the durable queue table.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    pub stage: String,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        storage.requeue_orphaned_jobs().await?;
        Ok(storage)
    }

    /// Requeue jobs a previous process left `active`. This is a single-broker
    /// queue, so any active row at open time belongs to a dead worker, and
    /// delivery is at-least-once.
    async fn requeue_orphaned_jobs(&self) -> Result<()> {
        let requeued = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'queued', started_at = NULL WHERE state = 'active'",
                params![],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        if requeued > 0 {
            tracing::warn!(requeued, "requeued jobs orphaned by a previous run");
        }
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PipelineError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Domain operations
    // -----------------------------------------------------------------------

    /// Upsert a domain by name. Returns `true` if the row was newly created.
    pub async fn upsert_domain(&self, name: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "INSERT INTO domains (name, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Write DNS lookup results onto a domain.
    pub async fn update_domain_dns(
        &self,
        name: &str,
        mx: Option<&str>,
        spf: Option<&str>,
        dmarc: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE domains SET mx = ?2, spf = ?3, dmarc = ?4, updated_at = ?5 WHERE name = ?1",
                params![name, mx, spf, dmarc, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Record the email address pattern reported by contact discovery.
    pub async fn set_domain_email_format(&self, name: &str, format: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE domains SET email_format = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, format, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a domain by name.
    pub async fn get_domain(&self, name: &str) -> Result<Option<Domain>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, mx, spf, dmarc, email_format FROM domains WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_domain(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// List all known domains.
    pub async fn list_domains(&self) -> Result<Vec<Domain>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, mx, spf, dmarc, email_format FROM domains ORDER BY name",
                params![],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_domain(&row)?);
        }
        Ok(results)
    }

    /// Upsert a source-hosting domain by name.
    pub async fn upsert_source_domain(&self, name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO source_domains (name, created_at) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Target operations
    // -----------------------------------------------------------------------

    /// Upsert a target by email. Conflict-tolerant: repeated discovery runs
    /// keep the earliest tenure_start and never blank an existing name.
    pub async fn upsert_target(
        &self,
        email: &str,
        name: Option<&str>,
        domain_name: &str,
        tenure_start: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tenure = tenure_start.map(|t| t.to_rfc3339());
        self.conn
            .execute(
                "INSERT INTO targets (email, name, domain_name, tenure_start, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
                 ON CONFLICT(email) DO UPDATE SET
                   name = COALESCE(name, excluded.name),
                   tenure_start = CASE
                     WHEN tenure_start IS NULL THEN excluded.tenure_start
                     WHEN excluded.tenure_start IS NULL THEN tenure_start
                     WHEN excluded.tenure_start < tenure_start THEN excluded.tenure_start
                     ELSE tenure_start
                   END,
                   updated_at = excluded.updated_at",
                params![email, name, domain_name, tenure.as_deref(), now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a target by email.
    pub async fn get_target(&self, email: &str) -> Result<Option<Target>> {
        let mut rows = self
            .conn
            .query(
                "SELECT email, name, profile, domain_name, tenure_start, status
                 FROM targets WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_target(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// List all targets belonging to a domain.
    pub async fn list_targets_by_domain(&self, domain_name: &str) -> Result<Vec<Target>> {
        let mut rows = self
            .conn
            .query(
                "SELECT email, name, profile, domain_name, tenure_start, status
                 FROM targets WHERE domain_name = ?1 ORDER BY email",
                params![domain_name],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_target(&row)?);
        }
        Ok(results)
    }

    /// Store the synthesized profile text on a target.
    pub async fn set_target_profile(&self, email: &str, profile: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE targets SET profile = ?2, updated_at = ?3 WHERE email = ?1",
                params![email, profile, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Conditionally transition a target to `enriched`.
    ///
    /// The `status <> 'enriched'` guard makes repeated convergence evaluation
    /// after the transition a no-op, never a double-fire.
    pub async fn mark_target_enriched(&self, email: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE targets SET status = 'enriched', updated_at = ?2
                 WHERE email = ?1 AND status <> 'enriched'",
                params![email, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Count mapped sources for a target: `(total, still_pending)`.
    pub async fn source_counts_for_target(&self, email: &str) -> Result<(i64, i64)> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN s.status = 'pending' OR s.status = 'processing' THEN 1 END)
                 FROM target_sources m
                 JOIN sources s ON s.id = m.source_id
                 WHERE m.target_email = ?1",
                params![email],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let total: i64 = row
                    .get(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                let pending: i64 = row
                    .get(1)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                Ok((total, pending))
            }
            Ok(None) => Ok((0, 0)),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Source operations
    // -----------------------------------------------------------------------

    /// Upsert a source by its globally unique URL.
    ///
    /// Re-discovery of the same URL resolves to the existing row (id and
    /// current status are returned), never a duplicate.
    pub async fn upsert_source(
        &self,
        url: &str,
        source_domain_name: &str,
        discovery_method: Option<&str>,
    ) -> Result<(i64, SourceStatus)> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO sources (url, source_domain_name, discovery_method, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
                 ON CONFLICT(url) DO UPDATE SET
                   discovery_method = COALESCE(discovery_method, excluded.discovery_method),
                   updated_at = excluded.updated_at
                 RETURNING id, status",
                params![url, source_domain_name, discovery_method, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: i64 = row
                    .get(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                let status: String = row
                    .get(1)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                Ok((id, status.parse()?))
            }
            Ok(None) => Err(PipelineError::Storage(
                "source upsert returned no row".into(),
            )),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Get a source by id.
    pub async fn get_source(&self, id: i64) -> Result<Option<SourceData>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, source_domain_name, discovery_method, data, status, status_message
                 FROM sources WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_source(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Get a source by URL.
    pub async fn get_source_by_url(&self, url: &str) -> Result<Option<SourceData>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, source_domain_name, discovery_method, data, status, status_message
                 FROM sources WHERE url = ?1",
                params![url],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_source(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Transition a source `pending → processing`. No-op on any other state.
    pub async fn mark_source_processing(&self, id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET status = 'processing', status_message = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Transition a source to terminal `mined` with its payload.
    ///
    /// Guarded so an already-terminal row never regresses.
    pub async fn mark_source_mined(
        &self,
        id: i64,
        data: &serde_json::Value,
        status_message: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let payload = data.to_string();
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET status = 'mined', data = ?2, status_message = ?3, updated_at = ?4
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id, payload.as_str(), status_message, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Transition a source to terminal `failed` with a diagnostic message.
    pub async fn mark_source_failed(&self, id: i64, status_message: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET status = 'failed', status_message = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id, status_message, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Explicit re-scrape request: reset a terminal source back to `pending`.
    pub async fn reset_source(&self, id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET status = 'pending', data = NULL, status_message = NULL, updated_at = ?2
                 WHERE id = ?1 AND status IN ('mined', 'failed')",
                params![id, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Emails of every target mapped to a source.
    pub async fn target_emails_for_source(&self, source_id: i64) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT target_email FROM target_sources WHERE source_id = ?1 ORDER BY target_email",
                params![source_id],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(
                row.get::<String>(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
            );
        }
        Ok(results)
    }

    /// Mined payloads for every source mapped to a target.
    pub async fn mined_payloads_for_target(&self, email: &str) -> Result<Vec<serde_json::Value>> {
        let mut rows = self
            .conn
            .query(
                "SELECT s.data FROM target_sources m
                 JOIN sources s ON s.id = m.source_id
                 WHERE m.target_email = ?1 AND s.status = 'mined' AND s.data IS NOT NULL
                 ORDER BY s.id",
                params![email],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let raw: String = row
                .get(0)
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            let value = serde_json::from_str(&raw)
                .map_err(|e| PipelineError::Storage(format!("corrupt source payload: {e}")))?;
            results.push(value);
        }
        Ok(results)
    }

    /// Find a direct profile URL on `platform_suffix` known for any target
    /// mapped to `source_id`, excluding the source itself. Used by the
    /// search-redirect substitution rule.
    pub async fn find_direct_profile_url(
        &self,
        source_id: i64,
        platform_suffix: &str,
    ) -> Result<Option<String>> {
        let pattern = format!("%{platform_suffix}");
        let mut rows = self
            .conn
            .query(
                "SELECT s2.url FROM sources s2
                 JOIN target_sources m2 ON m2.source_id = s2.id
                 WHERE m2.target_email IN
                       (SELECT target_email FROM target_sources WHERE source_id = ?1)
                   AND s2.id <> ?1
                   AND s2.source_domain_name LIKE ?2
                 ORDER BY s2.id
                 LIMIT 1",
                params![source_id, pattern.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Link a target to a source. Duplicate pairs are suppressed; returns
    /// `true` only when a new link row was created.
    pub async fn link_target_source(&self, target_email: &str, source_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO target_sources (target_email, source_id) VALUES (?1, ?2)",
                params![target_email, source_id],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Prompt & pretext operations
    // -----------------------------------------------------------------------

    /// Upsert a prompt template by its unique name. Returns the prompt id.
    pub async fn upsert_prompt(
        &self,
        name: &str,
        template: &str,
        dos: Option<&str>,
        donts: Option<&str>,
    ) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO prompts (name, template, dos, donts) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                   template = excluded.template,
                   dos = excluded.dos,
                   donts = excluded.donts
                 RETURNING id",
                params![name, template, dos, donts],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| PipelineError::Storage(e.to_string())),
            Ok(None) => Err(PipelineError::Storage(
                "prompt upsert returned no row".into(),
            )),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Get a prompt by name.
    pub async fn get_prompt(&self, name: &str) -> Result<Option<Prompt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, template, dos, donts FROM prompts WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Prompt {
                id: row
                    .get(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
                name: row
                    .get(1)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
                template: row
                    .get(2)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
                dos: row.get::<String>(3).ok(),
                donts: row.get::<String>(4).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Insert a drafted pretext. Returns the pretext id.
    pub async fn insert_pretext(
        &self,
        target_email: &str,
        prompt_id: i64,
        prompt_text: &str,
        subject: &str,
        body: &str,
        link: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO pretexts (target_email, prompt_id, prompt_text, subject, body, link, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft', ?7)
                 RETURNING id",
                params![target_email, prompt_id, prompt_text, subject, body, link, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| PipelineError::Storage(e.to_string())),
            Ok(None) => Err(PipelineError::Storage(
                "pretext insert returned no row".into(),
            )),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Review a pretext. Only `draft` rows can move; anything else is rejected.
    pub async fn set_pretext_status(&self, id: i64, next: PretextStatus) -> Result<bool> {
        if !PretextStatus::Draft.can_transition_to(next) {
            return Err(PipelineError::validation(format!(
                "pretext cannot transition draft -> {next}"
            )));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE pretexts SET status = ?2 WHERE id = ?1 AND status = 'draft'",
                params![id, next.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// List pretexts drafted for a target.
    pub async fn list_pretexts_for_target(&self, email: &str) -> Result<Vec<Pretext>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, target_email, prompt_id, prompt_text, subject, body, link, status
                 FROM pretexts WHERE target_email = ?1 ORDER BY id",
                params![email],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_pretext(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Job queue operations
    // -----------------------------------------------------------------------

    /// Enqueue a job. Returns `None` when an unfinished logically-identical
    /// job (same stage + dedupe key, queued or active) suppressed the insert.
    pub async fn enqueue_job(
        &self,
        stage: &str,
        dedupe_key: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<i64>> {
        let now = Utc::now().to_rfc3339();
        let body = payload.to_string();
        let mut rows = self
            .conn
            .query(
                "INSERT OR IGNORE INTO jobs (stage, dedupe_key, payload, state, created_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4)
                 RETURNING id",
                params![stage, dedupe_key, body.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Enqueue(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<i64>(0)
                    .map_err(|e| PipelineError::Enqueue(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Enqueue(e.to_string())),
        }
    }

    /// Claim the oldest queued job for a stage, marking it active.
    pub async fn claim_job(&self, stage: &str) -> Result<Option<QueuedJob>> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "UPDATE jobs SET state = 'active', attempts = attempts + 1, started_at = ?2
                 WHERE id = (SELECT id FROM jobs WHERE stage = ?1 AND state = 'queued'
                             ORDER BY id LIMIT 1)
                 RETURNING id, stage, dedupe_key, payload, attempts",
                params![stage, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(3)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                let payload = serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::Storage(format!("corrupt job payload: {e}")))?;
                Ok(Some(QueuedJob {
                    id: row
                        .get(0)
                        .map_err(|e| PipelineError::Storage(e.to_string()))?,
                    stage: row
                        .get(1)
                        .map_err(|e| PipelineError::Storage(e.to_string()))?,
                    dedupe_key: row
                        .get(2)
                        .map_err(|e| PipelineError::Storage(e.to_string()))?,
                    payload,
                    attempts: row
                        .get(4)
                        .map_err(|e| PipelineError::Storage(e.to_string()))?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Mark an active job done, freeing its dedupe key.
    pub async fn complete_job(&self, id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE jobs SET state = 'done', finished_at = ?2 WHERE id = ?1",
                params![id, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark an active job failed with its error, freeing its dedupe key.
    /// No automatic retry: the stage handler owns translating this into
    /// entity state.
    pub async fn fail_job(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE jobs SET state = 'failed', error = ?2, finished_at = ?3 WHERE id = ?1",
                params![id, error, now.as_str()],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Queue bookkeeping state for a job: `(state, error)`.
    pub async fn get_job_state(&self, id: i64) -> Result<Option<(String, Option<String>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, error FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some((
                row.get::<String>(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
                row.get::<String>(1).ok(),
            ))),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Count jobs for a stage in a given state.
    pub async fn count_jobs(&self, stage: &str, state: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE stage = ?1 AND state = ?2",
                params![stage, state],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| PipelineError::Storage(e.to_string())),
            _ => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

fn row_to_domain(row: &libsql::Row) -> Result<Domain> {
    Ok(Domain {
        name: row
            .get::<String>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        mx: row.get::<String>(1).ok(),
        spf: row.get::<String>(2).ok(),
        dmarc: row.get::<String>(3).ok(),
        email_format: row.get::<String>(4).ok(),
    })
}

fn row_to_target(row: &libsql::Row) -> Result<Target> {
    let status: String = row
        .get(5)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
    Ok(Target {
        email: row
            .get::<String>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        name: row.get::<String>(1).ok(),
        profile: row.get::<String>(2).ok(),
        domain_name: row
            .get::<String>(3)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        tenure_start: match row.get::<String>(4).ok() {
            Some(s) => Some(
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))?,
            ),
            None => None,
        },
        status: status.parse::<TargetStatus>()?,
    })
}

fn row_to_source(row: &libsql::Row) -> Result<SourceData> {
    let status: String = row
        .get(5)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
    Ok(SourceData {
        id: row
            .get::<i64>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        url: row
            .get::<String>(1)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        source_domain_name: row
            .get::<String>(2)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        discovery_method: row.get::<String>(3).ok(),
        data: match row.get::<String>(4).ok() {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::Storage(format!("corrupt source payload: {e}")))?,
            ),
            None => None,
        },
        status: status.parse::<SourceStatus>()?,
        status_message: row.get::<String>(6).ok(),
    })
}

fn row_to_pretext(row: &libsql::Row) -> Result<Pretext> {
    let status: String = row
        .get(7)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
    Ok(Pretext {
        id: row
            .get::<i64>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        target_email: row
            .get::<String>(1)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        prompt_id: row
            .get::<i64>(2)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        prompt_text: row
            .get::<String>(3)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        subject: row
            .get::<String>(4)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        body: row
            .get::<String>(5)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        link: row.get::<String>(6).ok(),
        status: status.parse::<PretextStatus>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!(
            "rp_test_{}_{}.db",
            std::process::id(),
            uuid_like()
        ));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn uuid_like() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn domain_upsert_is_idempotent() {
        let storage = test_storage().await;
        assert!(storage.upsert_domain("acme.test").await.unwrap());
        assert!(!storage.upsert_domain("acme.test").await.unwrap());

        storage
            .update_domain_dns(
                "acme.test",
                Some("mx1.acme.test"),
                Some("v=spf1 -all"),
                Some("v=DMARC1; p=reject"),
            )
            .await
            .unwrap();
        storage
            .set_domain_email_format("acme.test", "{first}.{last}")
            .await
            .unwrap();

        let domain = storage.get_domain("acme.test").await.unwrap().unwrap();
        assert_eq!(domain.mx.as_deref(), Some("mx1.acme.test"));
        assert_eq!(domain.email_format.as_deref(), Some("{first}.{last}"));
        assert_eq!(storage.list_domains().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn target_upsert_keeps_earliest_tenure_and_name() {
        let storage = test_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();

        let later = chrono::Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let earlier = chrono::Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap();

        storage
            .upsert_target("jdoe@acme.test", Some("Jane Doe"), "acme.test", Some(later))
            .await
            .unwrap();
        // Second discovery run: no name, but an earlier first-seen date.
        storage
            .upsert_target("jdoe@acme.test", None, "acme.test", Some(earlier))
            .await
            .unwrap();

        let target = storage.get_target("jdoe@acme.test").await.unwrap().unwrap();
        assert_eq!(target.name.as_deref(), Some("Jane Doe"));
        assert_eq!(target.tenure_start, Some(earlier));
        assert_eq!(target.status, TargetStatus::Pending);

        assert_eq!(
            storage.list_targets_by_domain("acme.test").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn source_url_is_globally_unique() {
        let storage = test_storage().await;
        storage.upsert_source_domain("social.example").await.unwrap();

        let (id1, status1) = storage
            .upsert_source("https://social.example/in/jdoe", "social.example", Some("search"))
            .await
            .unwrap();
        let (id2, _) = storage
            .upsert_source("https://social.example/in/jdoe", "social.example", Some("api"))
            .await
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(status1, SourceStatus::Pending);

        let source = storage.get_source(id1).await.unwrap().unwrap();
        // first discovery method wins
        assert_eq!(source.discovery_method.as_deref(), Some("search"));
    }

    #[tokio::test]
    async fn duplicate_map_pairs_are_suppressed() {
        let storage = test_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();
        storage.upsert_source_domain("social.example").await.unwrap();
        storage
            .upsert_target("jdoe@acme.test", None, "acme.test", None)
            .await
            .unwrap();
        let (sid, _) = storage
            .upsert_source("https://social.example/in/jdoe", "social.example", None)
            .await
            .unwrap();

        assert!(storage.link_target_source("jdoe@acme.test", sid).await.unwrap());
        assert!(!storage.link_target_source("jdoe@acme.test", sid).await.unwrap());

        let (total, pending) = storage.source_counts_for_target("jdoe@acme.test").await.unwrap();
        assert_eq!((total, pending), (1, 1));
    }

    #[tokio::test]
    async fn source_status_is_monotonic() {
        let storage = test_storage().await;
        storage.upsert_source_domain("social.example").await.unwrap();
        let (sid, _) = storage
            .upsert_source("https://social.example/in/jdoe", "social.example", None)
            .await
            .unwrap();

        assert!(storage.mark_source_processing(sid).await.unwrap());
        // already processing: no-op
        assert!(!storage.mark_source_processing(sid).await.unwrap());

        let payload = serde_json::json!({"content": "# Jane"});
        assert!(storage.mark_source_mined(sid, &payload, None).await.unwrap());
        // terminal rows never regress
        assert!(!storage.mark_source_failed(sid, "late failure").await.unwrap());
        assert!(!storage.mark_source_mined(sid, &payload, None).await.unwrap());

        let source = storage.get_source(sid).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Mined);
        assert_eq!(source.data.unwrap()["content"], "# Jane");

        // explicit re-scrape resets to pending and clears the payload
        assert!(storage.reset_source(sid).await.unwrap());
        let source = storage.get_source(sid).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Pending);
        assert!(source.data.is_none());
    }

    #[tokio::test]
    async fn target_enrichment_transition_fires_once() {
        let storage = test_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();
        storage
            .upsert_target("jdoe@acme.test", None, "acme.test", None)
            .await
            .unwrap();

        assert!(storage.mark_target_enriched("jdoe@acme.test").await.unwrap());
        // second evaluation after convergence is a no-op
        assert!(!storage.mark_target_enriched("jdoe@acme.test").await.unwrap());

        let target = storage.get_target("jdoe@acme.test").await.unwrap().unwrap();
        assert_eq!(target.status, TargetStatus::Enriched);
    }

    #[tokio::test]
    async fn job_dedupe_blocks_live_duplicates_only() {
        let storage = test_storage().await;
        let payload = serde_json::json!({"sourceId": 1});

        let first = storage
            .enqueue_job("scrape", "https://a.example/x", &payload)
            .await
            .unwrap();
        assert!(first.is_some());

        // identical live job suppressed
        let second = storage
            .enqueue_job("scrape", "https://a.example/x", &payload)
            .await
            .unwrap();
        assert!(second.is_none());

        // claim + complete frees the key
        let job = storage.claim_job("scrape").await.unwrap().unwrap();
        assert_eq!(job.id, first.unwrap());
        assert_eq!(job.attempts, 1);
        storage.complete_job(job.id).await.unwrap();

        let third = storage
            .enqueue_job("scrape", "https://a.example/x", &payload)
            .await
            .unwrap();
        assert!(third.is_some());
        assert_ne!(third, first);
    }

    #[tokio::test]
    async fn job_failure_is_bookkept_without_retry() {
        let storage = test_storage().await;
        let payload = serde_json::json!({"domain": "acme.test"});
        storage.enqueue_job("dns", "acme.test", &payload).await.unwrap();

        let job = storage.claim_job("dns").await.unwrap().unwrap();
        storage.fail_job(job.id, "resolver unreachable").await.unwrap();

        let (state, error) = storage.get_job_state(job.id).await.unwrap().unwrap();
        assert_eq!(state, "failed");
        assert_eq!(error.as_deref(), Some("resolver unreachable"));

        // nothing left to claim
        assert!(storage.claim_job("dns").await.unwrap().is_none());
        assert_eq!(storage.count_jobs("dns", "failed").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_is_fifo_per_stage() {
        let storage = test_storage().await;
        for n in 1..=3 {
            storage
                .enqueue_job("dns", &format!("d{n}.test"), &serde_json::json!({"n": n}))
                .await
                .unwrap();
        }

        let a = storage.claim_job("dns").await.unwrap().unwrap();
        let b = storage.claim_job("dns").await.unwrap().unwrap();
        assert!(a.id < b.id);
        assert_eq!(a.payload["n"], 1);
        assert_eq!(b.payload["n"], 2);
    }

    #[tokio::test]
    async fn reopen_requeues_orphaned_active_jobs() {
        let tmp = std::env::temp_dir().join(format!(
            "rp_orphan_test_{}_{}.db",
            std::process::id(),
            uuid_like()
        ));

        let storage = Storage::open(&tmp).await.expect("open test db");
        let payload = serde_json::json!({"domain": "acme.test"});
        storage.enqueue_job("dns", "acme.test", &payload).await.unwrap();
        let job = storage.claim_job("dns").await.unwrap().unwrap();
        assert!(storage.claim_job("dns").await.unwrap().is_none());
        drop(storage);

        // A worker died mid-job; the next process redelivers it.
        let storage = Storage::open(&tmp).await.expect("reopen test db");
        let redelivered = storage.claim_job("dns").await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempts, 2);
    }

    #[tokio::test]
    async fn direct_profile_url_lookup() {
        let storage = test_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();
        storage.upsert_source_domain("linkedin.com").await.unwrap();
        storage.upsert_source_domain("google.com").await.unwrap();
        storage
            .upsert_target("jdoe@acme.test", None, "acme.test", None)
            .await
            .unwrap();

        let (direct, _) = storage
            .upsert_source("https://linkedin.com/in/jdoe", "linkedin.com", None)
            .await
            .unwrap();
        let (redirect, _) = storage
            .upsert_source(
                "https://google.com/search?q=jdoe+linkedin",
                "google.com",
                None,
            )
            .await
            .unwrap();
        storage.link_target_source("jdoe@acme.test", direct).await.unwrap();
        storage.link_target_source("jdoe@acme.test", redirect).await.unwrap();

        let found = storage
            .find_direct_profile_url(redirect, "linkedin.com")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("https://linkedin.com/in/jdoe"));

        // nothing on an unrelated platform
        let none = storage
            .find_direct_profile_url(redirect, "github.com")
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn prompt_and_pretext_lifecycle() {
        let storage = test_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();
        storage
            .upsert_target("jdoe@acme.test", None, "acme.test", None)
            .await
            .unwrap();

        let pid = storage
            .upsert_prompt("it-update", "Write to {{name}}", Some("be brief"), None)
            .await
            .unwrap();
        // upsert by name keeps the id
        let pid2 = storage
            .upsert_prompt("it-update", "Write to {{name}} about {{topic}}", None, None)
            .await
            .unwrap();
        assert_eq!(pid, pid2);

        let prompt = storage.get_prompt("it-update").await.unwrap().unwrap();
        assert!(prompt.template.contains("{{topic}}"));

        let pretext_id = storage
            .insert_pretext(
                "jdoe@acme.test",
                pid,
                "rendered prompt",
                "Quarterly access review",
                "Hi Jane, ...",
                Some("https://awareness.acme.test/t/1"),
            )
            .await
            .unwrap();

        let pretexts = storage.list_pretexts_for_target("jdoe@acme.test").await.unwrap();
        assert_eq!(pretexts.len(), 1);
        assert_eq!(pretexts[0].status, PretextStatus::Draft);

        assert!(storage
            .set_pretext_status(pretext_id, PretextStatus::Approved)
            .await
            .unwrap());
        // already reviewed
        assert!(!storage
            .set_pretext_status(pretext_id, PretextStatus::Rejected)
            .await
            .unwrap());
    }
}
