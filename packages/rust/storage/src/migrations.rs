//! SQL migration definitions for the ReconPipe database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as a batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: domains, targets, sources, maps, prompts, pretexts, jobs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Primary domains under assessment
CREATE TABLE IF NOT EXISTS domains (
    name         TEXT PRIMARY KEY,
    mx           TEXT,
    spf          TEXT,
    dmarc        TEXT,
    email_format TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- Third-party domains hosting discovered sources
CREATE TABLE IF NOT EXISTS source_domains (
    name       TEXT PRIMARY KEY,
    mx         TEXT,
    spf        TEXT,
    dmarc      TEXT,
    created_at TEXT NOT NULL
);

-- Contacts being enriched
CREATE TABLE IF NOT EXISTS targets (
    email        TEXT PRIMARY KEY,
    name         TEXT,
    profile      TEXT,
    domain_name  TEXT NOT NULL REFERENCES domains(name),
    tenure_start TEXT,
    status       TEXT NOT NULL DEFAULT 'pending',
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_targets_domain ON targets(domain_name);

-- Discovered URLs to scrape; url is globally unique (idempotent re-discovery)
CREATE TABLE IF NOT EXISTS sources (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    url                TEXT NOT NULL UNIQUE,
    source_domain_name TEXT NOT NULL REFERENCES source_domains(name),
    discovery_method   TEXT,
    data               TEXT,
    status             TEXT NOT NULL DEFAULT 'pending',
    status_message     TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_status ON sources(status);

-- Many-to-many join; duplicate pairs suppressed
CREATE TABLE IF NOT EXISTS target_sources (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    target_email TEXT NOT NULL REFERENCES targets(email),
    source_id    INTEGER NOT NULL REFERENCES sources(id),
    UNIQUE(target_email, source_id)
);

CREATE INDEX IF NOT EXISTS idx_target_sources_source ON target_sources(source_id);

-- Pretext prompt templates
CREATE TABLE IF NOT EXISTS prompts (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT NOT NULL UNIQUE,
    template TEXT NOT NULL,
    dos      TEXT,
    donts    TEXT
);

-- Drafted pretexts awaiting review
CREATE TABLE IF NOT EXISTS pretexts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    target_email TEXT NOT NULL REFERENCES targets(email),
    prompt_id    INTEGER NOT NULL REFERENCES prompts(id),
    prompt_text  TEXT NOT NULL,
    subject      TEXT NOT NULL,
    body         TEXT NOT NULL,
    link         TEXT,
    status       TEXT NOT NULL DEFAULT 'draft',
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pretexts_target ON pretexts(target_email);

-- Durable stage-queue jobs
CREATE TABLE IF NOT EXISTS jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stage       TEXT NOT NULL,
    dedupe_key  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'queued',
    error       TEXT,
    attempts    INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_stage_state ON jobs(stage, state);

-- Dedupe: a second logically-identical job may not coexist with an
-- unfinished one, but re-queue after completion is allowed.
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_dedupe
    ON jobs(stage, dedupe_key) WHERE state IN ('queued', 'active');

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
