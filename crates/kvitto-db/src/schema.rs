//! Reference DDL for the kvitto tables.
//!
//! Production schema management is handled by external migration tooling;
//! this copy exists so integration tests can install the tables into an
//! isolated schema.

/// Complete table DDL, executable statement by statement.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE documents (
    id UUID PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'collected',
    content_hash TEXT NOT NULL UNIQUE,
    source_path TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    stored_filename TEXT NOT NULL,
    mime_type TEXT NOT NULL DEFAULT '',
    size_bytes BIGINT,
    raw_text TEXT,
    raw_text_hash TEXT,
    source TEXT NOT NULL,
    provider_message_id TEXT,
    provider_attachment_id TEXT,
    sender TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL DEFAULT '',
    received_at TIMESTAMPTZ,
    brand JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX documents_provider_attachment_idx
    ON documents (provider_attachment_id)
    WHERE provider_attachment_id IS NOT NULL;

CREATE INDEX documents_state_created_idx ON documents (state, created_at);

CREATE TABLE document_lines (
    id UUID PRIMARY KEY,
    document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    line_no INTEGER NOT NULL,
    text TEXT NOT NULL,
    embedding vector,
    UNIQUE (document_id, line_no)
);

CREATE TABLE brands (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    website TEXT NOT NULL DEFAULT '',
    metadata JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX brands_name_lower_idx ON brands (LOWER(name));

CREATE TABLE brand_aliases (
    id UUID PRIMARY KEY,
    brand_id UUID NOT NULL REFERENCES brands(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    embedding vector,
    UNIQUE (brand_id, alias)
);

CREATE TABLE processing_events (
    id UUID PRIMARY KEY,
    document_id UUID REFERENCES documents(id) ON DELETE SET NULL,
    step TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ,
    duration_ms BIGINT,
    message TEXT NOT NULL DEFAULT ''
);

CREATE INDEX processing_events_document_idx
    ON processing_events (document_id, started_at);

CREATE TABLE job_runs (
    id UUID PRIMARY KEY,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    params JSONB NOT NULL DEFAULT '{}',
    metrics JSONB NOT NULL DEFAULT '{}',
    log_path TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ
);

CREATE INDEX job_runs_name_started_idx ON job_runs (job_name, started_at);
"#;
