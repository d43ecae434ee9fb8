#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use decision_intel_core::{
    format_rfc3339, now_utc, BaselineKey, CalibrationBin, CalibrationBucket, CausalAnalysis,
    DecisionId, DecisionRuleset, DecisionTrace, EvidenceSignature, FeedbackEntry, FeedbackKind,
    IndexedDecision, MetricSample, SearchScope,
};
use decision_intel_store::{
    CalibrationStore, CausalEdgeSink, DecisionIndexStore, FeedbackLedger, FeedbackUpsert,
    MetricStore, Series,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use time::OffsetDateTime;

const DECISION_MIGRATION_VERSION: i64 = 1;
const AVERAGE_DRIFT_TOLERANCE: f64 = 1e-6;

const SCHEMA_DECISION_V1: &str = r"
CREATE TABLE IF NOT EXISTS decision_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metric_samples (
  tenant_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  metric_name TEXT NOT NULL,
  ts_unix_nanos INTEGER NOT NULL,
  ts TEXT NOT NULL,
  value REAL NOT NULL,
  ingested_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, entity_id, metric_name, ts_unix_nanos)
);

CREATE TRIGGER IF NOT EXISTS trg_metric_samples_no_update
BEFORE UPDATE ON metric_samples
BEGIN
  SELECT RAISE(FAIL, 'metric_samples is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_samples_entity_window
  ON metric_samples(tenant_id, entity_id, ts_unix_nanos);

CREATE TABLE IF NOT EXISTS decision_traces (
  decision_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  embedding_json TEXT,
  context_json TEXT NOT NULL,
  feedback_score INTEGER NOT NULL DEFAULT 0,
  memory_hit_count INTEGER NOT NULL CHECK (memory_hit_count >= 0),
  causal_evidence_count INTEGER NOT NULL CHECK (causal_evidence_count >= 0),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decision_traces_tenant
  ON decision_traces(tenant_id, created_at);

CREATE TABLE IF NOT EXISTS feedback_entries (
  decision_id TEXT NOT NULL,
  operator_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('vote', 'rating')),
  value INTEGER NOT NULL,
  score INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (decision_id, operator_id),
  FOREIGN KEY (decision_id) REFERENCES decision_traces(decision_id)
);

CREATE TABLE IF NOT EXISTS calibration_bins (
  memory_hit_bucket INTEGER NOT NULL CHECK (memory_hit_bucket >= 0),
  causal_evidence_bucket INTEGER NOT NULL CHECK (causal_evidence_bucket >= 0),
  sample_count INTEGER NOT NULL CHECK (sample_count >= 0),
  running_avg_rating REAL NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (memory_hit_bucket, causal_evidence_bucket)
);

CREATE TABLE IF NOT EXISTS causal_edges (
  edge_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  cause_metric TEXT NOT NULL,
  effect_metric TEXT NOT NULL,
  p_value REAL NOT NULL CHECK (p_value BETWEEN 0.0 AND 1.0),
  lag INTEGER NOT NULL CHECK (lag >= 1),
  stationarity_fixed INTEGER NOT NULL CHECK (stationarity_fixed IN (0, 1)),
  f_statistic REAL NOT NULL,
  observations INTEGER NOT NULL,
  analyzed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_causal_edges_entity
  ON causal_edges(tenant_id, entity_id, effect_metric, analyzed_at);
";

/// SQLite-backed implementation of every store trait. The connection sits
/// behind a mutex so one handle can be shared across worker threads.
pub struct SqliteDecisionStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CalibrationReplayReport {
    pub contract_version: String,
    pub rebuilt_bins: usize,
    pub processed_ratings: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CalibrationIssue {
    pub code: String,
    pub severity: CalibrationIssueSeverity,
    pub bucket: Option<CalibrationBucket>,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CalibrationCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub ledger_ratings: usize,
    pub stored_bins: usize,
    pub issues: Vec<CalibrationIssue>,
}

impl SqliteDecisionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

            conn.execute_batch(SCHEMA_DECISION_V1)
                .context("failed to apply decision schema")?;

            conn.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DECISION_MIGRATION_VERSION, now_text()?],
            )
            .context("failed to register decision schema migration")?;
        }

        if self.ruleset(1)?.is_none() {
            self.upsert_ruleset(&DecisionRuleset::v1())?;
        }
        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &DecisionRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO decision_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now_text()?],
            )
            .context("failed to upsert ruleset")?;
        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, DecisionRuleset>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ruleset_version, ruleset_json
             FROM decision_rulesets
             ORDER BY ruleset_version ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            map.insert(version, decode_ruleset(version, &json)?);
        }
        Ok(map)
    }

    pub fn ruleset(&self, version: u32) -> Result<Option<DecisionRuleset>> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT ruleset_json FROM decision_rulesets WHERE ruleset_version = ?1",
                params![i64::from(version)],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load ruleset")?;
        json.map(|raw| decode_ruleset(version, &raw)).transpose()
    }

    pub fn count_samples(&self, key: &BaselineKey) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM metric_samples
                 WHERE tenant_id = ?1 AND entity_id = ?2 AND metric_name = ?3",
                params![key.tenant_id, key.entity_id, key.metric_name],
                |row| row.get(0),
            )
            .context("failed to count samples")?;
        usize::try_from(count).context("negative sample count")
    }

    pub fn list_decisions(&self, scope: &SearchScope, limit: usize) -> Result<Vec<DecisionTrace>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT decision_id, tenant_id, embedding_json, context_json, feedback_score,
                    memory_hit_count, causal_evidence_count, created_at
             FROM decision_traces
             WHERE ?1 IS NULL OR tenant_id = ?1
             ORDER BY created_at DESC, decision_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![scope_tenant(scope), i64::try_from(limit).unwrap_or(i64::MAX)],
            parse_trace_row,
        )?;
        collect_rows(rows)
    }

    /// Rebuilds every calibration bin from the rating entries of the ledger
    /// and the evidence signature recorded with each decision.
    pub fn replay_calibration(&self, ruleset: &DecisionRuleset) -> Result<CalibrationReplayReport> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start calibration replay transaction")?;

        let (bins, processed_ratings) = ledger_bins(&tx, ruleset)?;
        tx.execute("DELETE FROM calibration_bins", [])
            .context("failed to clear calibration bins")?;
        for bin in bins.values() {
            upsert_bin(&tx, bin)?;
        }
        tx.commit().context("failed to commit calibration replay")?;

        Ok(CalibrationReplayReport {
            contract_version: "calibration_replay.v1".to_string(),
            rebuilt_bins: bins.len(),
            processed_ratings,
        })
    }

    /// Compares stored bins with aggregates derived from the ledger.
    pub fn check_calibration(&self, ruleset: &DecisionRuleset) -> Result<CalibrationCheck> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start calibration check transaction")?;
        let (expected, ledger_ratings) = ledger_bins(&tx, ruleset)?;
        let stored = stored_bins(&tx)?
            .into_iter()
            .map(|bin| (bin.bucket(), bin))
            .collect::<BTreeMap<_, _>>();
        drop(tx);

        let mut issues = Vec::new();
        for (bucket, want) in &expected {
            match stored.get(bucket) {
                None => issues.push(CalibrationIssue {
                    code: "missing_bin".to_string(),
                    severity: CalibrationIssueSeverity::Error,
                    bucket: Some(*bucket),
                    message: format!(
                        "ledger holds {} ratings for bucket ({}, {}) but no bin is stored",
                        want.sample_count, bucket.memory_hit_bucket, bucket.causal_evidence_bucket
                    ),
                }),
                Some(have) if have.sample_count != want.sample_count => {
                    issues.push(CalibrationIssue {
                        code: "sample_count_drift".to_string(),
                        severity: CalibrationIssueSeverity::Error,
                        bucket: Some(*bucket),
                        message: format!(
                            "stored sample_count={} ledger sample_count={}",
                            have.sample_count, want.sample_count
                        ),
                    });
                }
                Some(have)
                    if (have.running_avg_rating - want.running_avg_rating).abs()
                        > AVERAGE_DRIFT_TOLERANCE =>
                {
                    issues.push(CalibrationIssue {
                        code: "average_drift".to_string(),
                        severity: CalibrationIssueSeverity::Error,
                        bucket: Some(*bucket),
                        message: format!(
                            "stored running_avg_rating={} ledger average={}",
                            have.running_avg_rating, want.running_avg_rating
                        ),
                    });
                }
                Some(_) => {}
            }
        }

        for (bucket, have) in &stored {
            if have.sample_count > 0 && !expected.contains_key(bucket) {
                issues.push(CalibrationIssue {
                    code: "orphan_bin".to_string(),
                    severity: CalibrationIssueSeverity::Warning,
                    bucket: Some(*bucket),
                    message: format!(
                        "bin holds {} samples without matching ledger ratings",
                        have.sample_count
                    ),
                });
            }
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == CalibrationIssueSeverity::Error);

        Ok(CalibrationCheck {
            contract_version: "calibration_check.v1".to_string(),
            healthy,
            ledger_ratings,
            stored_bins: stored.len(),
            issues,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl MetricStore for SqliteDecisionStore {
    fn append_sample(&self, sample: &MetricSample) -> Result<bool> {
        let inserted = self
            .conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO metric_samples(
                    tenant_id, entity_id, metric_name, ts_unix_nanos, ts, value, ingested_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sample.tenant_id,
                    sample.entity_id,
                    sample.metric_name,
                    unix_nanos(sample.timestamp)?,
                    format_rfc3339(sample.timestamp)?,
                    sample.value,
                    now_text()?,
                ],
            )
            .context("failed to append metric sample")?;
        Ok(inserted == 1)
    }

    fn recent_window(
        &self,
        key: &BaselineKey,
        before: OffsetDateTime,
        limit: usize,
    ) -> Result<Series> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts_unix_nanos, value FROM metric_samples
             WHERE tenant_id = ?1 AND entity_id = ?2 AND metric_name = ?3 AND ts_unix_nanos < ?4
             ORDER BY ts_unix_nanos DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                key.tenant_id,
                key.entity_id,
                key.metric_name,
                unix_nanos(before)?,
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            parse_point_row,
        )?;
        let mut window = collect_rows(rows)?;
        window.reverse();
        Ok(window)
    }

    fn entity_series(
        &self,
        tenant_id: &str,
        entity_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<BTreeMap<String, Series>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT metric_name, ts_unix_nanos, value FROM metric_samples
             WHERE tenant_id = ?1 AND entity_id = ?2 AND ts_unix_nanos BETWEEN ?3 AND ?4
             ORDER BY metric_name ASC, ts_unix_nanos ASC",
        )?;
        let rows = stmt.query_map(
            params![tenant_id, entity_id, unix_nanos(from)?, unix_nanos(to)?],
            |row| {
                let metric: String = row.get(0)?;
                let nanos: i64 = row.get(1)?;
                Ok((metric, from_unix_nanos(nanos, 1)?, row.get::<_, f64>(2)?))
            },
        )?;

        let mut series: BTreeMap<String, Series> = BTreeMap::new();
        for (metric, timestamp, value) in collect_rows(rows)? {
            series.entry(metric).or_default().push((timestamp, value));
        }
        Ok(series)
    }
}

impl DecisionIndexStore for SqliteDecisionStore {
    fn insert_decision(&self, trace: &DecisionTrace) -> Result<()> {
        let embedding_json = trace
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize embedding")?;
        let context_json =
            serde_json::to_string(&trace.context).context("failed to serialize context")?;

        self.conn
            .lock()
            .execute(
                "INSERT INTO decision_traces(
                    decision_id, tenant_id, embedding_json, context_json, feedback_score,
                    memory_hit_count, causal_evidence_count, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    trace.id.to_string(),
                    trace.tenant_id,
                    embedding_json,
                    context_json,
                    trace.feedback_score,
                    i64::from(trace.memory_hit_count),
                    i64::from(trace.causal_evidence_count),
                    format_rfc3339(trace.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert decision {}", trace.id))?;
        Ok(())
    }

    fn decision(&self, id: DecisionId) -> Result<Option<DecisionTrace>> {
        self.conn
            .lock()
            .query_row(
                "SELECT decision_id, tenant_id, embedding_json, context_json, feedback_score,
                        memory_hit_count, causal_evidence_count, created_at
                 FROM decision_traces WHERE decision_id = ?1",
                params![id.to_string()],
                parse_trace_row,
            )
            .optional()
            .with_context(|| format!("failed to load decision {id}"))
    }

    fn indexed_decisions(&self, scope: &SearchScope) -> Result<Vec<IndexedDecision>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT decision_id, tenant_id, embedding_json, context_json, feedback_score,
                    memory_hit_count, causal_evidence_count, created_at
             FROM decision_traces
             WHERE embedding_json IS NOT NULL AND (?1 IS NULL OR tenant_id = ?1)
             ORDER BY decision_id ASC",
        )?;
        let rows = stmt.query_map(params![scope_tenant(scope)], parse_trace_row)?;

        Ok(collect_rows(rows)?
            .into_iter()
            .filter_map(|trace| {
                Some(IndexedDecision {
                    id: trace.id,
                    tenant_id: trace.tenant_id,
                    embedding: trace.embedding?,
                    feedback_score: trace.feedback_score,
                    context: trace.context,
                })
            })
            .collect())
    }
}

impl FeedbackLedger for SqliteDecisionStore {
    fn upsert_feedback(&self, entry: &FeedbackEntry) -> Result<FeedbackUpsert> {
        entry
            .kind
            .validate()
            .map_err(|err| anyhow!("feedback validation failed: {err}"))?;

        let decision_id = entry.decision_id.to_string();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start feedback transaction")?;

        let signature = tx
            .query_row(
                "SELECT memory_hit_count, causal_evidence_count
                 FROM decision_traces WHERE decision_id = ?1",
                params![decision_id],
                |row| {
                    Ok(EvidenceSignature::new(
                        to_u32(row.get(0)?, 0)?,
                        to_u32(row.get(1)?, 1)?,
                    ))
                },
            )
            .optional()
            .context("failed to load decision signature")?
            .ok_or_else(|| anyhow!("unknown decision_id {decision_id}"))?;

        let previous = tx
            .query_row(
                "SELECT decision_id, operator_id, kind, value, score, recorded_at
                 FROM feedback_entries WHERE decision_id = ?1 AND operator_id = ?2",
                params![decision_id, entry.operator_id],
                parse_feedback_row,
            )
            .optional()
            .context("failed to load previous feedback")?;

        let (kind, value) = feedback_columns(entry.kind);
        tx.execute(
            "INSERT INTO feedback_entries(decision_id, operator_id, kind, value, score, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(decision_id, operator_id) DO UPDATE SET
               kind = excluded.kind,
               value = excluded.value,
               score = excluded.score,
               recorded_at = excluded.recorded_at",
            params![
                decision_id,
                entry.operator_id,
                kind,
                value,
                entry.score,
                format_rfc3339(entry.recorded_at)?,
            ],
        )
        .context("failed to upsert feedback entry")?;

        let feedback_score: i64 = tx
            .query_row(
                "SELECT COALESCE(SUM(score), 0) FROM feedback_entries WHERE decision_id = ?1",
                params![decision_id],
                |row| row.get(0),
            )
            .context("failed to aggregate feedback")?;
        tx.execute(
            "UPDATE decision_traces SET feedback_score = ?2 WHERE decision_id = ?1",
            params![decision_id, feedback_score],
        )
        .context("failed to update cached feedback score")?;

        tx.commit().context("failed to commit feedback transaction")?;

        Ok(FeedbackUpsert {
            entry: entry.clone(),
            previous,
            feedback_score,
            signature,
        })
    }

    fn feedback_for(&self, decision_id: DecisionId) -> Result<Vec<FeedbackEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT decision_id, operator_id, kind, value, score, recorded_at
             FROM feedback_entries WHERE decision_id = ?1
             ORDER BY operator_id ASC",
        )?;
        let rows = stmt.query_map(params![decision_id.to_string()], parse_feedback_row)?;
        collect_rows(rows)
    }
}

impl CalibrationStore for SqliteDecisionStore {
    fn calibration_bin(&self, bucket: CalibrationBucket) -> Result<Option<CalibrationBin>> {
        let conn = self.conn.lock();
        load_bin(&conn, bucket)
    }

    fn apply_rating_change(
        &self,
        bucket: CalibrationBucket,
        previous: Option<u8>,
        current: Option<u8>,
    ) -> Result<CalibrationBin> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start calibration transaction")?;

        let mut bin = load_bin(&tx, bucket)?.unwrap_or_else(|| CalibrationBin::empty(bucket));
        match (previous, current) {
            (None, None) => return Ok(bin),
            (None, Some(rating)) => bin.record(rating),
            (Some(old), Some(rating)) => bin.replace(old, rating),
            (Some(old), None) => bin.remove(old),
        }
        upsert_bin(&tx, &bin)?;
        tx.commit().context("failed to commit calibration update")?;
        Ok(bin)
    }

    fn calibration_bins(&self) -> Result<Vec<CalibrationBin>> {
        let conn = self.conn.lock();
        stored_bins(&conn)
    }
}

impl CausalEdgeSink for SqliteDecisionStore {
    fn record_causal_edges(
        &self,
        tenant_id: &str,
        analysis: &CausalAnalysis,
        analyzed_at: OffsetDateTime,
    ) -> Result<usize> {
        let analyzed_at = format_rfc3339(analyzed_at)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start causal edge transaction")?;
        for edge in &analysis.edges {
            tx.execute(
                "INSERT INTO causal_edges(
                    tenant_id, entity_id, cause_metric, effect_metric, p_value, lag,
                    stationarity_fixed, f_statistic, observations, analyzed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    tenant_id,
                    edge.entity_id,
                    edge.cause_metric,
                    edge.effect_metric,
                    edge.p_value,
                    i64::try_from(edge.lag).unwrap_or(i64::MAX),
                    i64::from(edge.stationarity_fixed),
                    edge.f_statistic,
                    i64::try_from(edge.observations).unwrap_or(i64::MAX),
                    analyzed_at,
                ],
            )
            .context("failed to record causal edge")?;
        }
        tx.commit().context("failed to commit causal edges")?;
        Ok(analysis.edges.len())
    }
}

fn ledger_bins(
    tx: &Transaction<'_>,
    ruleset: &DecisionRuleset,
) -> Result<(BTreeMap<CalibrationBucket, CalibrationBin>, usize)> {
    let mut stmt = tx.prepare(
        "SELECT traces.memory_hit_count, traces.causal_evidence_count, entries.value
         FROM feedback_entries entries
         JOIN decision_traces traces ON traces.decision_id = entries.decision_id
         WHERE entries.kind = 'rating'
         ORDER BY entries.decision_id ASC, entries.operator_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let signature = EvidenceSignature::new(to_u32(row.get(0)?, 0)?, to_u32(row.get(1)?, 1)?);
        let rating = u8::try_from(row.get::<_, i64>(2)?)
            .map_err(|_| conversion_error(2, rusqlite::types::Type::Integer, "invalid rating"))?;
        Ok((signature, rating))
    })?;

    let mut bins = BTreeMap::new();
    let mut processed = 0_usize;
    for (signature, rating) in collect_rows(rows)? {
        let bucket = signature.bucket(ruleset);
        bins.entry(bucket)
            .or_insert_with(|| CalibrationBin::empty(bucket))
            .record(rating);
        processed += 1;
    }
    Ok((bins, processed))
}

fn load_bin(conn: &Connection, bucket: CalibrationBucket) -> Result<Option<CalibrationBin>> {
    conn.query_row(
        "SELECT memory_hit_bucket, causal_evidence_bucket, sample_count, running_avg_rating
         FROM calibration_bins
         WHERE memory_hit_bucket = ?1 AND causal_evidence_bucket = ?2",
        params![
            i64::from(bucket.memory_hit_bucket),
            i64::from(bucket.causal_evidence_bucket)
        ],
        parse_bin_row,
    )
    .optional()
    .context("failed to load calibration bin")
}

fn stored_bins(conn: &Connection) -> Result<Vec<CalibrationBin>> {
    let mut stmt = conn.prepare(
        "SELECT memory_hit_bucket, causal_evidence_bucket, sample_count, running_avg_rating
         FROM calibration_bins
         ORDER BY memory_hit_bucket ASC, causal_evidence_bucket ASC",
    )?;
    let rows = stmt.query_map([], parse_bin_row)?;
    collect_rows(rows)
}

fn upsert_bin(conn: &Connection, bin: &CalibrationBin) -> Result<()> {
    conn.execute(
        "INSERT INTO calibration_bins(
            memory_hit_bucket, causal_evidence_bucket, sample_count, running_avg_rating, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(memory_hit_bucket, causal_evidence_bucket) DO UPDATE SET
           sample_count = excluded.sample_count,
           running_avg_rating = excluded.running_avg_rating,
           updated_at = excluded.updated_at",
        params![
            i64::from(bin.memory_hit_bucket),
            i64::from(bin.causal_evidence_bucket),
            i64::try_from(bin.sample_count).unwrap_or(i64::MAX),
            bin.running_avg_rating,
            now_text()?,
        ],
    )
    .context("failed to upsert calibration bin")?;
    Ok(())
}

fn parse_bin_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CalibrationBin> {
    let sample_count: i64 = row.get(2)?;
    Ok(CalibrationBin {
        memory_hit_bucket: to_u32(row.get(0)?, 0)?,
        causal_evidence_bucket: to_u32(row.get(1)?, 1)?,
        sample_count: u64::try_from(sample_count).map_err(|_| {
            conversion_error(
                2,
                rusqlite::types::Type::Integer,
                &format!("invalid sample_count: {sample_count}"),
            )
        })?,
        running_avg_rating: row.get(3)?,
    })
}

fn parse_trace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionTrace> {
    let id_raw: String = row.get(0)?;
    let embedding_raw: Option<String> = row.get(2)?;
    let context_raw: String = row.get(3)?;
    let created_raw: String = row.get(7)?;

    let embedding = embedding_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Vec<f32>>(raw).map_err(|err| {
                conversion_error(
                    2,
                    rusqlite::types::Type::Text,
                    &format!("invalid embedding_json: {err}"),
                )
            })
        })
        .transpose()?;
    let context: Value = serde_json::from_str(&context_raw).map_err(|err| {
        conversion_error(
            3,
            rusqlite::types::Type::Text,
            &format!("invalid context_json: {err}"),
        )
    })?;

    Ok(DecisionTrace {
        id: parse_decision_id(&id_raw, 0)?,
        tenant_id: row.get(1)?,
        embedding,
        context,
        feedback_score: row.get(4)?,
        memory_hit_count: to_u32(row.get(5)?, 5)?,
        causal_evidence_count: to_u32(row.get(6)?, 6)?,
        created_at: parse_timestamp(&created_raw, 7)?,
    })
}

fn parse_feedback_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackEntry> {
    let id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(2)?;
    let value: i64 = row.get(3)?;
    let recorded_raw: String = row.get(5)?;

    let invalid_value = || {
        conversion_error(
            3,
            rusqlite::types::Type::Integer,
            &format!("invalid feedback value: {value}"),
        )
    };
    let kind = match kind_raw.as_str() {
        "vote" => FeedbackKind::Vote(i8::try_from(value).map_err(|_| invalid_value())?),
        "rating" => FeedbackKind::Rating(u8::try_from(value).map_err(|_| invalid_value())?),
        other => {
            return Err(conversion_error(
                2,
                rusqlite::types::Type::Text,
                &format!("invalid feedback kind: {other}"),
            ))
        }
    };

    Ok(FeedbackEntry {
        decision_id: parse_decision_id(&id_raw, 0)?,
        operator_id: row.get(1)?,
        kind,
        score: row.get(4)?,
        recorded_at: parse_timestamp(&recorded_raw, 5)?,
    })
}

fn parse_point_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(OffsetDateTime, f64)> {
    let nanos: i64 = row.get(0)?;
    Ok((from_unix_nanos(nanos, 0)?, row.get(1)?))
}

fn feedback_columns(kind: FeedbackKind) -> (&'static str, i64) {
    match kind {
        FeedbackKind::Vote(vote) => ("vote", i64::from(vote)),
        FeedbackKind::Rating(rating) => ("rating", i64::from(rating)),
    }
}

fn scope_tenant(scope: &SearchScope) -> Option<&str> {
    match scope {
        SearchScope::Tenant(tenant_id) => Some(tenant_id.as_str()),
        SearchScope::Operator => None,
    }
}

fn decode_ruleset(version: u32, json: &str) -> Result<DecisionRuleset> {
    let value: Value = serde_json::from_str(json).context("invalid stored ruleset JSON")?;
    DecisionRuleset::from_json(&value)
        .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))
}

fn parse_decision_id(raw: &str, column: usize) -> rusqlite::Result<DecisionId> {
    raw.parse::<DecisionId>().map_err(|err| {
        conversion_error(column, rusqlite::types::Type::Text, &err.to_string())
    })
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<OffsetDateTime> {
    decision_intel_core::parse_rfc3339_utc(raw).map_err(|err| {
        conversion_error(column, rusqlite::types::Type::Text, &err.to_string())
    })
}

fn to_u32(value: i64, column: usize) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        conversion_error(
            column,
            rusqlite::types::Type::Integer,
            &format!("invalid counter value: {value}"),
        )
    })
}

fn from_unix_nanos(nanos: i64, column: usize) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        conversion_error(column, rusqlite::types::Type::Integer, &err.to_string())
    })
}

fn unix_nanos(timestamp: OffsetDateTime) -> Result<i64> {
    i64::try_from(timestamp.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {timestamp}"))
}

fn now_text() -> Result<String> {
    format_rfc3339(now_utc()).context("failed to format current time")
}

fn conversion_error(column: usize, kind: rusqlite::types::Type, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
