//! `dic`: command surface over the decision engine and its SQLite store.
//!
//! Hosts embed the CLI through [`run_cli`]. Every JSON document printed on
//! stdout carries a `contract_version`; the schemas live in
//! `contracts/v1/schemas`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use decision_intel_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CalibrationBin, CandidateVerdict, CausalAnalysis,
    ConfidenceAssessment, DecisionId, DecisionRuleset, DecisionTrace, EvidenceSignature,
    FeatureHashEmbedder, FeedbackEntry, FeedbackKind, RawMetricSample, SearchRequest, SearchScope,
    SimilarDecision,
};
use decision_intel_engine::{
    AnalysisPool, AnalysisTrigger, DecisionEngine, DispatchError, EngineStores,
    EngineTelemetrySnapshot, FeedbackReceipt, IngestReport, IngestStatus, NewDecision,
    Recommendation,
};
use decision_intel_store::CalibrationStore;
use decision_intel_store_sqlite::{CalibrationCheck, CalibrationIssueSeverity, SqliteDecisionStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "dic")]
#[command(about = "Decision Intelligence Core CLI")]
pub struct Cli {
    #[arg(long, default_value = "./decision_intel.sqlite3")]
    db: PathBuf,

    /// JSON ruleset overriding the stored one; it is persisted under its
    /// own `ruleset_version`.
    #[arg(long)]
    ruleset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Sample {
        #[command(subcommand)]
        command: Box<SampleCommand>,
    },
    Causes(CausesArgs),
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
    Feedback {
        #[command(subcommand)]
        command: Box<FeedbackCommand>,
    },
    Confidence(ConfidenceArgs),
    Analyze(AnalyzeArgs),
    Calibration {
        #[command(subcommand)]
        command: Box<CalibrationCommand>,
    },
    Ruleset {
        #[command(subcommand)]
        command: Box<RulesetCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SampleCommand {
    Ingest(SampleIngestArgs),
    Import(SampleImportArgs),
}

#[derive(Debug, Args)]
pub struct SampleIngestArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    entity: String,
    #[arg(long)]
    metric: String,
    /// Parsed as JSON; anything else is passed through as a string and
    /// rejected as non-numeric.
    #[arg(long, allow_hyphen_values = true)]
    value: String,
    #[arg(long)]
    timestamp: Option<String>,
}

#[derive(Debug, Args)]
pub struct SampleImportArgs {
    /// JSON Lines file, one raw sample per line.
    #[arg(long)]
    file: PathBuf,
    /// Queue anomalies on the analysis pool and include recommendations.
    #[arg(long)]
    analyze: bool,
}

#[derive(Debug, Args)]
pub struct CausesArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    entity: String,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum DecisionCommand {
    Record(DecisionRecordArgs),
    Search(DecisionSearchArgs),
    Show(DecisionShowArgs),
}

#[derive(Debug, Args)]
pub struct DecisionRecordArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    context_json: String,
    #[arg(long, default_value_t = 0)]
    memory_hits: u32,
    #[arg(long, default_value_t = 0)]
    causal_evidence: u32,
}

#[derive(Debug, Args)]
pub struct DecisionSearchArgs {
    #[arg(long, required_unless_present = "operator")]
    tenant: Option<String>,
    /// Cross-tenant search.
    #[arg(long, conflicts_with = "tenant")]
    operator: bool,
    #[arg(long)]
    query_json: String,
    #[arg(long, allow_hyphen_values = true)]
    min_similarity: Option<f64>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DecisionShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    Vote(FeedbackVoteArgs),
    Rate(FeedbackRateArgs),
}

#[derive(Debug, Args)]
pub struct FeedbackVoteArgs {
    #[arg(long)]
    decision_id: String,
    #[arg(long)]
    operator: String,
    #[arg(long)]
    value: VoteArg,
}

#[derive(Debug, Args)]
pub struct FeedbackRateArgs {
    #[arg(long)]
    decision_id: String,
    #[arg(long)]
    operator: String,
    #[arg(long)]
    rating: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VoteArg {
    Up,
    Down,
}

#[derive(Debug, Args)]
pub struct ConfidenceArgs {
    #[arg(long, default_value_t = 0)]
    memory_hits: u32,
    #[arg(long, default_value_t = 0)]
    causal_evidence: u32,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    entity: String,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    as_of: Option<String>,
    /// Memory search query; defaults to the entity and metric names.
    #[arg(long)]
    context_json: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CalibrationCommand {
    Show(CalibrationShowArgs),
    Replay,
    Check(CalibrationCheckArgs),
}

#[derive(Debug, Args)]
pub struct CalibrationShowArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CalibrationCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetCommand {
    Show,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestPayload {
    contract_version: String,
    report: IngestReport,
    trigger: Option<AnalysisTrigger>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportRejection {
    line: usize,
    code: String,
    message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ImportSummary {
    contract_version: String,
    lines: usize,
    evaluated: usize,
    duplicates: usize,
    rejected: usize,
    store_unavailable: usize,
    anomalies: usize,
    shed_triggers: usize,
    rejections: Vec<ImportRejection>,
    recommendations: Vec<Recommendation>,
    telemetry: EngineTelemetrySnapshot,
}

impl ImportSummary {
    fn new() -> Self {
        Self {
            contract_version: "sample_import.v1".to_string(),
            lines: 0,
            evaluated: 0,
            duplicates: 0,
            rejected: 0,
            store_unavailable: 0,
            anomalies: 0,
            shed_triggers: 0,
            rejections: Vec::new(),
            recommendations: Vec::new(),
            telemetry: EngineTelemetrySnapshot::default(),
        }
    }

    fn tally(&mut self, line: usize, report: &IngestReport) {
        match report.status {
            IngestStatus::Evaluated => self.evaluated += 1,
            IngestStatus::Duplicate => self.duplicates += 1,
            IngestStatus::StoreUnavailable => self.store_unavailable += 1,
            IngestStatus::Rejected => {
                self.rejected += 1;
                if let Some(rejection) = &report.rejection {
                    self.rejections.push(ImportRejection {
                        line,
                        code: rejection.code().to_string(),
                        message: rejection.to_string(),
                    });
                }
            }
        }
        if report.anomaly.as_ref().is_some_and(|anomaly| anomaly.is_anomaly) {
            self.anomalies += 1;
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CausesPayload {
    contract_version: String,
    tenant_id: String,
    as_of: String,
    analysis: CausalAnalysis,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DecisionPayload {
    contract_version: String,
    decision: DecisionTrace,
    feedback: Vec<FeedbackEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SearchPayload {
    contract_version: String,
    scope: SearchScope,
    min_similarity: f64,
    limit: usize,
    results: Vec<SimilarDecision>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedbackPayload {
    contract_version: String,
    receipt: FeedbackReceipt,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfidencePayload {
    contract_version: String,
    assessment: ConfidenceAssessment,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationBinsPayload {
    contract_version: String,
    ruleset_version: u32,
    calibration_min_samples: u64,
    bins: Vec<CalibrationBin>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RulesetPayload {
    contract_version: String,
    stored_versions: Vec<u32>,
    ruleset: DecisionRuleset,
}

/// Store and engine opened for one command.
struct Session {
    store: Arc<SqliteDecisionStore>,
    engine: DecisionEngine,
}

impl Session {
    fn open(db_path: &Path, ruleset_path: Option<&Path>) -> Result<Self> {
        let store = Arc::new(SqliteDecisionStore::open(db_path)?);
        store.migrate()?;
        let ruleset = resolve_ruleset(&store, ruleset_path)?;
        debug!(
            db = %db_path.display(),
            ruleset_version = ruleset.ruleset_version,
            "session opened"
        );
        let engine = DecisionEngine::new(
            EngineStores::shared(Arc::clone(&store)),
            ruleset,
            Arc::new(FeatureHashEmbedder::default()),
        )
        .map_err(|err| anyhow!("failed to build decision engine: {err}"))?;
        Ok(Self { store, engine })
    }
}

/// Executes the parsed CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, the
/// ruleset is invalid, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let session = Session::open(&cli.db, cli.ruleset.as_deref())?;
    match cli.command {
        Command::Sample { command } => run_sample(*command, &session),
        Command::Causes(args) => run_causes(args, &session),
        Command::Decision { command } => run_decision(*command, &session),
        Command::Feedback { command } => run_feedback(*command, &session),
        Command::Confidence(args) => {
            let assessment = session.engine.confidence(EvidenceSignature::new(
                args.memory_hits,
                args.causal_evidence,
            ));
            print_json(&ConfidencePayload {
                contract_version: "confidence.v1".to_string(),
                assessment,
            })
        }
        Command::Analyze(args) => run_analyze(args, &session),
        Command::Calibration { command } => run_calibration(*command, &session),
        Command::Ruleset { command } => match *command {
            RulesetCommand::Show => {
                let stored_versions = session.store.get_rulesets()?.into_keys().collect();
                print_json(&RulesetPayload {
                    contract_version: "ruleset.v1".to_string(),
                    stored_versions,
                    ruleset: session.engine.ruleset().clone(),
                })
            }
        },
    }
}

fn run_sample(command: SampleCommand, session: &Session) -> Result<()> {
    match command {
        SampleCommand::Ingest(args) => {
            let timestamp = match args.timestamp {
                Some(raw) => raw,
                None => format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
            };
            let raw = RawMetricSample {
                tenant_id: Some(args.tenant),
                entity_id: Some(args.entity),
                metric_name: Some(args.metric),
                value: Some(parse_sample_value(&args.value)),
                timestamp: Some(timestamp),
            };

            let report = session.engine.ingest(&raw);
            let payload = IngestPayload {
                contract_version: "ingest.v1".to_string(),
                trigger: report.trigger(),
                report,
            };
            print_json(&payload)?;

            match &payload.report.rejection {
                Some(rejection) => Err(anyhow!(
                    "sample rejected ({}): {rejection}",
                    rejection.code()
                )),
                None => Ok(()),
            }
        }
        SampleCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed reading samples from {}", args.file.display()))?;
            let summary = if args.analyze {
                import_with_analysis(&raw, &session.engine)?
            } else {
                import_samples(&raw, &session.engine, |_| {})
            };
            print_json(&summary)
        }
    }
}

/// Ingests every non-blank line, handing anomaly triggers to `on_trigger`.
fn import_samples(
    raw: &str,
    engine: &DecisionEngine,
    mut on_trigger: impl FnMut(AnalysisTrigger),
) -> ImportSummary {
    let mut summary = ImportSummary::new();
    for (index, line) in raw.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;

        let sample = match serde_json::from_str::<RawMetricSample>(line) {
            Ok(sample) => sample,
            Err(err) => {
                summary.rejected += 1;
                summary.rejections.push(ImportRejection {
                    line: line_number,
                    code: "malformed_json".to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        let report = engine.ingest(&sample);
        summary.tally(line_number, &report);
        if let Some(trigger) = report.trigger() {
            on_trigger(trigger);
        }
    }
    summary.telemetry = engine.telemetry();
    summary
}

fn import_with_analysis(raw: &str, engine: &DecisionEngine) -> Result<ImportSummary> {
    runtime()?.block_on(async {
        let (pool, mut results) = AnalysisPool::from_ruleset(engine);
        let collector = tokio::spawn(async move {
            let mut recommendations = Vec::new();
            while let Some(recommendation) = results.recv().await {
                recommendations.push(recommendation);
            }
            recommendations
        });

        let raw = raw.to_string();
        let ingest_engine = engine.clone();
        let (mut summary, shed, closed, pool) = tokio::task::spawn_blocking(move || {
            let mut shed = 0_usize;
            let mut closed = false;
            let summary = import_samples(&raw, &ingest_engine, |trigger| {
                match pool.submit(trigger) {
                    Ok(()) => {}
                    Err(DispatchError::QueueFull) => shed += 1,
                    Err(DispatchError::Closed) => closed = true,
                }
            });
            (summary, shed, closed, pool)
        })
        .await
        .map_err(|err| anyhow!("sample ingestion task failed: {err}"))?;
        pool.shutdown().await;
        if closed {
            return Err(anyhow!("analysis pool closed during import"));
        }

        let mut recommendations = collector
            .await
            .map_err(|err| anyhow!("recommendation collector failed: {err}"))?;
        recommendations.sort_by(|left, right| {
            (&left.entity_id, &left.effect_metric).cmp(&(&right.entity_id, &right.effect_metric))
        });

        summary.shed_triggers = shed;
        summary.recommendations = recommendations;
        summary.telemetry = engine.telemetry();
        info!(
            lines = summary.lines,
            anomalies = summary.anomalies,
            shed = summary.shed_triggers,
            "sample import analysed"
        );
        Ok(summary)
    })
}

fn run_causes(args: CausesArgs, session: &Session) -> Result<()> {
    let as_of = parse_optional_utc(args.as_of.as_deref())?;
    let analysis = session
        .engine
        .analyzer()
        .find_causes(&args.tenant, &args.entity, &args.metric, as_of);

    if args.json {
        print_json(&CausesPayload {
            contract_version: "causes.v1".to_string(),
            tenant_id: args.tenant,
            as_of: format_rfc3339(as_of).map_err(|err| anyhow!(err.to_string()))?,
            analysis,
        })
    } else {
        print_causes_table(&analysis);
        Ok(())
    }
}

fn run_decision(command: DecisionCommand, session: &Session) -> Result<()> {
    match command {
        DecisionCommand::Record(args) => {
            let decision = session.engine.record_decision(NewDecision {
                tenant_id: args.tenant,
                context: parse_json_arg("context_json", &args.context_json)?,
                memory_hit_count: args.memory_hits,
                causal_evidence_count: args.causal_evidence,
            })?;
            print_json(&DecisionPayload {
                contract_version: "decision.v1".to_string(),
                decision,
                feedback: Vec::new(),
            })
        }
        DecisionCommand::Search(args) => {
            let scope = search_scope(args.tenant, args.operator)?;
            let mut request = session.engine.memory().default_request(scope);
            if let Some(min_similarity) = args.min_similarity {
                request.min_similarity = min_similarity;
            }
            if let Some(limit) = args.limit {
                request.limit = limit;
            }
            let query = parse_json_arg("query_json", &args.query_json)?;
            let results = session.engine.search(&query, &request)?;

            if args.json {
                let SearchRequest {
                    scope,
                    min_similarity,
                    limit,
                } = request;
                print_json(&SearchPayload {
                    contract_version: "decision_search.v1".to_string(),
                    scope,
                    min_similarity,
                    limit,
                    results,
                })
            } else {
                print_search_table(&results);
                Ok(())
            }
        }
        DecisionCommand::Show(args) => {
            let decision_id = parse_decision_id(&args.id)?;
            let Some(decision) = session.engine.memory().decision(decision_id)? else {
                return Err(anyhow!("decision not found: {decision_id}"));
            };
            let feedback = session.engine.memory().feedback_for(decision_id)?;
            print_json(&DecisionPayload {
                contract_version: "decision.v1".to_string(),
                decision,
                feedback,
            })
        }
    }
}

fn run_feedback(command: FeedbackCommand, session: &Session) -> Result<()> {
    let (decision_id, operator, kind) = match command {
        FeedbackCommand::Vote(args) => (
            args.decision_id,
            args.operator,
            FeedbackKind::Vote(match args.value {
                VoteArg::Up => 1,
                VoteArg::Down => -1,
            }),
        ),
        FeedbackCommand::Rate(args) => {
            (args.decision_id, args.operator, FeedbackKind::Rating(args.rating))
        }
    };

    let receipt = session
        .engine
        .record_feedback(parse_decision_id(&decision_id)?, &operator, kind)?;
    print_json(&FeedbackPayload {
        contract_version: "feedback_receipt.v1".to_string(),
        receipt,
    })
}

fn run_analyze(args: AnalyzeArgs, session: &Session) -> Result<()> {
    let context = match args.context_json.as_deref() {
        Some(raw) => parse_json_arg("context_json", raw)?,
        None => json!({"entity_id": args.entity, "metric_name": args.metric}),
    };
    let trigger = AnalysisTrigger {
        tenant_id: args.tenant,
        entity_id: args.entity,
        metric_name: args.metric,
        as_of: parse_optional_utc(args.as_of.as_deref())?,
        context,
    };

    let recommendation = runtime()?.block_on(session.engine.analyze(trigger));
    print_json(&recommendation)
}

fn run_calibration(command: CalibrationCommand, session: &Session) -> Result<()> {
    let ruleset = session.engine.ruleset();
    match command {
        CalibrationCommand::Show(args) => {
            let bins = session.store.calibration_bins()?;
            if args.json {
                print_json(&CalibrationBinsPayload {
                    contract_version: "calibration_bins.v1".to_string(),
                    ruleset_version: ruleset.ruleset_version,
                    calibration_min_samples: ruleset.calibration_min_samples,
                    bins,
                })
            } else {
                print_bins_table(&bins, ruleset);
                Ok(())
            }
        }
        CalibrationCommand::Replay => {
            let report = session.store.replay_calibration(ruleset)?;
            print_json(&report)
        }
        CalibrationCommand::Check(args) => {
            let check = session.store.check_calibration(ruleset)?;
            if args.json {
                print_json(&check)?;
            } else {
                print_calibration_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "calibration consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn resolve_ruleset(store: &SqliteDecisionStore, path: Option<&Path>) -> Result<DecisionRuleset> {
    let Some(path) = path else {
        let latest = store.get_rulesets()?.into_values().next_back();
        return Ok(latest.unwrap_or_else(DecisionRuleset::v1));
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading ruleset from {}", path.display()))?;
    let value = parse_json_arg("ruleset", &raw)?;
    let ruleset = DecisionRuleset::from_json(&value)
        .map_err(|err| anyhow!("invalid ruleset {}: {err}", path.display()))?;
    store.upsert_ruleset(&ruleset)?;
    Ok(ruleset)
}

fn search_scope(tenant: Option<String>, operator: bool) -> Result<SearchScope> {
    match (tenant, operator) {
        (_, true) => Ok(SearchScope::Operator),
        (Some(tenant), false) if !tenant.trim().is_empty() => Ok(SearchScope::Tenant(tenant)),
        _ => Err(anyhow!("either --tenant <id> or --operator is required")),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn parse_sample_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{name} must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_decision_id(raw: &str) -> Result<DecisionId> {
    DecisionId::from_str(raw).map_err(|err| anyhow!(err.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn verdict_label(verdict: &CandidateVerdict) -> String {
    match verdict {
        CandidateVerdict::Significant => "significant".to_string(),
        CandidateVerdict::NotSignificant => "not_significant".to_string(),
        CandidateVerdict::NonStationary => "non_stationary".to_string(),
        CandidateVerdict::NotTestable { reason } => format!("not_testable({reason})"),
        CandidateVerdict::InsufficientObservations { available } => {
            format!("insufficient_observations({available})")
        }
        CandidateVerdict::Skipped => "skipped".to_string(),
    }
}

fn print_causes_table(analysis: &CausalAnalysis) {
    println!(
        "entity={} effect={} status={:?} reason={}",
        analysis.entity_id,
        analysis.effect_metric,
        analysis.status,
        analysis.reason.as_deref().unwrap_or("n/a")
    );
    println!(
        "{:<24} {:<32} {:<12} {:<5} observations",
        "cause_metric", "verdict", "p_value", "lag"
    );
    println!("{}", "-".repeat(90));
    for candidate in &analysis.candidates {
        println!(
            "{:<24} {:<32} {:<12} {:<5} {}",
            candidate.cause_metric,
            verdict_label(&candidate.verdict),
            candidate
                .p_value
                .map_or_else(|| "n/a".to_string(), |value| format!("{value:.6}")),
            candidate
                .lag
                .map_or_else(|| "n/a".to_string(), |value| value.to_string()),
            candidate.observations
        );
    }
}

fn print_search_table(results: &[SimilarDecision]) {
    println!(
        "{:<28} {:<16} {:<8} {:<8} feedback",
        "decision_id", "tenant", "raw", "adjusted"
    );
    println!("{}", "-".repeat(76));
    for result in results {
        println!(
            "{:<28} {:<16} {:<8.4} {:<8.4} {}",
            result.decision_id,
            result.tenant_id,
            result.raw_similarity,
            result.adjusted_similarity,
            result.feedback_score
        );
    }
}

fn print_bins_table(bins: &[CalibrationBin], ruleset: &DecisionRuleset) {
    println!(
        "{:<12} {:<14} {:<8} {:<10} calibrated",
        "memory_hits", "causal_edges", "samples", "avg_rating"
    );
    println!("{}", "-".repeat(60));
    for bin in bins {
        println!(
            "{:<12} {:<14} {:<8} {:<10.3} {}",
            bin.memory_hit_bucket,
            bin.causal_evidence_bucket,
            bin.sample_count,
            bin.running_avg_rating,
            if bin.is_authoritative(ruleset) { "yes" } else { "no" }
        );
    }
}

fn print_calibration_check(check: &CalibrationCheck) {
    println!(
        "contract={} healthy={} ledger_ratings={} stored_bins={}",
        check.contract_version,
        if check.healthy { "yes" } else { "no" },
        check.ledger_ratings,
        check.stored_bins
    );
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    CalibrationIssueSeverity::Warning => "warning",
                    CalibrationIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `dic calibration replay` to rebuild bins from the ledger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decision_intel_core::CausalStatus;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn memory_session() -> Session {
        must(Session::open(Path::new(":memory:"), None))
    }

    fn write_ruleset(ruleset: &DecisionRuleset) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dic-ruleset-{}.json", DecisionId::new()));
        let raw = match serde_json::to_string(ruleset) {
            Ok(raw) => raw,
            Err(err) => panic!("failed to encode ruleset: {err}"),
        };
        if let Err(err) = std::fs::write(&path, raw) {
            panic!("failed to write {}: {err}", path.display());
        }
        path
    }

    #[test]
    fn sample_values_are_never_coerced() {
        assert_eq!(parse_sample_value("42.5"), json!(42.5));
        assert_eq!(parse_sample_value("\"42\""), json!("42"));
        assert_eq!(parse_sample_value("NaN"), json!("NaN"));
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00Z")).is_ok());
    }

    #[test]
    fn search_scope_requires_tenant_or_operator() {
        assert_eq!(must(search_scope(None, true)), SearchScope::Operator);
        assert_eq!(
            must(search_scope(Some("tenant-a".to_string()), false)),
            SearchScope::Tenant("tenant-a".to_string())
        );
        assert!(search_scope(Some("  ".to_string()), false).is_err());
        assert!(search_scope(None, false).is_err());
    }

    #[test]
    fn ruleset_file_overrides_and_is_persisted() {
        let session = memory_session();
        let mut ruleset = DecisionRuleset::v1();
        ruleset.ruleset_version = 2;
        ruleset.z_threshold = 2.5;

        let path = write_ruleset(&ruleset);

        let resolved = must(resolve_ruleset(&session.store, Some(&path)));
        assert_eq!(resolved, ruleset);
        let latest = must(resolve_ruleset(&session.store, None));
        assert_eq!(latest.ruleset_version, 2);
        assert!((latest.z_threshold - 2.5).abs() < f64::EPSILON);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn invalid_ruleset_file_is_rejected() {
        let session = memory_session();
        let mut ruleset = DecisionRuleset::v1();
        ruleset.z_threshold = 0.0;
        let path = write_ruleset(&ruleset);

        assert!(resolve_ruleset(&session.store, Some(&path)).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn import_tallies_statuses_and_rejections() {
        let session = memory_session();
        let lines = [
            r#"{"tenant_id":"t","entity_id":"e","metric_name":"cpu","value":1.0,"timestamp":"2026-03-01T00:00:00Z"}"#,
            r#"{"tenant_id":"t","entity_id":"e","metric_name":"cpu","value":1.0,"timestamp":"2026-03-01T00:00:00Z"}"#,
            r#"{"tenant_id":"t","entity_id":"e","metric_name":"cpu","value":"12","timestamp":"2026-03-01T00:01:00Z"}"#,
            "",
            "not json",
        ]
        .join("\n");

        let mut triggers = 0;
        let summary = import_samples(&lines, &session.engine, |_| triggers += 1);
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.rejected, 2);
        assert_eq!(triggers, 0);

        let codes = summary
            .rejections
            .iter()
            .map(|item| (item.line, item.code.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(codes, [(3, "non_numeric_value"), (5, "malformed_json")]);
        assert_eq!(summary.telemetry.duplicate_samples_total, 1);
        assert_eq!(summary.telemetry.invalid_samples_total, 1);
    }

    #[test]
    fn import_with_analysis_ingests_off_the_async_workers() {
        let session = memory_session();
        let lines = [45.0, 55.0, 45.0, 55.0, 50.0, 85.0]
            .iter()
            .enumerate()
            .map(|(minute, value)| {
                json!({
                    "tenant_id": "tenant-a",
                    "entity_id": "router-1",
                    "metric_name": "latency",
                    "value": value,
                    "timestamp": format!("2026-03-01T00:0{minute}:00Z"),
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");

        let summary = must(import_with_analysis(&lines, &session.engine));
        assert_eq!(summary.evaluated, 6);
        assert_eq!(summary.anomalies, 1);
        assert_eq!(summary.shed_triggers, 0);
        assert_eq!(summary.recommendations.len(), 1);
        assert_eq!(
            summary.recommendations[0].causal.status,
            CausalStatus::InsufficientStatisticalPower
        );
        assert_eq!(summary.telemetry.analyses_completed_total, 1);
    }

    #[test]
    fn verdict_labels_carry_detail() {
        assert_eq!(
            verdict_label(&CandidateVerdict::InsufficientObservations { available: 12 }),
            "insufficient_observations(12)"
        );
        assert_eq!(verdict_label(&CandidateVerdict::Skipped), "skipped");
    }
}
