//! Batch orchestration.
//!
//! One call to [`Pipeline::process_batch`] walks a fixed sequence:
//!
//! ```text
//! validate batch size → parse → deduplicate → rule score → generate
//!     → validate output → confidence → persist → done
//! ```
//!
//! Any stage can end the batch in the single failure state. Per-message
//! problems (parse errors, duplicate-lookup errors, rule faults) are
//! counted and the batch continues; an oversized batch, a generation
//! failure, a rule evaluator crash or overrun, or a persistence failure ends it with
//! zero items and nothing committed.
//!
//! Collaborators are snapshotted when a batch starts, so
//! [`Pipeline::update_generator_config`] and
//! [`Pipeline::update_sandbox_config`] take effect on the next batch.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::config::{ConfidenceConfig, Config, GeneratorConfig, PipelineConfig, SandboxConfig};
use crate::confidence::{score_item, ConfidenceContext};
use crate::dedup::{DuplicateDetector, DuplicateStats, DuplicateVerdict};
use crate::error::PipelineError;
use crate::generator::{create_adapter, ExtractionAdapter, GenerationRequest};
use crate::mode::{BackendMode, ModeSwitch};
use crate::models::{
    ActionItem, AnomalyType, ExtractionStatus, IndexAnomaly, IndexStatus, Message, SourceLink,
    SourceStatus,
};
use crate::parser::{JsonRecordParser, MessageParser, RawEmail};
use crate::rules::{RuleEvaluator, RuleResult};
use crate::store::{unix_now, PersistBatch, Store};
use crate::validator::{OutputValidator, ValidatedItem};

/// Result of one [`Pipeline::process_batch`] call.
///
/// `processed_emails + skipped_emails == total_emails` always holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub total_emails: usize,
    /// Unique messages that reached rule scoring and generation.
    pub processed_emails: usize,
    /// Parse failures plus duplicates (or the whole batch when rejected
    /// before parsing).
    pub skipped_emails: usize,
    pub parse_failures: usize,
    pub same_batch_duplicates: usize,
    pub cross_batch_duplicates: usize,
    /// Valid Message-IDs ÷ parsed messages.
    pub message_id_extraction_rate: f64,
    pub degraded: bool,
    pub rule_faults: usize,
    pub anomalies: usize,
    pub model: Option<String>,
    pub items: Vec<ActionItem>,
    pub links: Vec<SourceLink>,
    /// The processed messages, for rendering source lines.
    #[serde(skip)]
    pub sources: Vec<Message>,
    pub elapsed_ms: u64,
}

impl BatchOutcome {
    fn new(total: usize) -> Self {
        Self {
            total_emails: total,
            ..Default::default()
        }
    }

    /// Counters only, for the audit trail.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success,
            "error": self.error,
            "total_emails": self.total_emails,
            "processed_emails": self.processed_emails,
            "skipped_emails": self.skipped_emails,
            "parse_failures": self.parse_failures,
            "same_batch_duplicates": self.same_batch_duplicates,
            "cross_batch_duplicates": self.cross_batch_duplicates,
            "message_id_extraction_rate": self.message_id_extraction_rate,
            "degraded": self.degraded,
            "rule_faults": self.rule_faults,
            "anomalies": self.anomalies,
            "items": self.items.len(),
            "model": self.model,
            "elapsed_ms": self.elapsed_ms,
        })
    }
}

/// Everything a successful run produced, before it is persisted.
struct Extraction {
    items: Vec<ActionItem>,
    links: Vec<SourceLink>,
    anomalies: Vec<IndexAnomaly>,
}

pub struct Pipeline {
    pipeline_config: PipelineConfig,
    confidence_config: ConfidenceConfig,
    store: Arc<dyn Store>,
    parser: Arc<dyn MessageParser>,
    detector: DuplicateDetector,
    adapter: RwLock<Arc<dyn ExtractionAdapter>>,
    generator_config: RwLock<GeneratorConfig>,
    evaluator: RwLock<RuleEvaluator>,
    sandbox_config: RwLock<SandboxConfig>,
    audit: Option<Arc<AuditLog>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        parser: Arc<dyn MessageParser>,
        adapter: Arc<dyn ExtractionAdapter>,
        evaluator: RuleEvaluator,
    ) -> Self {
        Self {
            pipeline_config: config.pipeline.clone(),
            confidence_config: config.confidence.clone(),
            detector: DuplicateDetector::new(store.clone()),
            store,
            parser,
            adapter: RwLock::new(adapter),
            generator_config: RwLock::new(config.generator.clone()),
            evaluator: RwLock::new(evaluator),
            sandbox_config: RwLock::new(config.sandbox.clone()),
            audit: None,
        }
    }

    /// Wire up the configured backend, rule catalog, JSON parser and audit
    /// log.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        let adapter: Arc<dyn ExtractionAdapter> = Arc::from(create_adapter(&config.generator)?);
        let evaluator = RuleEvaluator::from_config(&config.sandbox)?;
        let mut pipeline = Self::new(
            config,
            store,
            Arc::new(JsonRecordParser),
            adapter,
            evaluator,
        );
        if let Some(path) = &config.audit.path {
            pipeline = pipeline.with_audit(AuditLog::open(path)?);
        }
        Ok(pipeline)
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn adapter(&self) -> Arc<dyn ExtractionAdapter> {
        self.adapter.read().unwrap().clone()
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        self.generator_config.read().unwrap().clone()
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox_config.read().unwrap().clone()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Runtime reconfiguration
    // ═══════════════════════════════════════════════════════════════════

    /// Swap the generative backend (mode, endpoint, model, timeout,
    /// retries). A batch already running keeps the backend it started with.
    pub fn update_generator_config(&self, config: GeneratorConfig) -> Result<()> {
        config.validate()?;
        let adapter: Arc<dyn ExtractionAdapter> = Arc::from(create_adapter(&config)?);
        info!(
            mode = %config.mode,
            model = %config.model,
            timeout_secs = config.timeout_secs,
            max_retries = config.max_retries,
            "generator reconfigured"
        );
        *self.adapter.write().unwrap() = adapter;
        *self.generator_config.write().unwrap() = config;
        Ok(())
    }

    /// Swap sandbox limits and allow-list. A changed `rules_dir` reloads
    /// the catalog.
    pub fn update_sandbox_config(&self, config: SandboxConfig) -> Result<()> {
        config.validate()?;
        let current = self.evaluator.read().unwrap().clone();
        let evaluator = if config.rules_dir != self.sandbox_config.read().unwrap().rules_dir {
            RuleEvaluator::from_config(&config)?
        } else {
            current.reconfigured(&config)
        };
        info!(
            timeout_ms = config.timeout_ms,
            memory_limit_mb = config.memory_limit_mb,
            rules = evaluator.rule_names().len(),
            "sandbox reconfigured"
        );
        *self.evaluator.write().unwrap() = evaluator;
        *self.sandbox_config.write().unwrap() = config;
        Ok(())
    }

    /// Bring the generator in line with `mode`, keeping the other settings.
    pub fn apply_mode(&self, mode: BackendMode) -> Result<()> {
        let current = self.generator_config();
        if current.mode == mode.as_str() {
            return Ok(());
        }
        self.update_generator_config(GeneratorConfig {
            mode: mode.as_str().to_string(),
            ..current
        })
    }

    /// Run a batch under a [`ModeSwitch`]: switches requested while it runs
    /// are applied only after it reaches its terminal state.
    pub async fn process_with_mode(&self, modes: &ModeSwitch, raws: &[RawEmail]) -> BatchOutcome {
        let mode = modes.begin_batch();
        let outcome = match self.apply_mode(mode) {
            Ok(()) => self.process_batch(raws).await,
            Err(e) => {
                let mut outcome = BatchOutcome::new(raws.len());
                self.fail(
                    &mut outcome,
                    PipelineError::Generation(format!("cannot enter {} mode: {:#}", mode, e)),
                );
                outcome
            }
        };
        if let Some(next) = modes.on_batch_terminal() {
            if let Err(e) = self.apply_mode(next) {
                warn!(mode = %next, error = %e, "queued mode switch could not be applied");
            }
        }
        outcome
    }

    // ═══════════════════════════════════════════════════════════════════
    // Batch processing
    // ═══════════════════════════════════════════════════════════════════

    pub async fn process_batch(&self, raws: &[RawEmail]) -> BatchOutcome {
        let started = Instant::now();
        let mut outcome = BatchOutcome::new(raws.len());

        let adapter = self.adapter();
        let evaluator = self.evaluator.read().unwrap().clone();
        outcome.model = Some(adapter.model_name().to_string());

        match self.run(raws, adapter, &evaluator, &mut outcome).await {
            Ok(anomalies) => {
                outcome.success = true;
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;
                info!(
                    total = outcome.total_emails,
                    processed = outcome.processed_emails,
                    skipped = outcome.skipped_emails,
                    items = outcome.items.len(),
                    degraded = outcome.degraded,
                    anomalies = outcome.anomalies,
                    elapsed_ms = outcome.elapsed_ms,
                    "batch completed"
                );
                self.audit_success(&outcome, &anomalies);
            }
            Err(e) => {
                self.fail(&mut outcome, e);
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            }
        }
        outcome
    }

    fn fail(&self, outcome: &mut BatchOutcome, err: PipelineError) {
        error!(stage = err.stage(), error = %err, "batch failed");
        if matches!(err, PipelineError::BatchTooLarge { .. }) {
            outcome.processed_emails = 0;
            outcome.skipped_emails = outcome.total_emails;
        }
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_batch_failed(err.stage(), &err.to_string()) {
                warn!(error = %e, "audit write failed");
            }
        }
        outcome.success = false;
        outcome.error = Some(err.to_string());
        outcome.items.clear();
        outcome.links.clear();
        outcome.sources.clear();
        outcome.anomalies = 0;
    }

    /// The state machine. Returns the anomalies committed with the batch.
    async fn run(
        &self,
        raws: &[RawEmail],
        adapter: Arc<dyn ExtractionAdapter>,
        evaluator: &RuleEvaluator,
        outcome: &mut BatchOutcome,
    ) -> Result<Vec<IndexAnomaly>, PipelineError> {
        // Validate-Batch-Size: before any collaborator is touched.
        let max = self.pipeline_config.max_batch_size;
        if raws.len() > max {
            return Err(PipelineError::BatchTooLarge {
                size: raws.len(),
                max,
            });
        }

        // Parse
        let mut parsed = Vec::with_capacity(raws.len());
        for raw in raws {
            match self.parser.parse(raw) {
                Ok(record) => {
                    parsed.push(Message::from_record(record, self.pipeline_config.max_body_bytes))
                }
                Err(e) => {
                    warn!(source = %raw.source, stage = "parse", parser = self.parser.name(), error = %e, "message excluded");
                    outcome.parse_failures += 1;
                }
            }
        }
        if !parsed.is_empty() {
            let valid = parsed.iter().filter(|m| m.has_valid_message_id()).count();
            outcome.message_id_extraction_rate = valid as f64 / parsed.len() as f64;
        }

        // Deduplicate
        let mut stats = DuplicateStats::new();
        let mut unique = Vec::with_capacity(parsed.len());
        for message in parsed {
            if self.detector.check_duplicate(&message, &mut stats).await == DuplicateVerdict::Unique
            {
                unique.push(message);
            }
        }
        self.detector.log_summary(&stats);

        outcome.same_batch_duplicates = stats.same_batch;
        outcome.cross_batch_duplicates = stats.cross_batch;
        outcome.processed_emails = unique.len();
        outcome.skipped_emails = outcome.parse_failures + stats.same_batch + stats.cross_batch;

        let mut anomalies = std::mem::take(&mut stats.failures);
        anomalies.extend(unique.iter().filter_map(message_id_anomaly));

        if unique.is_empty() {
            info!(stage = "deduplicate", "no unique messages, nothing to extract");
            outcome.anomalies = anomalies.len();
            if !anomalies.is_empty() {
                self.persist(PersistBatch {
                    anomalies: anomalies.clone(),
                    seen_at: unix_now(),
                    ..Default::default()
                })
                .await?;
            }
            return Ok(anomalies);
        }

        // RuleScore
        // Each message is bounded by the sandbox; this bounds the batch in
        // case a script stalls inside a native call the hook cannot reach.
        let budget = evaluator.batch_budget(unique.len())
            + Duration::from_millis(self.pipeline_config.rule_grace_ms);
        let rule_results = match tokio::time::timeout(budget, evaluator.execute_batch(&unique)).await
        {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => return Err(PipelineError::RuleEvaluation(format!("{e:#}"))),
            Err(_) => return Err(PipelineError::RuleEvaluationTimeout(budget)),
        };
        outcome.rule_faults = rule_results.iter().filter(|r| r.faulted()).count();

        // Generate
        let request = GenerationRequest::from_messages(&unique)
            .map_err(|e| PipelineError::Generation(format!("{e:#}")))?;
        let timeout = Duration::from_secs(self.pipeline_config.generate_timeout_secs);
        let raw_output = match tokio::time::timeout(timeout, adapter.generate(&request)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(PipelineError::Generation(format!("{e:#}"))),
            Err(_) => return Err(PipelineError::GenerationTimeout(timeout)),
        };

        // ValidateOutput
        let validation = OutputValidator::new(timeout)
            .validate(raw_output, adapter.as_ref(), &request)
            .await;
        outcome.degraded = validation.is_degraded;

        // ComputeConfidence
        let extraction = self.build_items(&validation.items, &unique, &rule_results);
        anomalies.extend(extraction.anomalies);

        // Persist
        self.persist(PersistBatch {
            messages: unique.clone(),
            items: extraction.items.clone(),
            links: extraction.links.clone(),
            anomalies: anomalies.clone(),
            seen_at: unix_now(),
        })
        .await?;

        outcome.items = extraction.items;
        outcome.links = extraction.links;
        outcome.anomalies = anomalies.len();
        outcome.sources = unique;
        Ok(anomalies)
    }

    fn build_items(
        &self,
        validated: &[ValidatedItem],
        unique: &[Message],
        rule_results: &[RuleResult],
    ) -> Extraction {
        let mut items = Vec::with_capacity(validated.len());
        let mut links = Vec::new();
        let mut anomalies = Vec::new();

        for v in validated {
            let candidate = v.item();
            let degraded = v.is_degraded();
            let scored = score_item(
                candidate,
                rule_results,
                ConfidenceContext {
                    is_degraded: degraded,
                    max_confidence: self.confidence_config.degraded_max,
                },
            );

            let id = uuid::Uuid::new_v4().to_string();
            let mut source_fingerprints: Vec<String> = Vec::new();
            for &i in &candidate.source_indices {
                if let Some(m) = unique.get(i) {
                    if !source_fingerprints.contains(&m.fingerprint) {
                        source_fingerprints.push(m.fingerprint.clone());
                    }
                }
            }

            let link_confidence = (scored.final_confidence * 100.0).round() as i64;
            for fp in &source_fingerprints {
                links.push(SourceLink {
                    item_id: id.clone(),
                    fingerprint: fp.clone(),
                    evidence: candidate.evidence.clone(),
                    confidence: link_confidence,
                });
            }

            let source_status = if degraded {
                SourceStatus::Unverified
            } else {
                candidate.source_status
            };

            let unlinked = source_fingerprints.is_empty();
            if unlinked {
                warn!(item_id = %id, stage = "compute_confidence", "item has no source linkage");
                anomalies.push(IndexAnomaly::new(
                    AnomalyType::MissingSourceLink,
                    id.clone(),
                    None,
                    "action item has no attributable source message",
                ));
            }
            let index_status =
                if unlinked || scored.final_confidence < self.confidence_config.anomaly_threshold {
                    IndexStatus::Anomaly
                } else {
                    IndexStatus::Normal
                };

            items.push(ActionItem {
                id,
                content: candidate.content.clone(),
                item_type: candidate.item_type,
                confidence: scored.final_confidence,
                source_status,
                index_status,
                source_fingerprints,
                evidence: candidate.evidence.clone(),
                degraded,
                created_at: Utc::now(),
            });
        }

        Extraction {
            items,
            links,
            anomalies,
        }
    }

    async fn persist(&self, batch: PersistBatch) -> Result<(), PipelineError> {
        let timeout = Duration::from_secs(self.pipeline_config.persist_timeout_secs);
        match tokio::time::timeout(timeout, self.store.persist_batch(&batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PipelineError::Persistence(format!("{e:#}"))),
            Err(_) => Err(PipelineError::PersistenceTimeout(timeout)),
        }
    }

    fn audit_success(&self, outcome: &BatchOutcome, anomalies: &[IndexAnomaly]) {
        let Some(audit) = &self.audit else {
            return;
        };
        let result = anomalies
            .iter()
            .try_for_each(|a| audit.log_index_anomaly(a))
            .and_then(|_| {
                outcome
                    .items
                    .iter()
                    .try_for_each(|i| audit.log_item_extracted(i))
            })
            .and_then(|_| audit.log_batch_completed(&outcome.summary()));
        if let Err(e) = result {
            warn!(error = %e, "audit write failed");
        }
    }
}

fn message_id_anomaly(message: &Message) -> Option<IndexAnomaly> {
    let (anomaly_type, details) = match message.extraction_status {
        ExtractionStatus::Complete => return None,
        ExtractionStatus::MissingMessageId => {
            (AnomalyType::MissingMessageId, "Message-ID header absent")
        }
        ExtractionStatus::MalformedMessageId => {
            (AnomalyType::MalformedMessageId, "Message-ID does not match <local@domain>")
        }
    };
    warn!(fp_prefix = message.fp_prefix(), stage = "parse", anomaly = anomaly_type.as_str(), "index anomaly");
    Some(IndexAnomaly::new(
        anomaly_type,
        message.fingerprint.clone(),
        message.message_id.clone(),
        details,
    ))
}
