//! Batch driver: many independent trials of one scenario and one tier.
//!
//! Each trial builds a fresh store, runs the scenario and, for
//! every retraction left unexplained, calls the configured generator once.
//! Every trial yields at least one JSONL record, so a batch is complete
//! when the record count adds up. A metadata file next to the JSONL file
//! captures the configuration of the batch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hypotheses::{
    self, c3, CatalogInfo, GenerationParams, GenerationRecord, GenerationRequest, Grounding,
    PromptLimits, RetrievalInfo, TierExtras, Tier,
};
use crate::kb::{Fact, OntologySource, TBox};
use crate::llm::LlmTransport;
use crate::retrieval::RetrievalConfig;
use crate::runtime::{self, ExperimentConfig, GapSnapshot};
use crate::scenario::Scenario;

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum BatchError {
    #[error("batch output I/O failed: {path}")]
    #[diagnostic(
        code(causa::batch::io),
        help("Check that the output directory is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialise a batch record")]
    #[diagnostic(code(causa::batch::serialize))]
    Serialize(#[from] serde_json::Error),

    #[error("invalid batch configuration: {message}")]
    #[diagnostic(
        code(causa::batch::invalid_config),
        help("A batch needs at least one run.")
    )]
    InvalidConfig { message: String },
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError + '_ {
    move |source| BatchError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ── Configuration ───────────────────────────────────────────────────────

/// `[batch]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_tier")]
    pub tier: Tier,
    #[serde(default = "default_runs")]
    pub runs: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-tier default when unset.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_hops")]
    pub hops: usize,
    #[serde(default = "default_max_ctx_triples")]
    pub max_ctx_triples: usize,
    #[serde(default = "default_max_eventtype_items")]
    pub max_eventtype_items: usize,
    /// Pause between trials; per-tier default when unset.
    #[serde(default)]
    pub sleep_ms: Option<u64>,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_tier() -> Tier {
    Tier::C0
}
fn default_runs() -> usize {
    20
}
fn default_temperature() -> f64 {
    0.3
}
fn default_hops() -> usize {
    2
}
fn default_max_ctx_triples() -> usize {
    80
}
fn default_max_eventtype_items() -> usize {
    250
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            tier: default_tier(),
            runs: default_runs(),
            temperature: default_temperature(),
            max_tokens: None,
            hops: default_hops(),
            max_ctx_triples: default_max_ctx_triples(),
            max_eventtype_items: default_max_eventtype_items(),
            sleep_ms: None,
        }
    }
}

impl BatchConfig {
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
            .unwrap_or_else(|| self.tier.default_max_tokens())
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms.unwrap_or_else(|| self.tier.default_sleep_ms()))
    }

    /// Generation parameters for this batch.
    pub fn generation_params(&self, limits: PromptLimits) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens(),
            limits,
            retrieval: RetrievalConfig {
                hops: self.hops,
                max_facts: self.max_ctx_triples,
            },
            max_eventtype_items: self.max_eventtype_items,
            ..GenerationParams::for_tier(self.tier)
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────

/// Minimum participant and location grounding rates, recorded for C0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroundingRule {
    pub min_part_rate: f64,
    pub min_where_rate: f64,
}

const C0_GROUNDING_RULE: GroundingRule = GroundingRule {
    min_part_rate: 0.5,
    min_where_rate: 0.0,
};

/// One JSONL line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub run_id: usize,
    pub config: Tier,
    pub timestamp: String,
    pub failed_step_index: Option<usize>,
    pub failed_step_name: Option<String>,
    pub errors: Vec<String>,
    pub observed_retract: Option<Fact>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding_rule: Option<GroundingRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ctx_triples: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_eventtype_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_ontology_paths: Option<Vec<String>>,
    #[serde(flatten)]
    pub generation: GenerationRecord,
}

/// Vocabulary sizes recorded in the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VocabMeta {
    pub n_event_types: usize,
    pub n_object_properties: usize,
    pub ontology_path: String,
}

/// The `<ts>_meta.json` document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMeta {
    pub scenario_id: String,
    pub config: Tier,
    pub n_runs: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    pub model: String,
    pub base_url: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbox_vocab: Option<VocabMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ctx_triples: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_eventtype_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_ontology_paths: Option<Vec<String>>,
}

/// Where a batch wrote its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
    pub jsonl_path: PathBuf,
    pub meta_path: PathBuf,
    pub records: usize,
    /// Trials that ran to completion with every retraction explained.
    pub explained_trials: usize,
}

// ── Trials ──────────────────────────────────────────────────────────────

/// Shared inputs of every trial in a batch.
pub struct TrialContext<'a, T: ?Sized> {
    pub scenario: &'a Scenario,
    pub tbox: Arc<TBox>,
    pub transport: &'a T,
    pub experiment: &'a ExperimentConfig,
    pub grounding: &'a Grounding,
    pub tier: Tier,
    pub params: &'a GenerationParams,
}

impl<T: LlmTransport + ?Sized> TrialContext<'_, T> {
    /// Run one trial and build its records.
    pub fn run_trial(&self, run_id: usize) -> Vec<TrialRecord> {
        let (report, gap) =
            runtime::run_to_gap(self.scenario, Arc::clone(&self.tbox), self.experiment);

        let Some(gap) = gap else {
            tracing::info!(run_id, steps = report.steps_completed, "trial fully explained");
            return vec![self.record(run_id, None, None, self.placeholder())];
        };

        tracing::info!(
            run_id,
            step = gap.step_index,
            unexplained = gap.unexplained.len(),
            "trial halted on unexplained retraction"
        );
        gap.unexplained
            .iter()
            .map(|retraction| {
                let request = GenerationRequest {
                    retraction,
                    step_name: &gap.step_name,
                    entities: &gap.entities,
                    facts: &gap.facts,
                };
                let generation = match hypotheses::generate(
                    self.tier,
                    self.transport,
                    &request,
                    self.grounding,
                    self.params,
                ) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(run_id, error = %err, "repair round failed");
                        let prepared = c3::prepare(&request, self.grounding, self.params);
                        GenerationRecord::repair_failed(
                            &err,
                            TierExtras::Catalog {
                                retrieval: prepared.retrieval,
                                catalog: prepared.catalog,
                                focus: None,
                                repair: None,
                            },
                        )
                    }
                };
                self.record(run_id, Some(&gap), Some(retraction), generation)
            })
            .collect()
    }

    fn placeholder(&self) -> GenerationRecord {
        let retrieval = RetrievalInfo {
            hops: self.params.retrieval.hops,
            max_ctx_triples: self.params.retrieval.max_facts,
            ctx_triples_n: 0,
        };
        let extras = match self.tier {
            Tier::C0 => TierExtras::Open {
                content_checks: None,
            },
            Tier::C1 => TierExtras::Vocabulary {},
            Tier::C2 => TierExtras::Retrieval {
                retrieval,
                focus: None,
            },
            Tier::C3 => TierExtras::Catalog {
                retrieval,
                catalog: CatalogInfo {
                    n_types: 0,
                    max_items: self.params.max_eventtype_items,
                },
                focus: None,
                repair: None,
            },
        };
        GenerationRecord::no_trigger(extras)
    }

    fn record(
        &self,
        run_id: usize,
        gap: Option<&GapSnapshot>,
        retraction: Option<&Fact>,
        generation: GenerationRecord,
    ) -> TrialRecord {
        let retrieval = self.tier.uses_retrieval();
        let catalog = self.tier == Tier::C3;
        TrialRecord {
            run_id,
            config: self.tier,
            timestamp: chrono::Local::now().to_rfc3339(),
            failed_step_index: gap.map(|g| g.step_index),
            failed_step_name: gap.map(|g| g.step_name.clone()),
            errors: gap.map(|g| g.errors.clone()).unwrap_or_default(),
            observed_retract: retraction.cloned(),
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
            grounding_rule: (self.tier == Tier::C0).then_some(C0_GROUNDING_RULE),
            hops: retrieval.then_some(self.params.retrieval.hops),
            max_ctx_triples: retrieval.then_some(self.params.retrieval.max_facts),
            max_eventtype_items: catalog.then_some(self.params.max_eventtype_items),
            extra_ontology_paths: catalog.then(|| self.tbox.extra_sources()),
            generation,
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────────

/// Run `config.runs` trials and write `<ts>.jsonl` plus `<ts>_meta.json`
/// under `<out_dir>/<tier>/<scenario_id>/`.
pub fn run_batch<T: LlmTransport + ?Sized>(
    scenario: &Scenario,
    tbox: Arc<TBox>,
    transport: &T,
    config: &BatchConfig,
    experiment: &ExperimentConfig,
    limits: PromptLimits,
) -> BatchResult<BatchOutput> {
    if config.runs == 0 {
        return Err(BatchError::InvalidConfig {
            message: "runs must be at least 1".into(),
        });
    }
    let tier = config.tier;
    let params = config.generation_params(limits);
    let grounding = Grounding::from_tbox(&tbox, limits.max_event_types);

    let started = chrono::Local::now();
    let ts = started.format("%Y%m%d_%H%M%S").to_string();
    let dir = config.out_dir.join(tier.dir_name()).join(&scenario.id);
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    let jsonl_path = dir.join(format!("{ts}.jsonl"));
    let meta_path = dir.join(format!("{ts}_meta.json"));

    let meta = batch_meta(scenario, &tbox, &grounding, transport, config, &params, &started);
    write_meta(&meta_path, &meta)?;

    tracing::info!(
        scenario = %scenario.id,
        tier = %tier,
        runs = config.runs,
        out = %jsonl_path.display(),
        "starting batch"
    );

    let ctx = TrialContext {
        scenario,
        tbox: Arc::clone(&tbox),
        transport,
        experiment,
        grounding: &grounding,
        tier,
        params: &params,
    };
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&jsonl_path)
        .map_err(io_err(&jsonl_path))?;

    let mut records = 0;
    let mut explained_trials = 0;
    let pause = config.sleep();
    for run_id in 1..=config.runs {
        let trial = ctx.run_trial(run_id);
        if trial.iter().all(|r| r.observed_retract.is_none()) {
            explained_trials += 1;
        }
        for record in &trial {
            let line = serde_json::to_string(record)?;
            writeln!(out, "{line}").map_err(io_err(&jsonl_path))?;
            records += 1;
        }
        out.flush().map_err(io_err(&jsonl_path))?;
        tracing::debug!(run_id, records = trial.len(), "trial written");

        if run_id < config.runs && !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }

    tracing::info!(records, explained_trials, "batch complete");
    Ok(BatchOutput {
        jsonl_path,
        meta_path,
        records,
        explained_trials,
    })
}

fn write_meta(path: &Path, meta: &BatchMeta) -> BatchResult<()> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, meta)?;
    writer.flush().map_err(io_err(path))
}

fn batch_meta<T: LlmTransport + ?Sized>(
    scenario: &Scenario,
    tbox: &TBox,
    grounding: &Grounding,
    transport: &T,
    config: &BatchConfig,
    params: &GenerationParams,
    started: &chrono::DateTime<chrono::Local>,
) -> BatchMeta {
    let tier = config.tier;
    let retrieval = tier.uses_retrieval();
    let catalog = tier == Tier::C3;
    let ontology_path = tbox
        .ontologies()
        .first()
        .map(|o| match &o.source {
            OntologySource::Bundled => o.meta.id.clone(),
            OntologySource::File(p) => p.display().to_string(),
        })
        .unwrap_or_default();
    BatchMeta {
        scenario_id: scenario.id.clone(),
        config: tier,
        n_runs: config.runs,
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        model: transport.model().to_string(),
        base_url: transport.base_url().to_string(),
        started_at: started.to_rfc3339(),
        tbox_vocab: (tier != Tier::C0).then(|| VocabMeta {
            n_event_types: grounding.vocab.event_types.len(),
            n_object_properties: grounding.vocab.object_properties.len(),
            ontology_path,
        }),
        hops: retrieval.then_some(params.retrieval.hops),
        max_ctx_triples: retrieval.then_some(params.retrieval.max_facts),
        max_eventtype_items: catalog.then_some(params.max_eventtype_items),
        extra_ontology_paths: catalog.then(|| tbox.extra_sources()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedTransport;

    fn context_for<'a>(
        scenario: &'a Scenario,
        transport: &'a ScriptedTransport,
        grounding: &'a Grounding,
        params: &'a GenerationParams,
        experiment: &'a ExperimentConfig,
        tier: Tier,
    ) -> TrialContext<'a, ScriptedTransport> {
        TrialContext {
            scenario,
            tbox: Arc::new(scenario.build_tbox().unwrap()),
            transport,
            experiment,
            grounding,
            tier,
            params,
        }
    }

    #[test]
    fn config_defaults_follow_tier() {
        let mut cfg = BatchConfig::default();
        assert_eq!(cfg.max_tokens(), 600);
        assert!(cfg.sleep().is_zero());
        cfg.tier = Tier::C3;
        assert_eq!(cfg.max_tokens(), 850);
        assert_eq!(cfg.sleep(), Duration::from_millis(50));
        cfg.max_tokens = Some(100);
        assert_eq!(cfg.max_tokens(), 100);
    }

    #[test]
    fn explained_trial_yields_placeholder() {
        let scenario = Scenario::bundled("nominal").unwrap();
        let transport = ScriptedTransport::new();
        let params = GenerationParams::for_tier(Tier::C2);
        let experiment = ExperimentConfig::default();
        let grounding = Grounding::default();
        let ctx = context_for(&scenario, &transport, &grounding, &params, &experiment, Tier::C2);

        let records = ctx.run_trial(1);
        assert_eq!(records.len(), 1);
        assert_eq!(transport.call_count(), 0);
        let v = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(v["schema_error_type"], "no_unexplained_trigger");
        assert_eq!(v["schema_error_msg"], "No unexplained retracts were detected.");
        assert!(v["observed_retract"].is_null());
        assert_eq!(v["retrieval"]["ctx_triples_n"], 0);
        assert_eq!(v["hops"], 2);
        assert_eq!(v["config"], "C2");
    }

    #[test]
    fn unexplained_trial_records_the_gap() {
        let scenario = Scenario::bundled("medicine_lost").unwrap();
        let transport = ScriptedTransport::new();
        transport.push_text("not json");
        let params = GenerationParams::for_tier(Tier::C0);
        let experiment = ExperimentConfig::default();
        let grounding = Grounding::default();
        let ctx = context_for(&scenario, &transport, &grounding, &params, &experiment, Tier::C0);

        let records = ctx.run_trial(3);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.run_id, 3);
        assert_eq!(r.failed_step_index, Some(6));
        assert!(r.observed_retract.is_some());
        assert!(!r.errors.is_empty());
        assert_eq!(r.grounding_rule, Some(C0_GROUNDING_RULE));
        let v = serde_json::to_value(r).unwrap();
        assert_eq!(v["schema_error_type"], "json_parse");
        assert_eq!(v["raw_text"], "not json");
        assert!(v.get("hops").is_none());
    }

    #[test]
    fn meta_file_is_complete_when_batch_returns() {
        let scenario = Scenario::bundled("nominal").unwrap();
        let tbox = Arc::new(scenario.build_tbox().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let cfg = BatchConfig {
            out_dir: dir.path().to_path_buf(),
            runs: 2,
            ..Default::default()
        };
        let out = run_batch(
            &scenario,
            tbox,
            &ScriptedTransport::new(),
            &cfg,
            &ExperimentConfig::default(),
            PromptLimits::default(),
        )
        .unwrap();

        let text = fs::read_to_string(&out.meta_path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["scenario_id"], "nominal");
        assert_eq!(v["n_runs"], 2);
        assert!(text.trim_end().ends_with('}'));
    }

    #[test]
    fn write_meta_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("meta.json");
        let meta = BatchMeta {
            scenario_id: "nominal".into(),
            config: Tier::C0,
            n_runs: 1,
            temperature: 0.0,
            max_tokens: 600,
            model: "m".into(),
            base_url: "http://localhost".into(),
            started_at: "2024-01-01T00:00:00Z".into(),
            tbox_vocab: None,
            hops: None,
            max_ctx_triples: None,
            max_eventtype_items: None,
            extra_ontology_paths: None,
        };
        let err = write_meta(&path, &meta).unwrap_err();
        assert!(matches!(err, BatchError::Io { .. }));
    }

    #[test]
    fn zero_runs_is_rejected() {
        let scenario = Scenario::bundled("nominal").unwrap();
        let tbox = Arc::new(scenario.build_tbox().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let cfg = BatchConfig {
            out_dir: dir.path().to_path_buf(),
            runs: 0,
            ..Default::default()
        };
        let err = run_batch(
            &scenario,
            tbox,
            &ScriptedTransport::new(),
            &cfg,
            &ExperimentConfig::default(),
            PromptLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig { .. }));
    }
}
