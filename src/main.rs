//! causa CLI: run scenarios, generate hypotheses, drive batches.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use causa::batch::run_batch;
use causa::config::AppConfig;
use causa::hypotheses::{self, GenerationRequest, Grounding, Tier};
use causa::kb::TBox;
use causa::llm::{ChatMessage, LlmConfig, LlmTransport, OpenAiClient};
use causa::retrieval::{self, RetrievalConfig};
use causa::runtime::{self, GapSnapshot};
use causa::scenario::Scenario;
use causa::vocab;

#[derive(Parser)]
#[command(
    name = "causa",
    version,
    about = "Abductive explanation of vanished facts in a symbolic world model"
)]
struct Cli {
    /// Configuration file (TOML). Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario through the causal matcher and print what happened.
    Run {
        /// Bundled scenario id or path to a scenario TOML file.
        #[arg(long, default_value = "medicine_lost")]
        scenario: String,

        /// Look-back window in steps.
        #[arg(long)]
        window: Option<usize>,

        /// Also explain the old value of location updates.
        #[arg(long)]
        explain_updates: bool,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run repeated trials and write JSONL records plus a metadata file.
    Batch {
        #[arg(long, default_value = "medicine_lost")]
        scenario: String,

        /// Generator tier: c0, c1, c2 or c3.
        #[arg(long)]
        tier: Option<Tier>,

        #[arg(long)]
        runs: Option<usize>,

        #[arg(long)]
        out_dir: Option<PathBuf>,

        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        hops: Option<usize>,

        #[arg(long)]
        max_ctx_triples: Option<usize>,

        #[arg(long)]
        max_eventtype_items: Option<usize>,

        /// Pause between trials in milliseconds.
        #[arg(long)]
        sleep_ms: Option<u64>,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Print the prompt a tier would send for the scenario's first gap.
    Prompt {
        #[arg(long, default_value = "medicine_lost")]
        scenario: String,

        #[arg(long, default_value = "c0")]
        tier: Tier,
    },

    /// Print the context retrieved around the scenario's first gap.
    Retrieve {
        #[arg(long, default_value = "medicine_lost")]
        scenario: String,

        #[arg(long)]
        hops: Option<usize>,

        #[arg(long)]
        max_triples: Option<usize>,
    },

    /// Print the vocabulary the grounded tiers quote.
    Vocab {
        #[arg(long, default_value = "medicine_lost")]
        scenario: String,

        /// Print the rendered event-type catalog instead.
        #[arg(long)]
        catalog: bool,
    },

    /// Send a one-line prompt to the LLM endpoint and print the answer.
    Smoke {
        #[arg(long, default_value = "Reply with the single word: ready")]
        prompt: String,

        #[command(flatten)]
        llm: LlmArgs,
    },
}

#[derive(Args)]
struct LlmArgs {
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl LlmArgs {
    fn apply(self, cfg: &mut LlmConfig) {
        if let Some(url) = self.base_url {
            cfg.base_url = url;
        }
        if let Some(model) = self.model {
            cfg.model = model;
        }
        if let Some(t) = self.timeout_secs {
            cfg.timeout_secs = t;
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            scenario,
            window,
            explain_updates,
            json,
        } => {
            if let Some(w) = window {
                config.matcher.window = w;
            }
            config.matcher.explain_updates |= explain_updates;
            let (scenario, tbox) = load_scenario(&scenario)?;
            let (report, gap) = runtime::run_to_gap(&scenario, tbox, &config.experiment());

            if json {
                let out = serde_json::to_string_pretty(&report).into_diagnostic()?;
                println!("{out}");
                return Ok(());
            }

            println!(
                "Scenario \"{}\": {} of {} step(s) applied",
                scenario.id,
                report.steps_completed,
                scenario.steps.len()
            );
            for exp in &report.explanations {
                println!("  explained {} <- {} (score {})", exp.retraction, exp.cause, exp.score);
                println!("    {}", exp.text);
            }
            match gap {
                None => println!("All retractions explained."),
                Some(gap) => {
                    println!(
                        "Halted at step {} \"{}\": {} unexplained retraction(s)",
                        gap.step_index,
                        gap.step_name,
                        gap.unexplained.len()
                    );
                    for msg in &gap.errors {
                        println!("  {msg}");
                    }
                }
            }
            for t in &report.timings {
                println!("  {:<40} {:.3}s", t.label, t.seconds);
            }
        }

        Commands::Batch {
            scenario,
            tier,
            runs,
            out_dir,
            temperature,
            max_tokens,
            hops,
            max_ctx_triples,
            max_eventtype_items,
            sleep_ms,
            llm,
        } => {
            let b = &mut config.batch;
            if let Some(t) = tier {
                b.tier = t;
            }
            if let Some(r) = runs {
                b.runs = r;
            }
            if let Some(d) = out_dir {
                b.out_dir = d;
            }
            if let Some(t) = temperature {
                b.temperature = t;
            }
            if max_tokens.is_some() {
                b.max_tokens = max_tokens;
            }
            if let Some(h) = hops {
                b.hops = h;
            }
            if let Some(m) = max_ctx_triples {
                b.max_ctx_triples = m;
            }
            if let Some(m) = max_eventtype_items {
                b.max_eventtype_items = m;
            }
            if sleep_ms.is_some() {
                b.sleep_ms = sleep_ms;
            }
            llm.apply(&mut config.llm);

            let (scenario, tbox) = load_scenario(&scenario)?;
            let client = OpenAiClient::new(config.llm.clone());
            let out = run_batch(
                &scenario,
                tbox,
                &client,
                &config.batch,
                &config.experiment(),
                config.prompt,
            )?;
            println!(
                "Wrote {} record(s) ({} fully explained trial(s))",
                out.records, out.explained_trials
            );
            println!("  records: {}", out.jsonl_path.display());
            println!("  meta:    {}", out.meta_path.display());
        }

        Commands::Prompt { scenario, tier } => {
            let (scenario, tbox) = load_scenario(&scenario)?;
            let Some(gap) = first_gap(&scenario, &tbox, &config) else {
                return Ok(());
            };
            config.batch.tier = tier;
            let params = config.batch.generation_params(config.prompt);
            let grounding = Grounding::from_tbox(&tbox, config.prompt.max_event_types);
            for retraction in &gap.unexplained {
                let request = GenerationRequest {
                    retraction,
                    step_name: &gap.step_name,
                    entities: &gap.entities,
                    facts: &gap.facts,
                };
                println!("{}", hypotheses::render_prompt(tier, &request, &grounding, &params));
            }
        }

        Commands::Retrieve {
            scenario,
            hops,
            max_triples,
        } => {
            let (scenario, tbox) = load_scenario(&scenario)?;
            let Some(gap) = first_gap(&scenario, &tbox, &config) else {
                return Ok(());
            };
            let cfg = RetrievalConfig {
                hops: hops.unwrap_or(config.batch.hops),
                max_facts: max_triples.unwrap_or(config.batch.max_ctx_triples),
            };
            for retraction in &gap.unexplained {
                let ctx = retrieval::retrieve_subgraph(&gap.facts, retraction, cfg);
                println!("Context for {retraction} ({} fact(s)):", ctx.len());
                for f in &ctx {
                    println!("  {f}");
                }
            }
        }

        Commands::Vocab { scenario, catalog } => {
            let (_, tbox) = load_scenario(&scenario)?;
            let grounding = Grounding::from_tbox(&tbox, config.prompt.max_event_types);
            if catalog {
                println!("Preferred ({}):", grounding.catalog.preferred.len());
                println!(
                    "{}",
                    vocab::format_catalog(&grounding.catalog.preferred, config.batch.max_eventtype_items)
                );
                println!("\nFallback ({}):", grounding.catalog.fallback.len());
                println!("{}", vocab::format_catalog(&grounding.catalog.fallback, usize::MAX));
            } else {
                let out = serde_json::to_string_pretty(&grounding.vocab).into_diagnostic()?;
                println!("{out}");
            }
        }

        Commands::Smoke { prompt, llm } => {
            llm.apply(&mut config.llm);
            let client = OpenAiClient::new(config.llm.clone());
            let messages = [
                ChatMessage::system("You are a helpful assistant."),
                ChatMessage::user(prompt),
            ];
            let resp = client.chat(&messages, 0.0, Some(32))?;
            println!("model:   {}", client.model());
            println!("latency: {:.2}s", resp.latency_s);
            println!("usage:   {}", resp.usage_json());
            println!("{}", resp.text);
        }
    }

    Ok(())
}

fn load_scenario(reference: &str) -> Result<(Scenario, Arc<TBox>)> {
    let scenario = Scenario::resolve(reference)?;
    let tbox = Arc::new(scenario.build_tbox()?);
    Ok((scenario, tbox))
}

fn first_gap(scenario: &Scenario, tbox: &Arc<TBox>, config: &AppConfig) -> Option<GapSnapshot> {
    let (_, gap) = runtime::run_to_gap(scenario, Arc::clone(tbox), &config.experiment());
    if gap.is_none() {
        println!(
            "Scenario \"{}\" is fully explained; there is nothing to generate for.",
            scenario.id
        );
    }
    gap
}
