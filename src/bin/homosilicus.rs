#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use homosilicus_harness::catalog::{Persona, PersonaCatalog, ScenarioCatalog};
use homosilicus_harness::config::ExperimentConfig;
use homosilicus_harness::gateway::openrouter::OpenRouterAdapter;
use homosilicus_harness::gateway::{ChatGateway, NoopUsageSink, ProviderGateway, StderrUsageSink};
use homosilicus_harness::judge::{InferenceGateway, LlmJudge};
use homosilicus_harness::runner::{RunMode, RunSummary, RunTarget, Runner};
use homosilicus_harness::store::{PersonaKey, ResultStore};
use homosilicus_harness::summary::{self, join_keys};
use homosilicus_harness::validate::{self, Issue, ValidationReport};

#[derive(Parser)]
#[command(
    name = "homosilicus",
    version,
    about = "Persona x scenario social-preference experiments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run personas (or the no-persona baseline) against the model
    #[command(group(
        ArgGroup::new("target")
            .required(true)
            .args(["all", "ids", "baseline", "rerun_missing", "rerun_problems"])
    ))]
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Every persona without a result document
        #[arg(long)]
        all: bool,
        /// Comma-separated persona ids; existing documents are overwritten
        #[arg(long, value_delimiter = ',')]
        ids: Vec<u64>,
        /// No-persona baseline, repeated N times (default 1)
        #[arg(long, num_args = 0..=1, default_missing_value = "1")]
        baseline: Option<u32>,
        /// Personas in the catalog with no result document
        #[arg(long)]
        rerun_missing: bool,
        /// Personas whose document the validator flags
        #[arg(long)]
        rerun_problems: bool,
        /// One request at a time per persona
        #[arg(long)]
        serial: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, value_enum, default_value_t = CliUsageSink::None)]
        usage: CliUsageSink,
    },
    /// Report missing and problematic result documents
    Validate {
        #[arg(long)]
        config: PathBuf,
        /// Write every issue as JSON lines
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Left/Right tallies per difficulty and scenario
    Summary {
        #[arg(long)]
        config: PathBuf,
        /// Group by a persona attribute (e.g. a domain label)
        #[arg(long)]
        by: Option<String>,
        /// Summarize the baseline store instead
        #[arg(long)]
        baseline: bool,
        /// Also write the tallies as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Merge result documents into one file per persona attribute value
    Merge {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        by: String,
        #[arg(long)]
        out_dir: PathBuf,
    },
}

/// CLI-facing usage sink choice (clap::ValueEnum).
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliUsageSink {
    None,
    Stderr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            all,
            ids,
            baseline,
            rerun_missing,
            rerun_problems,
            serial,
            workers,
            concurrency,
            model,
            usage,
        } => {
            let mut config = ExperimentConfig::load(&config)?;
            if let Some(w) = workers {
                config.workers = w;
            }
            if let Some(c) = concurrency {
                config.concurrency = c;
            }
            if let Some(m) = model {
                config.model = m;
            }
            config.validate()?;

            let scenarios = Arc::new(ScenarioCatalog::load(&config.scenarios)?);
            let run_id = Uuid::new_v4();
            let judge: Arc<dyn InferenceGateway> = Arc::new(
                LlmJudge::new(chat_gateway(usage)?, config.judge_config()).with_run(run_id),
            );
            let runner_for = |dir: &Path, mode: RunMode, skip_existing: bool| {
                ResultStore::open(dir).map(|store| {
                    Runner::new(
                        judge.clone(),
                        scenarios.clone(),
                        config.language.template(),
                        store,
                        config.runner_config(mode, skip_existing),
                    )
                    .with_run_id(run_id)
                })
            };
            // Explicit ids and re-runs are small targeted batches.
            let targeted = !ids.is_empty() || rerun_missing || rerun_problems;
            let mode = if serial || targeted {
                RunMode::Serial
            } else {
                RunMode::Bulk
            };

            if let Some(repeats) = baseline {
                let runner = runner_for(config.baseline_dir.as_path(), mode, true)?;
                let _lock = runner.store().lock_exclusive()?;
                let summary = runner.run_baseline(repeats).await?;
                finish(&summary, runner.store())?;
                return Ok(());
            }

            let personas = PersonaCatalog::load_jsonl(&config.personas, config.max_personas)?;

            if all {
                let runner = runner_for(config.output_dir.as_path(), mode, true)?;
                let _lock = runner.store().lock_exclusive()?;
                let summary = runner.run(personas.personas()).await?;
                finish(&summary, runner.store())?;
            } else if !ids.is_empty() {
                let selected = select_known(&personas, &ids);
                let runner = runner_for(config.output_dir.as_path(), mode, false)?;
                let _lock = runner.store().lock_exclusive()?;
                let summary = runner.run(&selected).await?;
                finish(&summary, runner.store())?;
            } else if rerun_missing {
                let runner = runner_for(config.output_dir.as_path(), mode, true)?;
                let _lock = runner.store().lock_exclusive()?;
                let known = personas.ids().into_iter().map(PersonaKey::Persona);
                let missing = validate::missing_keys(known, runner.store())?;
                println!("missing ({}): {}", missing.len(), join_keys(&missing));
                let ids: Vec<u64> = missing.iter().filter_map(|k| k.persona_idx()).collect();
                let summary = runner.run(&personas.select(&ids)).await?;
                finish(&summary, runner.store())?;
            } else if rerun_problems {
                let expected = scenarios.expected_slots();

                let runner = runner_for(config.output_dir.as_path(), mode, false)?;
                let _lock = runner.store().lock_exclusive()?;
                let report =
                    validate::check_problems(runner.store(), &config.problems, Some(&expected))?;
                println!(
                    "flagged ({}): {}",
                    report.flagged.len(),
                    join_keys(&report.flagged)
                );
                let ids: Vec<u64> = report
                    .flagged
                    .iter()
                    .filter_map(|k| k.persona_idx())
                    .collect();
                let summary = runner.run(&select_known(&personas, &ids)).await?;
                finish(&summary, runner.store())?;

                if config.baseline_dir.is_dir() {
                    let runner = runner_for(config.baseline_dir.as_path(), mode, false)?;
                    let _lock = runner.store().lock_exclusive()?;
                    let report = validate::check_problems(
                        runner.store(),
                        &config.problems,
                        Some(&expected),
                    )?;
                    if !report.flagged.is_empty() {
                        println!(
                            "flagged baseline ({}): {}",
                            report.flagged.len(),
                            join_keys(&report.flagged)
                        );
                        let targets = report
                            .flagged
                            .iter()
                            .map(|key| RunTarget {
                                key: *key,
                                description: String::new(),
                            })
                            .collect();
                        let summary = runner.run_targets(targets).await?;
                        finish(&summary, runner.store())?;
                    }
                }
            }
        }
        Commands::Validate { config, report } => {
            let config = ExperimentConfig::load(&config)?;
            let scenarios = ScenarioCatalog::load(&config.scenarios)?;
            let personas = PersonaCatalog::load_jsonl(&config.personas, config.max_personas)?;
            let expected = scenarios.expected_slots();

            let store = ResultStore::open(&config.output_dir)?;
            let known = personas.ids().into_iter().map(PersonaKey::Persona);
            let missing = validate::missing_keys(known, &store)?;
            let problems = validate::check_problems(&store, &config.problems, Some(&expected))?;
            println!("store: {}", store.dir().display());
            println!("missing ({}): {}", missing.len(), join_keys(&missing));
            print_problems(&problems);

            let mut issues: Vec<Issue> = problems.issues;
            if config.baseline_dir.is_dir() {
                let baseline = ResultStore::open(&config.baseline_dir)?;
                let problems =
                    validate::check_problems(&baseline, &config.problems, Some(&expected))?;
                println!("baseline store: {}", baseline.dir().display());
                print_problems(&problems);
                issues.extend(problems.issues);
            }

            if let Some(path) = report {
                validate::write_issue_report(&path, &issues)?;
                info!("[cli] wrote {} issues to {}", issues.len(), path.display());
            }
        }
        Commands::Summary {
            config,
            by,
            baseline,
            out,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let dir = if baseline {
                &config.baseline_dir
            } else {
                &config.output_dir
            };
            if !dir.is_dir() {
                return Err(format!("result store {} does not exist", dir.display()).into());
            }
            let store = ResultStore::open(dir)?;

            match by {
                Some(attribute) => {
                    let personas =
                        PersonaCatalog::load_jsonl(&config.personas, config.max_personas)?;
                    let groups = summary::summarize_by(&store, &personas, &attribute)?;
                    for (group, tally) in &groups {
                        println!("== {attribute}: {group}");
                        print!("{}", tally.render());
                        println!();
                    }
                    if let Some(path) = out {
                        std::fs::write(path, serde_json::to_string_pretty(&groups)?)?;
                    }
                }
                None => {
                    let tally = summary::summarize(&store)?;
                    print!("{}", tally.render());
                    if let Some(path) = out {
                        std::fs::write(path, serde_json::to_string_pretty(&tally)?)?;
                    }
                }
            }
        }
        Commands::Merge {
            config,
            by,
            out_dir,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let personas = PersonaCatalog::load_jsonl(&config.personas, config.max_personas)?;
            let store = ResultStore::open(&config.output_dir)?;
            let groups = summary::merge_by_attribute(&store, &personas, &by, &out_dir)?;
            for g in &groups {
                let note = if g.merged == g.expected {
                    ""
                } else {
                    "  (incomplete)"
                };
                println!(
                    "{:<32} {:>5}/{:<5} {}{}",
                    g.group,
                    g.merged,
                    g.expected,
                    g.file.display(),
                    note
                );
            }
        }
    }

    Ok(())
}

/// Catalog personas for `ids`, warning about ids the catalog does not hold.
fn select_known(personas: &PersonaCatalog, ids: &[u64]) -> Vec<Persona> {
    let unknown = personas.unknown(ids);
    if !unknown.is_empty() {
        warn!("[cli] ids not in persona catalog: {:?}", unknown);
    }
    personas.select(ids)
}

fn chat_gateway(usage: CliUsageSink) -> Result<Arc<dyn ChatGateway>, Box<dyn std::error::Error>> {
    let adapter = OpenRouterAdapter::from_env()?;
    let gateway: Arc<dyn ChatGateway> = match usage {
        CliUsageSink::None => Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink))),
        CliUsageSink::Stderr => {
            Arc::new(ProviderGateway::new(adapter, Arc::new(StderrUsageSink)))
        }
    };
    Ok(gateway)
}

fn finish(summary: &RunSummary, store: &ResultStore) -> Result<(), Box<dyn std::error::Error>> {
    let path = summary.write_to(store.dir())?;
    println!("run {}", summary.run_id);
    println!("  store:       {}", store.dir().display());
    println!(
        "  skipped:     {} {}",
        summary.skipped.len(),
        join_keys(&summary.skipped)
    );
    println!(
        "  attempted:   {} {}",
        summary.attempted.len(),
        join_keys(&summary.attempted)
    );
    println!("  completed:   {}", summary.completed);
    println!("  failed:      {}", summary.failed.len());
    println!("  slot errors: {}", summary.slot_errors);
    println!("  cost:        ${:.4}", summary.cost_dollars());
    for failure in &summary.failed {
        println!("    {}: {}", failure.persona, failure.error);
    }
    info!("[cli] summary written to {}", path.display());
    Ok(())
}

fn print_problems(report: &ValidationReport) {
    println!(
        "flagged ({} of {}): {}",
        report.flagged.len(),
        report.scanned,
        join_keys(&report.flagged)
    );
    for issue in &report.issues {
        println!(
            "  {} {} {:?}: {}",
            issue.file,
            issue.slot.as_deref().unwrap_or("-"),
            issue.kind,
            issue.detail
        );
    }
}
