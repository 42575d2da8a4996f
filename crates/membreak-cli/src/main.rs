//! membreak - memory-break evaluation CLI
//!
//! ## Commands
//!
//! - `run`: drive a full evaluation run over replayed agent sessions
//! - `judge`: score a question/answer file with the configured judge
//! - `detect`: replay context readings through a compression detector
//! - `agents`: list the default detector for each agent kind
//! - `config`: print the effective configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{info, Level};

use membreak_core::detector::SessionSignal;
use membreak_core::session::AgentInfo;
use membreak_core::{
    apply_thresholds, AgentRegistry, CreateRunRequest, DetectorKind, DirectoryIsolator,
    EvalService, JudgeInput, JudgeService, LocalChangeSource, OrchestratorConfig, ReplayAdapter,
    ReplayScript, RunCoordinator, RunStatusView, TemplatePromptSource, METRICS,
};
use membreak_state::{
    AgentKind, AgentRunRecord, JudgeKind, MemoryRunStateStore, RubricDimension, RubricThresholds,
    RunStateStore,
};

#[derive(Parser)]
#[command(name = "membreak")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Memory-break evaluation runs for coding agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "MEMBREAK_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every agent through the protocol against a local change directory
    Run {
        /// Directory holding the checked-out change
        #[arg(short, long)]
        change: PathBuf,

        /// Agent kinds to evaluate (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        agents: Vec<String>,

        /// JSON file mapping agent kind to a replay script
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Rubric dimensions (comma separated codes, default: all)
        #[arg(short, long, value_delimiter = ',')]
        rubric: Vec<RubricDimension>,

        /// Per-dimension pass threshold, e.g. `TTL=0.8` (repeatable)
        #[arg(short, long = "threshold", value_parser = parse_threshold)]
        thresholds: Vec<(RubricDimension, f64)>,

        /// Maximum number of changed files included in prompts
        #[arg(long)]
        max_files: Option<usize>,

        /// Where per-agent workspace copies are created
        #[arg(long, env = "MEMBREAK_WORKSPACE_ROOT")]
        workspace_root: Option<PathBuf>,

        /// Print the final run status as JSON
        #[arg(long)]
        json_output: bool,
    },

    /// Score pre/post answers without running any agent
    Judge {
        /// JSON file with `questions`, `pre_answers` and `post_answers`
        #[arg(short, long)]
        input: PathBuf,

        /// Judge to use (default: MEMBREAK_DEFAULT_JUDGE or heuristic)
        #[arg(long)]
        judge: Option<JudgeKind>,

        /// Rubric dimensions (comma separated codes, default: all)
        #[arg(short, long, value_delimiter = ',')]
        rubric: Vec<RubricDimension>,

        /// Per-dimension pass threshold, e.g. `AR=0.6` (repeatable)
        #[arg(short, long = "threshold", value_parser = parse_threshold)]
        thresholds: Vec<(RubricDimension, f64)>,
    },

    /// Feed a sequence of readings to a detector and report the first firing
    Detect {
        #[arg(short, long, value_enum, default_value_t = DetectorArg::ContextFooter)]
        detector: DetectorArg,

        /// Readings: percent left for `context-footer`, tokens used for
        /// `token-counter`, ignored by `step-count` (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        readings: Vec<f64>,

        /// Low-water mark in percent
        #[arg(long)]
        threshold_low: Option<f64>,

        /// Minimum freed-up percent that counts as a jump
        #[arg(long)]
        jump: Option<f64>,
    },

    /// List known agent kinds and their detectors
    Agents {
        /// Agent kinds to describe (comma separated)
        #[arg(value_delimiter = ',', default_value = "claude,gemini,iflow,codex")]
        kinds: Vec<String>,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DetectorArg {
    ContextFooter,
    TokenCounter,
    Composite,
    StepCount,
}

impl From<DetectorArg> for DetectorKind {
    fn from(arg: DetectorArg) -> Self {
        match arg {
            DetectorArg::ContextFooter => DetectorKind::ContextFooter,
            DetectorArg::TokenCounter => DetectorKind::TokenCounter,
            DetectorArg::Composite => DetectorKind::Composite,
            DetectorArg::StepCount => DetectorKind::StepCount,
        }
    }
}

#[derive(Deserialize)]
struct QaFile {
    questions: Vec<String>,
    pre_answers: Vec<String>,
    post_answers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    membreak_core::init_tracing(cli.json, level);

    let config = OrchestratorConfig::from_env().context("invalid MEMBREAK_* configuration")?;

    match cli.command {
        Commands::Run {
            change,
            agents,
            script,
            rubric,
            thresholds,
            max_files,
            workspace_root,
            json_output,
        } => {
            let request = RunArgs {
                change,
                agents,
                script,
                rubric,
                thresholds,
                max_files,
                workspace_root,
            };
            cmd_run(config, request, json_output).await
        }
        Commands::Judge {
            input,
            judge,
            rubric,
            thresholds,
        } => cmd_judge(config, &input, judge, rubric, thresholds).await,
        Commands::Detect {
            detector,
            readings,
            threshold_low,
            jump,
        } => cmd_detect(config, detector, &readings, threshold_low, jump),
        Commands::Agents { kinds } => cmd_agents(&kinds),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_threshold(raw: &str) -> Result<(RubricDimension, f64), String> {
    let (dim, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected DIM=VALUE, got {raw:?}"))?;
    let dim: RubricDimension = dim.trim().parse().map_err(|e| format!("{e}"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid threshold {value:?}: {e}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("threshold must be within 0..=1, got {value}"));
    }
    Ok((dim, value))
}

fn rubric_or_all(rubric: Vec<RubricDimension>) -> Vec<RubricDimension> {
    if rubric.is_empty() {
        RubricDimension::ALL.to_vec()
    } else {
        rubric
    }
}

fn thresholds_from(pairs: &[(RubricDimension, f64)]) -> RubricThresholds {
    pairs
        .iter()
        .fold(RubricThresholds::new(), |t, (dim, value)| t.with(*dim, *value))
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

struct RunArgs {
    change: PathBuf,
    agents: Vec<String>,
    script: Option<PathBuf>,
    rubric: Vec<RubricDimension>,
    thresholds: Vec<(RubricDimension, f64)>,
    max_files: Option<usize>,
    workspace_root: Option<PathBuf>,
}

/// Registry with one replay adapter per requested kind, each using the
/// kind's default detector.
fn replay_registry(kinds: &[AgentKind], scripts: &BTreeMap<String, ReplayScript>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for kind in kinds {
        let script = scripts.get(kind.as_str()).cloned().unwrap_or_default();
        let info = AgentInfo::new(kind.clone(), kind.as_str())
            .with_description("replayed session");
        registry.register(Arc::new(ReplayAdapter::new(kind.as_str(), script)), info, false);
    }
    registry
}

async fn cmd_run(config: OrchestratorConfig, args: RunArgs, json_output: bool) -> Result<()> {
    let kinds: Vec<AgentKind> = args.agents.iter().map(AgentKind::new).collect();
    let scripts: BTreeMap<String, ReplayScript> = match &args.script {
        Some(path) => read_json_file(path)?,
        None => BTreeMap::new(),
    };
    let workspace_root = args
        .workspace_root
        .unwrap_or_else(|| std::env::temp_dir().join("membreak-workspaces"));

    let store: Arc<dyn RunStateStore> = Arc::new(MemoryRunStateStore::new());
    let coordinator = RunCoordinator::new(store, replay_registry(&kinds, &scripts), config)
        .with_change_source(Arc::new(LocalChangeSource))
        .with_isolator(Arc::new(DirectoryIsolator::new(&workspace_root)))
        .with_prompt_source(Arc::new(TemplatePromptSource));
    let service = EvalService::new(coordinator);

    let mut request = CreateRunRequest::new(args.change.to_string_lossy(), kinds)
        .with_rubric(rubric_or_all(args.rubric))
        .with_thresholds(thresholds_from(&args.thresholds));
    request.max_files = args.max_files;

    let run = service.create_run(request).await?;
    info!(run_id = %run.id, workspace_root = %workspace_root.display(), "run created");
    service.run_to_completion(&run.id).await?;
    let view = service.get_run_status(&run.id).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", render_run(&view));
    }
    let metrics = METRICS.snapshot();
    info!(
        sessions = metrics.sessions_started,
        compressions = metrics.compressions_detected,
        fallbacks = metrics.judge_fallbacks,
        "run complete"
    );
    Ok(())
}

fn render_agent(agent: &AgentRunRecord, view: &RunStatusView) -> String {
    let mut line = format!("  {:<10} {:<11}", agent.agent_kind.as_str(), agent.status.as_str());
    if let Some(score) = view.scores.get(&agent.id) {
        let verdict = if score.passed { "PASS" } else { "FAIL" };
        line.push_str(&format!(" {verdict} aggregate={:.2}", score.aggregate));
        for detail in score.breaking_details.values() {
            line.push_str(&format!("\n      {detail}"));
        }
    } else if let Some(message) = &agent.error_message {
        line.push_str(&format!(" {message}"));
    }
    line
}

fn render_run(view: &RunStatusView) -> String {
    let run = &view.run;
    let mut out = format!("Run {} [{}]\n", run.id, run.status.as_str());
    if let Some(message) = &run.error_message {
        out.push_str(&format!("  error: {message}\n"));
    }
    for agent in &view.agent_runs {
        out.push_str(&render_agent(agent, view));
        out.push('\n');
    }
    out
}

async fn cmd_judge(
    mut config: OrchestratorConfig,
    input: &Path,
    judge: Option<JudgeKind>,
    rubric: Vec<RubricDimension>,
    thresholds: Vec<(RubricDimension, f64)>,
) -> Result<()> {
    let qa: QaFile = read_json_file(input)?;
    if qa.pre_answers.len() != qa.questions.len() || qa.post_answers.len() != qa.questions.len() {
        bail!(
            "{}: expected one pre and one post answer per question ({} questions)",
            input.display(),
            qa.questions.len()
        );
    }
    if let Some(kind) = judge {
        config.judge.default_judge = kind;
    }

    let judges = JudgeService::from_config(&config.judge);
    let judge_input = JudgeInput {
        questions: qa.questions,
        pre_answers: qa.pre_answers,
        post_answers: qa.post_answers,
        rubric: rubric_or_all(rubric),
    };
    let output = judges.evaluate(&judge_input).await;
    let verdict = apply_thresholds(&output.scores, &thresholds_from(&thresholds));

    let report = serde_json::json!({
        "judge_kind": output.judge_kind,
        "judge_model": output.judge_model,
        "scores": verdict.scores,
        "aggregate": verdict.aggregate,
        "thresholds": verdict.thresholds,
        "passed": verdict.passed(),
        "breaking_dimensions": verdict.breaking_dimensions,
        "breaking_details": verdict.breaking_details,
        "rationale": output.rationale,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn signals_for(detector: DetectorArg, readings: &[f64]) -> Vec<SessionSignal> {
    readings
        .iter()
        .enumerate()
        .map(|(i, reading)| {
            let mut signal = SessionSignal {
                iteration: i as u32 + 1,
                ..Default::default()
            };
            match detector {
                DetectorArg::TokenCounter => signal.tokens_used = Some(reading.max(0.0) as u64),
                DetectorArg::Composite => signal.estimated_tokens = reading.max(0.0) as u64,
                DetectorArg::ContextFooter | DetectorArg::StepCount => {
                    signal.context_left_percent = Some(*reading)
                }
            }
            signal
        })
        .collect()
}

fn cmd_detect(
    mut config: OrchestratorConfig,
    detector: DetectorArg,
    readings: &[f64],
    threshold_low: Option<f64>,
    jump: Option<f64>,
) -> Result<()> {
    if let Some(low) = threshold_low {
        config.detection.threshold_low = low;
    }
    if let Some(jump) = jump {
        config.detection.jump_threshold = jump;
    }
    config.validate()?;

    let built = DetectorKind::from(detector).build(&config.detection);
    let signals = signals_for(detector, readings);
    for n in 1..=signals.len() {
        let result = built.observe(&signals[..n]);
        if result.fired {
            println!("{}", serde_json::to_string_pretty(&result)?);
            info!(reading = n, detector = built.name(), "compression detected");
            return Ok(());
        }
    }
    println!("no compression detected across {} readings", signals.len());
    Ok(())
}

fn cmd_agents(kinds: &[String]) -> Result<()> {
    for kind in kinds.iter().map(AgentKind::new) {
        println!("{:<10} {:?}", kind.as_str(), DetectorKind::default_for(&kind));
    }
    Ok(())
}
