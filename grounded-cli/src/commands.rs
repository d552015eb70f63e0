//! Subcommand handlers.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use grounded_core::config::user_config_path;
use grounded_core::error::ConfigError;
use grounded_core::eval::load_dataset;
use grounded_core::gateway::{self, AppState};
use grounded_core::{
    AnswerResult, EngineConfig, EvalHarness, EvalRun, InMemoryRunStore, QueryEngine, QueryRequest,
    RetrievalDiagnostics, RunStore, SqliteRunStore, StreamCoordinator, StreamEvent,
};

use crate::{Commands, ConfigAction};

/// Layered configuration plus the `--corpus` override.
///
/// An explicit `--config` that does not exist is an error rather than an
/// empty layer.
pub fn load_config(path: Option<&Path>, corpus: Option<&Path>) -> anyhow::Result<EngineConfig> {
    if let Some(path) = path
        && !path.exists()
    {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    let mut config = grounded_core::load_config(path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(corpus) = corpus {
        config.corpus.path = Some(corpus.to_path_buf());
    }
    config.validate()?;
    debug!(
        corpus = ?config.corpus.path,
        embedding = %config.embedding.provider,
        generation = %config.generation.provider,
        "Configuration loaded"
    );
    Ok(config)
}

pub async fn handle_command(
    command: Commands,
    config: EngineConfig,
    quiet: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Query {
            question,
            top_k,
            diagnostics,
            json,
        } => {
            let engine = QueryEngine::from_config(config).await?;
            let response = engine
                .query(QueryRequest {
                    question,
                    top_k,
                    diagnostics,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print!("{}", render_answer(&response.result));
                if let Some(diagnostics) = &response.diagnostics {
                    print!("{}", render_diagnostics(diagnostics));
                }
            }
            Ok(())
        }
        Commands::Stream {
            question,
            top_k,
            json,
        } => {
            let engine = QueryEngine::from_config(config).await?;
            let request = QueryRequest {
                question,
                top_k,
                diagnostics: false,
            };
            stream(StreamCoordinator::new(engine), request, json, quiet).await
        }
        Commands::Eval {
            dataset,
            k,
            runs_db,
            no_history,
            json,
        } => {
            let dataset = load_dataset(&dataset)?;
            let k = k.unwrap_or(config.eval.k);
            let store = open_store(history_path(runs_db, no_history, &config)).await?;
            let engine = QueryEngine::from_config(config).await?;
            let run = EvalHarness::new(engine, store).run(&dataset, k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print!("{}", render_run(&run));
            }
            if !run.gates_passed() {
                anyhow::bail!("Blocking eval gates failed for dataset '{}'", run.dataset);
            }
            Ok(())
        }
        Commands::Serve {
            host,
            port,
            runs_db,
            no_history,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let store = open_store(history_path(runs_db, no_history, &config)).await?;
            let engine = QueryEngine::from_config(config).await?;
            let harness = EvalHarness::new(engine.clone(), store);
            gateway::run(Arc::new(AppState::new(engine, harness))).await?;
            Ok(())
        }
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn handle_config(action: ConfigAction, config: &EngineConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Init => {
            let config_path = user_config_path()
                .ok_or_else(|| anyhow::anyhow!("No configuration directory on this platform"))?;
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml_str = toml::to_string_pretty(&EngineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
    }
}

/// Run history file: `--runs-db`, then `eval.runs_db`. None keeps history
/// in memory for this process only.
fn history_path(flag: Option<PathBuf>, no_history: bool, config: &EngineConfig) -> Option<PathBuf> {
    if no_history {
        return None;
    }
    flag.or_else(|| config.eval.runs_db.clone())
}

async fn open_store(path: Option<PathBuf>) -> anyhow::Result<Arc<dyn RunStore>> {
    let store: Arc<dyn RunStore> = match path {
        Some(path) => {
            debug!(path = %path.display(), "Opening run history");
            Arc::new(SqliteRunStore::open(path).await?)
        }
        None => Arc::new(InMemoryRunStore::new()),
    };
    Ok(store)
}

async fn stream(
    coordinator: StreamCoordinator,
    request: QueryRequest,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut rx = coordinator.start(request)?;
    let mut stdout = std::io::stdout();
    let mut streamed = false;

    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            StreamEvent::Retrieval { candidates } => {
                if !quiet {
                    eprintln!("Retrieved {} candidate(s)", candidates.len());
                }
            }
            StreamEvent::Token { text } => {
                streamed = true;
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Error { message } => eprintln!("Error: {message}"),
            StreamEvent::Citations { .. } => {}
            StreamEvent::Done { result } => {
                if streamed {
                    println!();
                    print!("{}", render_citations(&result));
                } else {
                    print!("{}", render_answer(&result));
                }
            }
        }
    }
    Ok(())
}

/// Answer text followed by its numbered sources.
pub fn render_answer(result: &AnswerResult) -> String {
    let mut out = String::new();
    match result.refusal_reason {
        Some(reason) => {
            let _ = writeln!(out, "Refused ({reason}): {}", result.answer);
        }
        None => {
            let _ = writeln!(out, "{}", result.answer);
        }
    }
    out.push_str(&render_citations(result));
    out
}

fn render_citations(result: &AnswerResult) -> String {
    let mut out = String::new();
    if result.citations.is_empty() {
        return out;
    }
    out.push_str("\nSources:\n");
    for (i, citation) in result.citations.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{}] {} ({:.3}): {}",
            i + 1,
            citation.chunk_id,
            citation.score,
            citation.quote
        );
    }
    out
}

fn render_diagnostics(diagnostics: &RetrievalDiagnostics) -> String {
    format!(
        "\nRetrieval: {} lexical + {} vector -> {} merged, {} returned (vectors {}), {}ms\n",
        diagnostics.lexical_candidates,
        diagnostics.vector_candidates,
        diagnostics.merged_candidates,
        diagnostics.returned,
        if diagnostics.vector_enabled { "on" } else { "off" },
        diagnostics.total_ms,
    )
}

/// Summary of a finished run: metrics, failures, diff and gates.
pub fn render_run(run: &EvalRun) -> String {
    let m = &run.metrics;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} on '{}' (k={}, {}ms)",
        run.run_id,
        run.dataset,
        run.k,
        run.duration_ms()
    );
    let _ = writeln!(
        out,
        "  passed      {}/{} ({:.1}%)",
        m.passed,
        m.total,
        m.pass_rate * 100.0
    );
    let _ = writeln!(
        out,
        "  hit@{}       {}/{} ({:.3})",
        run.k, m.hits, m.cite_cases, m.hit_at_k
    );
    let _ = writeln!(out, "  mrr         {:.3}", m.mrr);
    let _ = writeln!(
        out,
        "  refusals    {}/{} correct",
        m.refusals_correct, m.refuse_cases
    );

    let failures: Vec<_> = run.cases.iter().filter(|c| !c.passed).collect();
    if !failures.is_empty() {
        out.push_str("\nFailing cases:\n");
        for case in failures {
            let _ = writeln!(
                out,
                "  {} [{}]: {}",
                case.case_id,
                case.kind,
                case.failure.as_deref().unwrap_or("failed")
            );
        }
    }

    if let Some(diff) = &run.diff {
        let _ = writeln!(
            out,
            "\nSince {}: pass rate {:+.3}, hit@k {:+.3}, mrr {:+.3}",
            diff.previous_run_id, diff.pass_rate_delta, diff.hit_at_k_delta, diff.mrr_delta
        );
        if !diff.newly_failing.is_empty() {
            let _ = writeln!(out, "  newly failing: {}", diff.newly_failing.join(", "));
        }
        if !diff.newly_passing.is_empty() {
            let _ = writeln!(out, "  newly passing: {}", diff.newly_passing.join(", "));
        }
    }

    if !run.gates.is_empty() {
        out.push_str("\nGates:\n");
        for gate in &run.gates {
            let _ = writeln!(
                out,
                "  {} {} >= {} (actual {:.3}){}",
                if gate.passed { "PASS" } else { "FAIL" },
                gate.metric,
                gate.min,
                gate.actual,
                if gate.blocking { "" } else { " [advisory]" }
            );
        }
    }
    out
}
