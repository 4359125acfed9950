//! CLI subcommand handlers.

use anyhow::{Context, bail};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lakeflow_core::config::{LakeflowConfig, load_config, load_config_file};
use lakeflow_core::{
    ApiAuth, Blueprint, PipelineExecutor, PipelinePlan, PipelineStatus, PlanCompiler,
    PluginRegistry, SqliteStore, TaskEnv,
};

use crate::{Commands, ConfigAction};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Compile { blueprint, output } => {
            handle_compile(&blueprint, output.as_deref(), workspace, config_path).await
        }
        Commands::Run {
            file,
            max_concurrent_tasks,
        } => handle_run(&file, max_concurrent_tasks, workspace, config_path).await,
        Commands::Plugins { json } => handle_plugins(json),
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<LakeflowConfig> {
    let config = match config_path {
        Some(path) => load_config_file(path),
        None => load_config(Some(workspace), None),
    }
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.ensure_valid()?;
    Ok(config)
}

fn registry() -> anyhow::Result<Arc<PluginRegistry>> {
    Ok(Arc::new(lakeflow_plugins::builtin_registry()?))
}

/// What a `run` input file holds.
#[derive(Debug)]
enum PlanSource {
    Plan(PipelinePlan),
    Blueprint(Blueprint),
}

/// A JSON array is a plan; an object is a blueprint.
fn parse_plan_source(text: &str) -> anyhow::Result<PlanSource> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(_) => Ok(PlanSource::Plan(serde_json::from_value(value)?)),
        Value::Object(_) => Ok(PlanSource::Blueprint(serde_json::from_value(value)?)),
        _ => bail!("expected a plan (array of stages) or a blueprint (object)"),
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn compile_blueprint(
    blueprint: &Blueprint,
    registry: &PluginRegistry,
    env: &TaskEnv,
) -> anyhow::Result<PipelinePlan> {
    let connection = env.connection(blueprint.connection_id)?;
    let Some(connector) = registry.get(&blueprint.plugin) else {
        bail!("Plugin '{}' is not registered", blueprint.plugin);
    };
    let auth = connector
        .scope_planner()
        .map(|planner| planner.auth(connection))
        .unwrap_or_else(|| ApiAuth::from_connection(connection));
    let client = env.api_client(connection, auth)?;

    let plan = PlanCompiler::new(registry)
        .compile(&blueprint.plugin, &blueprint.scopes, connection, client.as_ref())
        .await?;
    info!(
        plugin = %blueprint.plugin,
        stages = plan.len(),
        "Compiled blueprint"
    );
    Ok(plan)
}

fn open_env(config: LakeflowConfig) -> anyhow::Result<TaskEnv> {
    let Some(path) = config.store.resolved_path() else {
        bail!("No data directory available; set store.path in the configuration");
    };
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    info!(path = %path.display(), "Opened store");
    Ok(TaskEnv::new(Arc::new(store), Arc::new(config)))
}

async fn handle_compile(
    blueprint_path: &Path,
    output: Option<&Path>,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path)?;
    let blueprint: Blueprint = serde_json::from_str(&read_file(blueprint_path)?)
        .with_context(|| format!("Invalid blueprint in {}", blueprint_path.display()))?;
    let registry = registry()?;
    // Compiling only needs API access; an in-memory store keeps the data dir untouched.
    let env = TaskEnv::new(Arc::new(SqliteStore::open_in_memory()?), Arc::new(config));

    let plan = compile_blueprint(&blueprint, &registry, &env).await?;
    let json = serde_json::to_string_pretty(&plan)?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)?;
            println!("Wrote plan with {} stage(s) to {}", plan.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn handle_run(
    file: &Path,
    max_concurrent_tasks: Option<usize>,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path)?;
    let source = parse_plan_source(&read_file(file)?)
        .with_context(|| format!("Invalid plan file {}", file.display()))?;
    let registry = registry()?;
    let concurrency = max_concurrent_tasks.unwrap_or(config.executor.max_concurrent_tasks);

    let cancel = CancellationToken::new();
    let env = open_env(config)?.with_cancellation(cancel.clone());

    let plan = match source {
        PlanSource::Plan(plan) => plan,
        PlanSource::Blueprint(blueprint) => compile_blueprint(&blueprint, &registry, &env).await?,
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling pipeline");
            cancel.cancel();
        }
    });

    let report = PipelineExecutor::new(Arc::clone(&registry), env)
        .max_concurrent_tasks(concurrency)
        .execute(&plan)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.status {
        PipelineStatus::Succeeded => Ok(()),
        PipelineStatus::Cancelled => bail!("Pipeline {} was cancelled", report.run_id),
        PipelineStatus::Failed => bail!(
            "Pipeline {} failed: {}",
            report.run_id,
            report.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn handle_plugins(json: bool) -> anyhow::Result<()> {
    let plugins = registry()?.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }

    for plugin in &plugins {
        let blueprint = if plugin.blueprint_support {
            " [blueprint]"
        } else {
            ""
        };
        println!("{}{} - {}", plugin.name, blueprint, plugin.description);
        for meta in &plugin.subtasks {
            let mut flags = Vec::new();
            if meta.required {
                flags.push("required");
            }
            if !meta.enabled_by_default {
                flags.push("off by default");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            };
            println!("    {}{}", meta.name, flags);
        }
    }
    println!("\nTotal: {} plugins", plugins.len());
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".lakeflow");
            std::fs::create_dir_all(&config_dir)?;

            let path = config_dir.join("config.toml");
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&LakeflowConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
