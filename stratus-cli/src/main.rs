mod config;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use stratus_core::differ::{create_plan, destroy_plan};
use stratus_core::effect::Effect;
use stratus_core::interpreter::{EffectOutcome, Interpreter};
use stratus_core::plan::Plan;
use stratus_core::provider::{Provider, ProviderError};
use stratus_core::resource::{Resource, ResourceId, State, Value};
use stratus_provider_vpc::sim::SimulatedVpc;
use stratus_provider_vpc::{VpcContext, VpcProvider};
use stratus_state::{StateBackend, StateFile, create_backend};

use crate::config::{Bindings, Config, bind_state, bindings_from_state, load_config, resolve_refs};

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Drive VPC resources to their declared state", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the state file
    #[arg(long, default_value = "stratus.state.json", global = true)]
    state: PathBuf,

    /// Path to the simulated cloud
    #[arg(long, default_value = "stratus.sim.json", global = true)]
    sim: PathBuf,

    /// Seconds between status polls
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show execution plan without applying changes
    Plan {
        /// Path to configuration file
        #[arg(default_value = "stratus.json")]
        file: PathBuf,
    },
    /// Apply changes to reach the desired state
    Apply {
        /// Path to configuration file
        #[arg(default_value = "stratus.json")]
        file: PathBuf,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Destroy all resources defined in the configuration file
    Destroy {
        /// Path to configuration file
        #[arg(default_value = "stratus.json")]
        file: PathBuf,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Release a state lock left behind by an interrupted run
    ForceUnlock {
        /// Lock ID reported by the failed command
        lock_id: String,
    },
}

/// Settings shared by every command
struct Session {
    backend: Box<dyn StateBackend>,
    sim: Arc<SimulatedVpc>,
    sim_path: PathBuf,
    cancel: CancellationToken,
    poll_interval: Option<u64>,
}

impl Session {
    fn provider(&self, config: &Config) -> VpcProvider {
        let ctx = VpcContext::new(self.sim.clone())
            .with_poll_settings(config.provider.poll_settings(self.poll_interval))
            .with_cancellation(self.cancel.clone());
        VpcProvider::with_context(ctx)
    }

    async fn save_sim(&self) -> Result<(), String> {
        self.sim
            .save(&self.sim_path)
            .await
            .map_err(|e| format!("Failed to save {}: {}", self.sim_path.display(), e))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let backend = create_backend("local", Some(cli.state.clone())).map_err(|e| e.to_string())?;

    if let Commands::ForceUnlock { lock_id } = &cli.command {
        backend
            .force_unlock(lock_id)
            .await
            .map_err(|e| e.to_string())?;
        println!("{}", format!("Lock {} released.", lock_id).green().bold());
        return Ok(());
    }

    let sim = SimulatedVpc::load(&cli.sim)
        .await
        .map_err(|e| format!("Failed to load {}: {}", cli.sim.display(), e))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cancelling pending waits");
            on_interrupt.cancel();
        }
    });

    let session = Session {
        backend,
        sim: Arc::new(sim),
        sim_path: cli.sim,
        cancel,
        poll_interval: cli.poll_interval,
    };

    match cli.command {
        Commands::Plan { file } => run_plan(&session, &file).await,
        Commands::Apply { file, auto_approve } => {
            with_lock(&session, "apply", run_apply(&session, &file, auto_approve)).await
        }
        Commands::Destroy { file, auto_approve } => {
            with_lock(&session, "destroy", run_destroy(&session, &file, auto_approve)).await
        }
        Commands::ForceUnlock { .. } => Ok(()),
    }
}

/// Hold the state lock while `work` runs, releasing it whatever the outcome
async fn with_lock(
    session: &Session,
    operation: &str,
    work: impl Future<Output = Result<(), String>>,
) -> Result<(), String> {
    let lock = session
        .backend
        .acquire_lock(operation)
        .await
        .map_err(|e| e.to_string())?;

    let result = work.await;

    if let Err(e) = session.backend.release_lock(&lock).await {
        eprintln!("{} failed to release lock {}: {}", "Warning:".yellow().bold(), lock.id, e);
    }
    result
}

fn load(file: &Path) -> Result<(Config, Vec<Resource>), String> {
    let config = load_config(file).map_err(|e| e.to_string())?;
    let resources = config.resources().map_err(|e| e.to_string())?;
    Ok((config, resources))
}

async fn read_state_file(session: &Session) -> Result<StateFile, String> {
    Ok(session
        .backend
        .read_state()
        .await
        .map_err(|e| format!("Failed to read state: {}", e))?
        .unwrap_or_default())
}

/// Refresh recorded states against the cloud; vanished resources are dropped
async fn refresh_states(
    provider: &VpcProvider,
    recorded: HashMap<ResourceId, State>,
) -> Result<HashMap<ResourceId, State>, String> {
    let mut current = HashMap::new();
    for (id, state) in recorded {
        let read = provider
            .read(&id, state.identifier.as_deref())
            .await
            .map_err(|e| format!("Failed to read state: {}", e))?;
        if !read.exists {
            log::warn!("{} no longer exists", id);
            continue;
        }
        let mut refreshed = state;
        refreshed.attributes.extend(read.attributes);
        current.insert(id, refreshed);
    }
    Ok(current)
}

fn forget_vanished(state: &mut StateFile, current_states: &HashMap<ResourceId, State>) {
    let vanished: Vec<ResourceId> = state
        .resources
        .iter()
        .map(|r| r.resource_id())
        .filter(|id| !current_states.contains_key(id))
        .collect();
    for id in &vanished {
        state.remove_resource(id);
    }
}

async fn run_plan(session: &Session, file: &Path) -> Result<(), String> {
    let (config, resources) = load(file)?;
    let provider = session.provider(&config);
    let state = read_state_file(session).await?;
    let current_states = refresh_states(&provider, state.states()).await?;

    let bindings = bindings_from_state(&resources, &current_states);
    let resolved: Vec<Resource> = resources.iter().map(|r| resolve_refs(r, &bindings)).collect();
    let plan = create_plan(&resolved, &current_states);

    print_plan(&plan);
    Ok(())
}

async fn run_apply(session: &Session, file: &Path, auto_approve: bool) -> Result<(), String> {
    let (config, resources) = load(file)?;
    let provider = session.provider(&config);
    let mut state = read_state_file(session).await?;
    let current_states = refresh_states(&provider, state.states()).await?;
    forget_vanished(&mut state, &current_states);

    let mut bindings = bindings_from_state(&resources, &current_states);
    let resolved: Vec<Resource> = resources.iter().map(|r| resolve_refs(r, &bindings)).collect();
    let plan = create_plan(&resolved, &current_states);

    if plan.mutation_count() == 0 {
        println!("{}", "No changes needed.".green());
        return Ok(());
    }

    print_plan(&plan);
    println!();

    if !auto_approve && !confirm("Do you want to perform these actions?")? {
        println!();
        println!("{}", "Apply cancelled.".yellow());
        return Ok(());
    }

    println!("{}", "Applying changes...".cyan().bold());
    println!();

    let interpreter = Interpreter::new(provider);
    let provider_name = interpreter.provider().name();
    let mut success_count = 0;
    let mut failure_count = 0;

    for effect in plan.effects() {
        if session.cancel.is_cancelled() {
            println!("  {} {} - interrupted", "✗".red(), effect.describe());
            failure_count += 1;
            break;
        }

        // Re-resolve against resources converged earlier in this run
        let effect = resolve_effect(effect, &bindings);
        match interpreter.execute(&effect).await {
            Ok(outcome) => {
                match &outcome {
                    EffectOutcome::Deleted { id } => {
                        state.remove_resource(id);
                    }
                    EffectOutcome::Read { state: read } => {
                        if let Some(resource) = effect.resource() {
                            bind_state(&mut bindings, resource, read);
                        }
                    }
                    EffectOutcome::Created { state: converged }
                    | EffectOutcome::Updated { state: converged } => {
                        state.record(converged, provider_name);
                        if let Some(resource) = effect.resource() {
                            bind_state(&mut bindings, resource, converged);
                        }
                    }
                    EffectOutcome::Skipped { .. } => {}
                }
                if effect.is_mutating() {
                    success_count += 1;
                    persist(session, &mut state).await?;
                }
                println!("  {} {}", "✓".green(), effect.describe());
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), effect.describe(), e);
                failure_count += 1;
                if record_partial(&mut state, &e, provider_name) {
                    persist(session, &mut state).await?;
                }
                break;
            }
        }
    }

    session.save_sim().await?;

    println!();
    if failure_count == 0 {
        println!(
            "{}",
            format!("Apply complete! {} changes applied.", success_count)
                .green()
                .bold()
        );
        Ok(())
    } else {
        println!(
            "{}",
            format!(
                "Apply failed. {} succeeded, {} failed.",
                success_count, failure_count
            )
            .red()
            .bold()
        );
        Err("apply did not complete".to_string())
    }
}

async fn run_destroy(session: &Session, file: &Path, auto_approve: bool) -> Result<(), String> {
    let (config, resources) = load(file)?;
    let provider = session.provider(&config);
    let mut state = read_state_file(session).await?;
    let current_states = refresh_states(&provider, state.states()).await?;
    forget_vanished(&mut state, &current_states);

    let order: Vec<ResourceId> = resources
        .iter()
        .filter(|r| !r.is_data_source())
        .map(|r| r.id.clone())
        .collect();
    let plan = destroy_plan(&order, &current_states);

    if plan.is_empty() {
        println!("{}", "No resources to destroy.".green());
        return Ok(());
    }

    println!("{}", "Destroy Plan:".red().bold());
    println!();
    for effect in plan.effects() {
        println!("  {} {}", "-".red().bold(), effect.id());
    }
    println!();
    println!("Plan: {} to destroy.", plan.effects().len().to_string().red());
    println!();

    if !auto_approve && !confirm("Do you really want to destroy all resources?")? {
        println!();
        println!("{}", "Destroy cancelled.".yellow());
        return Ok(());
    }

    println!("{}", "Destroying resources...".red().bold());
    println!();

    let interpreter = Interpreter::new(provider);
    let mut success_count = 0;
    let mut failure_count = 0;

    for effect in plan.effects() {
        if session.cancel.is_cancelled() {
            println!("  {} {} - interrupted", "✗".red(), effect.describe());
            failure_count += 1;
            break;
        }
        match interpreter.execute(effect).await {
            Ok(_) => {
                state.remove_resource(effect.id());
                persist(session, &mut state).await?;
                println!("  {} {}", "✓".green(), effect.describe());
                success_count += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), effect.describe(), e);
                failure_count += 1;
                break;
            }
        }
    }

    session.save_sim().await?;

    println!();
    if failure_count == 0 {
        println!(
            "{}",
            format!("Destroy complete! {} resources destroyed.", success_count)
                .green()
                .bold()
        );
        Ok(())
    } else {
        println!(
            "{}",
            format!(
                "Destroy failed. {} succeeded, {} failed.",
                success_count, failure_count
            )
            .red()
            .bold()
        );
        Err("destroy did not complete".to_string())
    }
}

/// Record what a failed create left behind so the next plan replaces it
fn record_partial(state: &mut StateFile, error: &ProviderError, provider: &str) -> bool {
    let Some(partial) = error.partial.as_deref() else {
        return false;
    };
    if let Some(identifier) = &partial.identifier {
        log::warn!("{} ({}) is tainted and will be replaced", partial.id, identifier);
    }
    state.record(partial, provider);
    true
}

async fn persist(session: &Session, state: &mut StateFile) -> Result<(), String> {
    state.increment_serial();
    session
        .backend
        .write_state(state)
        .await
        .map_err(|e| format!("Failed to write state: {}", e))
}

fn confirm(question: &str) -> Result<bool, String> {
    println!("{}", question.yellow().bold());
    println!("  {}", "Only 'yes' will be accepted to confirm.".yellow());
    print!("\n  Enter a value: ");
    std::io::stdout().flush().map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    println!();
    Ok(input.trim() == "yes")
}

fn resolve_effect(effect: &Effect, bindings: &Bindings) -> Effect {
    match effect {
        Effect::Read(r) => Effect::Read(resolve_refs(r, bindings)),
        Effect::Create(r) => Effect::Create(resolve_refs(r, bindings)),
        Effect::Update { id, from, to } => Effect::Update {
            id: id.clone(),
            from: from.clone(),
            to: resolve_refs(to, bindings),
        },
        Effect::Delete { .. } => effect.clone(),
    }
}

fn print_plan(plan: &Plan) {
    if plan.mutation_count() == 0 {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    for effect in plan.effects() {
        let symbol = match effect {
            Effect::Read(_) => effect.symbol().cyan().bold(),
            Effect::Create(_) => effect.symbol().green().bold(),
            Effect::Update { .. } => effect.symbol().yellow().bold(),
            Effect::Delete { .. } => effect.symbol().red().bold(),
        };
        println!("  {} {}", symbol, effect.id().to_string().bold());

        match effect {
            Effect::Create(r) => {
                for (key, value) in sorted(&r.attributes) {
                    println!("      {}: {}", key, format_value(value).green());
                }
            }
            Effect::Update { from, to, .. } => {
                for (key, value) in sorted(&to.attributes) {
                    match from.attributes.get(key) {
                        Some(old) if old == value => {}
                        Some(old) => println!(
                            "      {}: {} → {}",
                            key.bold(),
                            format_value(old).red(),
                            format_value(value).green()
                        ),
                        None => println!("      {}: {}", key.bold(), format_value(value).green()),
                    }
                }
            }
            Effect::Delete { identifier, .. } => {
                println!("      id: {}", identifier.red());
            }
            Effect::Read(_) => {}
        }
    }

    println!();
    let summary = plan.summary();
    println!(
        "Plan: {} to add, {} to change, {} to destroy.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.delete.to_string().red()
    );
}

fn sorted(attributes: &HashMap<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = attributes
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => {
            let strs: Vec<_> = items.iter().map(format_value).collect();
            format!("[{}]", strs.join(", "))
        }
        Value::Map(map) => {
            let mut strs: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, format_value(v)))
                .collect();
            strs.sort();
            format!("{{{}}}", strs.join(", "))
        }
        Value::ResourceRef(binding, attr) => format!("(known after apply: {}.{})", binding, attr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_effect_fills_in_converged_identifiers() {
        let snapshot = Resource::new("snapshot", "nightly").with_attribute(
            "source_volume",
            Value::ResourceRef("volume.data".into(), "id".into()),
        );
        let effect = Effect::Create(snapshot);

        let mut bindings = Bindings::new();
        let volume = Resource::new("volume", "data");
        let converged = State::existing(
            volume.id.clone(),
            HashMap::from([("id".to_string(), Value::String("vol-9".into()))]),
        )
        .with_identifier("vol-9");
        bind_state(&mut bindings, &volume, &converged);

        let Effect::Create(resolved) = resolve_effect(&effect, &bindings) else {
            panic!("expected create");
        };
        assert_eq!(
            resolved.attributes.get("source_volume"),
            Some(&Value::String("vol-9".into()))
        );
    }

    #[test]
    fn delete_effects_are_left_alone() {
        let id = ResourceId::new("volume", "old");
        let effect = Effect::Delete {
            id: id.clone(),
            identifier: "vol-1".into(),
            last: State::existing(id, HashMap::new()).with_identifier("vol-1"),
        };
        assert_eq!(resolve_effect(&effect, &Bindings::new()), effect);
    }

    #[test]
    fn unresolved_references_render_as_pending() {
        let value = Value::ResourceRef("instance.web".into(), "id".into());
        assert_eq!(format_value(&value), "(known after apply: instance.web.id)");
        assert_eq!(
            format_value(&Value::List(vec![Value::Int(1), Value::Bool(true)])),
            "[1, true]"
        );
    }

    #[tokio::test]
    async fn refresh_keeps_configured_attributes_and_drops_vanished() {
        let sim = Arc::new(SimulatedVpc::new());
        let provider = VpcProvider::new(sim.clone());
        let volume_id = sim.seed_volume("data", "us-south-1", 100);

        let live = ResourceId::new("volume", "data");
        let gone = ResourceId::new("volume", "gone");
        let recorded = HashMap::from([
            (
                live.clone(),
                State::existing(
                    live.clone(),
                    HashMap::from([("profile".to_string(), Value::String("general".into()))]),
                )
                .with_identifier(&volume_id),
            ),
            (
                gone.clone(),
                State::existing(gone.clone(), HashMap::new()).with_identifier("vol-missing"),
            ),
        ]);

        let current = refresh_states(&provider, recorded).await.unwrap();
        assert!(!current.contains_key(&gone));
        let state = &current[&live];
        assert_eq!(state.attributes.get("capacity"), Some(&Value::Int(100)));
        assert_eq!(
            state.attributes.get("profile"),
            Some(&Value::String("general".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_is_recorded_and_replaced_next_run() {
        let sim = Arc::new(SimulatedVpc::new());
        sim.script_next_instance(&["failed"], Vec::new());
        let provider = VpcProvider::new(sim.clone());
        let s = |v: &str| Value::String(v.to_string());
        let web = Resource::new("instance", "web")
            .with_attribute("vpc", s("vpc-1"))
            .with_attribute("zone", s("us-south-1"))
            .with_attribute("profile", s("bx2-2x8"))
            .with_attribute("image", s("ubuntu-24-04"))
            .with_attribute("subnet", s("subnet-1"));

        let err = Interpreter::new(provider)
            .execute(&Effect::Create(web.clone()))
            .await
            .unwrap_err();
        let mut state = StateFile::new();
        assert!(record_partial(&mut state, &err, "vpc"));

        let recorded = state.find_resource(&web.id).unwrap().clone();
        assert!(recorded.tainted);
        assert!(!recorded.identifier.is_empty());

        let plan = create_plan(&[web], &state.states());
        let effects = plan.effects();
        assert_eq!(effects.len(), 2);
        assert!(
            matches!(&effects[0], Effect::Delete { identifier, .. } if *identifier == recorded.identifier)
        );
        assert!(matches!(effects[1], Effect::Create(_)));
    }

    #[test]
    fn errors_without_partial_state_record_nothing() {
        let mut state = StateFile::new();
        assert!(!record_partial(&mut state, &ProviderError::new("boom"), "vpc"));
        assert!(state.resources.is_empty());
    }
}
