//! `labkit` - bench inspection, record/replay, and sim-profile overrides.
//!
//! Exit codes: 0 ok, 1 validation/IO failure, 2 replay mismatch, 3 safety
//! violation.

mod script;

use clap::{Parser, Subcommand};
use lab_core::{LabError, Settings};
use lab_instruments::{Bench, BenchOptions};
use lab_profiles::{BackendType, BenchDescriptor, ProfileCatalog};
use lab_transport::{ReplayTransport, SessionDocument, Transport};
use script::Script;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "labkit", version, about = "Instrument bench automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and validate bench descriptors.
    Bench {
        #[command(subcommand)]
        command: BenchCommand,
    },
    /// Record and replay instrument sessions.
    Replay {
        #[command(subcommand)]
        command: ReplayCommand,
    },
    /// Manage per-user simulation profile overrides.
    SimProfile {
        #[command(subcommand)]
        command: SimProfileCommand,
    },
}

#[derive(Subcommand)]
enum BenchCommand {
    /// List the instruments a bench declares.
    Ls { bench: PathBuf },
    /// Parse and validate a bench descriptor and its profiles.
    Validate { bench: PathBuf },
    /// Open the bench and print each instrument's identity string.
    Id { bench: PathBuf },
    /// Emit a simulation-only copy of a bench descriptor.
    Sim {
        bench: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ReplayCommand {
    /// Run a script against a bench, recording all traffic to a session
    /// document.
    Record {
        script: PathBuf,
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Re-run a script strictly against a recorded session document.
    Run {
        script: PathBuf,
        #[arg(long)]
        session: PathBuf,
    },
}

#[derive(Subcommand)]
enum SimProfileCommand {
    /// Record a script's query responses into a profile override.
    Record {
        alias: String,
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        profile_dir: PathBuf,
    },
    /// Copy the built-in profile into the override directory and open it in
    /// $EDITOR.
    Edit {
        alias: String,
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        profile_dir: PathBuf,
    },
    /// Remove the override, restoring the built-in profile.
    Reset {
        alias: String,
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        profile_dir: PathBuf,
    },
    /// Show which keys the override changes.
    Diff {
        alias: String,
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        profile_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<(), LabError> {
    match cli.command {
        Command::Bench { command } => bench_command(command).await,
        Command::Replay { command } => replay_command(command).await,
        Command::SimProfile { command } => sim_profile_command(command).await,
    }
}

// =============================================================================
// bench
// =============================================================================

async fn bench_command(command: BenchCommand) -> Result<(), LabError> {
    match command {
        BenchCommand::Ls { bench } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            println!("bench: {}", descriptor.bench_name);
            for (alias, entry) in descriptor.instruments.iter() {
                let address = entry.address.as_deref().unwrap_or("sim");
                println!("  {:<16} {:<28} {}", alias, entry.profile, address);
            }
            Ok(())
        }
        BenchCommand::Validate { bench } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let catalog = ProfileCatalog::new();
            for (alias, entry) in descriptor.instruments.iter() {
                let profile = catalog.load(&entry.profile)?;
                println!("{}: {} ({}) ok", alias, profile.model_id, profile.device_type);
            }
            println!("bench '{}' is valid", descriptor.bench_name);
            Ok(())
        }
        BenchCommand::Id { bench } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let settings = Settings::load()?;
            let bench = Bench::open_with(descriptor, settings, BenchOptions::default()).await?;
            for alias in bench.aliases() {
                let idn = bench
                    .device(alias)?
                    .core()
                    .idn()
                    .unwrap_or_else(|| "<no identity>".to_string());
                println!("{:<16} {}", alias, idn);
            }
            bench.close().await
        }
        BenchCommand::Sim { bench, output } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let simulated = descriptor.to_simulated();
            let text = serde_yaml::to_string(&simulated).map_err(|e| {
                lab_core::ConfigError::Invalid {
                    message: format!("serialize: {}", e),
                }
            })?;
            match output {
                Some(path) => std::fs::write(path, text).map_err(lab_core::ConfigError::from)?,
                None => print!("{}", text),
            }
            Ok(())
        }
    }
}

// =============================================================================
// replay
// =============================================================================

async fn run_script_on_bench(bench: &Bench, script: &Script) -> Result<(), LabError> {
    for step in script.steps() {
        let device = bench.device(&step.alias)?;
        if let Some(command) = &step.write {
            device.core().write_raw_command(command).await?;
        } else if let Some(command) = &step.query {
            let response = device.core().query_op("script", command, &[]).await?;
            println!("{} {} -> {}", step.alias, command, response);
        }
    }
    Ok(())
}

async fn replay_command(command: ReplayCommand) -> Result<(), LabError> {
    match command {
        ReplayCommand::Record {
            script,
            bench,
            output,
        } => {
            let script = Script::load(&script)?;
            let mut descriptor = BenchDescriptor::from_yaml(&bench)?;
            // force every instrument behind a recorder
            descriptor.backend_defaults.backend_type = BackendType::Record;
            for (_, entry) in descriptor.instruments.0.iter_mut() {
                if let Some(backend) = entry.backend.as_mut() {
                    backend.backend_type = Some(BackendType::Record);
                }
            }

            let settings = Settings::load()?;
            let bench =
                Bench::open_with(descriptor, settings, BenchOptions::default()).await?;
            let result = run_script_on_bench(&bench, &script).await;
            let document = bench.recorded_session();
            bench.close().await?;
            result?;

            document.save(&output)?;
            println!("session recorded to {}", output.display());
            Ok(())
        }
        ReplayCommand::Run { script, session } => {
            let script = Script::load(&script)?;
            let document = SessionDocument::load(&session)?;
            let settings = Settings::load()?;

            // one replay transport per alias, strict sequencing per §replay
            let mut transports: Vec<(String, ReplayTransport)> = Vec::new();
            for step in script.steps() {
                if !transports.iter().any(|(alias, _)| alias == &step.alias) {
                    let recorded =
                        document.instrument(&step.alias).ok_or_else(|| {
                            lab_core::ConfigError::Invalid {
                                message: format!(
                                    "session document has no recording for alias '{}'",
                                    step.alias
                                ),
                            }
                        })?;
                    transports.push((
                        step.alias.clone(),
                        ReplayTransport::new(
                            recorded.clone(),
                            settings.replay_strict_trailing,
                        ),
                    ));
                }
            }

            for (_, transport) in &transports {
                transport.connect().await?;
            }
            for step in script.steps() {
                let (_, transport) = transports
                    .iter()
                    .find(|(alias, _)| alias == &step.alias)
                    .expect("transport created for every scripted alias");
                if let Some(command) = &step.write {
                    transport.write(command).await?;
                } else if let Some(command) = &step.query {
                    let response = transport.query(command).await?;
                    println!("{} {} -> {}", step.alias, command, response);
                }
            }
            for (alias, transport) in &transports {
                let remaining = transport.remaining();
                if remaining > 0 {
                    tracing::warn!(alias = %alias, remaining, "trailing entries not consumed");
                }
                transport.close().await?;
            }
            println!("replay completed");
            Ok(())
        }
    }
}

// =============================================================================
// sim-profile
// =============================================================================

fn profile_ref_for(descriptor: &BenchDescriptor, alias: &str) -> Result<String, LabError> {
    descriptor
        .instruments
        .get(alias)
        .map(|entry| entry.profile.clone())
        .ok_or_else(|| {
            lab_core::ConfigError::UnknownAlias {
                alias: alias.to_string(),
            }
            .into()
        })
}

async fn sim_profile_command(command: SimProfileCommand) -> Result<(), LabError> {
    match command {
        SimProfileCommand::Record {
            alias,
            bench,
            script,
            profile_dir,
        } => {
            let script = Script::load(&script)?;
            let mut descriptor = BenchDescriptor::from_yaml(&bench)?;
            descriptor.backend_defaults.backend_type = BackendType::Record;
            let profile_ref = profile_ref_for(&descriptor, &alias)?;

            let settings = Settings::load()?;
            let bench_handle =
                Bench::open_with(descriptor, settings, BenchOptions::default()).await?;
            let result = run_script_on_bench(&bench_handle, &script).await;
            let document = bench_handle.recorded_session();
            bench_handle.close().await?;
            result?;

            let Some(session) = document.instrument(&alias) else {
                return Err(lab_core::ConfigError::Invalid {
                    message: format!("no traffic recorded for alias '{}'", alias),
                }
                .into());
            };

            // recorded queries become exact-match simulation rules
            let mut rules = Vec::new();
            for entry in &session.log {
                if let Some(response) = &entry.response {
                    rules.push(serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                        (
                            serde_yaml::Value::from("command"),
                            serde_yaml::Value::from(regex_escape(&entry.command)),
                        ),
                        (
                            serde_yaml::Value::from("response"),
                            serde_yaml::Value::from(response.as_str()),
                        ),
                    ]))
                    .map_err(|e| lab_core::ConfigError::Invalid {
                        message: e.to_string(),
                    })?);
                }
            }
            let override_doc = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(
                serde_yaml::Value::from("simulation"),
                serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
                    serde_yaml::Value::from("scpi"),
                    serde_yaml::Value::Sequence(rules),
                )]))
                .map_err(|e| lab_core::ConfigError::Invalid {
                    message: e.to_string(),
                })?,
            )]))
            .map_err(|e| lab_core::ConfigError::Invalid {
                message: e.to_string(),
            })?;

            let path = override_target(&profile_dir, &profile_ref)?;
            std::fs::write(&path, override_doc).map_err(lab_core::ConfigError::from)?;
            println!("override written to {}", path.display());
            Ok(())
        }
        SimProfileCommand::Edit {
            alias,
            bench,
            profile_dir,
        } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let profile_ref = profile_ref_for(&descriptor, &alias)?;
            let path = override_target(&profile_dir, &profile_ref)?;
            if !path.exists() {
                let builtin = ProfileCatalog::builtin_source(&profile_ref).ok_or_else(
                    || lab_core::ProfileError::UnknownProfile {
                        key: profile_ref.clone(),
                    },
                )?;
                std::fs::write(&path, builtin).map_err(lab_core::ConfigError::from)?;
            }
            let editor = std::env::var("VISUAL")
                .or_else(|_| std::env::var("EDITOR"))
                .unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(&editor)
                .arg(&path)
                .status()
                .map_err(lab_core::ConfigError::from)?;
            if !status.success() {
                return Err(lab_core::ConfigError::Invalid {
                    message: format!("editor '{}' exited with {}", editor, status),
                }
                .into());
            }
            Ok(())
        }
        SimProfileCommand::Reset {
            alias,
            bench,
            profile_dir,
        } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let profile_ref = profile_ref_for(&descriptor, &alias)?;
            let path = override_target(&profile_dir, &profile_ref)?;
            if path.exists() {
                std::fs::remove_file(&path).map_err(lab_core::ConfigError::from)?;
                println!("override removed: {}", path.display());
            } else {
                println!("no override present for {}", profile_ref);
            }
            Ok(())
        }
        SimProfileCommand::Diff {
            alias,
            bench,
            profile_dir,
        } => {
            let descriptor = BenchDescriptor::from_yaml(&bench)?;
            let profile_ref = profile_ref_for(&descriptor, &alias)?;
            let path = override_target(&profile_dir, &profile_ref)?;
            if !path.exists() {
                println!("no override present for {}", profile_ref);
                return Ok(());
            }
            let builtin = ProfileCatalog::builtin_source(&profile_ref).ok_or_else(|| {
                lab_core::ProfileError::UnknownProfile {
                    key: profile_ref.clone(),
                }
            })?;
            let base: serde_yaml::Value =
                serde_yaml::from_str(builtin).map_err(|e| lab_core::ConfigError::Invalid {
                    message: e.to_string(),
                })?;
            let text =
                std::fs::read_to_string(&path).map_err(lab_core::ConfigError::from)?;
            let overlay: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|e| lab_core::ConfigError::Invalid {
                    message: e.to_string(),
                })?;
            let changes = lab_profiles::override_diff(&base, &overlay);
            if changes.is_empty() {
                println!("override matches the built-in profile");
            } else {
                for change in changes {
                    println!("{}", change);
                }
            }
            Ok(())
        }
    }
}

fn override_target(
    profile_dir: &std::path::Path,
    profile_ref: &str,
) -> Result<PathBuf, LabError> {
    let path = profile_dir.join(format!("{}.yaml", profile_ref));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(lab_core::ConfigError::from)?;
    }
    Ok(path)
}

fn regex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?()|[]{}^$#".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
