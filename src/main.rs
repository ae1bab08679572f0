use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::EngineConfig;
use floodgate::engine::Engine;
use floodgate::ratelimit::{Entity, EntityKind};

/// Validate and exercise Floodgate rate limiting configurations.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true, default_value = "floodgate.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration
    Validate,

    /// Show which configured limit applies to an entity and scope
    Explain(Target),

    /// Run admission checks against the configured store
    Check {
        #[command(flatten)]
        target: Target,

        /// Units consumed per check
        #[arg(long, default_value_t = 1)]
        cost: u64,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Entity as `kind:id`, e.g. `user:alice` or `ip:10.0.0.1`
    #[arg(long)]
    entity: String,

    /// Service tier of the entity
    #[arg(long, default_value = "")]
    tier: String,

    /// Scope to check
    #[arg(long, default_value = "global")]
    scope: String,
}

impl Target {
    fn entity(&self) -> anyhow::Result<Entity> {
        let Some((kind, id)) = self.entity.split_once(':') else {
            bail!("entity must be written as kind:id, got '{}'", self.entity);
        };
        let kind: EntityKind = kind.parse()?;
        Ok(Entity::new(kind, id).with_tier(self.tier.clone()))
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = EngineConfig::from_file(&cli.config)
        .and_then(EngineConfig::with_env_overrides)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Validate => {
            info!(
                algorithm = %config.algorithm,
                store = config.store.as_str(),
                enabled = config.enabled,
                "Configuration is valid"
            );
            let mut shown = config.clone();
            if shown.remote.password.is_some() {
                shown.remote.password = Some("<redacted>".to_string());
            }
            println!("{}", serde_yaml::to_string(&shown)?);
        }
        Command::Explain(target) => {
            let entity = target.entity()?;
            match config.limits.resolve(&entity, &target.scope) {
                Some(resolution) => println!(
                    "{} on '{}': {} (from {}, scope '{}')",
                    entity,
                    target.scope,
                    resolution.limit,
                    resolution.source,
                    resolution.matched_scope
                ),
                None => bail!("no limit configured for {} on '{}'", entity, target.scope),
            }
        }
        Command::Check {
            target,
            cost,
            repeat,
        } => {
            let entity = target.entity()?;
            let engine = Engine::from_config(config)
                .await
                .context("failed to start engine")?;

            for _ in 0..repeat {
                let decision = engine.check(&entity, &target.scope, cost).await?;
                println!("{}", serde_json::to_string(&decision)?);
            }

            println!("{}", serde_json::to_string(&engine.stats())?);
            engine.close().await?;
        }
    }

    Ok(())
}
