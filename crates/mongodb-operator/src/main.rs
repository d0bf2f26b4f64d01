//! mongodb-operator binary.
//!
//! Runs reconciliation passes for a declared spec against in-memory
//! collaborators and prints the resulting deployment document and status.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mongodb_operator::{
    Collaborators, DeclaredSpec, MemoryCertificateAuthority, MemoryControlPlane, MemorySecrets,
    MemoryStatusStore, MemoryWorkload, OperatorConfig, ProjectMutexes, ReconcileOutcome,
    Reconciler, StatusStore,
};

#[derive(Parser)]
#[command(name = "mongodb-operator")]
#[command(about = "Reconcile MongoDB deployments through an automation control plane")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to operator.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a spec file against in-memory collaborators
    Reconcile {
        /// JSON file with the declared spec
        #[arg(short, long)]
        spec: PathBuf,

        /// Maximum number of passes while the resource asks to be requeued
        #[arg(short, long, default_value_t = 3)]
        passes: u32,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mongodb_operator=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::load()?,
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Reconcile { spec, passes } => {
            let spec: DeclaredSpec = serde_json::from_str(&std::fs::read_to_string(spec)?)?;
            reconcile(config, &spec, passes).await?;
        }
    }
    Ok(())
}

async fn reconcile(
    config: OperatorConfig,
    spec: &DeclaredSpec,
    passes: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let control_plane = MemoryControlPlane::new();
    let status = Arc::new(MemoryStatusStore::new());
    let collaborators = Collaborators {
        control_plane: Arc::new(control_plane.clone()),
        certificate_authority: Arc::new(MemoryCertificateAuthority::auto_approving()),
        secrets: Arc::new(MemorySecrets::new()),
        workload: Arc::new(MemoryWorkload::new().registering_agents_with(control_plane.clone())),
        status: status.clone(),
    };
    let reconciler = Reconciler::new(config, collaborators, Arc::new(ProjectMutexes::new()));

    for pass in 1..=passes {
        let report = reconciler.reconcile(spec).await;
        info!(pass, phase = %report.status.phase(), "pass finished");
        if report.outcome == ReconcileOutcome::Done {
            break;
        }
    }

    if let Some(project) = control_plane.project_named(&spec.project.project_name).await {
        let document = control_plane.document(&project.id).await;
        println!("{}", serde_json::to_string_pretty(&document)?);
    }
    if let Some(stored) = status.get(&spec.key()).await? {
        println!("{}", serde_json::to_string_pretty(&stored.status)?);
    }
    Ok(())
}
