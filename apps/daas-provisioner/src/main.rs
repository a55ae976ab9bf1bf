use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daas_provisioner::kube_resources::ResourceFactory;
use daas_provisioner::EngineOptions;
use daas_runtime::{DatabaseServer, DatabaseServerKind};
use serde_json::{json, Value as JsonValue};

#[derive(Parser)]
#[command(
    name = "daas-provisioner",
    version,
    about = "Tenant database server provisioning utilities"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration JSON schema
    Schema {
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<String>,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to the TOML file; resolved via DAAS_CONFIG_DIR when relative
        path: String,
    },
    /// Print the Kubernetes objects a server would be made of
    Render {
        #[arg(long)]
        server_id: String,
        #[arg(long, value_enum, default_value_t = KindArg::SqlServer)]
        kind: KindArg,
        #[arg(long)]
        storage_mb: Option<u32>,
        /// Optional configuration file for namespace, images and sizes
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    SqlServer,
    Ravendb,
}

impl From<KindArg> for DatabaseServerKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::SqlServer => DatabaseServerKind::SqlServer,
            KindArg::Ravendb => DatabaseServerKind::RavenDb,
        }
    }
}

fn main() -> Result<()> {
    daas_otel::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Schema { out } => match out {
            Some(path) => {
                daas_core::write_schema_file(&path)
                    .with_context(|| format!("writing schema to {path}"))?;
                println!("wrote {path}");
            }
            None => println!(
                "{}",
                serde_json::to_string_pretty(&daas_core::config_schema_json())?
            ),
        },
        Commands::CheckConfig { path } => {
            let options = load_options(&path)?;
            println!("{}", serde_json::to_string_pretty(&describe_options(&options))?);
        }
        Commands::Render {
            server_id,
            kind,
            storage_mb,
            config,
        } => {
            let options = match config {
                Some(path) => load_options(&path)?,
                None => EngineOptions::default(),
            };
            let mut server = DatabaseServer::new(server_id, "", "", kind.into());
            if let Some(mb) = storage_mb {
                server = server.with_storage_mb(mb);
            }
            let rendered = render_server(&options, &server)?;
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
    }
    Ok(())
}

fn load_options(path: &str) -> Result<EngineOptions> {
    let resolved = daas_core::resolve_config_path(path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| path.to_string());
    let config = daas_core::load_config(&resolved)
        .with_context(|| format!("loading configuration from {resolved}"))?;
    Ok(EngineOptions::from_config(&config))
}

fn describe_options(options: &EngineOptions) -> JsonValue {
    let reconcile = &options.reconcile;
    json!({
        "reconcile": {
            "interval_ms": reconcile.interval.as_millis() as u64,
            "retry_backoff_min_ms": reconcile.retry_backoff_min.as_millis() as u64,
            "retry_backoff_max_ms": reconcile.retry_backoff_max.as_millis() as u64,
            "max_retries_before_fatal": reconcile.max_retries_before_fatal,
            "phase_timeout_secs": reconcile.phase_timeout.as_secs(),
            "mailbox_capacity": reconcile.mailbox_capacity,
        },
        "kube": {
            "namespace": options.kube.namespace,
            "sql_server_image": options.kube.sql_server_image,
            "ravendb_image": options.kube.ravendb_image,
            "storage_class": options.kube.storage_class,
            "data_volume_mb": options.kube.data_volume_mb,
            "ingress_port_base": options.kube.ingress_port_base,
        },
        "proxy": {
            "endpoint": options.proxy.endpoint,
            "request_timeout_secs": options.proxy.request_timeout.as_secs(),
        },
        "sql": { "max_server_memory_mb": options.sql.max_server_memory_mb },
        "prometheus": {
            "endpoint": options.stats.endpoint,
            "poll_interval_secs": options.stats.poll_interval.as_secs(),
            "queries": options.stats.queries,
        },
    })
}

fn render_server(options: &EngineOptions, server: &DatabaseServer) -> Result<JsonValue> {
    let factory = ResourceFactory::new(&options.kube);
    let objects = vec![
        factory.data_volume_claim(server)?,
        factory.replication_controller(server)?,
        factory.internal_service(server)?,
        factory.ingress(server)?,
    ];
    Ok(serde_json::to_value(objects)?)
}
