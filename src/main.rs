use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wxrelay::config::Config;
use wxrelay::upstream::{MediaType, MediaUpload, VideoDescription};
use wxrelay::webhook::AcknowledgeHandler;
use wxrelay::RelayContext;

/// `wxrelay` - credential, upload and webhook relay for Official Accounts.
#[derive(Parser, Debug)]
#[command(name = "wxrelay")]
#[command(version)]
#[command(about = "Resilience layer for WeChat Official Account gateways.", long_about = None)]
struct Cli {
    /// Config file (defaults to $WXRELAY_CONFIG, then the user config dir).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the webhook gateway
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a valid access token for a tenant, refreshing it if needed
    Token {
        #[arg(long)]
        tenant: String,
        /// Drop the cached token first
        #[arg(long)]
        force: bool,
    },

    /// Upload a media file
    Upload {
        #[arg(long)]
        tenant: String,
        #[arg(long = "type", value_enum)]
        media_type: MediaType,
        #[arg(long)]
        file: PathBuf,
        /// Add as permanent material instead of temporary media
        #[arg(long)]
        permanent: bool,
        /// Video title (permanent video only)
        #[arg(long)]
        title: Option<String>,
        /// Video introduction (permanent video only)
        #[arg(long)]
        introduction: Option<String>,
    },

    /// Config helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wxrelay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config {
            command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(Config);
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).context("failed to render schema")?
            );
            Ok(())
        }

        Commands::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if config.tenants.is_empty() {
                tracing::warn!("no tenants configured; every webhook route will answer 404");
            }
            let context = Arc::new(RelayContext::from_config(config).await?);
            wxrelay::gateway::serve(context, Arc::new(AcknowledgeHandler)).await
        }

        Commands::Token { tenant, force } => {
            let config = Config::load(cli.config.as_deref())?;
            ensure_tenant(&config, &tenant)?;
            let context = RelayContext::from_config(config).await?;
            if force {
                context.credentials().invalidate(&tenant).await?;
            }
            let credential = context.credentials().get_or_refresh(&tenant).await?;
            println!("{}", credential.token);
            Ok(())
        }

        Commands::Upload {
            tenant,
            media_type,
            file,
            permanent,
            title,
            introduction,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            ensure_tenant(&config, &tenant)?;
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut upload = MediaUpload::new(media_type, payload);
            if let Some(name) = file.file_name().and_then(|name| name.to_str()) {
                upload = upload.with_filename(name);
            }

            let context = RelayContext::from_config(config).await?;
            let client = context.client();
            let uploaded = if permanent {
                let description = title.map(|title| VideoDescription {
                    title,
                    introduction: introduction.unwrap_or_default(),
                });
                client
                    .add_material(&tenant, &upload, description.as_ref())
                    .await?
            } else {
                client.upload_temporary(&tenant, &upload).await?
            };
            println!("{}", serde_json::to_string_pretty(&uploaded)?);
            Ok(())
        }
    }
}

fn ensure_tenant(config: &Config, tenant: &str) -> Result<()> {
    if config.tenant(tenant).is_none() {
        bail!("tenant `{tenant}` is not configured");
    }
    Ok(())
}
