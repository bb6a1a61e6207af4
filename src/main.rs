use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use h2core::{
    H2Server, Outcome, Route, RouteDispatcher,
    config::{ServerConfig, ServerConfigValidator, load_config, loader::config_from_env},
    core::{
        event_stream::{SseMessage, sse_channel},
        outcome::{BytesPayload, MIME_TYPE_TEXT},
    },
    tracing_setup,
};
use http::Method;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

/// Built-in routes: a health probe, an SSE ticker and a body echo.
struct DemoRoutes;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const TICK_COUNT: u64 = 10;

#[async_trait]
impl RouteDispatcher for DemoRoutes {
    async fn dispatch(&self, outcome: Outcome) -> Result<Outcome> {
        let (envelope, request) = outcome
            .into_request()
            .map_err(|outcome| eyre!("expected a request, got {}", outcome.kind()))?;

        let route = match (&request.method, request.url.path()) {
            (&Method::GET, "/health") => Route::json(
                request.accept,
                serde_json::json!({ "status": "ok", "sni": request.sni }),
            ),
            (&Method::GET, "/events") => {
                let (sender, port) = sse_channel();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(TICK_INTERVAL);
                    for tick in 0..TICK_COUNT {
                        interval.tick().await;
                        let message = SseMessage::from(serde_json::json!({ "tick": tick }))
                            .event("tick")
                            .id(tick.to_string());
                        if sender.send(message).is_err() {
                            break;
                        }
                    }
                });
                Route::sse(port, request.accept)
            }
            (&Method::POST, "/echo") => {
                let body = request.body.await.wrap_err("failed to read echo body")?;
                Route::Bytes(Box::new(BytesPayload {
                    content_type: body
                        .content_type
                        .as_ref()
                        .map(|ct| ct.mime_type.clone())
                        .unwrap_or_else(|| MIME_TYPE_TEXT.to_string()),
                    content_length: Some(body.len() as u64),
                    body: body.bytes,
                    etag: None,
                    age: None,
                    max_age: None,
                    accept_ranges: None,
                }))
            }
            (_, path) => Route::not_found(format!("no route for {path}")),
        };

        Ok(Outcome::new(envelope, route))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path).await,
        "init" => return init_config_command(&config_path).await,
        _ => {}
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let config: ServerConfig = if Path::new(&config_path).exists() {
        tracing::info!("Loading configuration from {config_path}");
        load_config(&config_path)
            .await
            .with_context(|| format!("Failed to load config from {config_path}"))?
    } else {
        tracing::warn!("{config_path} not found, using defaults and environment");
        config_from_env()
    };
    ServerConfigValidator::validate(&config).context("Invalid configuration")?;

    let server = H2Server::new(Arc::new(config), Arc::new(DemoRoutes))
        .context("Failed to set up TLS")?;

    let signal_handler_shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    server.listen().await?;
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Credentials: {}", config.tls.credentials.join(", "));
            println!("   • Forwarded Required: {}", config.forwarded.required);
            println!("   • Allowed Origins: {}", config.cors.allowed_origins.len());
            println!("   • TRACE Enabled: {}", config.allow_trace);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8443')");
            println!(
                "   • Check that every credential has <name>-cert.pem and <name>-privkey.pem"
            );
            println!("   • Ensure allowed origins are full URLs or '*'");
            println!("   • Ensure shutdown_timeout uses valid units (s, m, h)");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# h2core server configuration

# The address to listen on
listen_addr = "[::]:8443"

# Set to false to also accept IPv4-mapped peers on an IPv6 address
ipv6_only = true

# How long to wait for open connections after shutdown
shutdown_timeout = "30s"

# Answer TRACE with a message/http echo
allow_trace = false

[tls]
# Holds <name>-cert.pem and <name>-privkey.pem for every credential
certificate_dir = "./certificates"
credentials = ["localhost"]

[forwarded]
required = false
# secret = "change-me"
skip_list = []

[cors]
allowed_origins = []
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'h2core serve --config {config_path}' to start the server");
    Ok(())
}
