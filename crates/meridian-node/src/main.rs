//! Meridian Node -- database replication node.
//!
//! Usage:
//!   meridian-node                      # Run with default config
//!   meridian-node --config path.toml   # Run with custom config
//!   meridian-node status               # Show replication connections
//!   meridian-node add-node URL --replicates

use meridian_node::config::NodeConfig;
use meridian_node::identity::{peer_identity, RegistryIdentity};
use meridian_node::node::{Node, NodeSettings};
use meridian_node::quic_transport::QuicTransport;
use meridian_node::{expand_tilde, load_or_create_token};

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;

use meridian_api::{AppState, HttpPeerClient};
use meridian_protocol::LocalIdentity;
use meridian_registry::NodeRegistry;
use meridian_replication::MemoryAuditStore;

#[derive(Parser)]
#[command(name = "meridian-node", about = "Meridian database replication node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.meridian/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show replication status (queries local API)
    Status,
    /// Register a peer and start replicating with it
    AddNode {
        /// Peer url, e.g. http://db2.example.net:9925
        url: String,
        /// Replicate every local database with the peer
        #[arg(long)]
        replicates: bool,
        /// Subscriptions as a JSON array
        #[arg(long)]
        subscriptions: Option<String>,
        /// Bearer token of the peer's API
        #[arg(long)]
        authorization: Option<String>,
    },
    /// Drop a peer by name or url
    RemoveNode {
        /// Node name or url
        node: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "meridian_node=info,meridian_coordinator=info,meridian_replication=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/cluster_status", "{}").await?;
        }
        Some(Commands::AddNode {
            url,
            replicates,
            subscriptions,
            authorization,
        }) => {
            let subscriptions: Option<serde_json::Value> =
                subscriptions.map(|s| serde_json::from_str(&s)).transpose()?;
            let mut body = serde_json::json!({ "url": url, "authorization": authorization });
            if replicates {
                body["replicates"] = serde_json::Value::Bool(true);
            }
            if let Some(subs) = subscriptions {
                body["subscriptions"] = subs;
            }
            cli_api_call(&cfg, "/api/v1/add_node", &body.to_string()).await?;
        }
        Some(Commands::RemoveNode { node }) => {
            let body = if node.contains("://") {
                serde_json::json!({ "url": node })
            } else {
                serde_json::json!({ "name": node })
            };
            cli_api_call(&cfg, "/api/v1/remove_node", &body.to_string()).await?;
        }
    }

    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &NodeConfig, path: &str, body: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde(&cfg.node.token_path);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body(body.to_string())
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let name = cfg.node.name.clone();
    let url = cfg.advertised_url();
    let timing = cfg.replication.timing();

    tracing::info!(
        node = %name,
        url = %url,
        version = env!("CARGO_PKG_VERSION"),
        databases = ?cfg.node.databases,
        workers = cfg.node.workers,
        "starting meridian-node"
    );
    tracing::info!(
        listen = %cfg.network.listen_addr,
        api_addr = %cfg.node.api_addr,
        api_socket = cfg.node.api_socket.as_deref().unwrap_or("(none)"),
        "network config"
    );

    // Open registry
    let registry_path = expand_tilde(&cfg.node.registry);
    if let Some(parent) = registry_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let registry = Arc::new(NodeRegistry::open(&registry_path)?);
    tracing::info!(path = %registry_path.display(), "registry opened");

    // Certificates
    let local = LocalIdentity::load_or_generate(&expand_tilde(&cfg.tls.identity), &name)?;
    let identity = Arc::new(RegistryIdentity::new(local.clone(), registry.clone()));

    // Load bearer token
    let bearer_token = load_or_create_token(&expand_tilde(&cfg.node.token_path))?;

    // Local databases
    let store = Arc::new(MemoryAuditStore::new(name.clone()));
    for database in &cfg.node.databases {
        store.create_database(database)?;
    }

    // QUIC replication endpoint
    let listen_addr: SocketAddr = cfg.network.listen_addr.parse()?;
    let quic = Arc::new(QuicTransport::bind(listen_addr, &local, identity, timing)?);
    tracing::info!(addr = %quic.local_addr()?, "replication endpoint listening (QUIC)");

    let node = Node::spawn(
        NodeSettings {
            name: name.clone(),
            url: url.clone(),
            databases: cfg.node.databases.clone(),
            workers: cfg.node.workers,
            timing,
        },
        registry.clone(),
        store,
        quic.clone(),
    )?;

    let quic_handle = {
        let quic = quic.clone();
        let context = node.source_context();
        let shutdown = node.shutdown_signal();
        tokio::spawn(async move { quic.listen(context, shutdown).await })
    };

    // Start API server
    let state = Arc::new(AppState {
        registry,
        identity: peer_identity(&local, &url, &cfg.node.databases, cfg.node.workers),
        bearer_token,
        coordinator: Some(node.coordinator.clone()),
        peers: Arc::new(HttpPeerClient::new()),
    });
    let router = meridian_api::router(state);

    tracing::info!(addr = %cfg.node.api_addr, "API listening (HTTP)");
    let listener = tokio::net::TcpListener::bind(&cfg.node.api_addr).await?;
    let api_handle = {
        let router = router.clone();
        let mut shutdown = node.shutdown_signal();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        })
    };

    let socket_handle = match &cfg.node.api_socket {
        Some(path) => {
            let sock_path = expand_tilde(path);
            let _ = std::fs::remove_file(&sock_path);
            if let Some(parent) = sock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %sock_path.display(), "API listening (Unix socket)");
            let listener = tokio::net::UnixListener::bind(&sock_path)?;

            let mut shutdown = node.shutdown_signal();
            Some(tokio::spawn(async move {
                use hyper_util::rt::TokioIo;
                use tower::Service;

                loop {
                    tokio::select! {
                        accept = listener.accept() => {
                            match accept {
                                Ok((stream, _addr)) => {
                                    let router = router.clone();
                                    tokio::spawn(async move {
                                        let io = TokioIo::new(stream);
                                        let service = hyper::service::service_fn(move |req| {
                                            let mut router = router.clone();
                                            async move { router.call(req).await }
                                        });
                                        if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                            hyper_util::rt::TokioExecutor::new(),
                                        )
                                        .serve_connection(io, service)
                                        .await
                                        {
                                            tracing::error!("connection error: {e}");
                                        }
                                    });
                                }
                                Err(e) => {
                                    tracing::error!("accept error: {e}");
                                }
                            }
                        }
                        _ = shutdown.recv() => {
                            break;
                        }
                    }
                }
            }))
        }
        None => None,
    };

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    node.stop().await;

    // Wait for all tasks
    let _ = tokio::join!(quic_handle, api_handle);
    if let Some(handle) = socket_handle {
        let _ = handle.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}
