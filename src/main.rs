//! QuickRelay CLI
//!
//! Run a relay on a public host, or an agent next to a private service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quickrelay_agent::{Agent, AgentConfig, Backoff, RelayOptions};
use quickrelay_server::{RelayConfig, RelayServer, ServiceOptions, StaticServices};
use quickrelay_transport::{Acceptor, ClientTlsConfig, ClientTransport, ServerTlsConfig};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// QuickRelay - expose services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "quickrelay")]
#[command(about = "QuickRelay - expose services behind NAT through a public relay")]
#[command(version)]
struct Cli {
    /// Log filter (e.g. "info", "quickrelay_server=debug"); RUST_LOG is used when unset
    #[arg(long, global = true, env = "QUICKRELAY_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent connections and publish their services
    #[command(long_about = r#"
Accept agent control connections and open one public port per service.

EXAMPLES:
  quickrelay relay --listen 0.0.0.0:4443 --services services.yaml \
    --tls-cert cert.pem --tls-key key.pem

SERVICES FILE:
  services:
    - name: db
      token: s3cret
      port: 15432
    "#)]
    Relay {
        /// Address agents connect to
        #[arg(long, env = "QUICKRELAY_LISTEN", default_value = "0.0.0.0:4443")]
        listen: SocketAddr,

        /// YAML file listing the services agents may expose
        #[arg(long, env = "QUICKRELAY_SERVICES")]
        services: PathBuf,

        /// IP the public service ports are bound on
        #[arg(long, env = "QUICKRELAY_PUBLIC_IP", default_value = "0.0.0.0")]
        public_ip: IpAddr,

        /// TLS certificate (PEM); agents connect over plain TCP when omitted
        #[arg(long, env = "QUICKRELAY_TLS_CERT", requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// TLS private key (PEM)
        #[arg(long, env = "QUICKRELAY_TLS_KEY", requires = "tls_cert")]
        tls_key: Option<PathBuf>,

        /// Seconds a public client waits for the agent's data connection
        #[arg(long, default_value = "5")]
        correlation_timeout_secs: u64,
    },

    /// Expose a local backend through a relay
    #[command(long_about = r#"
Keep a control connection to the relay and forward every public connection
of the service to a backend address. Reconnects when the relay goes away.

EXAMPLES:
  quickrelay agent --relay relay.example.com:4443 \
    --service db --token $QUICKRELAY_TOKEN --backend 127.0.0.1:5432
    "#)]
    Agent {
        /// Relay address (host:port)
        #[arg(long, env = "QUICKRELAY_RELAY")]
        relay: String,

        /// Service name registered on the relay
        #[arg(long, env = "QUICKRELAY_SERVICE")]
        service: String,

        /// Service token
        #[arg(long, env = "QUICKRELAY_TOKEN", hide_env_values = true)]
        token: String,

        /// Backend address to forward connections to (host:port)
        #[arg(long, env = "QUICKRELAY_BACKEND")]
        backend: String,

        /// Connect over plain TCP instead of TLS
        #[arg(long)]
        insecure: bool,

        /// Server name to verify; defaults to the relay host
        #[arg(long)]
        tls_server_name: Option<String>,

        /// CA certificate (PEM) to trust instead of the web PKI roots
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Skip certificate verification (development only)
        #[arg(long)]
        tls_skip_verify: bool,

        /// Maximum consecutive reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnects: usize,
    },
}

#[derive(Debug, Deserialize)]
struct ServicesFile {
    services: Vec<ServiceOptions>,
}

fn setup_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_services(path: &Path) -> Result<StaticServices> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read services file {}", path.display()))?;
    parse_services(&contents)
        .with_context(|| format!("Failed to parse services file {}", path.display()))
}

fn parse_services(contents: &str) -> Result<StaticServices> {
    let file: ServicesFile = serde_yaml::from_str(contents)?;

    let mut services = StaticServices::new();
    for service in file.services {
        if service.service_name.is_empty() || service.service_token.is_empty() {
            anyhow::bail!("every service needs a name and a token");
        }
        let name = service.service_name.clone();
        if services.insert(service).is_some() {
            anyhow::bail!("service {} is listed twice", name);
        }
    }
    Ok(services)
}

fn client_transport(
    insecure: bool,
    tls_server_name: Option<String>,
    ca_cert: Option<PathBuf>,
    tls_skip_verify: bool,
) -> ClientTransport {
    if insecure {
        return ClientTransport::Plain;
    }

    let mut tls = ClientTlsConfig::default();
    if let Some(name) = tls_server_name {
        tls = tls.with_server_name(name);
    }
    if let Some(path) = ca_cert {
        tls = tls.with_root_cert(path);
    }
    if tls_skip_verify {
        tls = tls.with_insecure_skip_verify();
    }
    ClientTransport::Tls(tls)
}

async fn run_relay(
    listen: SocketAddr,
    services: PathBuf,
    public_ip: IpAddr,
    tls: Option<(PathBuf, PathBuf)>,
    correlation_timeout: Duration,
) -> Result<()> {
    let lookup = load_services(&services)?;
    info!("Loaded {} service(s) from {}", lookup.len(), services.display());

    let config = RelayConfig::default()
        .with_listen_addr(listen)
        .with_public_bind_ip(public_ip)
        .with_correlation_timeout(correlation_timeout);

    let mut server = RelayServer::new(config, lookup);
    match tls {
        Some((cert, key)) => {
            let acceptor = Acceptor::tls(&ServerTlsConfig::new(cert, key))
                .context("Failed to load TLS certificate")?;
            server = server.with_tls(acceptor);
        }
        None => warn!("TLS disabled, agents connect over plain TCP"),
    }

    tokio::select! {
        result = server.serve() => result.context("Relay server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            server.shutdown();
        }
    }

    Ok(())
}

/// Run the agent, redialing the relay with backoff until a fatal error
async fn run_agent(agent: Arc<Agent>, max_reconnects: usize) -> Result<()> {
    let mut backoff = Backoff::new((max_reconnects > 0).then_some(max_reconnects));

    loop {
        match agent.connect().await {
            Ok(session) => {
                backoff.reset();
                if let Err(e) = agent.serve(session).await {
                    warn!("Control connection lost: {}", e);
                }
            }
            Err(e) if e.is_authentication_failure() => {
                return Err(e).context("Relay rejected the service credentials");
            }
            Err(e) => error!("Failed to connect to relay: {}", e),
        }

        if agent.is_shutdown() {
            return Ok(());
        }

        let Some(delay) = backoff.next_delay() else {
            anyhow::bail!("Gave up after {} reconnection attempts", backoff.failures());
        };
        warn!("Reconnecting in {:?} (attempt {})", delay, backoff.failures());
        tokio::time::sleep(delay).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Relay {
            listen,
            services,
            public_ip,
            tls_cert,
            tls_key,
            correlation_timeout_secs,
        } => {
            info!("QuickRelay relay starting on {}", listen);
            run_relay(
                listen,
                services,
                public_ip,
                tls_cert.zip(tls_key),
                Duration::from_secs(correlation_timeout_secs),
            )
            .await?;
            info!("Relay stopped");
            Ok(())
        }
        Commands::Agent {
            relay,
            service,
            token,
            backend,
            insecure,
            tls_server_name,
            ca_cert,
            tls_skip_verify,
            max_reconnects,
        } => {
            let transport = client_transport(insecure, tls_server_name, ca_cert, tls_skip_verify);
            if insecure {
                warn!("TLS disabled, connecting to the relay over plain TCP");
            } else if tls_skip_verify {
                warn!("Certificate verification disabled (development only)");
            }

            let config = AgentConfig::new(
                RelayOptions::new(relay.as_str(), service.as_str(), token).with_transport(transport),
                backend.as_str(),
            );
            config.validate().context("Invalid agent configuration")?;

            info!(service = %service, relay = %relay, backend = %backend, "QuickRelay agent starting");

            let agent = Arc::new(Agent::new(config));
            let task = tokio::spawn(run_agent(agent.clone(), max_reconnects));

            tokio::select! {
                result = task => {
                    result.context("Agent task panicked")??;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    agent.shutdown();
                }
            }

            info!("Agent stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickrelay_server::ServiceLookup;
    use std::io::Write;

    #[test]
    fn test_parse_services() {
        let yaml = r#"
services:
  - name: db
    token: s3cret
    port: 15432
  - name: web
    token: other
    port: 0
"#;
        let services = parse_services(yaml).unwrap();
        assert_eq!(services.len(), 2);

        let db = services.service_options("db").unwrap();
        assert_eq!(db.service_token, "s3cret");
        assert_eq!(db.service_port, 15432);
        assert!(services.service_options("missing").is_err());
    }

    #[test]
    fn test_parse_services_rejects_duplicates() {
        let yaml = r#"
services:
  - { name: db, token: a, port: 1 }
  - { name: db, token: b, port: 2 }
"#;
        assert!(parse_services(yaml).is_err());
    }

    #[test]
    fn test_parse_services_rejects_empty_token() {
        let yaml = "services:\n  - { name: db, token: \"\", port: 1 }\n";
        assert!(parse_services(yaml).is_err());
    }

    #[test]
    fn test_load_services_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "services:\n  - {{ name: ssh, token: t, port: 2222 }}").unwrap();

        let services = load_services(file.path()).unwrap();
        assert_eq!(services.service_options("ssh").unwrap().service_port, 2222);
    }

    #[test]
    fn test_load_services_missing_file() {
        let err = load_services(Path::new("/nonexistent/services.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read services file"));
    }

    #[test]
    fn test_client_transport() {
        assert!(!client_transport(true, None, None, false).is_tls());

        match client_transport(false, Some("relay.example.com".into()), None, true) {
            ClientTransport::Tls(tls) => {
                assert_eq!(tls.server_name.as_deref(), Some("relay.example.com"));
                assert!(tls.insecure_skip_verify);
            }
            ClientTransport::Plain => panic!("expected TLS transport"),
        }
    }

    #[test]
    fn test_cli_parses_agent() {
        let cli = Cli::try_parse_from([
            "quickrelay",
            "agent",
            "--relay",
            "relay:4443",
            "--service",
            "db",
            "--token",
            "T",
            "--backend",
            "127.0.0.1:5432",
            "--insecure",
        ])
        .unwrap();

        match cli.command {
            Commands::Agent {
                service, insecure, ..
            } => {
                assert_eq!(service, "db");
                assert!(insecure);
            }
            _ => panic!("expected agent command"),
        }
    }
}
