use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use induction_guard::config::GuardConfig;
use induction_guard::ratelimit::{PolicyKind, PolicySet, RateLimitEngine, RequestContext};

/// Operational entry point for the guard engine.
#[derive(Debug, Parser)]
#[command(name = "induction-guard", version, about)]
struct Cli {
    /// YAML configuration file; the process environment is used otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the resolved policies
    Policies,
    /// Evaluate a policy repeatedly and print each result as JSON
    Probe {
        #[arg(long, value_enum)]
        policy: PolicyArg,

        /// Explicit client key instead of one derived from headers
        #[arg(long)]
        client_key: Option<String>,

        /// Email, site id or token, depending on the policy
        #[arg(long, default_value = "")]
        subject: String,

        /// Request header as `name:value`; may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Public,
    Login,
    SignIn,
    SignOut,
    CspReport,
}

impl From<PolicyArg> for PolicyKind {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Public => PolicyKind::PublicAccess,
            PolicyArg::Login => PolicyKind::Login,
            PolicyArg::SignIn => PolicyKind::SignIn,
            PolicyArg::SignOut => PolicyKind::SignOut,
            PolicyArg::CspReport => PolicyKind::CspReport,
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once(':')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name:value, got {:?}", raw))
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

    let config = match &cli.config {
        Some(path) => GuardConfig::from_file(path)?,
        None => GuardConfig::from_env()?,
    };

    match cli.command {
        Command::Policies => {
            let policies = PolicySet::from_config(&config)?;
            print!("{}", serde_yaml::to_string(&policies)?);
        }
        Command::Probe {
            policy,
            client_key,
            subject,
            headers,
            count,
        } => {
            let kind = PolicyKind::from(policy);
            let engine = RateLimitEngine::from_config(&config)?;
            info!(
                policy = %kind,
                distributed = engine.context().backend.is_configured(),
                "Rate limit engine initialized"
            );

            let mut request = RequestContext::new(headers.into_iter().collect());
            if let Some(key) = client_key {
                request = request.with_client_key(&key);
            }

            for attempt in 1..=count {
                let request = request.clone().with_request_id(&format!("probe-{}", attempt));
                let result = engine.check(kind, &request, &subject).await?;
                println!("{}", serde_json::to_string(&result)?);
            }

            info!(
                policy = %kind,
                blocked = engine.context().telemetry.blocked_count(kind),
                "Probe finished"
            );
        }
    }

    Ok(())
}
