use apex_gateway::GatewayApp;
use apex_gateway::config::GatewayConfig;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "apex-gateway", version, about = "API gateway reverse proxy")]
struct Cli {
  /// Path to gateway.yaml; overrides GATEWAY_CONFIG and the conventional
  /// search paths when set.
  #[arg(long, env = "GATEWAY_CONFIG")]
  config: Option<String>,

  /// Directory the five log streams are written under.
  #[arg(long, env = "GATEWAY_LOG_DIR", default_value = "logs")]
  log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let _log_guards = apex_gateway::observability::init(&cli.log_dir)?;

  let config = match &cli.config {
    Some(path) => GatewayConfig::from_file(path)?,
    None => GatewayConfig::load()?,
  };

  let app = GatewayApp::build(config).await?;
  app.run().await
}
