mod backhaul;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "backhaul - expose TCP services behind NAT through a public relay"
)]
struct Cli {
    /// Path to the config file (.yaml/.yml/.toml). If omitted, uses BACKHAUL_CONFIG; then looks for backhaul.yaml, backhaul.yml, backhaul.toml or config.yaml in the working directory; then falls back to the OS default path (Linux: /etc/backhaul/backhaul.yaml; others: user config dir).
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    backhaul::run(cli.config).await
}
