use folder_importd::daemon::{DaemonConfig, DaemonRuntime, RunMode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run(RunMode),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run(RunMode::All);
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--api-only" => mode = CliMode::Run(RunMode::ApiOnly),
            "--worker-only" => mode = CliMode::Run(RunMode::WorkerOnly),
            "--help" | "-h" => return Ok(CliMode::Help),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: folder-importd [--api-only | --worker-only]");
            println!("  --api-only      Serve the HTTP API without running workers");
            println!("  --worker-only   Run import workers without the HTTP API");
            return Ok(());
        }
        CliMode::Run(mode) => mode,
    };
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config, mode).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("folder-importd")
            .chain(extra.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_api_and_workers() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run(RunMode::All));
    }

    #[test]
    fn parse_cli_mode_selects_a_single_surface() {
        assert_eq!(
            parse_cli_mode(args(&["--api-only"])).unwrap(),
            CliMode::Run(RunMode::ApiOnly)
        );
        assert_eq!(
            parse_cli_mode(args(&["--worker-only"])).unwrap(),
            CliMode::Run(RunMode::WorkerOnly)
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
