mod cli;

use anyhow::{bail, Context, Result};
use talus_relational::JsonlSink;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = cli::parse_args();
    // A missing config file is fine when --input names the track log;
    // everything else has usable defaults.
    let mut config = if args.config_path.exists() || args.input.is_none() {
        talus_config::load_config(&args.config_path)
            .with_context(|| format!("failed to load config {}", args.config_path.display()))?
    } else {
        talus_config::AppConfig::default()
    };

    if let Some(input) = &args.input {
        config.input.log_file = input.to_string_lossy().into_owned();
    }
    if let Some(output) = &args.output {
        config.output.dir = output.to_string_lossy().into_owned();
    }
    if config.input.log_file.is_empty() {
        bail!("no track log to translate: set input.log_file in the config or pass --input");
    }

    let mut sink = JsonlSink::create(&config.output.dir, config.translate.flush_every_rows)?;
    talus_translate_core::run_translator(&config, &mut sink)?;
    Ok(())
}
