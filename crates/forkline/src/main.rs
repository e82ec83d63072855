use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use forkline::config::{self, Transport, default_config_path, write_default_config};
use forkline::{
    FileDumpSink, ForkConfig, ForkSpec, ForkStarter, LoggingReporter, Reporter, ReporterFactory,
    test_queue,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run forked test workers over the forkline protocol.",
    propagate_version = true
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Transport between controller and worker (pipe or tcp)
    #[arg(long, value_name = "TRANSPORT")]
    transport: Option<Transport>,
    /// Seconds a fork may run before it is killed (0 disables)
    #[arg(long = "timeout", value_name = "SECONDS")]
    timeout: Option<u64>,
    /// Number of forks drawing from the test queue
    #[arg(long, value_name = "N", default_value_t = 1)]
    forks: usize,
    /// Test class to hand out; repeat for more
    #[arg(long = "class", value_name = "CLASS")]
    classes: Vec<String>,
    /// Directory for dump files
    #[arg(long = "dump-dir", value_name = "PATH")]
    dump_dir: Option<PathBuf>,
    /// Write the default configuration to the config path and exit
    #[arg(long = "init-config")]
    init_config: bool,
    /// Output the fork results as JSON
    #[arg(long)]
    json: bool,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
    /// Worker program and its arguments
    #[arg(last = true, value_name = "WORKER")]
    worker: Vec<String>,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }

    fn init_logging(&self) {
        let level = self.log_level().to_string().to_lowercase();
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
            .try_init()
            .ok();
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(default_config_path)
    }

    fn load_config(&self) -> Result<ForkConfig> {
        let mut config = config::load_config(self.config_path().as_deref())?;
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(timeout) = self.timeout {
            config.fork_timeout_secs = timeout;
        }
        if let Some(dir) = &self.dump_dir {
            config.dump_dir = dir.clone();
        }
        Ok(config)
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    if cli.init_config {
        let path = cli
            .config_path()
            .context("no config directory available, pass --config")?;
        write_default_config(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let Some((program, args)) = cli.worker.split_first() else {
        bail!("no worker given; usage: forkline [OPTIONS] -- <WORKER> [ARGS]...");
    };
    let config = cli.load_config()?;
    debug!("effective config: {:?}", config);

    let spec = ForkSpec::new(program.clone()).args(args.iter().cloned());
    async_main(config, spec, cli.classes.clone(), cli.forks, cli.json)
}

#[tokio::main]
async fn async_main(
    config: ForkConfig,
    spec: ForkSpec,
    classes: Vec<String>,
    forks: usize,
    json: bool,
) -> Result<()> {
    let dump = Arc::new(FileDumpSink::new(config.dump_dir.clone()));
    let reporters: ReporterFactory =
        Arc::new(|fork| Arc::new(LoggingReporter::new(fork)) as Arc<dyn Reporter>);
    let starter = Arc::new(ForkStarter::new(config, reporters, dump));

    info!("Starting {} fork(s) of {}", forks.max(1), spec.program);
    let results = starter.run_parallel(&spec, test_queue(classes), forks).await;
    starter.shutdown().await;
    let results = results?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("serializing fork results to JSON")?
        );
    } else {
        for result in &results {
            println!("fork {}: {}", result.fork_number, result.outcome());
        }
    }

    let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    if !failed.is_empty() {
        bail!("{} of {} fork(s) did not complete", failed.len(), results.len());
    }
    Ok(())
}
