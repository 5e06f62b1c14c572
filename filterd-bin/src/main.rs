use clap::{Parser, Subcommand};
use filterd_bin::{classify_files, format_decision, format_sniff, init_logging, inspect, match_hosts};
use filterd_config::Config;
use filterd_core::{FilterContext, RuleSet, WorkerPool};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/filterd/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and log the filter decision for each (default)
    Inspect,
    /// Print the detected protocol and HTML sniff result of files
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the filter decision for host names
    Match {
        #[arg(required = true)]
        hosts: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging()?;

    let config = Config::from_file(&args.config)?;
    let runtime = WorkerPool::build(&config.dispatcher)?;

    runtime.block_on(async move {
        match args.command.unwrap_or(Command::Inspect) {
            Command::Inspect => inspect(config).await,
            Command::Classify { files } => {
                let context = FilterContext::from_config(&config, tokio::runtime::Handle::current(), None)?;
                for report in classify_files(&context, &files).await {
                    match report.result {
                        Ok((verdict, html)) => {
                            println!("{}\t{}\t{}", report.path.display(), verdict, format_sniff(html))
                        }
                        Err(e) => println!("{}\terror: {}", report.path.display(), e),
                    }
                }
                Ok(())
            }
            Command::Match { hosts } => {
                let rules = RuleSet::from_config(&config);
                for (host, decision) in match_hosts(&rules, &hosts) {
                    println!("{}\t{}", host, format_decision(&decision));
                }
                Ok(())
            }
        }
    })
}
