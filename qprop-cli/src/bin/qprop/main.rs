use std::{io, path::PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use qprop::{apply_quantization_params_propagation, MinMaxQuantizer};
use qprop_cli::{load_config, load_graph, load_rules, write_graph, ConfigOverrides};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Should the logs be printed in json format or not
    #[arg(long, env = "QPROP_JSON_LOGS", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Propagate quantization parameters through a graph and write the rewritten graph.
    Propagate {
        /// The graph to rewrite
        #[arg(short, long)]
        graph: PathBuf,

        /// Quantization rules keyed by operation name
        #[arg(short, long, env = "QPROP_RULES")]
        rules: PathBuf,

        /// Base propagation settings, overridden by the flags below
        #[arg(short, long, env = "QPROP_CONFIG")]
        config: Option<PathBuf>,

        /// Where to write the rewritten graph, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Check the structure of a graph without rewriting it.
    Validate {
        #[arg(short, long)]
        graph: PathBuf,
    },
}

fn setup_logging(json: bool) -> Result<()> {
    // stdout may carry the rewritten graph
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(io::stderr)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_writer(io::stderr)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    };
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;

    match args.command {
        Command::Propagate {
            graph,
            rules,
            config,
            output,
            overrides,
        } => {
            let config = overrides.apply(load_config(config.as_deref())?);
            let rules = load_rules(&rules)?;
            let mut graph = load_graph(&graph)?;
            info!(
                ops = graph.num_ops(),
                rules = rules.len(),
                ?config,
                "propagating quantization parameters"
            );
            let report =
                apply_quantization_params_propagation(&mut graph, &config, &rules, &MinMaxQuantizer)
                    .context("propagating quantization parameters")?;
            if !report.changed {
                info!("no changes made");
            }
            write_graph(&graph, output.as_deref())?;
        }
        Command::Validate { graph: path } => {
            let graph = load_graph(&path)?;
            info!(
                path = %path.display(),
                ops = graph.num_ops(),
                arguments = graph.arguments().len(),
                "graph is valid"
            );
        }
    }
    Ok(())
}
