//! `tessera`: resolve images through the tiered cache from the command line

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tessera_cache::FsDiskCache;
use tessera_core::{DigestKeyMaker, DiskCacheStrategy, KeyMaker, ProcessorSpec};
use tessera_task::{
    FileFetcher, LoaderBuilder, LoaderConfig, Request, RequestBuilder, SourcePersistingFetcher,
    TaskOutcome,
};
use tracing_subscriber::{fmt, EnvFilter};

fn processor_args() -> [Arg; 2] {
    [
        Arg::new("processor")
            .long("processor")
            .short('p')
            .action(ArgAction::Append)
            .value_parser(value_parser!(ProcessorSpec))
            .help("Processor to apply, in order: grayscale, invert, blur:<sigma>, resize:<w>x<h>, rotate:<n>"),
        Arg::new("sample-size")
            .long("sample-size")
            .value_parser(value_parser!(u32))
            .help("Downsample factor applied while decoding"),
    ]
}

fn cli() -> Command {
    Command::new("tessera")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tiered image retrieval: memory, disk and source")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug-level logging"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("load")
                .about("Resolve an address and report where it came from")
                .arg(Arg::new("address").required(true).help("file:// address or path"))
                .args(processor_args())
                .arg(
                    Arg::new("out")
                        .long("out")
                        .short('o')
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the resolved image here"),
                )
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .value_parser(value_parser!(DiskCacheStrategy))
                        .help("Disk strategy: none, source, result or all"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .value_parser(value_parser!(PathBuf))
                        .help("Loader configuration file (TOML)"),
                )
                .arg(
                    Arg::new("cache-dir")
                        .long("cache-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Disk tier directory, overriding the configuration"),
                )
                .arg(
                    Arg::new("skip-memory")
                        .long("skip-memory")
                        .action(ArgAction::SetTrue)
                        .help("Neither read nor write the memory tier"),
                )
                .arg(
                    Arg::new("skip-disk")
                        .long("skip-disk")
                        .action(ArgAction::SetTrue)
                        .help("Do not read the disk tier"),
                ),
        )
        .subcommand(
            Command::new("key")
                .about("Print the cache keys an address resolves to")
                .arg(Arg::new("address").required(true))
                .args(processor_args()),
        )
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let initialized = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    initialized.map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
}

fn with_processors(mut builder: RequestBuilder, args: &ArgMatches) -> RequestBuilder {
    if let Some(specs) = args.get_many::<ProcessorSpec>("processor") {
        for spec in specs {
            builder = builder.processor(Arc::clone(&spec.0));
        }
    }
    if let Some(sample_size) = args.get_one::<u32>("sample-size") {
        builder = builder.sample_size(*sample_size);
    }
    builder
}

fn address_arg(args: &ArgMatches) -> Result<&str> {
    args.get_one::<String>("address")
        .map(String::as_str)
        .context("address is required")
}

async fn load(args: &ArgMatches) -> Result<ExitCode> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LoaderConfig::new(),
    };
    if let Some(dir) = args.get_one::<PathBuf>("cache-dir") {
        config = config.with_disk_dir(dir);
    }

    // opened here so pending writes can be flushed before exit
    let disk = match config.disk_dir.take() {
        Some(dir) => Some(Arc::new(FsDiskCache::open(&dir).await.with_context(|| {
            format!("opening disk cache {}", dir.display())
        })?)),
        None => None,
    };

    let mut builder =
        LoaderBuilder::from_config(&config, SourcePersistingFetcher::new(FileFetcher)).await?;
    if let Some(disk) = &disk {
        builder = builder.disk_cache(disk.clone());
    }
    let loader = builder.build();

    let skip_memory = args.get_flag("skip-memory");
    let mut request = loader
        .request(address_arg(args)?)
        .skip_read_memory(skip_memory)
        .skip_write_memory(skip_memory)
        .skip_read_disk(args.get_flag("skip-disk"));
    if let Some(strategy) = args.get_one::<DiskCacheStrategy>("strategy") {
        request = request.strategy(*strategy);
    }
    let request = with_processors(request, args).build();

    let outcome = loader.load(request).await;
    if let Some(disk) = &disk {
        disk.flush().await;
    }

    match outcome {
        TaskOutcome::Success { artifact, origin } => {
            println!("{origin} {}x{}", artifact.width(), artifact.height());
            if let Some(out) = args.get_one::<PathBuf>("out") {
                artifact
                    .image()
                    .save(out)
                    .with_context(|| format!("writing {}", out.display()))?;
                tracing::info!(path = %out.display(), "image written");
            }
            Ok(ExitCode::SUCCESS)
        }
        TaskOutcome::Failure { error, origin } => {
            eprintln!("failed ({origin}): {error}");
            Ok(ExitCode::FAILURE)
        }
        TaskOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn key(args: &ArgMatches) -> Result<()> {
    let request = with_processors(Request::builder(address_arg(args)?), args).build();
    let snapshot = request.processors().snapshot();
    let keys = DigestKeyMaker.keys(&request.key_subject(&snapshot));
    println!("source {}", keys.source);
    println!("result {}", keys.result);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"), matches.get_flag("log-json"))?;

    match matches.subcommand() {
        Some(("load", args)) => load(args).await,
        Some(("key", args)) => key(args).map(|()| ExitCode::SUCCESS),
        _ => unreachable!("subcommand is required"),
    }
}
