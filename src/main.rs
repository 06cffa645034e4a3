// nettrain - training and scoring drivers
// Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, BufReader, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use nettrain::config::{expand_pattern, load_config, Config, SourceConfig};
use nettrain::errors::{diagnostic, wrap_error_with_suggestion};
use nettrain::ingest::record::CONNECTION_COLUMNS;
use nettrain::ingest::socket::socket_path;
use nettrain::ingest::{
    ContainerReader, ContainerWriter, DatagramListener, FieldDecoder, FieldRecord, FileSource,
    LineParser, ReadOptions, Sampler, SocketRecordAssembler,
};
use nettrain::metrics::RunContext;
use nettrain::training::{
    CheckpointManager, ControllerConfig, Lifecycle, Scorer, SubprocessOracle,
    TrainingLoopController,
};

#[derive(Parser, Debug)]
#[command(name = "nettrain")]
#[command(about = "Streaming ingestion and early-stopping training on network traffic records", version)]
struct Args {
    /// Config file (default: ~/.nettrain/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Train from container files or the datagram socket
    Train {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        overrides: Overrides,

        /// Continue from the latest checkpoint
        #[arg(long)]
        resume: bool,

        /// Skip the checkpoint after each epoch
        #[arg(long)]
        no_epoch_checkpoints: bool,
    },
    /// Evaluate a trained model over container files
    Score {
        /// Glob matching the container files to score
        #[arg(long)]
        files: String,

        /// Checkpoint to load (default: latest in the checkpoint directory)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Show header and frame counts of container files
    Inspect {
        /// Container files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Write newline-delimited records into a container
    Pack {
        /// Output container (gzip when it ends in .gz)
        #[arg(long, short)]
        output: PathBuf,

        /// Input file (default: stdin)
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Header record (default: the connection record columns)
        #[arg(long)]
        header: Option<String>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct SourceArgs {
    /// Glob matching container files
    #[arg(long, conflicts_with = "socket")]
    files: Option<String>,

    /// Stream name; listens on /tmp/<name>.sock
    #[arg(long)]
    socket: Option<String>,
}

#[derive(clap::Args, Debug, Default)]
struct Overrides {
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    file_batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<u64>,

    #[arg(long)]
    patience: Option<u64>,

    #[arg(long)]
    min_delta: Option<f64>,

    /// Fraction of records to keep, in (0, 1]
    #[arg(long)]
    sample: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint name prefix
    #[arg(long)]
    family: Option<String>,

    /// Model service executable
    #[arg(long)]
    oracle: Option<String>,

    /// Model service argument (repeatable)
    #[arg(long = "oracle-arg", allow_hyphen_values = true)]
    oracle_args: Vec<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.file_batch_size {
            config.file_batch_size = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.patience {
            config.patience = v;
        }
        if let Some(v) = self.min_delta {
            config.min_delta = v;
        }
        if let Some(v) = self.sample {
            config.sample = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(v) = self.checkpoint_dir {
            config.checkpoint.dir = v;
        }
        if let Some(v) = self.family {
            config.checkpoint.family = v;
        }
        if let Some(v) = self.oracle {
            config.oracle.program = v;
            config.oracle.args = self.oracle_args;
        } else if !self.oracle_args.is_empty() {
            config.oracle.args = self.oracle_args;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Train {
            source,
            overrides,
            resume,
            no_epoch_checkpoints,
        } => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(pattern) = source.files {
                config.source = Some(SourceConfig::Files(pattern));
            } else if let Some(stream) = source.socket {
                config.source = Some(SourceConfig::Socket(stream));
            }
            overrides.apply(&mut config);
            config.checkpoint.resume |= resume;
            if no_epoch_checkpoints {
                config.checkpoint.every_epoch = false;
            }
            config.validate()?;
            run_train(config).await
        }
        Command::Score {
            files,
            checkpoint,
            overrides,
        } => {
            let mut config = load_config(args.config.as_deref())?;
            config.source = Some(SourceConfig::Files(files));
            overrides.apply(&mut config);
            config.validate()?;
            run_score(config, checkpoint).await
        }
        Command::Inspect { paths } => run_inspect(&paths),
        Command::Pack {
            output,
            input,
            header,
        } => run_pack(output, input, header),
    }
}

/// Initialize tracing to stderr
///
/// Default level is INFO; RUST_LOG overrides it, NETTRAIN_DEBUG=1 switches the
/// default to DEBUG.
fn init_tracing() {
    let show_debug = std::env::var("NETTRAIN_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);
    let default_level = if show_debug { "debug" } else { "info" };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn sampler(config: &Config) -> Result<Option<Sampler>> {
    if config.sample >= 1.0 {
        return Ok(None);
    }
    Ok(Some(Sampler::new(config.sample, config.seed)?))
}

fn line_parser(config: &Config) -> LineParser {
    LineParser::new(config.arity, config.header_prefix.clone())
}

fn file_source(config: &Config, pattern: &str) -> Result<FileSource<FieldDecoder>> {
    let files = expand_pattern(pattern)?;
    tracing::info!(pattern = %pattern, files = files.len(), "Resolved input files");

    Ok(FileSource::new(files, FieldDecoder::new(line_parser(config)))
        .with_read_options(ReadOptions {
            chunk_size: config.chunk_size,
            max_frame_len: config.max_frame_len,
        })
        .with_file_batch_size(config.file_batch_size)
        .with_sampler(sampler(config)?))
}

async fn run_train(config: Config) -> Result<()> {
    let source = config.source.clone().context(
        "No input configured. Pass --files <glob> or --socket <name>, or set [source] in the config file",
    )?;

    let checkpoints = CheckpointManager::new(
        &config.checkpoint.dir,
        &config.checkpoint.family,
        &config.checkpoint.extension,
    )?;
    let oracle = SubprocessOracle::spawn(&config.oracle).await?;
    let controller_config = ControllerConfig {
        batch_size: config.batch_size,
        epochs: config.epochs,
        patience: config.patience,
        min_delta: config.min_delta,
        checkpoint_every_epoch: config.checkpoint.every_epoch,
    };
    let mut controller: TrainingLoopController<FieldRecord, _> =
        TrainingLoopController::new(oracle, checkpoints, controller_config);
    let mut ctx = RunContext::new();

    tracing::info!(
        run_id = %ctx.run_id,
        batch_size = config.batch_size,
        epochs = config.epochs,
        patience = config.patience,
        min_delta = config.min_delta,
        "Starting training"
    );

    if config.checkpoint.resume {
        controller.resume().await?;
    }

    let outcome = match &source {
        SourceConfig::Files(pattern) => {
            let mut files = file_source(&config, pattern)?;
            controller.run_files(&mut files, &mut ctx).await
        }
        SourceConfig::Socket(stream) => {
            let mut listener = DatagramListener::bind(socket_path(stream), config.recv_buffer)?;
            let mut assembler =
                SocketRecordAssembler::new(line_parser(&config), config.batch_size)?;
            controller
                .run_socket(&mut listener, &mut assembler, sampler(&config)?, &mut ctx)
                .await
        }
    };
    ctx.log_summary();
    let lifecycle = outcome?;

    let state = controller.state().clone();
    controller.into_oracle().shutdown().await?;

    match lifecycle {
        Lifecycle::EarlyStopped => println!(
            "Stopped early at epoch {} (val_loss {:?})",
            state.epoch, state.val_loss
        ),
        _ => println!(
            "Training {:?} at epoch {}, {} batch(es)",
            lifecycle, state.epoch, ctx.batches
        ),
    }
    Ok(())
}

async fn run_score(config: Config, checkpoint: Option<PathBuf>) -> Result<()> {
    let Some(SourceConfig::Files(pattern)) = &config.source else {
        anyhow::bail!("Scoring reads container files; pass --files <glob>");
    };

    let checkpoint = match checkpoint {
        Some(path) => path,
        None => {
            let manager = CheckpointManager::new(
                &config.checkpoint.dir,
                &config.checkpoint.family,
                &config.checkpoint.extension,
            )?;
            manager
                .latest()?
                .map(|c| c.path)
                .with_context(|| {
                    wrap_error_with_suggestion(
                        format!("No checkpoint found in {}", manager.dir().display()),
                        "Train a model first or pass --checkpoint <path>.",
                    )
                })?
        }
    };

    let mut files = file_source(&config, pattern)?;
    let oracle = SubprocessOracle::spawn(&config.oracle).await?;
    let mut scorer: Scorer<FieldRecord, _> = Scorer::new(oracle, config.batch_size);
    let mut ctx = RunContext::new();

    scorer.load(&checkpoint).await?;
    let report = scorer.score_files(&mut files, &mut ctx).await;
    ctx.log_summary();
    let report = report?;
    scorer.into_oracle().shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize score report")?
    );
    Ok(())
}

fn run_inspect(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let mut reader = ContainerReader::open(path, ReadOptions::default())
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut bytes = 0u64;
        while let Some(frame) = reader
            .next_frame()
            .with_context(|| format!("Failed to read {}", path.display()))?
        {
            bytes += frame.len() as u64;
        }

        let header = reader
            .header()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .unwrap_or_else(|| "<none>".to_string());
        println!("{}", path.display());
        println!("  header:  {}", header);
        println!("  records: {}", reader.frames_decoded());
        println!("  payload: {} bytes", bytes);
    }
    Ok(())
}

fn run_pack(output: PathBuf, input: Option<PathBuf>, header: Option<String>) -> Result<()> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let header = header.unwrap_or_else(|| CONNECTION_COLUMNS.join(","));

    let mut writer = ContainerWriter::create(&output, header.as_bytes())
        .with_context(|| format!("Failed to create {}", output.display()))?;
    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        if line.is_empty() {
            continue;
        }
        writer.write_record(line.as_bytes())?;
    }
    let records = writer.finish()?;

    tracing::info!(output = %output.display(), records, "Packed container");
    println!("Wrote {} record(s) to {}", records, output.display());
    Ok(())
}
