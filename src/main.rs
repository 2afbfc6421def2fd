use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use hl7_mllp_sim::template::{load_template, Expander};
use hl7_mllp_sim::{Client, ExpandOptions, LengthPrefixedSink, MessageSink, Server, Settings, StdoutSink};

/// Generate HL7 v2 test messages from templates and exchange them over MLLP
#[derive(Parser, Debug)]
#[command(name = "hl7sim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file, hl7sim.toml in the working directory is used if present
    #[arg(short, long, env = "HL7SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG is honoured when unset
    #[arg(short, long, env = "HL7SIM_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expand a template and print the messages
    Generate(GenerateArgs),

    /// Send a template's messages (or a file of messages) and wait for the acks
    Send(SendArgs),

    /// Acknowledge and print (or pipe) every message received
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct TemplateArgs {
    /// Template name or path
    template: String,

    /// Values for $VAR1, $VAR2, ...
    args: Vec<String>,

    /// Extra template directory, searched before the configured ones
    #[arg(long = "template-dir")]
    template_dirs: Vec<PathBuf>,

    /// Directory for $DAT and $B64 files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed the random generator for reproducible output
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    template: TemplateArgs,

    /// Ignore the argument count and also print the form hints as JSON
    #[arg(short, long)]
    interactive: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Send the messages in this file instead of expanding a template
    #[arg(short, long, conflicts_with_all = ["template", "args"])]
    file: Option<PathBuf>,

    #[arg(required_unless_present = "file")]
    template: Option<String>,

    args: Vec<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds to wait for each acknowledgement
    #[arg(short, long)]
    timeout: Option<u64>,

    #[arg(long = "template-dir")]
    template_dirs: Vec<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write length prefixed messages to this named pipe instead of stdout
    #[arg(long)]
    pipe: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Generate(args) => generate(&settings, args),
        Commands::Send(args) => send(&settings, args).await,
        Commands::Listen(args) => listen(&settings, args).await,
    }
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // also installs the bridge that routes the library's `log` records through this subscriber
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

fn expand_template(
    settings: &Settings,
    template: &TemplateArgs,
    interactive: bool,
) -> Result<hl7_mllp_sim::Expansion> {
    let mut dirs = template.template_dirs.clone();
    dirs.extend(settings.template_dirs.iter().cloned());

    let doc = load_template(&template.template, &dirs)?;
    let options = ExpandOptions {
        interactive,
        data_dir: template
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.data_dir.clone()),
        seed: template.seed,
        now: None,
    };
    let expansion = Expander::new(&doc, options)
        .expand(&template.args)
        .with_context(|| format!("Failed to expand template '{}'", template.template))?;
    info!(
        "Template '{}' expanded to {} message(s)",
        template.template,
        expansion.messages.len()
    );
    Ok(expansion)
}

fn generate(settings: &Settings, args: GenerateArgs) -> Result<()> {
    let expansion = expand_template(settings, &args.template, args.interactive)?;
    for message in &expansion.messages {
        println!("{}", String::from_utf8_lossy(message).replace('\r', "\n"));
    }
    if args.interactive {
        println!("{}", serde_json::to_string_pretty(&expansion.form_hints)?);
    }
    Ok(())
}

async fn send(settings: &Settings, args: SendArgs) -> Result<()> {
    let payload = match (&args.file, &args.template) {
        (Some(path), _) => {
            let text = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            normalize_segment_terminators(&text)
        }
        (None, Some(template)) => {
            let template = TemplateArgs {
                template: template.clone(),
                args: args.args.clone(),
                template_dirs: args.template_dirs.clone(),
                data_dir: args.data_dir.clone(),
                seed: args.seed,
            };
            expand_template(settings, &template, false)?.payload().to_vec()
        }
        (None, None) => bail!("Either a template or --file is required"),
    };

    let mut options = settings.send_options();
    if let Some(secs) = args.timeout {
        options.ack_timeout = Duration::from_secs(secs);
    }
    let host = args.host.as_deref().unwrap_or(&settings.host);
    let port = args.port.unwrap_or(settings.send_port);

    let acks = Client::new(options).send_all(host, port, &payload).await?;
    let mut rejected = 0;
    for (n, ack) in acks.iter().enumerate() {
        println!("Message {}: {}", n + 1, ack.code);
        if !ack.code.is_accept() {
            rejected += 1;
        }
    }
    if rejected > 0 {
        bail!("{} of {} message(s) were not accepted", rejected, acks.len());
    }
    Ok(())
}

async fn listen(settings: &Settings, args: ListenArgs) -> Result<()> {
    let sink: Arc<dyn MessageSink> = match &args.pipe {
        Some(path) => Arc::new(
            LengthPrefixedSink::open(path)
                .with_context(|| format!("Failed to open pipe {}", path.display()))?,
        ),
        None => Arc::new(StdoutSink),
    };

    let port = args.port.unwrap_or(settings.listen_port);
    let server = Server::bind((args.bind.as_str(), port)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Unable to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(sink, shutdown_rx).await?;
    Ok(())
}

/// Files written on other systems separate segments with LF or CRLF, the wire wants a lone CR.
fn normalize_segment_terminators(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut iter = text.iter().peekable();
    while let Some(&b) = iter.next() {
        match b {
            b'\r' => {
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
                out.push(b'\r');
            }
            b'\n' => out.push(b'\r'),
            _ => out.push(b),
        }
    }
    out
}
