use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley::api::{self, AppState};
use parley::ask::{
    AskUserError, BaseErrorHandler, DecisionClassifier, HttpClassifier, KeywordClassifier,
    PrivateKeyExport, SinkAskHandler, answer_text,
};
use parley::config::{self, APP_NAME, AppConfig, AppPaths};
use parley::protocol::{
    Actor, Envelope, EnvelopeContext, Level, OutMessage, Transformer, TransformerKind,
};
use parley::router::{MessageType, SinkRouter};
use parley::settings::{FileSettingsStore, SettingsStore};
use parley::sink::{PipeBridge, Sink, StdioConsole, TracingSink};
use parley::transport::{ConnectionHandler, ConnectionManager, TransportOptions};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Say(cmd) => handle_say(&ctx, cmd).await,
        Command::Ask(cmd) => handle_ask(&ctx, cmd).await,
        Command::ExportKey(cmd) => handle_export_key(&ctx, cmd).await,
        Command::Pipe { command } => handle_pipe(&ctx, command).await,
        Command::Config { .. } | Command::Completions { .. } => Ok(()),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Parley - interactive output and recoverable-error protocol.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatOption {
    Text,
    Html,
    Json,
    Plang,
}

impl From<FormatOption> for TransformerKind {
    fn from(value: FormatOption) -> Self {
        match value {
            FormatOption::Text => TransformerKind::Text,
            FormatOption::Html => TransformerKind::Html,
            FormatOption::Json => TransformerKind::Json,
            FormatOption::Plang => TransformerKind::Plang,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Emit one message
    Say(SayCommand),
    /// Ask a question on the console and print the answer
    Ask(AskCommand),
    /// Run the private key export interrogation
    ExportKey(ExportKeyCommand),
    /// Exchange messages over a Unix socket
    Pipe {
        #[command(subcommand)]
        command: PipeCommand,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address to bind to (defaults to http.bind)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct SayCommand {
    /// Message content
    content: String,
    /// Channel to emit on
    #[arg(long)]
    channel: Option<String>,
    /// Message level
    #[arg(long, default_value = "info")]
    level: Level,
    /// Status code
    #[arg(long, default_value_t = 200)]
    status: u16,
    /// Originating actor
    #[arg(long, default_value = "user")]
    actor: Actor,
    /// Write the encoded message instead of rendering it on the console
    #[arg(long, value_enum)]
    format: Option<FormatOption>,
}

#[derive(Debug, Clone, Args)]
struct AskCommand {
    /// Question to ask
    question: String,
}

#[derive(Debug, Clone, Args)]
struct ExportKeyCommand {
    /// Key namespace the decision is stored under
    #[arg(long, default_value = "default")]
    namespace: String,
}

#[derive(Debug, Subcommand)]
enum PipeCommand {
    /// Listen on a socket and print inbound messages
    Listen {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
        /// Channel connections are registered under (defaults to pipe.channel)
        #[arg(long)]
        channel: Option<String>,
    },
    /// Connect to a socket and send messages
    Send {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
        /// Plain text or JSON envelopes
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{APP_NAME}={level},parley_protocol={level},tower_http={level}"
            ))
        });

        // Logs go to stderr; stdout carries messages
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(self.stderr_colors()),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn color_disabled(&self) -> bool {
        self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
    }

    fn force_color(&self) -> bool {
        matches!(self.common.color, ColorOption::Always) || env::var_os("FORCE_COLOR").is_some()
    }

    fn stderr_colors(&self) -> bool {
        !self.color_disabled() && (self.force_color() || io::stderr().is_terminal())
    }

    fn stdout_colors(&self) -> bool {
        self.config.console.color
            && !self.color_disabled()
            && (self.force_color() || io::stdout().is_terminal())
    }

    fn console(&self) -> Arc<StdioConsole> {
        Arc::new(
            StdioConsole::stdio()
                .with_colors(self.stdout_colors())
                .with_prompt(self.config.console.prompt.clone()),
        )
    }

    /// Console for user and system output, log traffic to the subscriber.
    fn console_router(&self) -> Arc<SinkRouter> {
        let console: Arc<dyn Sink> = self.console();
        let tracing: Arc<dyn Sink> = Arc::new(TracingSink::new());
        Arc::new(
            SinkRouter::builder()
                .user(console.clone())
                .system(console)
                .route(MessageType::SystemLog, tracing.clone())
                .route(MessageType::SystemDebug, tracing.clone())
                .route(MessageType::SystemTrace, tracing)
                .build(),
        )
    }

    fn error_handler(&self, router: Arc<SinkRouter>) -> BaseErrorHandler {
        BaseErrorHandler::new(
            Arc::new(SinkAskHandler::new(router)),
            self.config.ask.run_mode,
        )
        .with_max_turns(self.config.ask.max_turns)
    }

    fn settings_store(&self) -> Result<Arc<dyn SettingsStore>> {
        let path = self.paths.settings_file(&self.config)?;
        debug!("settings file: {}", path.display());
        Ok(Arc::new(FileSettingsStore::new(path)))
    }

    fn classifier(&self) -> Result<Arc<dyn DecisionClassifier>> {
        match self.config.classifier.url.as_deref() {
            Some(url) => {
                let timeout = Duration::from_secs(self.config.classifier.timeout);
                Ok(Arc::new(
                    HttpClassifier::new(url, timeout).context("building classifier client")?,
                ))
            }
            None => Ok(Arc::new(KeywordClassifier::default())),
        }
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            delimiter: self.config.pipe.delimiter.clone(),
            read_buffer: self.config.pipe.read_buffer,
            max_frame: self.config.pipe.max_frame,
            dispatch_queue: self.config.pipe.dispatch_queue,
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let bind = cmd.bind.unwrap_or_else(|| ctx.config.http.bind.clone());
    let addr: SocketAddr = bind.parse().context("invalid address")?;

    let shutdown = CancellationToken::new();
    let state = AppState::new(ctx.settings_store()?, ctx.classifier()?)
        .with_default_kind(ctx.config.http.default_transformer())
        .with_buffer(ctx.config.http.live_buffer)
        .with_max_turns(ctx.config.ask.max_turns)
        .with_pending_ttl(Duration::from_secs(ctx.config.ask.pending_ttl))
        .with_shutdown(shutdown.clone());
    let live = state.live.clone();
    let app = api::create_router(state);

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received, closing live connections...");
        shutdown.cancel();
        live.complete_all().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_say(ctx: &RuntimeContext, cmd: SayCommand) -> Result<()> {
    let mut message = OutMessage::text(cmd.content)
        .with_level(cmd.level)
        .with_status(cmd.status)
        .with_actor(cmd.actor);
    if let Some(channel) = cmd.channel {
        message = message.with_channel(channel);
    }

    match cmd.format {
        Some(format) => {
            let transformer = TransformerKind::from(format).build();
            let mut out = BytesMut::new();
            transformer.transform(&EnvelopeContext::default(), &mut out, &message)?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&out)?;
            if !out.ends_with(b"\n") {
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
            Ok(())
        }
        None => {
            ctx.console_router()
                .send(message, &CancellationToken::new())
                .await?;
            Ok(())
        }
    }
}

async fn handle_ask(ctx: &RuntimeContext, cmd: AskCommand) -> Result<()> {
    let router = ctx.console_router();
    let handler = ctx.error_handler(router.clone());
    let cancel = CancellationToken::new();

    let reply_router = router.clone();
    let question = AskUserError::new(cmd.question, move |answers| async move {
        let answer = answer_text(&answers);
        reply_router
            .send(OutMessage::text(answer), &CancellationToken::new())
            .await?;
        Ok((true, None))
    });

    match handler.handle(question.into(), &cancel).await {
        (_, None) => Ok(()),
        (_, Some(err)) => Err(anyhow!(err)),
    }
}

async fn handle_export_key(ctx: &RuntimeContext, cmd: ExportKeyCommand) -> Result<()> {
    let router = ctx.console_router();
    let handler = ctx.error_handler(router.clone());
    let cancel = CancellationToken::new();
    let export = PrivateKeyExport::new(ctx.classifier()?, ctx.settings_store()?, cmd.namespace);

    if let Err(err) = export.authorize().await
        && let (_, Some(err)) = handler.handle(err, &cancel).await
    {
        router.send(err.to_message(), &cancel).await?;
        return Err(anyhow!(err));
    }

    match export.authorize().await {
        Ok(decision) => {
            let message = OutMessage::text(format!(
                "Export allowed ({:?}): {}",
                decision.level, decision.explain
            ));
            router.send(message, &cancel).await?;
            Ok(())
        }
        Err(err) => {
            router.send(err.to_message(), &cancel).await?;
            Err(anyhow!(err))
        }
    }
}

async fn handle_pipe(ctx: &RuntimeContext, command: PipeCommand) -> Result<()> {
    let manager = ConnectionManager::new(ctx.transport_options());
    let router = ctx.console_router();
    let inbound: Arc<dyn Sink> = ctx.console();
    let bridge: Arc<dyn ConnectionHandler> = Arc::new(PipeBridge::new(router, inbound));

    match command {
        PipeCommand::Listen { socket, channel } => {
            let channel = channel.unwrap_or_else(|| ctx.config.pipe.channel.clone());
            manager.listen(&socket, &channel, bridge).await?;
            wait_for_signal().await;
            manager.stop_listening(&socket);
            manager.shutdown().await;
            Ok(())
        }
        PipeCommand::Send { socket, messages } => {
            let connection = manager
                .connect(&socket, &ctx.config.pipe.channel, bridge)
                .await?;
            for raw in messages {
                let message = match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) => OutMessage::try_from(envelope)?,
                    Err(_) => OutMessage::text(raw),
                };
                connection.send(&message.with_actor(connection.actor())).await?;
            }
            manager.shutdown().await;
            Ok(())
        }
    }
}
