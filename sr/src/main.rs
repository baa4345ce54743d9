//! SessionReel - session event streaming and replay
//!
//! CLI entry point: runs the daemon (`sr serve`) or talks to it over the
//! control socket.

use std::fs;
use std::io::Write;

use clap::Parser;
use colored::Colorize;
use eventlog::{Event, Payload};
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sessionreel::cli::{Cli, Command, get_log_path};
use sessionreel::config::Config;
use sessionreel::interaction::{CancelOutcome, InteractionStatus};
use sessionreel::ipc::{self, DaemonClient, Frame, FrameStream, ReplayOptions};
use sessionreel::reel::Reel;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.server.socket_path = Some(socket);
    }
    config.validate()?;

    let client = DaemonClient::with_socket_path(config.server.resolved_socket_path());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Send { session, message } => cmd_send(&client, &session, &message).await,
        Command::Cancel { session } => cmd_cancel(&client, &session).await,
        Command::Watch { session } => cmd_watch(&client, &session).await,
        Command::History { session, from, limit } => cmd_history(&client, &session, from, limit).await,
        Command::Replay { session, rate, from } => cmd_replay(&client, &session, rate, from).await,
        Command::Status { session } => cmd_status(&client, &session).await,
        Command::Ping => cmd_ping(&client).await,
        Command::Stop => cmd_stop(&client).await,
    }
}

async fn cmd_serve(config: Config) -> Result<()> {
    debug!("cmd_serve: called");
    let reel = Reel::from_config(&config)?;
    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            on_signal.cancel();
        }
    });

    println!(
        "{} listening on {}",
        "SessionReel".green().bold(),
        config.server.resolved_socket_path().display()
    );
    ipc::serve(reel, &config.server, shutdown).await?;
    println!("SessionReel stopped");
    Ok(())
}

fn not_running_hint(client: &DaemonClient) -> Result<()> {
    if !client.socket_exists() {
        return Err(eyre::eyre!("Daemon is not running (start it with `sr serve`)"));
    }
    Ok(())
}

async fn cmd_send(client: &DaemonClient, session: &str, message: &str) -> Result<()> {
    not_running_hint(client)?;
    let stream = client.start(session, message).await?;
    print_stream(stream).await
}

async fn cmd_watch(client: &DaemonClient, session: &str) -> Result<()> {
    not_running_hint(client)?;
    let stream = client.watch(session).await?;
    println!("{}", format!("Watching {}...", session).dimmed());
    print_stream(stream).await
}

async fn cmd_cancel(client: &DaemonClient, session: &str) -> Result<()> {
    not_running_hint(client)?;
    match client.cancel(session).await? {
        CancelOutcome::Cancelled { forced: false } => println!("{}", "Cancelled".yellow()),
        CancelOutcome::Cancelled { forced: true } => {
            println!("{}", "Cancelled (forced after grace period)".yellow())
        }
        CancelOutcome::NotRunning => println!("Nothing running for {}", session),
    }
    Ok(())
}

async fn cmd_history(client: &DaemonClient, session: &str, from: u64, limit: Option<usize>) -> Result<()> {
    not_running_hint(client)?;
    let events = client.history(session, from, limit).await?;
    if events.is_empty() {
        println!("No events");
        return Ok(());
    }
    for event in &events {
        println!("{}", describe(event));
    }
    Ok(())
}

async fn cmd_replay(client: &DaemonClient, session: &str, rate: Option<f64>, from: Option<i64>) -> Result<()> {
    not_running_hint(client)?;
    let options = ReplayOptions {
        rate,
        from,
        autoplay: true,
    };
    let (status, stream) = client.replay_open(session, options).await?;
    println!(
        "{}",
        format!("Replay {} from #{} at {}x", status.replay_id, status.cursor, status.rate).dimmed()
    );
    print_stream(stream).await
}

async fn cmd_status(client: &DaemonClient, session: &str) -> Result<()> {
    not_running_hint(client)?;
    match client.status(session).await? {
        Some(snapshot) => {
            let status = match snapshot.status {
                InteractionStatus::Running => "running".green(),
                InteractionStatus::Completed => "completed".normal(),
                InteractionStatus::Cancelled => "cancelled".yellow(),
                InteractionStatus::Failed => "failed".red(),
            };
            println!("Interaction: {}", snapshot.id);
            println!("Status:      {}", status);
            println!("Started:     {}", snapshot.started_at.to_rfc3339());
            if let Some(finished) = snapshot.finished_at {
                println!("Finished:    {}", finished.to_rfc3339());
            }
        }
        None => println!("No interactions for {}", session),
    }
    Ok(())
}

async fn cmd_ping(client: &DaemonClient) -> Result<()> {
    debug!("cmd_ping: called");
    if !client.socket_exists() {
        println!("SessionReel is not running");
        return Ok(());
    }
    match client.ping().await {
        Ok(version) => {
            println!("Daemon is alive and responsive");
            println!("Version: {}", version);
        }
        Err(e) => {
            println!("Socket exists but daemon is not responding");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_stop(client: &DaemonClient) -> Result<()> {
    debug!("cmd_stop: called");
    if !client.socket_exists() {
        println!("SessionReel is not running");
        return Ok(());
    }
    client.shutdown().await?;
    println!("SessionReel stopping");
    Ok(())
}

/// Print frames until the stream ends; text deltas stream inline
async fn print_stream(mut stream: FrameStream) -> Result<()> {
    let mut inline = false;
    while let Some(frame) = stream.next_frame().await? {
        match frame {
            Frame::Event { event } => {
                if let Payload::TextDelta(delta) = &event.payload {
                    print!("{}", delta.text);
                    std::io::stdout().flush().context("Failed to flush stdout")?;
                    inline = true;
                    continue;
                }
                if inline {
                    println!();
                    inline = false;
                }
                println!("{}", describe(&event));
            }
            Frame::Finished { status } => {
                if inline {
                    println!();
                }
                println!("{}", format!("Replay finished at #{}", status.cursor).dimmed());
                return Ok(());
            }
            Frame::Overflow => {
                if inline {
                    println!();
                }
                println!("{}", "Fell behind the live stream; reconnect with `sr history`".red());
                return Ok(());
            }
            other => debug!(?other, "print_stream: ignoring frame"),
        }
    }
    if inline {
        println!();
    }
    Ok(())
}

/// One-line rendering of an event
fn describe(event: &Event) -> String {
    let seq = format!("#{:<4}", event.sequence).dimmed();
    let body = match &event.payload {
        Payload::TextDelta(delta) => delta.text.clone(),
        Payload::ToolCall(call) => format!("{} {}({})", "tool".cyan(), call.name, call.arguments),
        Payload::ToolResult(result) if result.is_error => format!("{} {}", "tool error".red(), result.output),
        Payload::ToolResult(result) => format!("{} {}", "tool result".cyan(), result.output),
        Payload::SystemMessage(msg) => format!("{} {}", "system".magenta(), msg.text),
        Payload::Completion(done) => format!("{} ({})", "completed".green(), done.stop_reason),
        Payload::Cancelled(cancelled) if cancelled.forced => {
            format!("{} {} (forced)", "cancelled".yellow(), cancelled.reason)
        }
        Payload::Cancelled(cancelled) => format!("{} {}", "cancelled".yellow(), cancelled.reason),
        Payload::Error(err) => format!("{} {}", "error".red(), err.message),
    };
    format!("{} {}", seq, body)
}

