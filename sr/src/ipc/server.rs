//! Control socket server
//!
//! One request per connection. Unary requests get a single frame back;
//! `start`, `watch` and `replay_open` keep the connection and stream frames
//! until their natural end or until the client hangs up.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use eventlog::Event;
use eyre::Result;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::{cleanup_socket, create_listener_at, read_request, send_frame};
use super::messages::{ControlCommand, Frame, Request};
use crate::config::ServerConfig;
use crate::error::{ReelError, ReelResult};
use crate::interaction::{CancelOutcome, InteractionOutcome, StartedInteraction};
use crate::reel::Reel;
use crate::replay::{ReplayFrame, ReplayStatus};

/// How long open connections get to flush after the reel shuts down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves once the client closes its side of the connection
type Hangup = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Accept loop over a bound control socket
pub struct Server {
    reel: Reel,
    max_request_bytes: usize,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(reel: Reel, max_request_bytes: usize, shutdown: CancellationToken) -> Self {
        Self {
            reel,
            max_request_bytes,
            shutdown,
        }
    }

    /// Serve until the shutdown token fires, then shut the reel down
    pub async fn run(&self, listener: UnixListener) -> Result<()> {
        info!("Control socket accepting connections");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let (read_half, write_half) = stream.into_split();
                        connections.spawn(handle_connection(
                            self.reel.clone(),
                            read_half,
                            write_half,
                            self.max_request_bytes,
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        self.reel.shutdown().await;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(remaining = connections.len(), "Server::run: aborting open connections");
            connections.shutdown().await;
        }
        info!("Control socket closed");
        Ok(())
    }
}

/// Bind the configured socket, serve until `shutdown`, remove the socket
pub async fn serve(reel: Reel, config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let socket_path = config.resolved_socket_path();
    let (listener, socket_path) = create_listener_at(&socket_path)?;
    info!(?socket_path, "Control socket listening");

    let server = Server::new(reel, config.max_request_bytes, shutdown);
    let result = server.run(listener).await;
    cleanup_socket(&socket_path);
    result
}

async fn handle_connection(
    reel: Reel,
    read_half: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    max_request_bytes: usize,
    shutdown: CancellationToken,
) {
    if let Err(e) = serve_connection(reel, read_half, &mut writer, max_request_bytes, shutdown).await {
        debug!(error = %e, "handle_connection: connection ended with error");
    }
}

async fn serve_connection(
    reel: Reel,
    read_half: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    max_request_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(read_half);
    let request = match read_request(&mut reader, max_request_bytes).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("serve_connection: client closed before sending a request");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "Rejected request");
            return send_frame(writer, &Frame::from(&e)).await;
        }
    };
    let mut hangup: Hangup = Box::pin(wait_for_hangup(reader));

    match request {
        Request::Start { session_id, message } => stream_start(&reel, &session_id, &message, writer, &mut hangup).await,
        Request::Watch { session_id } => stream_watch(&reel, &session_id, writer, &mut hangup).await,
        Request::ReplayOpen {
            session_id,
            rate,
            from,
            autoplay,
        } => {
            let options = OpenOptions { rate, from, autoplay };
            stream_replay(&reel, &session_id, options, writer, &mut hangup).await
        }
        other => {
            let frame = respond(&reel, other, &shutdown).await;
            send_frame(writer, &frame).await
        }
    }
}

async fn wait_for_hangup(mut reader: BufReader<OwnedReadHalf>) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            // Anything after the request line is ignored
            Ok(_) => continue,
        }
    }
}

fn error_frame(result: ReelResult<Frame>) -> Frame {
    result.unwrap_or_else(|e| Frame::from(&e))
}

/// Answer a single-frame request
async fn respond(reel: &Reel, request: Request, shutdown: &CancellationToken) -> Frame {
    match request {
        Request::Cancel { session_id } => error_frame(reel.cancel(&session_id).await.map(|outcome| match outcome {
            CancelOutcome::Cancelled { forced } => Frame::CancelAck {
                was_running: true,
                forced,
            },
            CancelOutcome::NotRunning => Frame::CancelAck {
                was_running: false,
                forced: false,
            },
        })),
        Request::History {
            session_id,
            from,
            limit,
        } => error_frame(
            reel.history(&session_id, from, limit)
                .await
                .map(|events| Frame::Events { events }),
        ),
        Request::ReplayControl { replay_id, command } => error_frame(
            control_replay(reel, &replay_id, command)
                .await
                .map(|status| Frame::ReplayStatus { status }),
        ),
        Request::ReplayClose { replay_id } => {
            // Closing an unknown or already closed replay still succeeds
            if let Ok(handle) = reel.replay(&replay_id) {
                handle.close().await;
            }
            Frame::Ack
        }
        Request::Status { session_id } => error_frame(
            reel.status(&session_id)
                .await
                .map(|snapshot| Frame::Interaction { snapshot }),
        ),
        Request::Ping => Frame::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Request::Shutdown => {
            shutdown.cancel();
            Frame::Ack
        }
        Request::Start { .. } | Request::Watch { .. } | Request::ReplayOpen { .. } => {
            Frame::from(&ReelError::BadRequest("streaming request on a unary path".to_string()))
        }
    }
}

async fn control_replay(reel: &Reel, replay_id: &str, command: ControlCommand) -> ReelResult<ReplayStatus> {
    let handle = reel.replay(replay_id)?;
    match command {
        ControlCommand::Play => handle.play().await,
        ControlCommand::Pause => handle.pause().await,
        ControlCommand::Seek { target } => handle.seek(target).await,
        ControlCommand::SetRate { rate } => handle.set_rate(rate).await,
        ControlCommand::Status => handle.status().await,
    }
}

/// Forward one live item; returns true once the stream is over
async fn forward_live(writer: &mut OwnedWriteHalf, next: ReelResult<Option<Event>>) -> Result<bool> {
    match next {
        Ok(Some(event)) => {
            let done = event.is_terminal();
            send_frame(writer, &Frame::Event { event }).await?;
            Ok(done)
        }
        Ok(None) => Ok(true),
        Err(ReelError::SubscriberOverflow) => {
            send_frame(writer, &Frame::Overflow).await?;
            Ok(true)
        }
        Err(e) => {
            send_frame(writer, &Frame::from(&e)).await?;
            Ok(true)
        }
    }
}

async fn stream_start(
    reel: &Reel,
    session_id: &str,
    message: &str,
    writer: &mut OwnedWriteHalf,
    hangup: &mut Hangup,
) -> Result<()> {
    let StartedInteraction { interaction, mut events } = match reel.start(session_id, message).await {
        Ok(started) => started,
        Err(e) => return send_frame(writer, &Frame::from(&e)).await,
    };
    info!(%session_id, interaction_id = %interaction.id(), "Streaming interaction to client");

    let outcome = interaction.wait();
    tokio::pin!(outcome);
    let mut outcome_seen = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut *hangup => {
                debug!(%session_id, "stream_start: client hung up, interaction continues");
                return Ok(());
            }
            next = events.recv() => {
                if forward_live(writer, next).await? {
                    return Ok(());
                }
            }
            finished = &mut outcome, if !outcome_seen => {
                outcome_seen = true;
                // No terminal event reached the log, so none will be broadcast
                if let InteractionOutcome::Failed { logged: false, reason } = finished {
                    while let Ok(Some(event)) = events.try_recv() {
                        send_frame(writer, &Frame::Event { event }).await?;
                    }
                    return send_frame(writer, &Frame::from(&ReelError::LogUnavailable(reason))).await;
                }
            }
        }
    }
}

async fn stream_watch(reel: &Reel, session_id: &str, writer: &mut OwnedWriteHalf, hangup: &mut Hangup) -> Result<()> {
    let mut events = match reel.watch(session_id).await {
        Ok(subscription) => subscription,
        Err(e) => return send_frame(writer, &Frame::from(&e)).await,
    };
    send_frame(writer, &Frame::Ack).await?;
    debug!(%session_id, "stream_watch: watching");

    loop {
        tokio::select! {
            biased;
            _ = &mut *hangup => return Ok(()),
            next = events.recv() => {
                if forward_live(writer, next).await? {
                    return Ok(());
                }
            }
        }
    }
}

struct OpenOptions {
    rate: Option<f64>,
    from: Option<i64>,
    autoplay: bool,
}

async fn stream_replay(
    reel: &Reel,
    session_id: &str,
    options: OpenOptions,
    writer: &mut OwnedWriteHalf,
    hangup: &mut Hangup,
) -> Result<()> {
    let (handle, mut frames) = match reel.open_replay(session_id).await {
        Ok(opened) => opened,
        Err(e) => return send_frame(writer, &Frame::from(&e)).await,
    };

    let setup = async {
        if let Some(rate) = options.rate {
            handle.set_rate(rate).await?;
        }
        if let Some(from) = options.from {
            handle.seek(from).await?;
        }
        if options.autoplay {
            handle.play().await
        } else {
            handle.status().await
        }
    }
    .await;
    let status = match setup {
        Ok(status) => status,
        Err(e) => {
            handle.close().await;
            return send_frame(writer, &Frame::from(&e)).await;
        }
    };
    send_frame(writer, &Frame::ReplayOpened { status }).await?;

    loop {
        tokio::select! {
            biased;
            _ = &mut *hangup => {
                debug!(replay_id = %handle.replay_id(), "stream_replay: client hung up");
                handle.close().await;
                return Ok(());
            }
            frame = frames.next_frame() => match frame {
                Some(ReplayFrame::Event(event)) => send_frame(writer, &Frame::Event { event }).await?,
                Some(ReplayFrame::Finished(status)) => {
                    send_frame(writer, &Frame::Finished { status }).await?;
                    handle.close().await;
                    return Ok(());
                }
                // A replay closed elsewhere still yields `Finished` first
                None => return Ok(()),
            },
        }
    }
}
