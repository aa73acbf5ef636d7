//! Per-connection SMTP server session.
//!
//! Synthesizes the same lifecycle as the milter engine (connect,
//! helo, envfrom, envrcpt, header, eoh, body, eom) against the same
//! pipeline, so the two front-ends are observably equivalent in
//! handler order and emitted fragments.

use std::{net::IpAddr, sync::Arc, time::Duration};

use attest_common::{
    authres,
    context::{Context, Disposition},
    error::SessionError,
    incoming, internal, outgoing,
};
use attest_handlers::{Event, Pipeline};
use attest_metrics::{MetricsRegistry, CONNECTIONS_TOTAL, MESSAGES_TOTAL};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::{
    client,
    command::{envelope_address, Command},
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    /// Relay target; `None` stamps without forwarding (used by tests
    /// and dry runs).
    pub upstream: Option<String>,
    pub command_timeout: Duration,
    pub message_timeout: Duration,
    pub max_messages: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionOutcome {
    pub messages: u64,
    pub exit_on_close: bool,
    pub exit_on_close_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Greeted,
    HasMail,
    HasRcpt,
}

pub struct Session<Stream> {
    reader: BufReader<ReadHalf<Stream>>,
    writer: WriteHalf<Stream>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
    config: SessionConfig,
    state: State,
    ctx: Context,
    messages: u64,
}

impl<Stream: AsyncRead + AsyncWrite + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: Option<IpAddr>,
        pipeline: Arc<Pipeline>,
        metrics: Arc<MetricsRegistry>,
        config: SessionConfig,
    ) -> Self {
        metrics.counter(CONNECTIONS_TOTAL).incr();

        let (read_half, writer) = tokio::io::split(stream);
        let mut ctx = Context::new();
        ctx.client_ip = peer;

        Self {
            reader: BufReader::new(read_half),
            writer,
            pipeline,
            metrics,
            config,
            state: State::Start,
            ctx,
            messages: 0,
        }
    }

    fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            messages: self.messages,
            exit_on_close: self.ctx.exit_on_close,
            exit_on_close_error: self.ctx.exit_on_close_error,
        }
    }

    async fn reply(&mut self, line: &str) -> Result<(), SessionError> {
        outgoing!("{line}");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut line = Vec::new();
        let read = tokio::time::timeout(
            self.config.command_timeout,
            self.reader.read_until(b'\n', &mut line),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.config.command_timeout.as_secs()))??;

        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Serve the connection to completion.
    pub async fn run(mut self) -> Result<SessionOutcome, SessionError> {
        internal!("SMTP connection opened");

        self.pipeline.dispatch(&mut self.ctx, Event::Connect).await;

        let banner = format!("220 {} ESMTP attest", self.config.hostname);
        self.reply(&banner).await?;

        loop {
            let Some(line) = self.read_line().await? else {
                self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                internal!("SMTP connection closed by peer");
                return Ok(self.outcome());
            };

            let command = Command::parse(&String::from_utf8_lossy(&line));
            incoming!("{command}");

            match command {
                Command::Helo(name) | Command::Ehlo(name) if name.is_empty() => {
                    self.reply("501 5.5.4 Syntax: HELO hostname").await?;
                }

                Command::Helo(name) => {
                    self.ctx.helo_name = Some(name.clone());
                    self.pipeline
                        .dispatch(&mut self.ctx, Event::Helo(&name))
                        .await;
                    let reply = format!("250 {} says hello to {name}", self.config.hostname);
                    self.reply(&reply).await?;
                    self.state = State::Greeted;
                }

                Command::Ehlo(name) => {
                    self.ctx.helo_name = Some(name.clone());
                    self.pipeline
                        .dispatch(&mut self.ctx, Event::Helo(&name))
                        .await;
                    let reply =
                        format!("250-{} says hello to {name}\r\n250 8BITMIME", self.config.hostname);
                    self.reply(&reply).await?;
                    self.state = State::Greeted;
                }

                Command::MailFrom(argument) => {
                    if self.state != State::Greeted {
                        self.reply("503 5.5.1 Error: send HELO/EHLO first").await?;
                        continue;
                    }
                    let from = envelope_address(&argument);
                    self.ctx.envelope_from = Some(from.clone());
                    self.pipeline
                        .dispatch(&mut self.ctx, Event::EnvFrom(&from))
                        .await;
                    self.reply("250 2.1.0 Ok").await?;
                    self.state = State::HasMail;
                }

                Command::RcptTo(argument) => {
                    if !matches!(self.state, State::HasMail | State::HasRcpt) {
                        self.reply("503 5.5.1 Error: need MAIL command").await?;
                        continue;
                    }
                    let rcpt = envelope_address(&argument);
                    self.ctx.envelope_rcpt.push(rcpt.clone());
                    self.pipeline
                        .dispatch(&mut self.ctx, Event::EnvRcpt(&rcpt))
                        .await;
                    self.reply("250 2.1.5 Ok").await?;
                    self.state = State::HasRcpt;
                }

                Command::Data => {
                    if self.state != State::HasRcpt {
                        self.reply("503 5.5.1 Error: need RCPT command").await?;
                        continue;
                    }
                    self.reply("354 End data with <CR><LF>.<CR><LF>").await?;

                    let message = self.read_data().await?;
                    self.process_message(&message).await?;

                    self.state = State::Greeted;

                    if let Some(budget) = self.config.max_messages {
                        if self.messages >= budget {
                            internal!(
                                level = DEBUG,
                                "Message budget spent after {} message(s), closing connection",
                                self.messages
                            );
                            self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                            return Ok(self.outcome());
                        }
                    }
                }

                Command::Rset => {
                    self.pipeline.dispatch(&mut self.ctx, Event::Abort).await;
                    self.ctx.reset_message(true);
                    if self.state != State::Start {
                        self.state = State::Greeted;
                    }
                    self.reply("250 2.0.0 Ok").await?;
                }

                Command::Noop => {
                    self.reply("250 2.0.0 Ok").await?;
                }

                Command::Quit => {
                    let goodbye = format!("221 {} Bye", self.config.hostname);
                    self.reply(&goodbye).await?;
                    self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                    internal!("SMTP connection closed");
                    return Ok(self.outcome());
                }

                Command::Unknown(line) => {
                    internal!(level = DEBUG, "Unrecognized command: {line}");
                    self.reply("500 5.5.2 Error: command not recognized").await?;
                }
            }
        }
    }

    /// Buffer the DATA phase until the lone-dot terminator,
    /// un-stuffing doubled leading dots.
    async fn read_data(&mut self) -> Result<Vec<u8>, SessionError> {
        let started = std::time::Instant::now();
        let mut message = Vec::new();

        loop {
            if started.elapsed() > self.config.message_timeout {
                return Err(SessionError::Timeout(self.config.message_timeout.as_secs()));
            }

            let Some(line) = self.read_line().await? else {
                return Err(SessionError::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                )));
            };

            if line == b".\r\n" || line == b".\n" {
                return Ok(message);
            }

            if line.starts_with(b"..") {
                message.extend_from_slice(&line[1..]);
            } else {
                message.extend_from_slice(&line);
            }
        }
    }

    /// Synthesize the header/eoh/body/eom stages for a buffered
    /// message, then reply with the accumulated disposition and relay
    /// the stamped message upstream.
    async fn process_message(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.ctx.message = message.to_vec();

        let (headers, body) = split_message(message);
        for (name, value) in &headers {
            self.pipeline
                .dispatch(&mut self.ctx, Event::Header(name, value))
                .await;
        }
        self.pipeline.dispatch(&mut self.ctx, Event::Eoh).await;
        if !body.is_empty() {
            self.pipeline
                .dispatch(&mut self.ctx, Event::Body(body))
                .await;
        }
        self.pipeline.dispatch(&mut self.ctx, Event::Eom).await;

        self.messages += 1;
        self.metrics.counter(MESSAGES_TOTAL).incr();

        let reason = self.ctx.reject_reason().unwrap_or("policy").to_string();
        let disposition = self.ctx.disposition();

        match disposition {
            Disposition::Reject => {
                self.ctx.reset_message(false);
                let reply = format!("550 5.7.1 {reason}");
                return self.reply(&reply).await;
            }
            Disposition::Tempfail => {
                self.ctx.reset_message(false);
                let reply = format!("451 4.7.1 {reason}");
                return self.reply(&reply).await;
            }
            Disposition::Discard => {
                self.ctx.reset_message(false);
                // Accepted and dropped on the floor, as the MTA would.
                let reply = format!("250 2.0.0 Ok: queued as {}", self.messages);
                return self.reply(&reply).await;
            }
            Disposition::Continue | Disposition::Accept | Disposition::Quarantine => {}
        }

        let stamped = self.stamped_message(message);
        let mail_from = self.ctx.envelope_from.clone().unwrap_or_default();
        let rcpts = self.ctx.envelope_rcpt.clone();
        self.ctx.reset_message(false);

        if let Some(upstream) = self.config.upstream.clone() {
            let forwarded = client::relay(
                &upstream,
                &self.config.hostname,
                &mail_from,
                &rcpts,
                &stamped,
                self.config.command_timeout,
            )
            .await;

            if let Err(err) = forwarded {
                internal!(level = ERROR, "Relay to {upstream} failed: {err}");
                return self.reply("451 4.4.1 Upstream unavailable").await;
            }
        }

        let reply = format!("250 2.0.0 Ok: queued as {}", self.messages);
        self.reply(&reply).await
    }

    /// The forwarded message: `Authentication-Results` first, then the
    /// auxiliary headers, then the message as received.
    fn stamped_message(&self, message: &[u8]) -> Vec<u8> {
        let header = authres::assemble(&self.config.hostname, self.ctx.fragments());

        let mut out = Vec::with_capacity(message.len() + header.len() + 64);
        out.extend_from_slice(b"Authentication-Results: ");
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");

        for aux in self.ctx.aux_headers() {
            out.extend_from_slice(aux.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(aux.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(message);
        out
    }
}

/// Split a raw message into unfolded `(name, value)` headers and the
/// body. Continuation lines keep their leading whitespace, joined by
/// a bare newline the way the milter engine delivers them.
fn split_message(message: &[u8]) -> (Vec<(String, String)>, &[u8]) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    for line in message.split_inclusive(|&byte| byte == b'\n') {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            offset += line.len();
            break;
        }

        if trimmed.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push('\n');
                value.push_str(trimmed);
            }
        } else if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim_start().to_string()));
        }

        offset += line.len();
    }

    (headers, &message[offset.min(message.len())..])
}
