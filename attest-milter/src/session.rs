//! Per-connection milter engine.
//!
//! Drives the connection FSM, dispatches pipeline stages for each wire
//! command, and answers the MTA with the accumulated disposition at
//! end-of-message. Protocol errors close this connection only; the
//! worker and its sibling connections stay untainted.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use attest_common::{
    authres,
    context::{Context, Disposition},
    error::{ProtocolError, SessionError},
    incoming, internal,
};
use attest_handlers::{Event, Pipeline};
use attest_metrics::{MetricsRegistry, CONNECTIONS_TOTAL, MESSAGES_TOTAL};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, Frame};

/// Connection FSM states, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Idle,
    Negotiated,
    Connected,
    HeloSeen,
    EnvFromSeen,
    EnvRcptSeen,
    HeadersStreaming,
    Eoh,
    BodyStreaming,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server-id of the assembled `Authentication-Results` header.
    pub hostname: String,
    pub command_timeout: Duration,
    pub message_timeout: Duration,
    /// Remaining per-worker message budget; the connection closes once
    /// it is spent so the worker can exit exactly on its N-th message.
    pub max_messages: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionOutcome {
    pub messages: u64,
    pub exit_on_close: bool,
    pub exit_on_close_error: bool,
}

pub struct Session<Stream> {
    stream: Stream,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
    config: SessionConfig,
    state: State,
    ctx: Context,
    messages: u64,
    message_started: Option<Instant>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        pipeline: Arc<Pipeline>,
        metrics: Arc<MetricsRegistry>,
        config: SessionConfig,
    ) -> Self {
        metrics.counter(CONNECTIONS_TOTAL).incr();

        Self {
            stream,
            pipeline,
            metrics,
            config,
            state: State::Idle,
            ctx: Context::new(),
            messages: 0,
            message_started: None,
        }
    }

    fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            messages: self.messages,
            exit_on_close: self.ctx.exit_on_close,
            exit_on_close_error: self.ctx.exit_on_close_error,
        }
    }

    /// Serve the connection to completion.
    pub async fn run(mut self) -> Result<SessionOutcome, SessionError> {
        internal!("Milter connection opened");

        let mut read_buf = [0u8; 4096];
        let mut buffer = Vec::new();

        loop {
            loop {
                let frame = match codec::parse_frame(&mut buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        internal!(level = WARN, "Protocol error: {err}");
                        return Err(err.into());
                    }
                };

                match self.handle_frame(frame).await? {
                    Flow::Continue => {}
                    Flow::Close => {
                        self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                        internal!("Milter connection closed");
                        return Ok(self.outcome());
                    }
                }
            }

            if let Some(started) = self.message_started {
                if started.elapsed() > self.config.message_timeout {
                    return Err(SessionError::Timeout(self.config.message_timeout.as_secs()));
                }
            }

            let read = tokio::time::timeout(
                self.config.command_timeout,
                self.stream.read(&mut read_buf),
            )
            .await
            .map_err(|_| SessionError::Timeout(self.config.command_timeout.as_secs()))??;

            if read == 0 {
                // The MTA went away without QUIT.
                self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                internal!("Milter connection closed by peer");
                return Ok(self.outcome());
            }

            buffer.extend_from_slice(&read_buf[..read]);
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.stream.write_all(frame).await?;
        Ok(())
    }

    async fn respond_continue(&mut self) -> Result<(), SessionError> {
        self.send(&codec::encode_frame(codec::SMFIR_CONTINUE, &[]))
            .await
    }

    fn expect(&self, command: u8, allowed: &[State]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedCommand {
                command: command as char,
                state: self.state.to_string(),
            }
            .into())
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        use State::{
            BodyStreaming, Connected, EnvFromSeen, EnvRcptSeen, Eoh, HeadersStreaming, HeloSeen,
            Idle, Negotiated,
        };

        incoming!("Milter command {:?}", frame.command as char);

        match frame.command {
            codec::SMFIC_OPTNEG => {
                self.expect(frame.command, &[Idle])?;
                let (version, actions, steps) = codec::parse_optneg(&frame.payload)?;
                internal!(
                    level = DEBUG,
                    "Negotiated: MTA version {version}, actions {actions:#x}, steps {steps:#x}"
                );
                let reply = codec::encode_optneg();
                self.send(&reply).await?;
                self.state = Negotiated;
            }

            codec::SMFIC_MACRO => {
                // Macros may arrive at any point after negotiation.
                self.expect(frame.command, &[
                    Negotiated,
                    Connected,
                    HeloSeen,
                    EnvFromSeen,
                    EnvRcptSeen,
                    HeadersStreaming,
                    Eoh,
                    BodyStreaming,
                ])?;
                let (_, macros) = codec::parse_macros(&frame.payload)?;
                for (name, value) in macros {
                    match name.as_str() {
                        "i" => self.ctx.queue_id = Some(value),
                        "{auth_authen}" => self.ctx.is_authenticated = !value.is_empty(),
                        _ => {}
                    }
                }
            }

            codec::SMFIC_CONNECT => {
                self.expect(frame.command, &[Negotiated])?;
                let (hostname, address) = codec::parse_connect(&frame.payload)?;

                self.ctx.client_ip = address.as_deref().and_then(|addr| addr.parse().ok());
                if !hostname.is_empty() && !hostname.starts_with('[') {
                    self.ctx.client_rdns = Some(hostname);
                }

                self.pipeline.dispatch(&mut self.ctx, Event::Connect).await;
                self.respond_continue().await?;
                self.state = Connected;
            }

            codec::SMFIC_HELO => {
                self.expect(frame.command, &[Connected, HeloSeen])?;
                let helo = codec::parse_envelope(&frame.payload)?;

                self.ctx.helo_name = Some(helo.clone());
                self.pipeline
                    .dispatch(&mut self.ctx, Event::Helo(&helo))
                    .await;
                self.respond_continue().await?;
                self.state = HeloSeen;
            }

            codec::SMFIC_MAIL => {
                self.expect(frame.command, &[Connected, HeloSeen])?;
                let from = codec::parse_envelope(&frame.payload)?;

                self.message_started = Some(Instant::now());
                self.ctx.envelope_from = Some(from.clone());
                self.pipeline
                    .dispatch(&mut self.ctx, Event::EnvFrom(&from))
                    .await;
                self.respond_continue().await?;
                self.state = EnvFromSeen;
            }

            codec::SMFIC_RCPT => {
                self.expect(frame.command, &[EnvFromSeen, EnvRcptSeen])?;
                let rcpt = codec::parse_envelope(&frame.payload)?;

                self.ctx.envelope_rcpt.push(rcpt.clone());
                self.pipeline
                    .dispatch(&mut self.ctx, Event::EnvRcpt(&rcpt))
                    .await;
                self.respond_continue().await?;
                self.state = EnvRcptSeen;
            }

            codec::SMFIC_DATA => {
                self.expect(frame.command, &[EnvRcptSeen])?;
                self.respond_continue().await?;
            }

            codec::SMFIC_HEADER => {
                self.expect(frame.command, &[EnvRcptSeen, HeadersStreaming])?;
                let (name, value) = codec::parse_header(&frame.payload)?;

                self.ctx.message.extend_from_slice(name.as_bytes());
                self.ctx.message.extend_from_slice(b": ");
                self.ctx.message.extend_from_slice(value.as_bytes());
                self.ctx.message.extend_from_slice(b"\r\n");

                self.pipeline
                    .dispatch(&mut self.ctx, Event::Header(&name, &value))
                    .await;
                self.respond_continue().await?;
                self.state = HeadersStreaming;
            }

            codec::SMFIC_EOH => {
                self.expect(frame.command, &[EnvRcptSeen, HeadersStreaming])?;
                self.ctx.message.extend_from_slice(b"\r\n");
                self.pipeline.dispatch(&mut self.ctx, Event::Eoh).await;
                self.respond_continue().await?;
                self.state = Eoh;
            }

            codec::SMFIC_BODY => {
                self.expect(frame.command, &[Eoh, BodyStreaming])?;
                self.ctx.message.extend_from_slice(&frame.payload);
                self.pipeline
                    .dispatch(&mut self.ctx, Event::Body(&frame.payload))
                    .await;
                self.respond_continue().await?;
                self.state = BodyStreaming;
            }

            codec::SMFIC_BODYEOB => {
                self.expect(frame.command, &[Eoh, BodyStreaming])?;
                self.finalize_message().await?;
                self.state = Connected;

                if let Some(budget) = self.config.max_messages {
                    if self.messages >= budget {
                        internal!(
                            level = DEBUG,
                            "Message budget spent after {} message(s), closing connection",
                            self.messages
                        );
                        return Ok(Flow::Close);
                    }
                }
            }

            codec::SMFIC_ABORT => {
                if self.state >= EnvFromSeen {
                    self.pipeline.dispatch(&mut self.ctx, Event::Abort).await;
                    self.ctx.reset_message(true);
                    self.message_started = None;
                }
                if self.state >= Connected {
                    self.state = Connected;
                }
            }

            codec::SMFIC_QUIT => {
                return Ok(Flow::Close);
            }

            codec::SMFIC_QUIT_NC => {
                // Connection reused for another MTA client; negotiation
                // stands, everything else starts over.
                self.pipeline.dispatch(&mut self.ctx, Event::Close).await;
                self.ctx = Context::new();
                self.message_started = None;
                self.state = Negotiated;
            }

            unknown => {
                return Err(ProtocolError::UnexpectedCommand {
                    command: unknown as char,
                    state: self.state.to_string(),
                }
                .into());
            }
        }

        Ok(Flow::Continue)
    }

    /// End-of-message: run the eom stage, insert the synthesized
    /// headers (`Authentication-Results` first, auxiliaries after),
    /// then answer with the accumulated disposition.
    async fn finalize_message(&mut self) -> Result<(), SessionError> {
        self.pipeline.dispatch(&mut self.ctx, Event::Eom).await;

        let header = authres::assemble(&self.config.hostname, self.ctx.fragments());
        self.send(&codec::encode_insert_header(0, "Authentication-Results", &header))
            .await?;

        let aux: Vec<_> = self
            .ctx
            .aux_headers()
            .iter()
            .map(|header| (header.name.clone(), header.value.clone()))
            .collect();
        for (idx, (name, value)) in aux.iter().enumerate() {
            let index = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            self.send(&codec::encode_insert_header(index, name, value))
                .await?;
        }

        let reason = self.ctx.reject_reason().unwrap_or("policy").to_string();
        match self.ctx.disposition() {
            Disposition::Continue => self.respond_continue().await?,
            Disposition::Accept => {
                self.send(&codec::encode_frame(codec::SMFIR_ACCEPT, &[]))
                    .await?;
            }
            Disposition::Quarantine => {
                self.send(&codec::encode_quarantine(&reason)).await?;
                self.respond_continue().await?;
            }
            Disposition::Tempfail => {
                self.send(&codec::encode_replycode(&format!("451 4.7.1 {reason}")))
                    .await?;
            }
            Disposition::Discard => {
                self.send(&codec::encode_frame(codec::SMFIR_DISCARD, &[]))
                    .await?;
            }
            Disposition::Reject => {
                self.send(&codec::encode_replycode(&format!("550 5.7.1 {reason}")))
                    .await?;
            }
        }

        self.messages += 1;
        self.metrics.counter(MESSAGES_TOTAL).incr();
        self.message_started = None;
        self.ctx.reset_message(false);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use attest_common::context::AuthFragment;
    use attest_handlers::{Handler, HandlerResult, Stage};
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    use super::*;

    /// Emits one fragment per message plus an auxiliary header,
    /// mimicking the iprev/ptr pair.
    struct Stamp;

    #[async_trait]
    impl Handler for Stamp {
        fn name(&self) -> &'static str {
            "stamp"
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }

        async fn eom(&self, ctx: &mut Context) -> HandlerResult {
            ctx.add_auth_fragment(
                AuthFragment::new("stamp", "pass")
                    .with_property("smtp.mailfrom", ctx.envelope_from.clone().unwrap_or_default()),
            );
            ctx.add_aux_header("X-Stamp", "present");
            Ok(())
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Handler for Rejecting {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }

        async fn eom(&self, ctx: &mut Context) -> HandlerResult {
            ctx.set_reject("go away");
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            hostname: "gw.example.net".to_string(),
            command_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(30),
            max_messages: None,
        }
    }

    fn pipeline(handlers: Vec<Arc<dyn Handler>>) -> Arc<Pipeline> {
        Arc::new(Pipeline::build(handlers, Arc::new(MetricsRegistry::new())).unwrap())
    }

    fn connect_payload() -> Vec<u8> {
        let mut payload = b"client.example.com\0".to_vec();
        payload.push(b'4');
        payload.extend_from_slice(&2525u16.to_be_bytes());
        payload.extend_from_slice(b"198.51.100.7\0");
        payload
    }

    async fn drive(
        frames: Vec<Vec<u8>>,
        handlers: Vec<Arc<dyn Handler>>,
        session_config: SessionConfig,
    ) -> (Vec<Frame>, SessionOutcome) {
        let (mta, filter) = duplex(1 << 16);
        let session = Session::new(
            filter,
            pipeline(handlers),
            Arc::new(MetricsRegistry::new()),
            session_config,
        );
        let task = tokio::spawn(session.run());

        let (mut rx, mut tx) = tokio::io::split(mta);
        for frame in frames {
            tx.write_all(&frame).await.unwrap();
        }
        drop(tx);

        let mut responses = Vec::new();
        let mut buffer = Vec::new();
        let mut read_buf = [0u8; 4096];
        loop {
            let Ok(read) = rx.read(&mut read_buf).await else {
                break;
            };
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&read_buf[..read]);
            while let Some(frame) = codec::parse_frame(&mut buffer).unwrap() {
                responses.push(frame);
            }
        }

        let outcome = task.await.unwrap().unwrap();
        (responses, outcome)
    }

    fn full_message_frames() -> Vec<Vec<u8>> {
        vec![
            codec::encode_optneg(),
            codec::encode_frame(codec::SMFIC_MACRO, b"Mi\x004Zw1Kd\0"),
            codec::encode_frame(codec::SMFIC_CONNECT, &connect_payload()),
            codec::encode_frame(codec::SMFIC_HELO, b"mx.example.com\0"),
            codec::encode_frame(codec::SMFIC_MAIL, b"<bob@example.com>\0"),
            codec::encode_frame(codec::SMFIC_RCPT, b"<alice@example.org>\0"),
            codec::encode_frame(codec::SMFIC_HEADER, b"Subject\0hello\0"),
            codec::encode_frame(codec::SMFIC_EOH, b""),
            codec::encode_frame(codec::SMFIC_BODY, b"Hi!\r\n"),
            codec::encode_frame(codec::SMFIC_BODYEOB, b""),
            codec::encode_frame(codec::SMFIC_QUIT, b""),
        ]
    }

    #[tokio::test]
    async fn full_conversation_inserts_results_then_aux() {
        let (responses, outcome) =
            drive(full_message_frames(), vec![Arc::new(Stamp)], config()).await;

        // optneg + 7 continues + 2 insheaders + final continue.
        assert_eq!(responses[0].command, codec::SMFIC_OPTNEG);

        let inserted: Vec<_> = responses
            .iter()
            .filter(|frame| frame.command == codec::SMFIR_INSHEADER)
            .collect();
        assert_eq!(inserted.len(), 2);

        // Authentication-Results is emitted exactly once, at index 0,
        // before any auxiliary headers.
        assert_eq!(&inserted[0].payload[..4], &[0, 0, 0, 0]);
        let text = String::from_utf8_lossy(&inserted[0].payload[4..]);
        assert_eq!(
            text,
            "Authentication-Results\0gw.example.net; stamp=pass smtp.mailfrom=<bob@example.com>\0"
        );

        assert_eq!(&inserted[1].payload[..4], &[0, 0, 0, 1]);
        assert!(String::from_utf8_lossy(&inserted[1].payload[4..]).starts_with("X-Stamp\0"));

        // The final action for a clean message is continue.
        assert_eq!(responses.last().unwrap().command, codec::SMFIR_CONTINUE);
        assert_eq!(outcome.messages, 1);
    }

    #[tokio::test]
    async fn reject_disposition_answers_replycode() {
        let (responses, _) =
            drive(full_message_frames(), vec![Arc::new(Rejecting)], config()).await;

        let reply = responses
            .iter()
            .find(|frame| frame.command == codec::SMFIR_REPLYCODE)
            .expect("a replycode response");
        assert_eq!(
            String::from_utf8_lossy(&reply.payload),
            "550 5.7.1 go away\0"
        );
    }

    #[tokio::test]
    async fn unexpected_command_is_a_protocol_error() {
        let frames = vec![
            codec::encode_optneg(),
            // BODY before any message is underway.
            codec::encode_frame(codec::SMFIC_BODY, b"bytes"),
        ];

        let (mta, filter) = duplex(1 << 16);
        let session = Session::new(
            filter,
            pipeline(vec![Arc::new(Stamp)]),
            Arc::new(MetricsRegistry::new()),
            config(),
        );
        let task = tokio::spawn(session.run());

        let (_rx, mut tx) = tokio::io::split(mta);
        for frame in frames {
            tx.write_all(&frame).await.unwrap();
        }

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn abort_discards_and_allows_a_fresh_message() {
        let mut frames = vec![
            codec::encode_optneg(),
            codec::encode_frame(codec::SMFIC_CONNECT, &connect_payload()),
            codec::encode_frame(codec::SMFIC_HELO, b"mx.example.com\0"),
            codec::encode_frame(codec::SMFIC_MAIL, b"<bob@example.com>\0"),
            codec::encode_frame(codec::SMFIC_RCPT, b"<alice@example.org>\0"),
            codec::encode_frame(codec::SMFIC_ABORT, b""),
        ];
        // A second, complete message on the same connection.
        frames.extend(vec![
            codec::encode_frame(codec::SMFIC_MAIL, b"<carol@example.com>\0"),
            codec::encode_frame(codec::SMFIC_RCPT, b"<alice@example.org>\0"),
            codec::encode_frame(codec::SMFIC_HEADER, b"Subject\0retry\0"),
            codec::encode_frame(codec::SMFIC_EOH, b""),
            codec::encode_frame(codec::SMFIC_BODYEOB, b""),
            codec::encode_frame(codec::SMFIC_QUIT, b""),
        ]);

        let (responses, outcome) = drive(frames, vec![Arc::new(Stamp)], config()).await;

        // Only the post-abort message was finalized.
        assert_eq!(outcome.messages, 1);
        let inserted: Vec<_> = responses
            .iter()
            .filter(|frame| frame.command == codec::SMFIR_INSHEADER)
            .collect();
        let text = String::from_utf8_lossy(&inserted[0].payload[4..]).into_owned();
        assert!(text.contains("carol@example.com"));
        assert!(!text.contains("bob@example.com"));
    }

    #[tokio::test]
    async fn message_budget_closes_the_connection() {
        let mut budgeted = config();
        budgeted.max_messages = Some(1);

        // No QUIT: the engine itself must close after the first EOM.
        let frames = full_message_frames()
            .into_iter()
            .take(10)
            .collect::<Vec<_>>();

        let (_, outcome) = drive(frames, vec![Arc::new(Stamp)], budgeted).await;
        assert_eq!(outcome.messages, 1);
    }

    #[tokio::test]
    async fn macros_set_queue_id_and_auth() {
        struct SawAuth;

        #[async_trait]
        impl Handler for SawAuth {
            fn name(&self) -> &'static str {
                "saw-auth"
            }

            fn stages(&self) -> &'static [Stage] {
                &[Stage::Eom]
            }

            async fn eom(&self, ctx: &mut Context) -> HandlerResult {
                assert_eq!(ctx.queue_id.as_deref(), Some("4Zw1Kd"));
                assert!(ctx.is_authenticated);
                Ok(())
            }
        }

        let mut frames = full_message_frames();
        frames[1] = codec::encode_frame(
            codec::SMFIC_MACRO,
            b"Mi\x004Zw1Kd\0{auth_authen}\0bob\0",
        );

        let (_, outcome) = drive(frames, vec![Arc::new(SawAuth)], config()).await;
        assert_eq!(outcome.messages, 1);
    }
}
