//! Minimal SMTP relay client used to forward stamped messages to the
//! upstream MTA.

use std::{io, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use attest_common::{incoming, outgoing};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Upstream answered {got:?}, expected {expected}")]
    UnexpectedReply { expected: u16, got: String },

    #[error("Relay timed out")]
    Timeout,
}

/// Double every leading dot so the body cannot terminate the DATA
/// phase early.
#[must_use]
pub fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len());
    let mut at_line_start = true;

    for &byte in message {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }

    out
}

/// Read one (possibly multiline) reply and check its code.
async fn expect_reply<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    expected: u16,
    timeout: Duration,
) -> Result<(), RelayError> {
    loop {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| RelayError::Timeout)??;
        if read == 0 {
            return Err(RelayError::UnexpectedReply {
                expected,
                got: "connection closed".to_string(),
            });
        }

        incoming!("Upstream: {}", line.trim_end());

        if line.len() < 4 || !line[..3].chars().all(|ch| ch.is_ascii_digit()) {
            return Err(RelayError::UnexpectedReply {
                expected,
                got: line.trim_end().to_string(),
            });
        }

        // Continuation lines of a multiline reply.
        if line.as_bytes()[3] == b'-' {
            continue;
        }

        let code: u16 = line[..3].parse().unwrap_or(0);
        if code == expected {
            return Ok(());
        }
        return Err(RelayError::UnexpectedReply {
            expected,
            got: line.trim_end().to_string(),
        });
    }
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), RelayError> {
    outgoing!("Upstream: {line}");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Forward one message to the upstream MTA.
pub async fn relay(
    upstream: &str,
    hostname: &str,
    mail_from: &str,
    rcpts: &[String],
    message: &[u8],
    timeout: Duration,
) -> Result<(), RelayError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(upstream))
        .await
        .map_err(|_| RelayError::Timeout)??;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    expect_reply(&mut reader, 220, timeout).await?;

    send_line(&mut write_half, &format!("EHLO {hostname}")).await?;
    expect_reply(&mut reader, 250, timeout).await?;

    send_line(&mut write_half, &format!("MAIL FROM:<{mail_from}>")).await?;
    expect_reply(&mut reader, 250, timeout).await?;

    for rcpt in rcpts {
        send_line(&mut write_half, &format!("RCPT TO:<{rcpt}>")).await?;
        expect_reply(&mut reader, 250, timeout).await?;
    }

    send_line(&mut write_half, "DATA").await?;
    expect_reply(&mut reader, 354, timeout).await?;

    let mut stuffed = dot_stuff(message);
    if !stuffed.ends_with(b"\r\n") {
        stuffed.extend_from_slice(b"\r\n");
    }
    stuffed.extend_from_slice(b".\r\n");
    write_half.write_all(&stuffed).await?;
    expect_reply(&mut reader, 250, timeout).await?;

    send_line(&mut write_half, "QUIT").await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn dot_stuffing_doubles_leading_dots_only() {
        assert_eq!(
            dot_stuff(b"line one\r\n.hidden dot\r\nno. inner dot\r\n"),
            b"line one\r\n..hidden dot\r\nno. inner dot\r\n".to_vec()
        );
        assert_eq!(dot_stuff(b".\r\n"), b"..\r\n".to_vec());
        assert_eq!(dot_stuff(b""), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn multiline_replies_are_consumed() {
        let reply = b"250-gw.example.net\r\n250-PIPELINING\r\n250 SIZE 10240000\r\n";
        let mut reader = BufReader::new(&reply[..]);
        assert!(expect_reply(&mut reader, 250, Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn wrong_code_is_reported() {
        let reply = b"451 4.3.0 try again later\r\n";
        let mut reader = BufReader::new(&reply[..]);
        let err = expect_reply(&mut reader, 250, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::UnexpectedReply { expected: 250, .. }
        ));
    }
}
