use crate::smtp::{
    ListenerKind, SmtpConfig,
    session::{SessionContext, SessionReply, SmtpSession},
};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept TLS: {0}")]
    Accept(std::io::Error),
    #[error("failed to write to stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read from stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const COMMAND_BUFFER_SIZE: usize = 1024;
const DATA_CHUNK_SIZE: usize = 16 * 1024;
/// Slack past the SIZE cap before the stream is cut instead of drained.
const OVERSIZE_SLACK: usize = 8 * 1024;
const DATA_END: &[u8] = b"\r\n.\r\n";

enum LoopEnd {
    Close,
    StartTls,
}

/// Drives one client connection: accept-time screening, the plain command
/// loop, and the TLS phase after a STARTTLS upgrade.
pub async fn handle(
    mut stream: TcpStream,
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    ctx: SessionContext,
    config: Arc<SmtpConfig>,
    peer_addr: SocketAddr,
) -> Result<(), ConnectionError> {
    if let Err(reason) = SmtpSession::screen_connection(&ctx, peer_addr).await {
        debug!(peer = %peer_addr, "dropping connection at accept: {reason}");
        stream
            .write_all(format!("421 {reason}\r\n").as_bytes())
            .await
            .map_err(ConnectionError::Write)?;
        return Ok(());
    }

    let mut session = SmtpSession::new(
        kind,
        ctx,
        config.clone(),
        peer_addr,
        false,
        acceptor.is_some(),
    );

    stream
        .write_all(format!("220 {} ESMTP\r\n", config.hostname).as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    match run_session(&mut stream, &mut session, &config).await? {
        LoopEnd::Close => {
            stream.shutdown().await.ok();
        }
        LoopEnd::StartTls => {
            // the session never offers STARTTLS without an acceptor
            let acceptor = acceptor.ok_or(ConnectionError::Dropped)?;
            let mut tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::Accept)?;
            session.tls_established();
            trace!(peer = %peer_addr, "TLS established");

            run_session(&mut tls_stream, &mut session, &config).await?;
            tls_stream.shutdown().await.ok();
        }
    }

    info!(peer = %peer_addr, listener = kind.as_str(), "connection handled");
    Ok(())
}

async fn run_session<S>(
    stream: &mut S,
    session: &mut SmtpSession,
    config: &SmtpConfig,
) -> Result<LoopEnd, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (source, mut sink) = tokio::io::split(stream);
    let mut reader = BufReader::new(source);
    let mut buffer = Vec::with_capacity(COMMAND_BUFFER_SIZE);

    loop {
        if read_command(&mut reader, &mut buffer, config).await? == 0 {
            // idle timeout: RFC 5321, 4.3.2 wants a 421 before closing
            write_reply(&mut sink, 421, "4.4.2 Idle timeout, closing connection").await?;
            return Ok(LoopEnd::Close);
        }

        let request = smtp_proto::Request::parse(&mut buffer.iter())
            .map(|request| request.into_owned());

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(&mut sink, code, &message).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(&mut sink, code, &message).await?;
                return Ok(LoopEnd::Close);
            }
            SessionReply::RawReply(reply) => {
                sink.write_all(&reply).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::UpgradeTls(code, message) => {
                write_reply(&mut sink, code, &message).await?;
                return Ok(LoopEnd::StartTls);
            }
            SessionReply::IngestAuth(code, message) => {
                write_reply(&mut sink, code, &message).await?;
                // the exchange may need several lines (AUTH LOGIN)
                while session.auth_pending() {
                    if read_command(&mut reader, &mut buffer, config).await? == 0 {
                        write_reply(&mut sink, 421, "4.4.2 Idle timeout, closing connection")
                            .await?;
                        return Ok(LoopEnd::Close);
                    }
                    match session.handle_auth_line(&buffer).await {
                        SessionReply::IngestAuth(code, message)
                        | SessionReply::ReplyAndContinue(code, message) => {
                            write_reply(&mut sink, code, &message).await?;
                        }
                        _ => return Err(ConnectionError::Dropped),
                    }
                }
            }
            SessionReply::IngestData(code, message) => {
                write_reply(&mut sink, code, &message).await?;
                match ingest_data(&mut reader, config).await? {
                    Some(data) => match session.handle_data_complete(data).await {
                        SessionReply::ReplyAndContinue(code, message) => {
                            write_reply(&mut sink, code, &message).await?;
                        }
                        _ => return Err(ConnectionError::Dropped),
                    },
                    None => {
                        // stream cut mid-message to bound memory; no sync
                        // point remains, so the connection closes
                        write_reply(&mut sink, 552, "5.3.4 Message exceeds size limit").await?;
                        return Ok(LoopEnd::Close);
                    }
                }
            }
        }
    }
}

/// Reads one command line within the idle timeout; 0 signals the timeout.
async fn read_command(
    reader: &mut (impl AsyncBufReadExt + Unpin),
    buffer: &mut Vec<u8>,
    config: &SmtpConfig,
) -> Result<usize, ConnectionError> {
    buffer.clear();
    let mut limited = reader.take(COMMAND_BUFFER_SIZE as u64);
    let read = limited.read_until(b'\n', buffer);
    match tokio::time::timeout(config.idle_timeout, read).await {
        Ok(Ok(0)) => Err(ConnectionError::Dropped),
        Ok(Ok(size)) => Ok(size),
        Ok(Err(err)) => Err(ConnectionError::Read(err)),
        Err(_) => Ok(0),
    }
}

/// Accumulates a DATA payload until `<CRLF>.<CRLF>`, undoing dot transparency.
/// `None` when the client overshot the cap so far that draining is unsafe.
async fn ingest_data(
    reader: &mut (impl AsyncRead + Unpin),
    config: &SmtpConfig,
) -> Result<Option<Vec<u8>>, ConnectionError> {
    let mut buffer = Vec::with_capacity(DATA_CHUNK_SIZE);
    let hard_limit = config.max_message_size + OVERSIZE_SLACK;

    loop {
        let mut chunk = [0u8; DATA_CHUNK_SIZE];
        let read = reader.read(&mut chunk);
        let size = match tokio::time::timeout(config.idle_timeout, read).await {
            Ok(Ok(0)) => return Err(ConnectionError::Dropped),
            Ok(Ok(size)) => size,
            Ok(Err(err)) => return Err(ConnectionError::Read(err)),
            Err(_) => return Err(ConnectionError::Dropped),
        };
        buffer.extend_from_slice(&chunk[..size]);

        if buffer.ends_with(DATA_END) || buffer == b".\r\n" {
            let body_len = buffer.len().saturating_sub(DATA_END.len());
            buffer.truncate(body_len);
            trace!("received message ({} bytes)", buffer.len());
            return Ok(Some(unstuff_dots(&buffer)));
        }

        if buffer.len() > hard_limit {
            return Ok(None);
        }
    }
}

/// RFC 5321, 4.5.2: a leading dot on a data line was doubled in transit.
fn unstuff_dots(data: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    let mut bytes = data.iter().peekable();
    while let Some(&byte) = bytes.next() {
        if at_line_start && byte == b'.' {
            at_line_start = false;
            // the stuffed dot is dropped, whatever follows is kept
            continue;
        }
        if byte == b'\n' {
            at_line_start = true;
        } else if byte != b'\r' || bytes.peek() != Some(&&b'\n') {
            at_line_start = false;
        }
        output.push(byte);
    }
    output
}

async fn write_reply(
    sink: &mut (impl AsyncWriteExt + Unpin),
    code: u16,
    message: &str,
) -> Result<(), ConnectionError> {
    let reply = if message.is_empty() {
        format!("{code}\r\n")
    } else {
        format!("{code} {message}\r\n")
    };
    sink.write_all(reply.as_bytes())
        .await
        .map_err(ConnectionError::Write)?;
    debug!("sent: {}", reply.trim_end());
    Ok(())
}
