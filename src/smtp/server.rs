use crate::smtp::{
    ListenerKind, SmtpConfig,
    connection::{self, ConnectionError},
    session::SessionContext,
};
use std::{fs::File, io, sync::Arc};
use thiserror::Error;
use tokio::{net::TcpListener, select};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

/// The SMTP front-end: an anonymous MX listener for inbound mail and an
/// authenticated submission listener for tenant clients, sharing one TLS
/// identity and one session context.
pub struct SmtpServer {
    ctx: SessionContext,
    config: Arc<SmtpConfig>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(ctx: SessionContext, config: Arc<SmtpConfig>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            config,
            shutdown,
        }
    }

    fn load_tls_config(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, SmtpServerError>
    {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file)
        else {
            return Ok(None);
        };

        let mut cert_reader =
            io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
        let mut key_reader =
            io::BufReader::new(File::open(key_file).map_err(SmtpServerError::PrivateKey)?);

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok(Some((certs, key)))
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, SmtpServerError> {
        let Some((certs, key)) = self.load_tls_config()? else {
            info!("no TLS certificate configured, STARTTLS will not be offered");
            return Ok(None);
        };

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let acceptor = self.build_tls_acceptor()?;

        let mx_listener = TcpListener::bind(self.config.mx_addr)
            .await
            .map_err(SmtpServerError::Listen)?;
        let submission_listener = TcpListener::bind(self.config.submission_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        info!(
            mx = %self.config.mx_addr,
            submission = %self.config.submission_addr,
            "smtp server listening"
        );

        loop {
            let (result, kind) = select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                result = mx_listener.accept() => (result, ListenerKind::Mx),
                result = submission_listener.accept() => (result, ListenerKind::Submission),
            };

            match result {
                Ok((stream, peer_addr)) => {
                    trace!(
                        source_ip = peer_addr.ip().to_string(),
                        source_port = peer_addr.port(),
                        listener = kind.as_str(),
                        "new TCP connection"
                    );

                    let ctx = self.ctx.clone();
                    let config = self.config.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            connection::handle(stream, kind, acceptor, ctx, config, peer_addr).await
                        {
                            match err {
                                ConnectionError::Dropped => {
                                    trace!("connection dropped: {err}");
                                }
                                err => error!("failed to handle connection: {err}"),
                            }
                        }
                    });
                }
                Err(err) => {
                    error!("failed to accept connection: {err}");
                }
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(err) = self.serve().await {
                error!("smtp server error: {err:?}");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        models::{Direction, EmailStatus},
        smtp::SmtpConfig,
        test_support::{TestStack, random_port},
    };
    use base64ct::{Base64, Encoding};
    use std::time::Duration;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{
            TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
    };

    type Lines = tokio::io::Lines<BufReader<OwnedReadHalf>>;

    async fn client(port: u16) -> (Lines, OwnedWriteHalf) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        // banner
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("220"));
        (lines, write)
    }

    async fn command(lines: &mut Lines, write: &mut OwnedWriteHalf, line: &str) -> String {
        write.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        lines.next_line().await.unwrap().unwrap()
    }

    async fn ehlo(lines: &mut Lines, write: &mut OwnedWriteHalf) {
        write.write_all(b"EHLO client.example\r\n").await.unwrap();
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            if line.starts_with("250 ") {
                break;
            }
        }
    }

    async fn spawn_server(stack: &TestStack) -> (CancellationToken, u16, u16) {
        let mx_port = random_port();
        let submission_port = random_port();
        let config = Arc::new(SmtpConfig {
            hostname: "mail.example".into(),
            mx_addr: format!("127.0.0.1:{mx_port}").parse().unwrap(),
            submission_addr: format!("127.0.0.1:{submission_port}").parse().unwrap(),
            require_tls: false,
            ..Default::default()
        });

        let shutdown = CancellationToken::new();
        let server = SmtpServer::new(stack.context(), config, shutdown.clone());
        server.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;

        (shutdown, mx_port, submission_port)
    }

    #[tokio::test]
    async fn authenticated_submission_lands_in_the_queue() {
        let stack = TestStack::new().await;
        let (shutdown, _, submission_port) = spawn_server(&stack).await;

        let (mut lines, mut write) = client(submission_port).await;
        ehlo(&mut lines, &mut write).await;

        let token = Base64::encode_string(b"\0alice@verified.tld\0s3cret");
        let reply = command(&mut lines, &mut write, &format!("AUTH PLAIN {token}")).await;
        assert!(reply.starts_with("235"), "got: {reply}");

        assert!(
            command(&mut lines, &mut write, "MAIL FROM:<alice@verified.tld>")
                .await
                .starts_with("250")
        );
        assert!(
            command(&mut lines, &mut write, "RCPT TO:<bob@gmail.com>")
                .await
                .starts_with("250")
        );
        assert!(command(&mut lines, &mut write, "DATA").await.starts_with("354"));

        write
            .write_all(
                b"From: alice@verified.tld\r\nTo: bob@gmail.com\r\nSubject: Hi!\r\n\r\nHello world!\r\n.\r\n",
            )
            .await
            .unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.starts_with("250"), "got: {reply}");

        command(&mut lines, &mut write, "QUIT").await;
        shutdown.cancel();

        let emails = stack.all_emails().await;
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].direction, Direction::Outbound);
        assert_eq!(emails[0].status, EmailStatus::Pending);
        assert_eq!(emails[0].from_email, "alice@verified.tld");
    }

    #[tokio::test]
    async fn wrong_credentials_are_rejected() {
        let stack = TestStack::new().await;
        let (shutdown, _, submission_port) = spawn_server(&stack).await;

        let (mut lines, mut write) = client(submission_port).await;
        ehlo(&mut lines, &mut write).await;

        let token = Base64::encode_string(b"\0alice@verified.tld\0wrong");
        let reply = command(&mut lines, &mut write, &format!("AUTH PLAIN {token}")).await;
        assert!(reply.starts_with("535"), "got: {reply}");

        // still unauthenticated
        let reply = command(&mut lines, &mut write, "MAIL FROM:<alice@verified.tld>").await;
        assert!(reply.starts_with("530"), "got: {reply}");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn mx_listener_refuses_to_relay() {
        let stack = TestStack::new().await;
        let (shutdown, mx_port, _) = spawn_server(&stack).await;

        let (mut lines, mut write) = client(mx_port).await;
        ehlo(&mut lines, &mut write).await;

        assert!(
            command(&mut lines, &mut write, "MAIL FROM:<x@external.example>")
                .await
                .starts_with("250")
        );
        let reply = command(&mut lines, &mut write, "RCPT TO:<y@external.example>").await;
        assert!(reply.starts_with("550 5.7.1"), "got: {reply}");

        command(&mut lines, &mut write, "QUIT").await;
        shutdown.cancel();

        // relay attempts never create email rows, only audit events
        assert!(stack.all_emails().await.is_empty());
        assert!(!stack.events.security_events().await.is_empty());
    }

    #[tokio::test]
    async fn inbound_mail_for_local_domains_is_recorded() {
        let stack = TestStack::new().await;
        let (shutdown, mx_port, _) = spawn_server(&stack).await;

        let (mut lines, mut write) = client(mx_port).await;
        ehlo(&mut lines, &mut write).await;

        command(&mut lines, &mut write, "MAIL FROM:<someone@external.example>").await;
        assert!(
            command(&mut lines, &mut write, "RCPT TO:<postmaster@mail.example>")
                .await
                .starts_with("250")
        );
        assert!(command(&mut lines, &mut write, "DATA").await.starts_with("354"));
        write
            .write_all(
                b"From: someone@external.example\r\nSubject: q\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\nhello\r\n.\r\n",
            )
            .await
            .unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.starts_with("250"), "got: {reply}");

        command(&mut lines, &mut write, "QUIT").await;
        shutdown.cancel();

        let emails = stack.all_emails().await;
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].direction, Direction::Inbound);
        assert_eq!(emails[0].status, EmailStatus::Delivered);
    }
}
