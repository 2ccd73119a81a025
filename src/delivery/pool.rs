use crate::delivery::Protection;
use dashmap::DashMap;
use mail_send::{SmtpClient, SmtpClientBuilder, smtp::message::Message};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    net::TcpStream,
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
};
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent sessions per MX host, in-use and idle combined.
    pub max_sessions_per_host: usize,
    /// Messages sent over one session before it is retired.
    pub max_messages_per_session: u32,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    /// Dev/test escape hatch for self-signed destination certificates.
    pub allow_invalid_certs: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_host: 5,
            max_messages_per_session: 100,
            idle_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            allow_invalid_certs: false,
        }
    }
}

enum Client {
    Tls(SmtpClient<TlsStream<TcpStream>>),
    Plain(SmtpClient<TcpStream>),
}

impl Client {
    async fn send(&mut self, message: Message<'_>) -> mail_send::Result<()> {
        match self {
            Client::Tls(client) => client.send(message).await,
            Client::Plain(client) => client.send(message).await,
        }
    }

    async fn quit(self) -> mail_send::Result<()> {
        match self {
            Client::Tls(client) => client.quit().await,
            Client::Plain(client) => client.quit().await,
        }
    }

    fn protection(&self) -> Protection {
        match self {
            Client::Tls(_) => Protection::Tls,
            Client::Plain(_) => Protection::Plaintext,
        }
    }
}

/// A checked-out SMTP session. Holds the per-host permit until it is checked
/// back in, discarded, or dropped.
pub struct PooledSession {
    client: Client,
    host: String,
    messages_sent: u32,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub async fn send(&mut self, message: Message<'_>) -> mail_send::Result<()> {
        let result = self.client.send(message).await;
        if result.is_ok() {
            self.messages_sent += 1;
        }
        result
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

struct IdleSession {
    client: Client,
    messages_sent: u32,
    last_used: Instant,
    permit: OwnedSemaphorePermit,
}

struct HostPool {
    sessions: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    returned: Notify,
}

/// Bounded pool of outbound SMTP sessions, keyed by MX hostname. Sessions
/// are multi-message to amortise the handshake; idle ones are reaped.
#[derive(Clone)]
pub struct SmtpConnectionPool {
    hosts: Arc<DashMap<String, Arc<HostPool>>>,
    config: PoolConfig,
    helo_hostname: String,
}

impl SmtpConnectionPool {
    pub fn new(config: PoolConfig, helo_hostname: String) -> Self {
        Self {
            hosts: Arc::new(DashMap::new()),
            config,
            helo_hostname,
        }
    }

    fn host_pool(&self, host: &str) -> Arc<HostPool> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    sessions: Arc::new(Semaphore::new(self.config.max_sessions_per_host)),
                    idle: Mutex::new(Vec::new()),
                    returned: Notify::new(),
                })
            })
            .clone()
    }

    /// Obtains a session to `host`, reusing an idle one when available. The
    /// per-host bound holds across reuse and fresh dials.
    pub async fn checkout(
        &self,
        host: &str,
        port: u16,
        protection: Protection,
    ) -> mail_send::Result<PooledSession> {
        let pool = self.host_pool(host);

        loop {
            {
                let mut idle = pool.idle.lock().unwrap();
                while let Some(session) = idle.pop() {
                    if session.last_used.elapsed() < self.config.idle_timeout
                        && session.client.protection() == protection
                    {
                        trace!(host, "reusing pooled SMTP session");
                        return Ok(PooledSession {
                            client: session.client,
                            host: host.to_string(),
                            messages_sent: session.messages_sent,
                            _permit: session.permit,
                        });
                    }
                    // stale or mismatched: dropping it releases its permit
                }
            }

            tokio::select! {
                permit = pool.sessions.clone().acquire_owned() => {
                    let permit = permit.expect("session pool semaphore closed");
                    let client = self.dial(host, port, protection).await?;
                    return Ok(PooledSession {
                        client,
                        host: host.to_string(),
                        messages_sent: 0,
                        _permit: permit,
                    });
                }
                // a session was checked back in while we were waiting
                _ = pool.returned.notified() => continue,
            }
        }
    }

    async fn dial(
        &self,
        host: &str,
        port: u16,
        protection: Protection,
    ) -> mail_send::Result<Client> {
        debug!(host, port, "opening SMTP session");
        let mut builder = SmtpClientBuilder::new(host.to_string(), port)
            .implicit_tls(false)
            .helo_host(self.helo_hostname.clone())
            .timeout(self.config.command_timeout);
        if self.config.allow_invalid_certs {
            builder = builder.allow_invalid_certs();
        }

        let connect = async {
            match protection {
                Protection::Tls => builder.connect().await.map(Client::Tls),
                Protection::Plaintext => builder.connect_plain().await.map(Client::Plain),
            }
        };
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(mail_send::Error::Timeout),
        }
    }

    /// Returns a healthy session to the pool, retiring it once it has
    /// carried its message quota.
    pub async fn checkin(&self, session: PooledSession) {
        if session.messages_sent >= self.config.max_messages_per_session {
            trace!(host = session.host, "retiring session at message cap");
            self.discard(session).await;
            return;
        }

        let pool = self.host_pool(&session.host);
        pool.idle.lock().unwrap().push(IdleSession {
            client: session.client,
            messages_sent: session.messages_sent,
            last_used: Instant::now(),
            permit: session._permit,
        });
        pool.returned.notify_one();
    }

    /// Politely closes a session; its permit frees on drop.
    pub async fn discard(&self, session: PooledSession) {
        let host = session.host;
        session
            .client
            .quit()
            .await
            .inspect_err(|err| warn!(host, "failed to close upstream SMTP session: {err}"))
            .ok();
    }

    /// Closes idle sessions past the idle timeout. Run periodically.
    pub async fn reap_idle(&self) {
        let mut expired = Vec::new();
        for entry in self.hosts.iter() {
            let mut idle = entry.idle.lock().unwrap();
            let mut keep = Vec::with_capacity(idle.len());
            for session in idle.drain(..) {
                if session.last_used.elapsed() >= self.config.idle_timeout {
                    expired.push(session);
                } else {
                    keep.push(session);
                }
            }
            *idle = keep;
        }

        for session in expired {
            session.client.quit().await.ok();
            // dropping the permit here reopens the slot
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|pool| pool.idle.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mailcrab::TestMailServerHandle;
    use std::net::Ipv4Addr;

    fn test_config(max_sessions: usize) -> PoolConfig {
        PoolConfig {
            max_sessions_per_host: max_sessions,
            max_messages_per_session: 2,
            idle_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            allow_invalid_certs: true,
        }
    }

    fn test_message<'a>(body: &'a str) -> Message<'a> {
        Message {
            mail_from: "alice@verified.tld".into(),
            rcpt_to: vec!["bob@example.org".into()],
            body: body.as_bytes().into(),
        }
    }

    async fn mail_sink() -> (tokio_util::sync::CancellationToken, u16) {
        let port = crate::test_support::random_port();
        let TestMailServerHandle { token, rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        drop(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        (token, port)
    }

    #[tokio::test]
    async fn sessions_are_reused_until_the_message_cap() {
        let (token, port) = mail_sink().await;
        let _guard = token.drop_guard();

        let pool = SmtpConnectionPool::new(test_config(2), "test.example".into());

        let mut session = pool
            .checkout("localhost", port, Protection::Plaintext)
            .await
            .unwrap();
        session.send(test_message("Subject: one\r\n\r\nhi\r\n")).await.unwrap();
        pool.checkin(session).await;
        assert_eq!(pool.idle_count("localhost"), 1);

        let mut session = pool
            .checkout("localhost", port, Protection::Plaintext)
            .await
            .unwrap();
        session.send(test_message("Subject: two\r\n\r\nhi\r\n")).await.unwrap();
        // second message hits the per-session cap: the session is retired
        pool.checkin(session).await;
        assert_eq!(pool.idle_count("localhost"), 0);
    }

    #[tokio::test]
    async fn per_host_bound_holds() {
        let (token, port) = mail_sink().await;
        let _guard = token.drop_guard();

        let pool = SmtpConnectionPool::new(test_config(2), "test.example".into());

        let first = pool
            .checkout("localhost", port, Protection::Plaintext)
            .await
            .unwrap();
        let _second = pool
            .checkout("localhost", port, Protection::Plaintext)
            .await
            .unwrap();

        // the third session only becomes available once one is returned
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            pool.checkout("localhost", port, Protection::Plaintext),
        )
        .await;
        assert!(blocked.is_err());

        pool.checkin(first).await;
        let reused = tokio::time::timeout(
            Duration::from_secs(1),
            pool.checkout("localhost", port, Protection::Plaintext),
        )
        .await
        .expect("checkout must proceed after checkin")
        .unwrap();
        assert_eq!(reused.host(), "localhost");
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let (token, port) = mail_sink().await;
        let _guard = token.drop_guard();

        let pool = SmtpConnectionPool::new(test_config(2), "test.example".into());
        let session = pool
            .checkout("localhost", port, Protection::Plaintext)
            .await
            .unwrap();
        pool.checkin(session).await;
        assert_eq!(pool.idle_count("localhost"), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.reap_idle().await;
        assert_eq!(pool.idle_count("localhost"), 0);
    }
}
