//! TL1 device session.
//!
//! One `DeviceSession` owns one TCP connection to the switch. Every command is
//! tagged with the next value of a per-connection correlation counter (the TL1
//! ctag) and the reply is read until the completion block `M <ctag> <STATUS>...;`
//! for that exact ctag shows up. The session is strictly one command at a
//! time; callers share it behind a mutex.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout as tokio_timeout, timeout_at, Instant};
use tracing::{info, warn};

use crate::error::L1Error;
use crate::tl1::{self, DeviceCommand};

const READ_CHUNK: usize = 1024;

// completion block of a TL1 response: "M  <ctag> COMPLD ... ;"
static COMPLETION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*M[ \t]+(\d+)[ \t]+([A-Za-z][A-Za-z ]*)[^;]*;")
        .expect("completion regex")
});

static SWITCH_NAME_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?m)^[ \t]*(\S.*?)[ \t]+\d+-").expect("switch name regex"));

/// Opens the byte stream a session talks over.
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, address: &str) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// Plain TCP to `<address>:<port>`. An address that already carries a
/// `host:port` is used as given.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub port: u16,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> std::io::Result<TcpStream> {
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{}", self.port)
        };
        let stream = tokio_timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Per-connection ctag source. Starts from 0 on every (re)connect; the first
/// command sent on a fresh connection carries 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationCounter {
    value: u64,
}

impl CorrelationCounter {
    pub fn next(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Last value handed out (0 before the first command).
    #[must_use]
    pub const fn current(&self) -> u64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[derive(Clone)]
struct Credentials {
    address: String,
    user: String,
    password: String,
}

pub struct DeviceSession<C: Connector = TcpConnector> {
    connector: C,
    stream: Option<C::Stream>,
    credentials: Option<Credentials>,
    switch_name: String,
    counter: CorrelationCounter,
    rx_buf: Vec<u8>,
    reply_timeout: Option<Duration>,
}

impl<C: Connector> DeviceSession<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            stream: None,
            credentials: None,
            switch_name: String::new(),
            counter: CorrelationCounter::default(),
            rx_buf: Vec::new(),
            reply_timeout: None,
        }
    }

    /// Bound the wait for each reply. `None` waits until the device answers
    /// or closes the connection.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Switch name learned from the header at connect time (may be empty).
    #[must_use]
    pub fn switch_name(&self) -> &str {
        &self.switch_name
    }

    /// Last ctag used on the current connection.
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.counter.current()
    }

    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.address.as_str())
    }

    /// Open the connection, authenticate and learn the switch name.
    ///
    /// # Errors
    ///
    /// Returns `L1Error::Login` when the socket cannot be opened or the
    /// authentication/header commands are not completed.
    pub async fn connect(
        &mut self,
        address: &str,
        user: &str,
        password: &str,
    ) -> Result<(), L1Error> {
        self.credentials = Some(Credentials {
            address: address.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        });
        self.open().await
    }

    async fn open(&mut self) -> Result<(), L1Error> {
        let creds = self.credentials.clone().ok_or(L1Error::NotLoggedIn)?;
        self.drop_stream();
        info!("Connecting to {}...", creds.address);

        let login_err = |reason: String| L1Error::Login {
            address: creds.address.clone(),
            reason,
        };

        let stream = self
            .connector
            .connect(&creds.address)
            .await
            .map_err(|e| login_err(format!("connect: {e}")))?;
        self.stream = Some(stream);
        self.counter.reset();
        self.rx_buf.clear();
        self.switch_name.clear();

        let act_user = DeviceCommand::new(tl1::ACT_USER)
            .bind("user", &creds.user)
            .bind("password", &creds.password);
        if let Err(e) = self.roundtrip(&act_user).await {
            self.drop_stream();
            return Err(login_err(e.to_string()));
        }

        let header = match self.roundtrip(&DeviceCommand::new(tl1::RTRV_HDR)).await {
            Ok(h) => h,
            Err(e) => {
                self.drop_stream();
                return Err(login_err(format!("header: {e}")));
            }
        };
        self.switch_name = parse_switch_name(&header);
        info!(
            "Connected to {} (switch name \"{}\")",
            creds.address, self.switch_name
        );
        Ok(())
    }

    /// Close the current connection (if any) and connect again with the last
    /// credentials.
    ///
    /// # Errors
    ///
    /// `L1Error::Login` when connecting fails, `L1Error::NotLoggedIn` when
    /// there are no credentials.
    pub async fn reconnect(&mut self) -> Result<(), L1Error> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.open().await
    }

    /// Close the connection and forget the credentials. Safe to call twice.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            info!("Disconnecting...");
            let _ = stream.shutdown().await;
            info!("Disconnected");
        }
        self.credentials = None;
        self.rx_buf.clear();
    }

    /// Send one command and return the full reply text once the device has
    /// completed it.
    ///
    /// A failed write triggers one transparent reconnect; the command is then
    /// re-rendered with the fresh connection's counter and written again.
    ///
    /// # Errors
    ///
    /// * `L1Error::DeviceCommand` when the completion status is not `COMPLD`
    ///   (the session stays connected)
    /// * `L1Error::Login` when the reconnect fails
    /// * `L1Error::UnexpectedDisconnect` when the peer closes before replying
    ///   or the retried write fails
    /// * `L1Error::DeviceTimeout` when a reply timeout is set and expires
    pub async fn execute(&mut self, command: &DeviceCommand) -> Result<String, L1Error> {
        if self.credentials.is_none() {
            return Err(L1Error::NotLoggedIn);
        }
        let counter = match self.send(command).await {
            Ok(counter) => counter,
            Err(e) => {
                warn!("Caught send failure {e}; reconnecting and retrying");
                self.reconnect().await?;
                match self.send(command).await {
                    Ok(counter) => counter,
                    Err(e) => {
                        warn!("send failed again after reconnect: {e}");
                        self.drop_stream();
                        return Err(L1Error::UnexpectedDisconnect {
                            counter: self.counter.current(),
                        });
                    }
                }
            }
        };
        self.read_reply(counter).await
    }

    // write + read without the reconnect path; used while connecting
    async fn roundtrip(&mut self, command: &DeviceCommand) -> Result<String, L1Error> {
        let counter = self.send(command).await?;
        self.read_reply(counter).await
    }

    async fn send(&mut self, command: &DeviceCommand) -> Result<u64, L1Error> {
        let counter = self.counter.next();
        let line = command.render(counter, &self.switch_name);
        let stream = self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no device connection")
        })?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        if command.template == tl1::ACT_USER {
            log::debug!("[TL1 send] ACT-USER::***:{counter}::***;");
        } else {
            log::debug!("[TL1 send] {line}");
        }
        Ok(counter)
    }

    async fn read_reply(&mut self, counter: u64) -> Result<String, L1Error> {
        let mut tmp = [0u8; READ_CHUNK];
        let deadline = self.reply_timeout.map(|d| (Instant::now() + d, d));
        loop {
            if let Some(end) = find_completion(&self.rx_buf, counter) {
                let raw: Vec<u8> = self.rx_buf.drain(..end.end).collect();
                let reply = String::from_utf8_lossy(&raw).into_owned();
                log::debug!("[TL1 recv] {reply}");
                if end.status != tl1::STATUS_COMPLETED {
                    return Err(L1Error::DeviceCommand {
                        status: end.status,
                        reply,
                    });
                }
                return Ok(reply);
            }

            let stream = self.stream.as_mut().ok_or(L1Error::UnexpectedDisconnect { counter })?;
            let n = match deadline {
                Some((at, dur)) => match timeout_at(at, stream.read(&mut tmp)).await {
                    Ok(res) => res,
                    Err(_) => {
                        return Err(L1Error::DeviceTimeout {
                            counter,
                            secs: dur.as_secs(),
                        })
                    }
                },
                None => stream.read(&mut tmp).await,
            };
            match n {
                Ok(0) => {
                    self.drop_stream();
                    return Err(L1Error::UnexpectedDisconnect { counter });
                }
                Ok(n) => self.rx_buf.extend_from_slice(&tmp[..n]),
                Err(e) => {
                    self.drop_stream();
                    return Err(L1Error::Io(e));
                }
            }
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
    }
}

struct Completion {
    end: usize,
    status: String,
}

fn find_completion(buf: &[u8], counter: u64) -> Option<Completion> {
    COMPLETION_RE.captures_iter(buf).find_map(|caps| {
        let ctag = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
        if ctag.parse::<u64>().ok()? != counter {
            return None;
        }
        let status = String::from_utf8_lossy(caps.get(2)?.as_bytes()).trim().to_string();
        Some(Completion {
            end: caps.get(0)?.end(),
            status,
        })
    })
}

/// Pick the switch name out of an `RTRV-HDR` reply. `( nil )` and
/// unrecognised headers both yield an empty name.
#[must_use]
pub fn parse_switch_name(header: &str) -> String {
    if header.contains(tl1::NIL_SWITCH_NAME) {
        info!("Switch name was \"( nil )\" - using blank switch name");
        return String::new();
    }
    match SWITCH_NAME_RE.captures(header).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().trim_matches('"').to_string(),
        None => {
            warn!("Switch name regex not found: {header} - using blank switch name");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_at_one_after_reset() {
        let mut c = CorrelationCounter::default();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        c.reset();
        assert_eq!(c.current(), 0);
        assert_eq!(c.next(), 1);
    }

    #[test]
    fn completion_matches_exact_ctag() {
        let buf = b"\r\n   OSW 26-10-18 10:00:00\r\nM  12 COMPLD\r\n;\r\nM  1 COMPLD\r\n;";
        let c = find_completion(buf, 1).expect("ctag 1");
        assert_eq!(c.status, "COMPLD");
        assert_eq!(c.end, buf.len());
        let c12 = find_completion(buf, 12).expect("ctag 12");
        assert!(c12.end < buf.len());
        assert!(find_completion(buf, 2).is_none());
    }

    #[test]
    fn completion_needs_terminator() {
        assert!(find_completion(b"M  3 COMPLD\r\n   \"1,9\"\r\n", 3).is_none());
        assert!(find_completion(b"M  3 COMPLD\r\n   \"1,9\"\r\n;", 3).is_some());
    }

    #[test]
    fn completion_status_is_trimmed() {
        let c = find_completion(b"M 4 DENY \r\n   IIAC\r\n;", 4).expect("match");
        assert_eq!(c.status, "DENY");
        let c = find_completion(b"M 5 COMPLD ;", 5).expect("match");
        assert_eq!(c.status, "COMPLD");
    }

    #[test]
    fn completion_ignores_m_inside_words() {
        assert!(find_completion(b"   SYSTEM 7 COMPLD;", 7).is_none());
    }

    #[test]
    fn switch_name_from_header() {
        let hdr = "\r\n\n   OSW-LAB1 26-10-18 10:01:02\r\nM  2 COMPLD\r\n;";
        assert_eq!(parse_switch_name(hdr), "OSW-LAB1");
        let quoted = "\r\n   \"LAB 2\" 26-10-18 10:01:02\r\nM  2 COMPLD\r\n;";
        assert_eq!(parse_switch_name(quoted), "LAB 2");
    }

    #[test]
    fn nil_or_unknown_switch_name_is_blank() {
        let nil = "\r\n   ( nil ) 26-10-18 10:01:02\r\nM  2 COMPLD\r\n;";
        assert_eq!(parse_switch_name(nil), "");
        assert_eq!(parse_switch_name("M  2 COMPLD\r\n;"), "");
    }
}
