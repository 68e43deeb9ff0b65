use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use polatis_l1::session::{Connector, DeviceSession, TcpConnector};
use polatis_l1::tl1::{self, DeviceCommand};
use polatis_l1::L1Error;
use polatis_tl1_mock::{MockConfig, MockSwitch};

async fn start_mock(mock: &MockSwitch) -> Result<u16, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let srv = mock.clone();
    tokio::spawn(async move {
        let _ = srv.run_listener_on(listener).await;
    });
    // give server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(port)
}

fn ctag_of(line: &str) -> Option<u64> {
    line.trim_end_matches(';').split(':').nth(3)?.parse().ok()
}

#[tokio::test]
async fn counters_increase_from_login_baseline() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;

    let mut session = DeviceSession::new(TcpConnector::new(port));
    session.connect("127.0.0.1", "admin", "root").await?;
    assert_eq!(session.switch_name(), "OSW-MOCK");
    assert_eq!(session.counter(), 2);

    for _ in 0..3 {
        session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)).await?;
    }

    let received = mock.received().await;
    assert_eq!(received[0], "ACT-USER::admin:1::root;");
    assert_eq!(received[1], "RTRV-HDR:::2:;");
    let ctags: Vec<u64> = received[2..].iter().filter_map(|l| ctag_of(l)).collect();
    assert_eq!(ctags, vec![3, 4, 5]);
    assert_eq!(received[2], "RTRV-PATCH:OSW-MOCK::3:;");
    Ok(())
}

#[tokio::test]
async fn nil_switch_name_renders_blank() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::with_config(MockConfig::default().with_switch_name(None));
    let port = start_mock(&mock).await?;

    let mut session = DeviceSession::new(TcpConnector::new(port));
    session.connect("127.0.0.1", "admin", "root").await?;
    assert_eq!(session.switch_name(), "");

    let reply = session
        .execute(&DeviceCommand::new(tl1::RTRV_EQPT_SIZE))
        .await?;
    assert!(reply.contains("SYSTEM:SIZE=8x8"));
    assert_eq!(
        mock.received().await.last().map(String::as_str),
        Some("RTRV-EQPT::SYSTEM:3:::PARAMETER=SIZE;")
    );
    Ok(())
}

#[tokio::test]
async fn rejected_status_keeps_session_connected() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    let mut session = DeviceSession::new(TcpConnector::new(port));
    session.connect("127.0.0.1", "admin", "root").await?;

    mock.fail_commands("RTRV-NETYPE", "DENY").await;
    let err = session
        .execute(&DeviceCommand::new(tl1::RTRV_NETYPE))
        .await
        .unwrap_err();
    match &err {
        L1Error::DeviceCommand { status, reply } => {
            assert_eq!(status, "DENY");
            assert!(reply.contains("INJECTED"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(session.is_connected());

    let reply = session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)).await?;
    assert!(reply.contains("M  4 COMPLD"));
    assert_eq!(mock.connections().await, 1);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_a_login_error() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::with_config(MockConfig::default().with_credentials("ops", "secret"));
    let port = start_mock(&mock).await?;

    let mut session = DeviceSession::new(TcpConnector::new(port));
    let err = session.connect("127.0.0.1", "ops", "guess").await.unwrap_err();
    assert!(matches!(err, L1Error::Login { .. }), "{err}");
    assert!(!session.is_connected());
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_a_login_error() -> Result<(), Box<dyn std::error::Error>> {
    // bind then drop to get a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();
    let mut session = DeviceSession::new(
        TcpConnector::new(port).with_connect_timeout(Duration::from_secs(2)),
    );
    let err = session.connect("127.0.0.1", "admin", "root").await.unwrap_err();
    assert!(matches!(err, L1Error::Login { .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn execute_before_connect_is_not_logged_in() {
    let mut session = DeviceSession::new(TcpConnector::new(1));
    let err = session
        .execute(&DeviceCommand::new(tl1::RTRV_PATCH))
        .await
        .unwrap_err();
    assert!(matches!(err, L1Error::NotLoggedIn));
}

#[tokio::test]
async fn disconnect_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    let mut session = DeviceSession::new(TcpConnector::new(port));
    session.connect("127.0.0.1", "admin", "root").await?;
    session.disconnect().await;
    session.disconnect().await;
    assert!(!session.is_connected());
    assert!(matches!(
        session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)).await,
        Err(L1Error::NotLoggedIn)
    ));
    Ok(())
}

#[tokio::test]
async fn late_reply_is_skipped_by_counter() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    let mut session = DeviceSession::new(TcpConnector::new(port))
        .with_reply_timeout(Some(Duration::from_millis(300)));
    session.connect("127.0.0.1", "admin", "root").await?;

    mock.delay_commands("RTRV-NETYPE", Duration::from_millis(400))
        .await;
    let err = session
        .execute(&DeviceCommand::new(tl1::RTRV_NETYPE))
        .await
        .unwrap_err();
    assert!(matches!(err, L1Error::DeviceTimeout { counter: 3, .. }), "{err}");
    assert!(session.is_connected());

    // the NETYPE reply (ctag 3) arrives first and must not satisfy ctag 4
    let reply = session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)).await?;
    assert!(reply.contains("M  4 COMPLD"));
    Ok(())
}

/// One-shot device: completes login and header, then closes on the next command.
async fn start_closing_device() -> Result<u16, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        let mut line = Vec::new();
        for (ctag, body) in [(1, ""), (2, "   \"LAB\" 26-10-18 10:00:00\r\n")] {
            line.clear();
            if reader.read_until(b';', &mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let reply = format!("\r\n{body}M  {ctag} COMPLD\r\n;");
            if wr.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
        line.clear();
        let _ = reader.read_until(b';', &mut line).await;
        // partial reply, then the peer goes away
        let _ = wr.write_all(b"\r\n   LAB 26-10-18 10:00:01\r\n").await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(port)
}

#[tokio::test]
async fn peer_close_before_completion_is_unexpected_disconnect(
) -> Result<(), Box<dyn std::error::Error>> {
    let port = start_closing_device().await?;
    let mut session = DeviceSession::new(TcpConnector::new(port));
    session.connect("127.0.0.1", "admin", "root").await?;
    assert_eq!(session.switch_name(), "LAB");

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)),
    )
    .await?;
    assert!(
        matches!(res, Err(L1Error::UnexpectedDisconnect { counter: 3 })),
        "{res:?}"
    );
    assert!(!session.is_connected());
    Ok(())
}

/// TCP stream whose writes of lines starting with `prefix` fail while the
/// shared budget lasts.
struct FlakyStream {
    inner: TcpStream,
    prefix: &'static [u8],
    budget: Arc<AtomicUsize>,
}

impl AsyncRead for FlakyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.starts_with(self.prefix)
            && self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_ok()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Clone)]
struct FlakyConnector {
    port: u16,
    prefix: &'static [u8],
    budget: Arc<AtomicUsize>,
}

impl Connector for FlakyConnector {
    type Stream = FlakyStream;

    async fn connect(&self, address: &str) -> io::Result<FlakyStream> {
        let inner = TcpStream::connect((address, self.port)).await?;
        Ok(FlakyStream {
            inner,
            prefix: self.prefix,
            budget: self.budget.clone(),
        })
    }
}

async fn flaky_session(
    port: u16,
    prefix: &'static [u8],
) -> Result<(DeviceSession<FlakyConnector>, Arc<AtomicUsize>), L1Error> {
    let budget = Arc::new(AtomicUsize::new(0));
    let connector = FlakyConnector {
        port,
        prefix,
        budget: budget.clone(),
    };
    let mut session = DeviceSession::new(connector);
    session.connect("127.0.0.1", "admin", "root").await?;
    Ok((session, budget))
}

#[tokio::test]
async fn write_failure_reconnects_and_retries_once() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    let (mut session, budget) = flaky_session(port, b"RTRV-PATCH").await?;

    budget.store(1, Ordering::SeqCst);
    let reply = session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)).await?;
    // fresh connection: ACT-USER=1, RTRV-HDR=2, retried command=3
    assert!(reply.contains("M  3 COMPLD"));
    assert_eq!(mock.connections().await, 2);
    assert_eq!(
        mock.received().await.last().map(String::as_str),
        Some("RTRV-PATCH:OSW-MOCK::3:;")
    );
    Ok(())
}

#[tokio::test]
async fn second_write_failure_fails_without_hanging() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    let (mut session, budget) = flaky_session(port, b"RTRV-PATCH").await?;

    budget.store(2, Ordering::SeqCst);
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)),
    )
    .await?;
    assert!(
        matches!(res, Err(L1Error::UnexpectedDisconnect { .. })),
        "{res:?}"
    );
    assert!(!session.is_connected());
    Ok(())
}

#[tokio::test]
async fn failed_reconnect_is_a_login_error() -> Result<(), Box<dyn std::error::Error>> {
    let mock = MockSwitch::new();
    let port = start_mock(&mock).await?;
    // the command and the re-login both fail to write
    let (mut session, budget) = flaky_session(port, b"").await?;

    budget.store(2, Ordering::SeqCst);
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        session.execute(&DeviceCommand::new(tl1::RTRV_PATCH)),
    )
    .await?;
    assert!(matches!(res, Err(L1Error::Login { .. })), "{res:?}");
    Ok(())
}
