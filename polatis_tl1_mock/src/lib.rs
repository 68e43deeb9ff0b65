//! A scripted Polatis switch speaking TL1 over TCP.
//!
//! Understands the subset of TL1 the L1 driver sends: `ACT-USER`, `RTRV-HDR`,
//! `RTRV-EQPT`, `RTRV-INV`, `RTRV-NETYPE`, `RTRV-PATCH`, `RTRV-PORT-SHUTTER`,
//! `RTRV-PORT-POWER`, `RTRV-PORT-PMON`, `ENT-PATCH` and `DLT-PATCH`.
//! Patches live in memory and are shared by all connections.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Header timestamp; the driver only needs its shape.
const HEADER_TIMESTAMP: &str = "24-01-01 00:00:00";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub user: String,
    pub password: String,
    /// `None` makes the header report `( nil )`.
    pub switch_name: Option<String>,
    pub size_a: u32,
    pub size_b: u32,
    pub serial: String,
    pub vendor: String,
    pub model: String,
    pub hardware_type: String,
    pub version: String,
    pub closed_ports: Vec<u32>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            user: "admin".to_string(),
            password: "root".to_string(),
            switch_name: Some("OSW-MOCK".to_string()),
            size_a: 8,
            size_b: 8,
            serial: "MOCK0001".to_string(),
            vendor: "POLATIS".to_string(),
            model: "OST-8x8".to_string(),
            hardware_type: "Optical Switch".to_string(),
            version: "6.5.1".to_string(),
            closed_ports: Vec::new(),
        }
    }
}

impl MockConfig {
    #[must_use]
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    #[must_use]
    pub fn with_switch_name(mut self, name: Option<&str>) -> Self {
        self.switch_name = name.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_size(mut self, a: u32, b: u32) -> Self {
        self.size_a = a;
        self.size_b = b;
        self
    }

    #[must_use]
    pub fn with_closed_ports(mut self, ports: Vec<u32>) -> Self {
        self.closed_ports = ports;
        self
    }

    const fn total_ports(&self) -> u32 {
        self.size_a + self.size_b
    }
}

#[derive(Default)]
struct State {
    /// first -> second as entered; both ends are busy
    patches: BTreeMap<u32, u32>,
    received: Vec<String>,
    failures: Vec<(String, String)>,
    delays: Vec<(String, Duration)>,
    connections: usize,
}

impl State {
    fn busy(&self, port: u32) -> bool {
        self.patches.iter().any(|(a, b)| *a == port || *b == port)
    }
}

#[derive(Clone)]
pub struct MockSwitch {
    config: Arc<MockConfig>,
    state: Arc<Mutex<State>>,
}

impl Default for MockSwitch {
    fn default() -> Self {
        Self::new()
    }
}

struct Reply {
    status: String,
    body: Vec<String>,
}

impl Reply {
    fn completed(body: Vec<String>) -> Self {
        Self {
            status: "COMPLD".to_string(),
            body,
        }
    }

    fn deny(code: &str) -> Self {
        Self {
            status: "DENY".to_string(),
            body: vec![code.to_string()],
        }
    }
}

impl MockSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    /// Answer every command starting with `prefix` with `status` instead of
    /// executing it.
    pub async fn fail_commands(&self, prefix: &str, status: &str) {
        self.state
            .lock()
            .await
            .failures
            .push((prefix.to_string(), status.to_string()));
    }

    /// Hold back the reply to commands starting with `prefix`.
    pub async fn delay_commands(&self, prefix: &str, delay: Duration) {
        self.state
            .lock()
            .await
            .delays
            .push((prefix.to_string(), delay));
    }

    pub async fn clear_faults(&self) {
        let mut st = self.state.lock().await;
        st.failures.clear();
        st.delays.clear();
    }

    /// Every command line received so far (all connections, arrival order).
    pub async fn received(&self) -> Vec<String> {
        self.state.lock().await.received.clone()
    }

    /// Current patches as entered (`ENT-PATCH` aid order).
    pub async fn patches(&self) -> Vec<(u32, u32)> {
        self.state
            .lock()
            .await
            .patches
            .iter()
            .map(|(a, b)| (*a, *b))
            .collect()
    }

    /// Pre-load a patch.
    pub async fn add_patch(&self, a: u32, b: u32) {
        self.state.lock().await.patches.insert(a, b);
    }

    /// Number of accepted connections.
    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("mock switch listening on {}", listener.local_addr()?);
        self.run_listener_on(listener).await
    }

    pub async fn run_listener_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            self.state.lock().await.connections += 1;
            tracing::debug!("mock switch: connection from {peer}");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    tracing::debug!("mock switch: connection {peer} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        let mut buf = Vec::new();
        let mut authenticated = false;
        loop {
            buf.clear();
            if reader.read_until(b';', &mut buf).await? == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if line.is_empty() || line == ";" {
                continue;
            }
            let (ctag, reply, delay) = self.respond(&line, &mut authenticated).await;
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            wr.write_all(self.render(&ctag, &reply).as_bytes()).await?;
            wr.flush().await?;
        }
    }

    fn render(&self, ctag: &str, reply: &Reply) -> String {
        let name = self.config.switch_name.as_deref().unwrap_or("( nil )");
        let mut out = format!(
            "\r\n\n   {name} {HEADER_TIMESTAMP}\r\nM  {ctag} {}\r\n",
            reply.status
        );
        for line in &reply.body {
            out.push_str("   ");
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push(';');
        out
    }

    async fn respond(
        &self,
        line: &str,
        authenticated: &mut bool,
    ) -> (String, Reply, Option<Duration>) {
        let mut st = self.state.lock().await;
        st.received.push(line.to_string());

        let body = line.trim_end_matches(';');
        let parts: Vec<&str> = body.split(':').collect();
        let verb = parts.first().copied().unwrap_or_default();
        let tid = parts.get(1).copied().unwrap_or_default();
        let aid = parts.get(2).copied().unwrap_or_default();
        let ctag = parts.get(3).copied().unwrap_or("0").to_string();

        let delay = st
            .delays
            .iter()
            .find(|(p, _)| line.starts_with(p.as_str()))
            .map(|(_, d)| *d);
        if let Some((_, status)) = st.failures.iter().find(|(p, _)| line.starts_with(p.as_str())) {
            let reply = Reply {
                status: status.clone(),
                body: vec!["INJECTED".to_string()],
            };
            return (ctag, reply, delay);
        }

        let cfg = &self.config;
        let expected_tid = cfg.switch_name.as_deref().unwrap_or("");
        if !tid.is_empty() && tid.trim_matches('"') != expected_tid {
            return (ctag, Reply::deny("IITA"), delay);
        }

        let reply = match verb {
            "ACT-USER" => {
                let password = parts.get(5).copied().unwrap_or_default();
                if aid == cfg.user && password == cfg.password {
                    *authenticated = true;
                    Reply::completed(Vec::new())
                } else {
                    Reply::deny("PICC")
                }
            }
            "RTRV-HDR" => Reply::completed(Vec::new()),
            _ if !*authenticated => Reply::deny("PLNA"),
            "RTRV-EQPT" => Reply::completed(vec![format!(
                "\"SYSTEM:SIZE={}x{}\"",
                cfg.size_a, cfg.size_b
            )]),
            "RTRV-INV" => Reply::completed(vec![format!(
                "\"OCS:SN={},PN={}\"",
                cfg.serial, cfg.model
            )]),
            "RTRV-NETYPE" => Reply::completed(vec![format!(
                "\"{},{},{},{}\"",
                cfg.vendor, cfg.model, cfg.hardware_type, cfg.version
            )]),
            "RTRV-PATCH" => Reply::completed(
                st.patches
                    .iter()
                    .map(|(a, b)| format!("\"{a},{b}\""))
                    .collect(),
            ),
            "RTRV-PORT-SHUTTER" | "RTRV-PORT-POWER" | "RTRV-PORT-PMON" => {
                match port_range(aid, cfg.total_ports()) {
                    Some(last) => Reply::completed(
                        (1..=last)
                            .map(|p| port_line(verb, p, cfg, &st))
                            .collect(),
                    ),
                    None => Reply::deny("IIAC"),
                }
            }
            "ENT-PATCH" => match parse_pair(aid) {
                Some((a, b))
                    if a != b
                        && (1..=cfg.total_ports()).contains(&a)
                        && (1..=cfg.total_ports()).contains(&b)
                        && !st.busy(a)
                        && !st.busy(b) =>
                {
                    st.patches.insert(a, b);
                    Reply::completed(Vec::new())
                }
                _ => Reply::deny("IIAC"),
            },
            "DLT-PATCH" => {
                let ports: Vec<u32> = aid.split('&').filter_map(|p| p.parse().ok()).collect();
                if ports.is_empty() {
                    Reply::deny("IIAC")
                } else {
                    st.patches
                        .retain(|a, b| !ports.contains(a) && !ports.contains(b));
                    Reply::completed(Vec::new())
                }
            }
            _ => Reply::deny("ICNV"),
        };
        (ctag, reply, delay)
    }
}

fn parse_pair(aid: &str) -> Option<(u32, u32)> {
    let (a, b) = aid.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// `1&&N` -> `N` when within the switch.
fn port_range(aid: &str, total: u32) -> Option<u32> {
    let (first, last) = aid.split_once("&&")?;
    let first: u32 = first.parse().ok()?;
    let last: u32 = last.parse().ok()?;
    (first == 1 && last >= 1 && last <= total).then_some(last)
}

fn port_line(verb: &str, port: u32, cfg: &MockConfig, st: &State) -> String {
    match verb {
        "RTRV-PORT-SHUTTER" => {
            let state = if cfg.closed_ports.contains(&port) {
                "CLOSED"
            } else {
                "OPEN"
            };
            format!("\"{port}:{state}\"")
        }
        "RTRV-PORT-POWER" => {
            let power = if st.busy(port) { "-3.50" } else { "-60.00" };
            format!("\"{port}:{power}\"")
        }
        _ => format!("\"{port}:1550.00,OK\""),
    }
}
