//! Polatis optical switch handler.
//!
//! An AxB Polatis switch has `A + B` physical ports. In logical port mode the
//! controller sees `L = min(A, B)` ports and logical port `p` stands for the
//! physical pair `p` (ingress side) and `p + L` (egress side); a
//! bidirectional mapping between `a` and `b` is then two patches,
//! `a -> b + L` and `b -> a + L`. Physical port mode presents all ports 1:1.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Config, PortMode};
use crate::error::L1Error;
use crate::handler::{port_number, L1Handler};
use crate::resource::{AttributeType, ResourceInfo};
use crate::session::{Connector, DeviceSession, TcpConnector};
use crate::tl1::{self, DeviceCommand};

pub const SWITCH_FAMILY: &str = "L1 Optical Switch";
pub const SWITCH_MODEL: &str = "Polatis";
pub const PORT_FAMILY: &str = "L1 Optical Switch Port";
pub const PORT_MODEL: &str = "Port Polatis";

const UNI_IN_PHYSICAL_MODE: &str =
    "Unidirectional connection is not available in physical port mode";

macro_rules! lazy_regex {
    ($name:ident, $re:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($re).expect(stringify!($name)));
    };
}

lazy_regex!(SIZE_RE, r"SYSTEM:SIZE=(\d+)x(\d+)");
lazy_regex!(SERIAL_RE, r"SN=(\w+)");
lazy_regex!(NETYPE_QUOTED_RE, r#""(.*),(.*),(.*),(.*)""#);
lazy_regex!(NETYPE_BARE_RE, r"(.*),(.*),(.*),(.*)");
lazy_regex!(PATCH_RE, r#""(\d+),(\d+)""#);
lazy_regex!(PORT_VALUE_RE, r#""(\d+):(\S+)""#);
lazy_regex!(WAVELENGTH_RE, r#""(\d+):(\S+?),.*""#);

/// Port counts from `SYSTEM:SIZE=AxB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSize {
    pub total: u32,
    pub logical: u32,
}

impl DeviceSize {
    #[must_use]
    pub fn new(a: u32, b: u32) -> Self {
        Self {
            total: a.saturating_add(b),
            logical: a.min(b),
        }
    }

    /// Parse an `RTRV-EQPT ... PARAMETER=SIZE` reply.
    ///
    /// # Errors
    ///
    /// `L1Error::Parse` when the reply has no `SYSTEM:SIZE=AxB`.
    pub fn parse(reply: &str) -> Result<Self, L1Error> {
        let caps = SIZE_RE
            .captures(reply)
            .ok_or_else(|| L1Error::Parse(format!("Unable to determine system size: {reply}")))?;
        let a: u32 = caps[1]
            .parse()
            .map_err(|e| L1Error::Parse(format!("system size {}: {e}", &caps[1])))?;
        let b: u32 = caps[2]
            .parse()
            .map_err(|e| L1Error::Parse(format!("system size {}: {e}", &caps[2])))?;
        if a.checked_add(b).is_none() {
            return Err(L1Error::Parse(format!("system size {a}x{b} out of range")));
        }
        Ok(Self::new(a, b))
    }

    /// Number of ports presented to the controller.
    #[must_use]
    pub const fn port_count(&self, mode: PortMode) -> u32 {
        match mode {
            PortMode::Logical => self.logical,
            PortMode::Physical => self.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeType {
    pub vendor: String,
    pub model: String,
    pub hardware_type: String,
    pub version: String,
}

/// Everything the inventory queries returned, keyed by physical port.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub serial: String,
    pub netype: Option<NeType>,
    pub patches: BTreeMap<u32, u32>,
    pub shutters: HashMap<u32, String>,
    pub power: HashMap<u32, String>,
    pub wavelength: HashMap<u32, String>,
}

#[must_use]
pub fn parse_serial(reply: &str) -> String {
    match SERIAL_RE.captures(reply) {
        Some(c) => c[1].to_string(),
        None => {
            warn!("Failed to extract serial number: {reply}");
            "-1".to_string()
        }
    }
}

#[must_use]
pub fn parse_netype(reply: &str) -> Option<NeType> {
    let caps = NETYPE_QUOTED_RE
        .captures(reply)
        .or_else(|| NETYPE_BARE_RE.captures(reply));
    match caps {
        Some(c) => Some(NeType {
            vendor: c[1].to_string(),
            model: c[2].to_string(),
            hardware_type: c[3].to_string(),
            version: c[4].to_string(),
        }),
        None => {
            warn!("Unable to parse system info: {reply}");
            None
        }
    }
}

/// Patch list as a symmetric map (both ends point at each other).
#[must_use]
pub fn parse_patches(reply: &str) -> BTreeMap<u32, u32> {
    let mut map = BTreeMap::new();
    for c in PATCH_RE.captures_iter(reply) {
        if let (Ok(a), Ok(b)) = (c[1].parse::<u32>(), c[2].parse::<u32>()) {
            map.insert(a, b);
            map.insert(b, a);
        }
    }
    map
}

/// Fold physical patches onto logical ports: an egress end `p + L` belongs
/// to logical port `p`.
#[must_use]
pub fn fold_patches(patches: &BTreeMap<u32, u32>, logical: u32) -> BTreeMap<u32, u32> {
    let mut folded = BTreeMap::new();
    for (&src, &dst) in patches {
        if src > logical {
            folded.insert(src - logical, dst);
        } else if dst > logical {
            folded.insert(dst - logical, src);
        }
    }
    folded
}

fn parse_port_values(re: &Regex, reply: &str) -> HashMap<u32, String> {
    re.captures_iter(reply)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].to_string())))
        .collect()
}

#[must_use]
pub fn parse_port_states(reply: &str) -> HashMap<u32, String> {
    parse_port_values(&PORT_VALUE_RE, reply)
}

#[must_use]
pub fn parse_wavelengths(reply: &str) -> HashMap<u32, String> {
    parse_port_values(&WAVELENGTH_RE, reply)
}

impl Inventory {
    /// Build the chassis resource with one child per presented port.
    #[must_use]
    pub fn to_resource(&self, address: &str, size: DeviceSize, mode: PortMode) -> ResourceInfo {
        let mut chassis = ResourceInfo::new("", address, SWITCH_FAMILY, SWITCH_MODEL)
            .with_serial(self.serial.clone());
        if let Some(ne) = &self.netype {
            chassis.set_attribute("Vendor", &ne.vendor, AttributeType::String);
            chassis.set_attribute("Hardware Type", &ne.hardware_type, AttributeType::String);
            chassis.set_attribute("Version", &ne.version, AttributeType::String);
            chassis.set_attribute("Model", &ne.model, AttributeType::String);
        }

        let connections = match mode {
            PortMode::Logical => fold_patches(&self.patches, size.logical),
            PortMode::Physical => self.patches.clone(),
        };
        let id_width = size.total.to_string().len();
        let zero = || "0".to_string();

        for n in 1..=size.port_count(mode) {
            let map_path = connections.get(&n).map(|p| format!("{address}/{p}"));
            let mut port = ResourceInfo::new(
                format!("Port {n:0id_width$}"),
                format!("{address}/{n}"),
                PORT_FAMILY,
                PORT_MODEL,
            )
            .with_serial(format!("{}.{n}", self.serial))
            .with_map_path(map_path);

            let open = self
                .shutters
                .get(&n)
                .map_or(true, |s| s.eq_ignore_ascii_case("open"));
            port.set_attribute("State", u8::from(!open), AttributeType::Lookup);
            port.set_attribute("Protocol Type", 0, AttributeType::Lookup);
            port.set_attribute(
                "Wavelength",
                self.wavelength.get(&n).cloned().unwrap_or_else(zero),
                AttributeType::Double,
            );

            let (tx, rx) = match mode {
                PortMode::Logical => (
                    self.power.get(&n).cloned(),
                    self.power.get(&(n + size.logical)).cloned(),
                ),
                PortMode::Physical if n <= size.logical => (self.power.get(&n).cloned(), None),
                PortMode::Physical => (None, self.power.get(&n).cloned()),
            };
            port.set_attribute(
                "Tx Power (dBm)",
                tx.unwrap_or_else(zero),
                AttributeType::Double,
            );
            port.set_attribute(
                "Rx Power (dBm)",
                rx.unwrap_or_else(zero),
                AttributeType::Double,
            );
            chassis.add_child(port);
        }
        chassis
    }
}

/// Logged-in switch: the session plus what was learned through it.
struct Device<C: Connector> {
    session: DeviceSession<C>,
    size: Option<DeviceSize>,
    description: Option<ResourceInfo>,
}

impl<C: Connector> Device<C> {
    fn new(session: DeviceSession<C>) -> Self {
        Self {
            session,
            size: None,
            description: None,
        }
    }

    async fn run(&mut self, command: DeviceCommand) -> Result<String, L1Error> {
        self.session.execute(&command).await
    }

    async fn size(&mut self) -> Result<DeviceSize, L1Error> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let reply = self.run(DeviceCommand::new(tl1::RTRV_EQPT_SIZE)).await?;
        let size = DeviceSize::parse(&reply)?;
        debug!("device size: total={} logical={}", size.total, size.logical);
        self.size = Some(size);
        Ok(size)
    }

    /// Per-port query whose device-side rejection only costs that column.
    async fn port_query(
        &mut self,
        template: &'static str,
        size: u32,
        parse: fn(&str) -> HashMap<u32, String>,
    ) -> Result<HashMap<u32, String>, L1Error> {
        match self.run(DeviceCommand::new(template).bind("size", size)).await {
            Ok(reply) => Ok(parse(&reply)),
            Err(e) if e.is_transport() || matches!(e, L1Error::DeviceTimeout { .. }) => Err(e),
            Err(e) => {
                warn!("port query failed, continuing without it: {e}");
                Ok(HashMap::new())
            }
        }
    }

    async fn inventory(&mut self, size: DeviceSize) -> Result<Inventory, L1Error> {
        let serial = parse_serial(&self.run(DeviceCommand::new(tl1::RTRV_INV)).await?);
        let netype = parse_netype(&self.run(DeviceCommand::new(tl1::RTRV_NETYPE)).await?);
        let patches = parse_patches(&self.run(DeviceCommand::new(tl1::RTRV_PATCH)).await?);
        let shutters = self
            .port_query(tl1::RTRV_PORT_SHUTTER, size.total, parse_port_states)
            .await?;
        let power = self
            .port_query(tl1::RTRV_PORT_POWER, size.total, parse_port_states)
            .await?;
        let wavelength = self
            .port_query(tl1::RTRV_PORT_PMON, size.total, parse_wavelengths)
            .await?;
        Ok(Inventory {
            serial,
            netype,
            patches,
            shutters,
            power,
            wavelength,
        })
    }

    async fn describe(&mut self, address: &str, mode: PortMode) -> Result<ResourceInfo, L1Error> {
        let size = self.size().await?;
        let info = self.inventory(size).await?.to_resource(address, size, mode);
        self.description = Some(info.clone());
        Ok(info)
    }

    /// Device size, once every port is known to exist in the numbering
    /// presented for `mode`.
    async fn checked_size(
        &mut self,
        mode: PortMode,
        ports: &[(&str, u32)],
    ) -> Result<DeviceSize, L1Error> {
        let size = self.size().await?;
        let count = size.port_count(mode);
        match ports.iter().find(|(_, n)| *n > count) {
            Some((address, _)) => Err(L1Error::InvalidPort(format!(
                "{address} (switch presents {count} ports)"
            ))),
            None => Ok(size),
        }
    }

    async fn patch(&mut self, src_port: u32, dst_port: u32) -> Result<(), L1Error> {
        self.description = None;
        let cmd = DeviceCommand::new(tl1::ENT_PATCH)
            .bind("src_port", src_port)
            .bind("dst_port", dst_port);
        self.run(cmd).await.map(drop)
    }

    async fn unpatch(&mut self, port: impl ToString) -> Result<(), L1Error> {
        self.description = None;
        self.run(DeviceCommand::new(tl1::DLT_PATCH).bind("port", port))
            .await
            .map(drop)
    }
}

pub struct PolatisHandler<C: Connector + Clone = TcpConnector> {
    connector: C,
    port_mode: PortMode,
    reply_timeout: Option<Duration>,
    device: Mutex<Option<Device<C>>>,
    state_id: RwLock<String>,
}

impl PolatisHandler<TcpConnector> {
    /// Handler talking TCP to the configured device port.
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        let connector =
            TcpConnector::new(cfg.device_port).with_connect_timeout(cfg.connect_timeout());
        Self::new(connector, cfg.port_mode).with_reply_timeout(cfg.reply_timeout())
    }
}

impl<C: Connector + Clone> PolatisHandler<C> {
    pub fn new(connector: C, port_mode: PortMode) -> Self {
        Self {
            connector,
            port_mode,
            reply_timeout: None,
            device: Mutex::new(None),
            state_id: RwLock::new("-1".to_string()),
        }
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn port_mode(&self) -> PortMode {
        self.port_mode
    }

    pub async fn is_logged_in(&self) -> bool {
        self.device.lock().await.is_some()
    }
}

fn not_logged_in<C: Connector>(device: &mut Option<Device<C>>) -> Result<&mut Device<C>, L1Error> {
    device.as_mut().ok_or(L1Error::NotLoggedIn)
}

#[async_trait]
impl<C: Connector + Clone + 'static> L1Handler for PolatisHandler<C> {
    async fn login(&self, address: &str, user: &str, password: &str) -> Result<(), L1Error> {
        info!("Login called for {address}");
        let mut guard = self.device.lock().await;
        if let Some(mut old) = guard.take() {
            old.session.disconnect().await;
        }
        let mut session =
            DeviceSession::new(self.connector.clone()).with_reply_timeout(self.reply_timeout);
        session.connect(address, user, password).await?;
        *guard = Some(Device::new(session));
        Ok(())
    }

    async fn logout(&self) -> Result<(), L1Error> {
        info!("Logout called");
        if let Some(mut device) = self.device.lock().await.take() {
            device.session.disconnect().await;
        }
        Ok(())
    }

    async fn get_resource_description(&self, address: &str) -> Result<ResourceInfo, L1Error> {
        info!("get_resource_description {address}");
        let mut guard = self.device.lock().await;
        not_logged_in(&mut guard)?
            .describe(address, self.port_mode)
            .await
    }

    async fn get_attribute_value(&self, address: &str, attribute: &str) -> Result<String, L1Error> {
        info!("get_attribute_value {address} {attribute}");
        let mut guard = self.device.lock().await;
        let device = not_logged_in(&mut guard)?;

        let cached = device
            .description
            .as_ref()
            .and_then(|d| d.find(address))
            .is_some();
        if !cached {
            let chassis = address.split('/').next().unwrap_or(address);
            device.describe(chassis, self.port_mode).await?;
        }
        let resource = device
            .description
            .as_ref()
            .and_then(|d| d.find(address))
            .ok_or_else(|| L1Error::Unsupported(format!("unknown resource {address}")))?;
        resource
            .attribute(attribute)
            .map(str::to_string)
            .ok_or_else(|| {
                L1Error::Unsupported(format!("attribute {attribute} not found on {address}"))
            })
    }

    async fn set_state_id(&self, state_id: &str) -> Result<(), L1Error> {
        info!("set_state_id {state_id}");
        *self.state_id.write().await = state_id.to_string();
        Ok(())
    }

    async fn get_state_id(&self) -> Result<String, L1Error> {
        Ok(self.state_id.read().await.clone())
    }

    async fn map_bidi(&self, port_a: &str, port_b: &str, group: &str) -> Result<(), L1Error> {
        info!("map_bidi {port_a} {port_b} group={group}");
        let a = port_number(port_a)?;
        let b = port_number(port_b)?;
        let mut guard = self.device.lock().await;
        let device = not_logged_in(&mut guard)?;
        let size = device
            .checked_size(self.port_mode, &[(port_a, a), (port_b, b)])
            .await?;
        match self.port_mode {
            PortMode::Logical => {
                let l = size.logical;
                device.patch(a + l, b).await?;
                device.patch(b + l, a).await
            }
            PortMode::Physical => device.patch(a.max(b), a.min(b)).await,
        }
    }

    async fn map_uni(&self, src_port: &str, dst_port: &str) -> Result<(), L1Error> {
        info!("map_uni {src_port} {dst_port}");
        if self.port_mode == PortMode::Physical {
            return Err(L1Error::Unsupported(UNI_IN_PHYSICAL_MODE.to_string()));
        }
        let src = port_number(src_port)?;
        let dst = port_number(dst_port)?;
        let mut guard = self.device.lock().await;
        let device = not_logged_in(&mut guard)?;
        let l = device
            .checked_size(self.port_mode, &[(src_port, src), (dst_port, dst)])
            .await?
            .logical;
        device.patch(src + l, dst).await
    }

    async fn map_clear(&self, port_a: &str, port_b: &str) -> Result<(), L1Error> {
        info!("map_clear {port_a} {port_b}");
        let a = port_number(port_a)?;
        let b = port_number(port_b)?;
        let mut guard = self.device.lock().await;
        let device = not_logged_in(&mut guard)?;
        let size = device
            .checked_size(self.port_mode, &[(port_a, a), (port_b, b)])
            .await?;
        match self.port_mode {
            PortMode::Logical => {
                let l = size.logical;
                for p in [a, b] {
                    device.unpatch(format!("{p}&{}", p + l)).await?;
                }
                Ok(())
            }
            PortMode::Physical => device.unpatch(a.min(b)).await,
        }
    }

    async fn map_clear_to(&self, src_port: &str, dst_port: &str) -> Result<(), L1Error> {
        info!("map_clear_to {src_port} {dst_port}");
        let src = port_number(src_port)?;
        let dst = port_number(dst_port)?;
        let port = match self.port_mode {
            PortMode::Logical => dst,
            PortMode::Physical => src.min(dst),
        };
        let mut guard = self.device.lock().await;
        let device = not_logged_in(&mut guard)?;
        device
            .checked_size(self.port_mode, &[(src_port, src), (dst_port, dst)])
            .await?;
        device.unpatch(port).await
    }

    async fn set_speed_manual(
        &self,
        src_port: &str,
        dst_port: &str,
        speed: &str,
        duplex: &str,
    ) -> Result<(), L1Error> {
        info!("set_speed_manual {src_port} {dst_port} {speed} {duplex}");
        Ok(())
    }
}
