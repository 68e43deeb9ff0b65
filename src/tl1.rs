//! TL1 command templates for Polatis switches.
//!
//! `<name>` and `<counter>` are filled in by the device session; `{param}`
//! placeholders are bound by the caller.

pub const COUNTER_PLACEHOLDER: &str = "<counter>";
pub const NAME_PLACEHOLDER: &str = "<name>";

/// Completion status the device reports for a successful command.
pub const STATUS_COMPLETED: &str = "COMPLD";

/// Header text the device reports when no switch name is configured.
pub const NIL_SWITCH_NAME: &str = "( nil )";

pub const ACT_USER: &str = "ACT-USER::{user}:<counter>::{password};";
pub const RTRV_HDR: &str = "RTRV-HDR:::<counter>:;";
pub const RTRV_EQPT_SIZE: &str = "RTRV-EQPT:<name>:SYSTEM:<counter>:::PARAMETER=SIZE;";
pub const RTRV_INV: &str = "RTRV-INV:<name>:OCS:<counter>:;";
pub const RTRV_NETYPE: &str = "RTRV-NETYPE:<name>::<counter>:;";
pub const RTRV_PATCH: &str = "RTRV-PATCH:<name>::<counter>:;";
pub const RTRV_PORT_SHUTTER: &str = "RTRV-PORT-SHUTTER:<name>:1&&{size}:<counter>:;";
pub const RTRV_PORT_POWER: &str = "RTRV-PORT-POWER:<name>:1&&{size}:<counter>:;";
pub const RTRV_PORT_PMON: &str = "RTRV-PORT-PMON:<name>:1&&{size}:<counter>:;";
pub const ENT_PATCH: &str = "ENT-PATCH:<name>:{dst_port},{src_port}:<counter>:;";
pub const DLT_PATCH: &str = "DLT-PATCH:<name>:{port}:<counter>:;";

/// A template plus its bound parameter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub template: &'static str,
    pub params: Vec<(&'static str, String)>,
}

impl DeviceCommand {
    #[must_use]
    pub const fn new(template: &'static str) -> Self {
        Self {
            template,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn bind(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, value.to_string()));
        self
    }

    /// Render the literal line for `counter`, `switch_name` and the bound params.
    ///
    /// Session placeholders are substituted first. `{param}` placeholders are
    /// then replaced in a single left-to-right pass, so bound values are never
    /// themselves re-expanded. Unknown `{...}` text is left as is.
    #[must_use]
    pub fn render(&self, counter: u64, switch_name: &str) -> String {
        let line = self
            .template
            .replace(NAME_PLACEHOLDER, switch_name)
            .replace(COUNTER_PLACEHOLDER, &counter.to_string());

        let mut out = String::with_capacity(line.len());
        let mut rest = line.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let bound = after.find('}').and_then(|close| {
                let key = &after[..close];
                self.params
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| (v, close))
            });
            match bound {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
