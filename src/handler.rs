//! Device-agnostic L1 operations.
//!
//! The dispatcher only ever talks to an `L1Handler`; a device model plugs in
//! by implementing it. Port addresses are resource paths such as
//! `192.168.42.240/12`.

use async_trait::async_trait;

use crate::error::L1Error;
use crate::resource::ResourceInfo;

#[async_trait]
pub trait L1Handler: Send + Sync {
    /// Open a device session, replacing any existing one.
    async fn login(&self, address: &str, user: &str, password: &str) -> Result<(), L1Error>;

    /// Close the device session. No-op when not logged in.
    async fn logout(&self) -> Result<(), L1Error>;

    async fn get_resource_description(&self, address: &str) -> Result<ResourceInfo, L1Error>;

    /// Value of one attribute of the resource at `address`.
    async fn get_attribute_value(&self, address: &str, attribute: &str)
        -> Result<String, L1Error>;

    async fn set_state_id(&self, state_id: &str) -> Result<(), L1Error>;

    async fn get_state_id(&self) -> Result<String, L1Error>;

    async fn map_bidi(&self, port_a: &str, port_b: &str, group: &str) -> Result<(), L1Error>;

    async fn map_uni(&self, src_port: &str, dst_port: &str) -> Result<(), L1Error>;

    async fn map_clear(&self, port_a: &str, port_b: &str) -> Result<(), L1Error>;

    async fn map_clear_to(&self, src_port: &str, dst_port: &str) -> Result<(), L1Error>;

    async fn set_speed_manual(
        &self,
        src_port: &str,
        dst_port: &str,
        speed: &str,
        duplex: &str,
    ) -> Result<(), L1Error>;
}

/// Port number from a port address: the text after the last `/`.
///
/// # Errors
///
/// `L1Error::InvalidPort` when there is no `/` or the segment is not a
/// positive integer.
pub fn port_number(address: &str) -> Result<u32, L1Error> {
    let (_, last) = address
        .rsplit_once('/')
        .ok_or_else(|| L1Error::InvalidPort(address.to_string()))?;
    match last.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(L1Error::InvalidPort(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_number_uses_last_segment() {
        assert_eq!(port_number("10.0.0.1/12").ok(), Some(12));
        assert_eq!(port_number("10.0.0.1/blade/3").ok(), Some(3));
    }

    #[test]
    fn port_number_rejects_bad_segments() {
        for bad in ["10.0.0.1", "10.0.0.1/", "10.0.0.1/x", "10.0.0.1/0", "10.0.0.1/-2"] {
            assert!(
                matches!(port_number(bad), Err(L1Error::InvalidPort(_))),
                "{bad}"
            );
        }
    }
}
