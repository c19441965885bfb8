//! USB device identity
//!
//! A device is identified by its vendor and product id. The textual id
//! (`"{vendor}:{product}"`, decimal) keys the registry and the preference
//! store; the numeric id correlates permission requests with their results.
//!
//! Two identical adapters share the same identity, and with it the same
//! registry entry and permission token.

use core::fmt;
use core::str::FromStr;

/// Vendor/product identity of a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Create an identity from vendor and product id
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Registry and preference key, `"{vendor}:{product}"` in decimal
    pub fn id(&self) -> String {
        format!("{}:{}", self.vendor_id, self.product_id)
    }

    /// Permission correlation token, `(vendor << 16) | product`
    pub const fn numeric_id(&self) -> u32 {
        ((self.vendor_id as u32) << 16) | self.product_id as u32
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Parse a single id component, hex with `0x` prefix or decimal
fn parse_component(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
    } else {
        s.parse().map_err(|e| format!("invalid id '{}': {}", s, e))
    }
}

impl FromStr for DeviceIdentity {
    type Err = String;

    /// Parse `"vendor:product"`
    ///
    /// Components are decimal (the registry key format) or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid device id '{}' (expected vendor:product)", s))?;
        Ok(Self::new(parse_component(vendor)?, parse_component(product)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_decimal() {
        let ident = DeviceIdentity::new(0x0403, 0x6001);
        assert_eq!(ident.id(), "1027:24577");
        assert_eq!(ident.to_string(), "0403:6001");
    }

    #[test]
    fn test_numeric_id() {
        let ident = DeviceIdentity::new(0x0403, 0x6001);
        assert_eq!(ident.numeric_id(), 0x0403_6001);
        let ident = DeviceIdentity::new(0xFFFF, 0x0001);
        assert_eq!(ident.numeric_id(), 0xFFFF_0001);
    }

    #[test]
    fn test_parse() {
        let a: DeviceIdentity = "1027:24577".parse().unwrap();
        let b: DeviceIdentity = "0x0403:0x6001".parse().unwrap();
        assert_eq!(a, b);
        assert!("1027".parse::<DeviceIdentity>().is_err());
        assert!("abc:1".parse::<DeviceIdentity>().is_err());
    }
}
