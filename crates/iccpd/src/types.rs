//! Shared primitive types for iccpd

use std::fmt;
use std::str::FromStr;

/// Maximum length of an interface name carried on the wire, including
/// the terminating padding. Matches the kernel IFNAMSIZ-derived limit
/// used for port names throughout SONiC.
pub const MAX_IFNAME_LEN: usize = 20;

/// Length of the ASCII MAC representation carried in MAC-info TLVs
/// ("aa:bb:cc:dd:ee:ff" plus NUL padding).
pub const MAC_STR_LEN: usize = 18;

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress {
    bytes: [u8; 6],
}

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
            self.bytes[4],
            self.bytes[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address format: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid hex in MAC: {}", part))?;
        }
        Ok(Self { bytes })
    }
}

/// Key of the MAC index: total order over (VLAN, address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacKey {
    pub vlan: u16,
    pub mac: MacAddress,
}

impl MacKey {
    pub fn new(vlan: u16, mac: MacAddress) -> Self {
        Self { vlan, mac }
    }
}

impl fmt::Display for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vlan{}|{}", self.vlan, self.mac)
    }
}
