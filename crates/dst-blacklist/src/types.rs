//! Keys, protocols and reason flags

use std::fmt;
use std::net::IpAddr;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

use crate::error::{BlacklistError, Result};

/// Transport protocol of a destination
///
/// `Any` is the wildcard: stored, it shadows every protocol for the same
/// address and port; queried, it matches whatever protocol is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(rename = "*")]
    Any,
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Protocol {
    /// Decode a numeric protocol value
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Protocol::Any),
            1 => Ok(Protocol::Udp),
            2 => Ok(Protocol::Tcp),
            3 => Ok(Protocol::Tls),
            4 => Ok(Protocol::Sctp),
            5 => Ok(Protocol::Ws),
            6 => Ok(Protocol::Wss),
            other => Err(BlacklistError::UnknownProtocol(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Protocol::Any => 0,
            Protocol::Udp => 1,
            Protocol::Tcp => 2,
            Protocol::Tls => 3,
            Protocol::Sctp => 4,
            Protocol::Ws => 5,
            Protocol::Wss => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Any => "*",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Sctp => "sctp",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    /// Wildcard-aware protocol match
    pub fn matches(self, other: Protocol) -> bool {
        self == Protocol::Any || other == Protocol::Any || self == other
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a destination was blacklisted, plus the address family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlacklistFlags(u8);

impl BlacklistFlags {
    pub const NONE: BlacklistFlags = BlacklistFlags(0);
    /// Sending failed
    pub const SEND_ERROR: BlacklistFlags = BlacklistFlags(0x01);
    /// Connection could not be established
    pub const CONNECT_ERROR: BlacklistFlags = BlacklistFlags(0x02);
    /// An ICMP error was received for the destination
    pub const ICMP_RECEIVED: BlacklistFlags = BlacklistFlags(0x04);
    /// The transaction timed out
    pub const TIMEOUT: BlacklistFlags = BlacklistFlags(0x08);
    /// The peer answered 503
    pub const ERROR_503: BlacklistFlags = BlacklistFlags(0x10);
    /// ICMP administratively prohibited
    pub const ADMIN_PROHIBITED: BlacklistFlags = BlacklistFlags(0x20);
    /// Survives `flush`
    pub const PERMANENT: BlacklistFlags = BlacklistFlags(0x40);
    /// Address family tag, set by the table for IPv6 entries
    pub const IS_IPV6: BlacklistFlags = BlacklistFlags(0x80);

    pub const fn from_bits(bits: u8) -> Self {
        BlacklistFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: BlacklistFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The flags without the address family tag
    pub const fn reasons(self) -> BlacklistFlags {
        BlacklistFlags(self.0 & !Self::IS_IPV6.0)
    }
}

impl BitOr for BlacklistFlags {
    type Output = BlacklistFlags;

    fn bitor(self, rhs: Self) -> Self {
        BlacklistFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BlacklistFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for BlacklistFlags {
    type Output = BlacklistFlags;

    fn bitand(self, rhs: Self) -> Self {
        BlacklistFlags(self.0 & rhs.0)
    }
}

impl Not for BlacklistFlags {
    type Output = BlacklistFlags;

    fn not(self) -> Self {
        BlacklistFlags(!self.0)
    }
}

impl fmt::Display for BlacklistFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A network destination: protocol, address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub protocol: Protocol,
    pub addr: IpAddr,
    pub port: u16,
}

impl Destination {
    pub fn new(protocol: Protocol, addr: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            addr,
            port,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(ip) => write!(f, "{}:{}:{}", self.protocol, ip, self.port),
            IpAddr::V6(ip) => write!(f, "{}:[{}]:{}", self.protocol, ip, self.port),
        }
    }
}

/// Storage size of an IPv4 entry
pub const ENTRY_BASE_SIZE: usize = 24;

/// Extra storage an IPv6 entry needs for its longer address
pub const IPV6_EXTRA_SIZE: usize = 12;

/// Bytes an entry for `addr` accounts for against the budget
pub fn entry_size(addr: &IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => ENTRY_BASE_SIZE,
        IpAddr::V6(_) => ENTRY_BASE_SIZE + IPV6_EXTRA_SIZE,
    }
}
