//! Destination codec for the first DATA frame of a session.
//!
//! Wire format: `[type(1)] [addr-bytes: 4 | 16 | len(1)+domain] [port(2, BE)]`
//! with type 1 = IPv4, 2 = IPv6, 3 = domain name. The header is followed
//! inline by the initial upstream payload, so [`header_len`] exists to peel
//! it off.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Address type byte for IPv4.
pub const ADDR_TYPE_IPV4: u8 = 0x01;
/// Address type byte for IPv6.
pub const ADDR_TYPE_IPV6: u8 = 0x02;
/// Address type byte for domain names.
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;

/// A resolved-or-named upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Literal IP address (v4 or v6)
    Ip(IpAddr),
    /// Domain name to be resolved by the dispatcher
    Domain(String),
}

/// Where the client wants this session's upstream traffic to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target address.
    pub address: Address,
    /// Target TCP port.
    pub port: u16,
}

impl Destination {
    /// Parse a destination header from the front of a buffer.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::invalid("destination data too short"));
        }

        match data[0] {
            ADDR_TYPE_IPV4 => {
                if data.len() < 7 {
                    return Err(Error::invalid("IPv4 destination too short"));
                }
                let octets: [u8; 4] = data[1..5].try_into().unwrap();
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok(Self {
                    address: Address::Ip(IpAddr::V4(Ipv4Addr::from(octets))),
                    port,
                })
            }
            ADDR_TYPE_IPV6 => {
                if data.len() < 19 {
                    return Err(Error::invalid("IPv6 destination too short"));
                }
                let octets: [u8; 16] = data[1..17].try_into().unwrap();
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok(Self {
                    address: Address::Ip(IpAddr::V6(Ipv6Addr::from(octets))),
                    port,
                })
            }
            ADDR_TYPE_DOMAIN => {
                let domain_len = data[1] as usize;
                if data.len() < 4 + domain_len {
                    return Err(Error::invalid("domain destination truncated"));
                }
                let domain = std::str::from_utf8(&data[2..2 + domain_len])
                    .map_err(|_| Error::invalid("domain name is not valid UTF-8"))?
                    .to_string();
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok(Self {
                    address: Address::Domain(domain),
                    port,
                })
            }
            other => Err(Error::invalid(format!(
                "unknown address type: 0x{:02x}",
                other
            ))),
        }
    }

    /// Encode this destination into its wire header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(19);
        match &self.address {
            Address::Ip(IpAddr::V4(ip)) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ip(IpAddr::V6(ip)) => {
                buf.push(ADDR_TYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                buf.push(ADDR_TYPE_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Hostname form of the address, suitable for a connect call.
    pub fn host(&self) -> String {
        match &self.address {
            Address::Ip(ip) => ip.to_string(),
            Address::Domain(domain) => domain.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Address::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Address::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

/// Length of the destination header at the front of `data`, used to peel
/// the header off a combined `[header || inline-payload]` first frame.
/// Returns `None` for malformed headers.
pub fn header_len(data: &[u8]) -> Option<usize> {
    match data.first()? {
        &ADDR_TYPE_IPV4 => Some(7),
        &ADDR_TYPE_IPV6 => Some(19),
        &ADDR_TYPE_DOMAIN => {
            let domain_len = *data.get(1)? as usize;
            Some(4 + domain_len)
        }
        _ => None,
    }
}
