use core::net::Ipv4Addr;

use thiserror::Error;

use crate::frame::FrameView;

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_P_IPV4: u16 = 0x0800;
pub const IPV4_MIN_HEADER_LEN: usize = 20;

const ETH_TYPE_OFFSET: usize = 12;
const IPV4_SRC_OFFSET: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ParseError {
    /// A header does not fully fit in the received buffer.
    #[error("header does not fit in frame")]
    Incomplete,
    /// Ethertype other than IPv4.
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedProtocol(u16),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EthernetHeader {
    pub destination: [u8; 6],
    pub source: [u8; 6],
    /// Host-order value of the big-endian ethertype field.
    pub ether_type: u16,
}

impl EthernetHeader {
    pub fn is_ipv4(&self) -> bool {
        self.ether_type == ETH_P_IPV4
    }
}

pub fn parse_ethernet<F: FrameView>(frame: &F) -> Result<EthernetHeader, ParseError> {
    if !frame.fits(0, ETH_HDR_LEN) {
        return Err(ParseError::Incomplete);
    }
    let raw = frame.read::<ETH_HDR_LEN>(0).ok_or(ParseError::Incomplete)?;

    let mut destination = [0u8; 6];
    let mut source = [0u8; 6];
    destination.copy_from_slice(&raw[0..6]);
    source.copy_from_slice(&raw[6..12]);
    let ether_type = u16::from_be_bytes([raw[ETH_TYPE_OFFSET], raw[ETH_TYPE_OFFSET + 1]]);

    Ok(EthernetHeader {
        destination,
        source,
        ether_type,
    })
}

/// Source address from the fixed 20-byte IPv4 header following Ethernet.
///
/// IHL and options are not looked at: only the fixed portion has to fit.
pub fn parse_ipv4_source<F: FrameView>(frame: &F) -> Result<Ipv4Addr, ParseError> {
    if !frame.fits(ETH_HDR_LEN, IPV4_MIN_HEADER_LEN) {
        return Err(ParseError::Incomplete);
    }
    let octets = frame
        .read::<4>(ETH_HDR_LEN + IPV4_SRC_OFFSET)
        .ok_or(ParseError::Incomplete)?;
    Ok(Ipv4Addr::from(octets))
}
