//! Advertising data structures and legacy advertising parameters.

use thiserror::Error;

use crate::{AddrKind, BdAddr};

/// LE Limited Discoverable mode flag.
pub const AD_FLAG_LE_LIMITED_DISCOVERABLE: u8 = 0b0000_0001;
/// LE General Discoverable mode flag.
pub const AD_FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0b0000_0010;
/// BR/EDR Not Supported flag.
pub const AD_FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0b0000_0100;

/// Total space available for advertising data in a legacy advertisement.
pub const ADVERTISING_DATA_MAX: usize = 31;

/// One advertising data element: `len, type, value` on the wire.
#[derive(Debug, Clone, Copy)]
pub enum AdStructure<'a> {
    /// Device flags and baseband capabilities (AD type 0x01).
    Flags(u8),
    /// The full device name (AD type 0x09).
    CompleteLocalName(&'a [u8]),
    /// A shortened device name (AD type 0x08).
    ShortenedLocalName(&'a [u8]),
    /// Any other AD type, carried as raw bytes.
    Unknown {
        /// AD type byte.
        ty: u8,
        /// Value transmitted after the type byte.
        data: &'a [u8],
    },
}

/// The assembled elements exceed the 31-byte advertising data field.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("advertising data exceeds {ADVERTISING_DATA_MAX} bytes")]
pub struct TooLong;

/// Assembled advertising data: up to 31 significant bytes.
#[derive(Debug, Clone, Copy)]
pub struct AdvertisingData {
    len: u8,
    data: [u8; ADVERTISING_DATA_MAX],
}

impl AdvertisingData {
    /// Assemble advertising data from its elements.
    pub fn from_structures(structures: &[AdStructure<'_>]) -> Result<Self, TooLong> {
        let mut data = [0; ADVERTISING_DATA_MAX];
        let mut len = 0;
        for ad in structures {
            let (ty, value): (u8, &[u8]) = match ad {
                AdStructure::Flags(flags) => (0x01, std::slice::from_ref(flags)),
                AdStructure::ShortenedLocalName(name) => (0x08, *name),
                AdStructure::CompleteLocalName(name) => (0x09, *name),
                AdStructure::Unknown { ty, data } => (*ty, *data),
            };
            let end = len + 2 + value.len();
            if value.len() > u8::MAX as usize - 1 || end > ADVERTISING_DATA_MAX {
                return Err(TooLong);
            }
            data[len] = value.len() as u8 + 1;
            data[len + 1] = ty;
            data[len + 2..end].copy_from_slice(value);
            len = end;
        }
        Ok(Self {
            len: len as u8,
            data,
        })
    }

    /// Number of significant bytes.
    pub fn significant_len(&self) -> u8 {
        self.len
    }

    /// The significant bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// The full 31-byte field, zero padded.
    pub fn padded(&self) -> &[u8; ADVERTISING_DATA_MAX] {
        &self.data
    }
}

/// Advertising type of a legacy advertisement.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum AdvertisingType {
    /// Connectable and scannable undirected advertising (ADV_IND).
    ConnectableUndirected = 0x00,
    /// Connectable high duty cycle directed advertising.
    ConnectableDirectedHighDuty = 0x01,
    /// Scannable undirected advertising (ADV_SCAN_IND).
    ScannableUndirected = 0x02,
    /// Non-connectable undirected advertising (ADV_NONCONN_IND).
    NonConnectableUndirected = 0x03,
    /// Connectable low duty cycle directed advertising.
    ConnectableDirectedLowDuty = 0x04,
}

/// Source of the advertiser's own address.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OwnAddrKind {
    /// The controller's public device address.
    Public,
    /// The configured random device address.
    Random,
    /// Controller-generated resolvable address, falling back to public.
    ResolvableOrPublic,
    /// Controller-generated resolvable address, falling back to random.
    ResolvableOrRandom,
}

impl From<OwnAddrKind> for u8 {
    fn from(kind: OwnAddrKind) -> Self {
        match kind {
            OwnAddrKind::Public => 0x00,
            OwnAddrKind::Random => 0x01,
            OwnAddrKind::ResolvableOrPublic => 0x02,
            OwnAddrKind::ResolvableOrRandom => 0x03,
        }
    }
}

/// Which of the three primary advertising channels to use.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelMap(pub u8);

impl ChannelMap {
    /// Channel 37.
    pub const CHANNEL_37: ChannelMap = ChannelMap(0b001);
    /// Channel 38.
    pub const CHANNEL_38: ChannelMap = ChannelMap(0b010);
    /// Channel 39.
    pub const CHANNEL_39: ChannelMap = ChannelMap(0b100);
    /// All three primary channels.
    pub const ALL: ChannelMap = ChannelMap(0b111);
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitOr for ChannelMap {
    type Output = ChannelMap;
    fn bitor(self, rhs: ChannelMap) -> ChannelMap {
        ChannelMap(self.0 | rhs.0)
    }
}

/// Scan/connection request filtering while advertising.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum FilterPolicy {
    /// Process scan and connection requests from all devices.
    All = 0x00,
    /// Filter scan requests through the filter accept list.
    FilterScan = 0x01,
    /// Filter connection requests through the filter accept list.
    FilterConnection = 0x02,
    /// Filter both through the filter accept list.
    FilterAll = 0x03,
}

/// Parameters for legacy undirected advertising.
///
/// Intervals are in 0.625 ms units and legal between 0x0020 and 0x4000; the
/// defaults mirror the controller defaults (0x0800, 1.28 s, all channels).
#[derive(Debug, Clone, Copy)]
pub struct AdvertisingParameters {
    /// Minimum advertising interval.
    pub interval_min: u16,
    /// Maximum advertising interval.
    pub interval_max: u16,
    /// Advertising type.
    pub kind: AdvertisingType,
    /// Own address source.
    pub own_addr_kind: OwnAddrKind,
    /// Peer address kind, for directed advertising.
    pub peer_addr_kind: AddrKind,
    /// Peer address, for directed advertising.
    pub peer_addr: BdAddr,
    /// Advertising channel map.
    pub channel_map: ChannelMap,
    /// Filter policy.
    pub filter_policy: FilterPolicy,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            interval_min: 0x0800,
            interval_max: 0x0800,
            kind: AdvertisingType::ConnectableUndirected,
            own_addr_kind: OwnAddrKind::Public,
            peer_addr_kind: AddrKind::Public,
            peer_addr: BdAddr::default(),
            channel_map: ChannelMap::ALL,
            filter_policy: FilterPolicy::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn flags_and_name() {
        let data = AdvertisingData::from_structures(&[
            AdStructure::Flags(AD_FLAG_LE_GENERAL_DISCOVERABLE | AD_FLAG_BR_EDR_NOT_SUPPORTED),
            AdStructure::CompleteLocalName(b"muxer"),
        ])
        .unwrap();
        assert_eq!(data.as_slice(), hex!("02 01 06 06 09 6d 75 78 65 72"));
    }

    #[test]
    fn shortened_name_type() {
        let data =
            AdvertisingData::from_structures(&[AdStructure::ShortenedLocalName(b"mx")]).unwrap();
        assert_eq!(data.as_slice(), hex!("03 08 6d 78"));
    }

    #[test]
    fn exactly_31_bytes_fits() {
        let name = [b'a'; 26];
        let data = AdvertisingData::from_structures(&[
            AdStructure::Flags(AD_FLAG_LE_GENERAL_DISCOVERABLE),
            AdStructure::CompleteLocalName(&name),
        ])
        .unwrap();
        assert_eq!(data.significant_len(), 31);
    }

    #[test]
    fn oversized_data_rejected() {
        let name = [b'a'; 27];
        assert!(matches!(
            AdvertisingData::from_structures(&[
                AdStructure::Flags(AD_FLAG_LE_GENERAL_DISCOVERABLE),
                AdStructure::CompleteLocalName(&name),
            ]),
            Err(TooLong)
        ));
    }
}
