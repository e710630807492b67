//! MS/TP frame types and codec.

use std::fmt;

use crate::datalink::{DataLinkError, Result};
use crate::util::{crc16_mstp, crc8_header};

/// MS/TP frame preamble bytes
pub const MSTP_PREAMBLE_55: u8 = 0x55;
pub const MSTP_PREAMBLE_FF: u8 = 0xFF;

/// Maximum MS/TP data length
pub const MSTP_MAX_DATA_LENGTH: usize = 501;

/// MS/TP frame size up to and including the header CRC
pub const MSTP_HEADER_SIZE: usize = 8;

/// MS/TP maximum frame size
pub const MSTP_MAX_FRAME_SIZE: usize = MSTP_HEADER_SIZE + MSTP_MAX_DATA_LENGTH + 2;

/// Destination address reserved for broadcast
pub const MSTP_BROADCAST_ADDRESS: u8 = 0xFF;

/// Highest station address a master node may occupy
pub const MSTP_MAX_MASTER: u8 = 127;

/// MS/TP frame types
///
/// Octet values above 7 are proprietary; the framing layer accepts them but
/// the state machine drops frames it cannot dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FrameType {
    /// Token frame
    Token = 0,
    /// Poll For Master frame
    PollForMaster = 1,
    /// Reply To Poll For Master frame
    ReplyToPollForMaster = 2,
    /// Test Request frame
    TestRequest = 3,
    /// Test Response frame
    TestResponse = 4,
    /// BACnet Data Expecting Reply frame
    BacnetDataExpectingReply = 5,
    /// BACnet Data Not Expecting Reply frame
    BacnetDataNotExpectingReply = 6,
    /// Reply Postponed frame
    ReplyPostponed = 7,
}

impl FrameType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Token),
            1 => Some(Self::PollForMaster),
            2 => Some(Self::ReplyToPollForMaster),
            3 => Some(Self::TestRequest),
            4 => Some(Self::TestResponse),
            5 => Some(Self::BacnetDataExpectingReply),
            6 => Some(Self::BacnetDataNotExpectingReply),
            7 => Some(Self::ReplyPostponed),
            _ => None,
        }
    }

    /// True for the two frame types that solicit an immediate reply.
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::TestRequest | Self::BacnetDataExpectingReply)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Token => "Token",
            Self::PollForMaster => "PollForMaster",
            Self::ReplyToPollForMaster => "ReplyToPollForMaster",
            Self::TestRequest => "TestRequest",
            Self::TestResponse => "TestResponse",
            Self::BacnetDataExpectingReply => "DataExpectingReply",
            Self::BacnetDataNotExpectingReply => "DataNotExpectingReply",
            Self::ReplyPostponed => "ReplyPostponed",
        };
        f.write_str(name)
    }
}

/// An MS/TP frame, either parsed off the wire or built for transmission.
///
/// The raw type octet is kept so proprietary frames survive the framing
/// layer; [`Frame::frame_type`] returns `None` for them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    type_octet: u8,
    /// Destination address
    pub destination: u8,
    /// Source address
    pub source: u8,
    /// Frame data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new MS/TP frame
    pub fn new(frame_type: FrameType, destination: u8, source: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::InvalidFrame);
        }

        Ok(Self {
            type_octet: frame_type as u8,
            destination,
            source,
            data,
        })
    }

    /// Create a token frame
    pub fn token(destination: u8, source: u8) -> Self {
        Self {
            type_octet: FrameType::Token as u8,
            destination,
            source,
            data: Vec::new(),
        }
    }

    /// Create a poll for master frame
    pub fn poll_for_master(destination: u8, source: u8) -> Self {
        Self {
            type_octet: FrameType::PollForMaster as u8,
            destination,
            source,
            data: Vec::new(),
        }
    }

    /// Create a reply to poll for master frame
    pub fn reply_to_poll_for_master(destination: u8, source: u8) -> Self {
        Self {
            type_octet: FrameType::ReplyToPollForMaster as u8,
            destination,
            source,
            data: Vec::new(),
        }
    }

    /// Create a reply postponed frame
    pub fn reply_postponed(destination: u8, source: u8) -> Self {
        Self {
            type_octet: FrameType::ReplyPostponed as u8,
            destination,
            source,
            data: Vec::new(),
        }
    }

    pub(crate) fn from_wire(type_octet: u8, destination: u8, source: u8, data: Vec<u8>) -> Self {
        Self {
            type_octet,
            destination,
            source,
            data,
        }
    }

    /// The frame type, or `None` for proprietary type octets.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.type_octet)
    }

    /// The raw frame type octet.
    pub fn type_octet(&self) -> u8 {
        self.type_octet
    }

    /// True iff the frame is addressed to `station`.
    pub fn for_station(&self, station: u8) -> bool {
        self.destination == station
    }

    /// True iff the frame is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.destination == MSTP_BROADCAST_ADDRESS
    }

    /// True iff the frame is addressed to `station` or broadcast.
    pub fn for_station_or_broadcast(&self, station: u8) -> bool {
        self.for_station(station) || self.is_broadcast()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut octets = Vec::with_capacity(MSTP_HEADER_SIZE + self.data.len() + 2);
        self.encode_into(&mut octets);
        octets
    }

    /// Encode the frame, appending to `octets`.
    pub fn encode_into(&self, octets: &mut Vec<u8>) {
        octets.push(MSTP_PREAMBLE_55);
        octets.push(MSTP_PREAMBLE_FF);

        let data_length = self.data.len() as u16;
        let header = [
            self.type_octet,
            self.destination,
            self.source,
            (data_length >> 8) as u8,
            (data_length & 0xFF) as u8,
        ];
        octets.extend_from_slice(&header);
        octets.push(crc8_header(&header));

        if !self.data.is_empty() {
            octets.extend_from_slice(&self.data);

            // Data CRC, low octet first
            let crc = crc16_mstp(&self.data);
            octets.push((crc & 0xFF) as u8);
            octets.push((crc >> 8) as u8);
        }
    }

    /// Decode frame from bytes
    ///
    /// Expects exactly one whole frame including the preamble. The receiver
    /// parses the live octet stream incrementally instead; this entry point
    /// serves tests and diagnostics.
    pub fn decode(octets: &[u8]) -> Result<Self> {
        if octets.len() < MSTP_HEADER_SIZE {
            return Err(DataLinkError::InvalidFrame);
        }

        if octets[0] != MSTP_PREAMBLE_55 || octets[1] != MSTP_PREAMBLE_FF {
            return Err(DataLinkError::InvalidFrame);
        }

        let header = [octets[2], octets[3], octets[4], octets[5], octets[6]];
        if crc8_header(&header) != octets[7] {
            return Err(DataLinkError::CrcError);
        }

        let data_length = ((octets[5] as usize) << 8) | (octets[6] as usize);
        if data_length > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::InvalidFrame);
        }

        let expected = MSTP_HEADER_SIZE + data_length + if data_length > 0 { 2 } else { 0 };
        if octets.len() != expected {
            return Err(DataLinkError::InvalidFrame);
        }

        let data = if data_length > 0 {
            let data_end = MSTP_HEADER_SIZE + data_length;
            let data = octets[MSTP_HEADER_SIZE..data_end].to_vec();

            let received = u16::from_le_bytes([octets[data_end], octets[data_end + 1]]);
            if crc16_mstp(&data) != received {
                return Err(DataLinkError::CrcError);
            }

            data
        } else {
            Vec::new()
        };

        Ok(Self::from_wire(octets[2], octets[3], octets[4], data))
    }
}
