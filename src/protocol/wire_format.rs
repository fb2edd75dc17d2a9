//! Wire format encoding and decoding.
//!
//! Implements the JT/T 808 frame layout:
//! ```text
//! ┌──────┬────────┬────────────┬─────────┬───────────┬────────┬─────────────┬──────┬──────┬──────┐
//! │ 0x7e │ Msg ID │ Attributes │ Version │ Phone     │ Serial │ Sub-package │ Body │ XOR  │ 0x7e │
//! │      │ 2 bytes│ 2 bytes    │ 1 byte  │ 6/10 BCD  │ 2 bytes│ 0/4 bytes   │ N    │ 1    │      │
//! └──────┴────────┴────────────┴─────────┴───────────┴────────┴─────────────┴──────┴──────┴──────┘
//! ```
//!
//! The version byte and the 10-byte phone only exist when the version bit of
//! the attributes is set (2019 revision). Everything between the delimiters is
//! escaped on the wire. All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GatewayError, Result};

/// Frame delimiter.
pub const DELIMITER: u8 = 0x7e;

/// Escape byte.
pub const ESCAPE: u8 = 0x7d;

/// Maximum body length a single frame can declare (10 bits).
pub const MAX_BODY_LENGTH: usize = 0x03ff;

/// Header size for the 2011/2013 revision without sub-package fields.
pub const HEADER_SIZE_2013: usize = 12;

/// Header size for the 2019 revision without sub-package fields.
pub const HEADER_SIZE_2019: usize = 17;

/// Size of the sub-package `total` + `index` fields.
pub const SUB_PACKAGE_SIZE: usize = 4;

/// Largest header the protocol allows.
pub const MAX_HEADER_SIZE: usize = HEADER_SIZE_2019 + SUB_PACKAGE_SIZE;

/// Worst-case size of a single frame on the wire (everything escaped).
pub const MAX_FRAME_SIZE: usize = 2 + (MAX_HEADER_SIZE + MAX_BODY_LENGTH + 1) * 2;

const PHONE_BCD_LEN_2013: usize = 6;
const PHONE_BCD_LEN_2019: usize = 10;

/// Attribute bit masks.
pub mod attr {
    /// Body length (bits 0-9).
    pub const BODY_LENGTH_MASK: u16 = 0x03ff;
    /// Encryption method (bits 10-12). Bit 10 alone means RSA.
    pub const ENCRYPTION_MASK: u16 = 0x1c00;
    pub const ENCRYPTION_SHIFT: u16 = 10;
    /// Body is split into sub-packages (bit 13).
    pub const SUB_PACKAGE: u16 = 0x2000;
    /// 2019 revision header (bit 14).
    pub const VERSION: u16 = 0x4000;
    /// Reserved (bit 15).
    pub const RESERVED: u16 = 0x8000;
}

/// Protocol revision, selected by the version bit of the attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// 2011 and 2013 revisions share one header layout (6-byte phone).
    V2013,
    /// 2019 revision: version byte and 10-byte phone.
    V2019,
}

impl ProtocolVersion {
    /// Number of BCD bytes used by the terminal phone.
    #[inline]
    pub fn phone_len(self) -> usize {
        match self {
            ProtocolVersion::V2013 => PHONE_BCD_LEN_2013,
            ProtocolVersion::V2019 => PHONE_BCD_LEN_2019,
        }
    }

    /// Header size without sub-package fields.
    #[inline]
    pub fn header_size(self) -> usize {
        match self {
            ProtocolVersion::V2013 => HEADER_SIZE_2013,
            ProtocolVersion::V2019 => HEADER_SIZE_2019,
        }
    }
}

/// The bit-packed body attributes word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BodyAttributes {
    /// Declared body length (0-1023).
    pub body_length: u16,
    /// Encryption method bits (0 = none, 1 = RSA).
    pub encryption: u8,
    /// Sub-package fields follow the serial number.
    pub sub_package: bool,
    /// 2019 revision header.
    pub version_flag: bool,
    /// Reserved bit, kept for exact re-encoding.
    pub reserved: bool,
}

impl BodyAttributes {
    /// Unpack the attributes word.
    pub fn from_bits(bits: u16) -> Self {
        Self {
            body_length: bits & attr::BODY_LENGTH_MASK,
            encryption: ((bits & attr::ENCRYPTION_MASK) >> attr::ENCRYPTION_SHIFT) as u8,
            sub_package: bits & attr::SUB_PACKAGE != 0,
            version_flag: bits & attr::VERSION != 0,
            reserved: bits & attr::RESERVED != 0,
        }
    }

    /// Pack the attributes word.
    pub fn to_bits(&self) -> u16 {
        let mut bits = self.body_length & attr::BODY_LENGTH_MASK;
        bits |= ((self.encryption as u16) << attr::ENCRYPTION_SHIFT) & attr::ENCRYPTION_MASK;
        if self.sub_package {
            bits |= attr::SUB_PACKAGE;
        }
        if self.version_flag {
            bits |= attr::VERSION;
        }
        if self.reserved {
            bits |= attr::RESERVED;
        }
        bits
    }

    /// Check whether the body is RSA encrypted.
    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.encryption & 0x01 != 0
    }

    /// Protocol revision selected by the version bit.
    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        if self.version_flag {
            ProtocolVersion::V2019
        } else {
            ProtocolVersion::V2013
        }
    }
}

/// Sub-package position of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPackage {
    /// Total number of parts (>= 1).
    pub total: u16,
    /// Index of this part, 1-based.
    pub index: u16,
}

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Message (command) id.
    pub msg_id: u16,
    /// Body attributes.
    pub attributes: BodyAttributes,
    /// Protocol version byte (2019 only, 0 otherwise).
    pub protocol_version: u8,
    /// Terminal phone as decimal digits (12 or 20 digits).
    pub phone: String,
    /// Serial number assigned by the terminal.
    pub serial_number: u16,
    /// Sub-package position, when the sub-package bit is set.
    pub sub_package: Option<SubPackage>,
    /// Message id written on outbound frames.
    pub reply_id: u16,
    /// Serial number written on outbound frames.
    pub platform_serial_number: u16,
}

impl Header {
    /// Create a header addressing a terminal.
    ///
    /// The phone is left-padded with zeros to the width of the revision.
    pub fn for_terminal(phone: &str, version: ProtocolVersion) -> Result<Self> {
        let width = version.phone_len() * 2;
        if phone.is_empty() || phone.len() > width || !phone.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(GatewayError::Frame(format!(
                "phone {:?} is not at most {} decimal digits",
                phone, width
            )));
        }

        Ok(Self {
            msg_id: 0,
            attributes: BodyAttributes {
                version_flag: version == ProtocolVersion::V2019,
                ..BodyAttributes::default()
            },
            protocol_version: if version == ProtocolVersion::V2019 { 1 } else { 0 },
            phone: format!("{:0>width$}", phone, width = width),
            serial_number: 0,
            sub_package: None,
            reply_id: 0,
            platform_serial_number: 0,
        })
    }

    /// Protocol revision of this header.
    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        self.attributes.version()
    }

    /// Encoded size of this header as received.
    #[inline]
    pub fn size(&self) -> usize {
        let base = self.version().header_size();
        if self.attributes.sub_package {
            base + SUB_PACKAGE_SIZE
        } else {
            base
        }
    }

    /// Terminal phone without leading zeros.
    pub fn short_phone(&self) -> &str {
        let trimmed = self.phone.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Decode a header from unescaped frame content (delimiters stripped).
    ///
    /// Returns the header and the offset at which the body starts.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(GatewayError::Frame(format!(
                "frame of {} bytes is shorter than any header",
                buf.len()
            )));
        }

        let msg_id = u16::from_be_bytes([buf[0], buf[1]]);
        let attributes = BodyAttributes::from_bits(u16::from_be_bytes([buf[2], buf[3]]));
        let version = attributes.version();

        let mut size = version.header_size();
        if attributes.sub_package {
            size += SUB_PACKAGE_SIZE;
        }
        if buf.len() < size {
            return Err(GatewayError::Frame(format!(
                "header of message {:#06x} needs {} bytes, got {}",
                msg_id,
                size,
                buf.len()
            )));
        }

        let mut offset = 4;
        let protocol_version = match version {
            ProtocolVersion::V2019 => {
                offset += 1;
                buf[4]
            }
            ProtocolVersion::V2013 => 0,
        };

        let phone_len = version.phone_len();
        let phone = bcd_decode(&buf[offset..offset + phone_len])?;
        offset += phone_len;

        let serial_number = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;

        let sub_package = if attributes.sub_package {
            let total = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let index = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            offset += SUB_PACKAGE_SIZE;
            if total == 0 || index == 0 || index > total {
                return Err(GatewayError::Frame(format!(
                    "sub-package index {} of {} is out of range",
                    index, total
                )));
            }
            Some(SubPackage { total, index })
        } else {
            None
        };

        let header = Self {
            msg_id,
            attributes,
            protocol_version,
            phone,
            serial_number,
            sub_package,
            reply_id: 0,
            platform_serial_number: 0,
        };
        Ok((header, offset))
    }

    /// Encode an outbound platform frame.
    ///
    /// Uses `reply_id` as message id and `platform_serial_number` as serial.
    /// Outbound frames are never encrypted nor split.
    pub fn encode(&self, body: &[u8]) -> Result<Bytes> {
        let attributes = BodyAttributes {
            version_flag: self.attributes.version_flag,
            ..BodyAttributes::default()
        };
        self.encode_with(
            self.reply_id,
            attributes,
            self.platform_serial_number,
            None,
            body,
        )
    }

    /// Encode a frame exactly as the terminal sent it.
    pub fn encode_as_received(&self, body: &[u8]) -> Result<Bytes> {
        let attributes = BodyAttributes {
            sub_package: self.sub_package.is_some(),
            ..self.attributes
        };
        self.encode_with(
            self.msg_id,
            attributes,
            self.serial_number,
            self.sub_package,
            body,
        )
    }

    fn encode_with(
        &self,
        msg_id: u16,
        mut attributes: BodyAttributes,
        serial: u16,
        sub_package: Option<SubPackage>,
        body: &[u8],
    ) -> Result<Bytes> {
        if body.len() > MAX_BODY_LENGTH {
            return Err(GatewayError::Frame(format!(
                "body of {} bytes exceeds maximum {}",
                body.len(),
                MAX_BODY_LENGTH
            )));
        }
        attributes.body_length = body.len() as u16;
        let version = attributes.version();

        let mut raw = BytesMut::with_capacity(MAX_HEADER_SIZE + body.len() + 1);
        raw.put_u16(msg_id);
        raw.put_u16(attributes.to_bits());
        if version == ProtocolVersion::V2019 {
            raw.put_u8(self.protocol_version);
        }
        bcd_encode(&self.phone, version.phone_len(), &mut raw);
        raw.put_u16(serial);
        if let Some(sub) = sub_package {
            raw.put_u16(sub.total);
            raw.put_u16(sub.index);
        }
        raw.put_slice(body);
        raw.put_u8(checksum(&raw));

        let mut out = BytesMut::with_capacity(raw.len() * 2 + 2);
        out.put_u8(DELIMITER);
        escape_into(&raw, &mut out);
        out.put_u8(DELIMITER);
        Ok(out.freeze())
    }
}

/// XOR of every byte.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Escape frame content for the wire.
pub fn escape_into(data: &[u8], out: &mut BytesMut) {
    for &b in data {
        match b {
            DELIMITER => out.put_slice(&[ESCAPE, 0x02]),
            ESCAPE => out.put_slice(&[ESCAPE, 0x01]),
            _ => out.put_u8(b),
        }
    }
}

/// Reverse [`escape_into`].
pub fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(0x01) => out.push(ESCAPE),
            Some(0x02) => out.push(DELIMITER),
            Some(other) => {
                return Err(GatewayError::Frame(format!(
                    "invalid escape sequence 0x7d {:#04x}",
                    other
                )))
            }
            None => return Err(GatewayError::Frame("dangling escape byte".to_string())),
        }
    }
    Ok(out)
}

/// Decode packed BCD into decimal digits.
pub fn bcd_decode(data: &[u8]) -> Result<String> {
    let mut digits = String::with_capacity(data.len() * 2);
    for &b in data {
        for nibble in [b >> 4, b & 0x0f] {
            if nibble > 9 {
                return Err(GatewayError::Frame(format!("invalid BCD byte {:#04x}", b)));
            }
            digits.push(char::from(b'0' + nibble));
        }
    }
    Ok(digits)
}

/// Encode decimal digits as `len` bytes of packed BCD.
///
/// Shorter input is left-padded with zeros; longer input keeps its rightmost digits.
pub fn bcd_encode(digits: &str, len: usize, out: &mut BytesMut) {
    let width = len * 2;
    let raw = digits.as_bytes();
    let skip = raw.len().saturating_sub(width);
    let pad = width - (raw.len() - skip);

    let nibbles: Vec<u8> = std::iter::repeat(0)
        .take(pad)
        .chain(raw[skip..].iter().map(|c| c.wrapping_sub(b'0') & 0x0f))
        .collect();

    for pair in nibbles.chunks(2) {
        out.put_u8((pair[0] << 4) | pair[1]);
    }
}
