//! Header frame parsing and opcode table.
//!
//! The magic byte, version byte and opcode values below match the table in
//! spec.md section 6.

use bytes::Bytes;

use crate::error::ProtocolError;

pub const MAGIC_BYTE: u8 = 0x31;
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Feature-flag bitmap returned by `ServerInfo` (opcode 0x00).
pub const FEATURE_ON_THE_FLY_TABLE_OPEN: u64 = 0x01;
pub const FEATURE_SUPPORT_PARTSYNC: u64 = 0x02;
pub const FEATURE_SUPPORT_FULLSYNC: u64 = 0x04;

/// Write-flag bits carried in header byte 3 of a Put request.
pub const WRITE_FLAG_PARTSYNC: u8 = 0x01;
pub const WRITE_FLAG_FULLSYNC: u8 = 0x02;

/// Scan-flag bit carried in header byte 3 of a Scan request.
pub const SCAN_FLAG_REVERSE: u8 = 0x01;

/// Response status bytes, common across Table-Admin and worker replies.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_GENERIC_ERROR: u8 = 0x01;
pub const STATUS_DB_ERROR: u8 = 0x10;
pub const STATUS_UNKNOWN_REQUEST: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ServerInfo,
    OpenTable,
    CloseTable,
    CompactTable,
    TruncateTable,
    StopServer,
    Read,
    Count,
    Exists,
    Scan,
    Put,
    Delete,
    DeleteRange,
    CopyRange,
    ForwardRangeToSocket,
    ServerSideTableSinkedMapInit,
    ClientSidePassiveInit,
    ClientDataRequest,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            0x00 => ServerInfo,
            0x01 => OpenTable,
            0x02 => CloseTable,
            0x03 => CompactTable,
            0x04 => TruncateTable,
            0x05 => StopServer,
            0x10 => Read,
            0x11 => Count,
            0x12 => Exists,
            0x13 => Scan,
            0x20 => Put,
            0x21 => Delete,
            0x22 => DeleteRange,
            0x24 => CopyRange,
            0x40 => ForwardRangeToSocket,
            0x41 => ServerSideTableSinkedMapInit,
            0x42 => ClientSidePassiveInit,
            0x50 => ClientDataRequest,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        use Opcode::*;
        match self {
            ServerInfo => 0x00,
            OpenTable => 0x01,
            CloseTable => 0x02,
            CompactTable => 0x03,
            TruncateTable => 0x04,
            StopServer => 0x05,
            Read => 0x10,
            Count => 0x11,
            Exists => 0x12,
            Scan => 0x13,
            Put => 0x20,
            Delete => 0x21,
            DeleteRange => 0x22,
            CopyRange => 0x24,
            ForwardRangeToSocket => 0x40,
            ServerSideTableSinkedMapInit => 0x41,
            ClientSidePassiveInit => 0x42,
            ClientDataRequest => 0x50,
        }
    }

    /// Whether this opcode belongs to the "async-job" family (bit 6 of the
    /// opcode byte set, per section 4.8's routing rule).
    pub fn is_async_job(self) -> bool {
        self.to_byte() & 0x40 != 0
    }
}

/// A parsed header frame: `[0x31][0x01][opcode][flags?][request_id…]`.
#[derive(Debug, Clone)]
pub struct Header {
    pub opcode: Opcode,
    /// Byte 3 of the header, if present. Carries write/scan flags.
    pub flags: Option<u8>,
    /// Everything after the flags byte (or after the opcode if no flags
    /// byte was sent) — mirrored verbatim into response headers.
    pub request_id: Bytes,
}

impl Header {
    pub fn flags_byte(&self) -> u8 {
        self.flags.unwrap_or(0)
    }

    pub fn parse(raw: &Bytes) -> Result<Header, ProtocolError> {
        if raw.len() < 3 {
            return Err(ProtocolError::HeaderTooShort(raw.len()));
        }
        if raw[0] != MAGIC_BYTE {
            return Err(ProtocolError::InvalidMagic(raw[0]));
        }
        if raw[1] != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion(raw[1]));
        }
        let opcode =
            Opcode::from_byte(raw[2]).ok_or(ProtocolError::UnknownOpcode(raw[2]))?;

        let (flags, request_id) = if raw.len() > 3 {
            (Some(raw[3]), raw.slice(4..))
        } else {
            (None, raw.slice(3..3))
        };

        Ok(Header {
            opcode,
            flags,
            request_id,
        })
    }

    /// Builds a response header for this request, mirroring the
    /// request-identifier tail verbatim (spec.md: "Header invariance").
    pub fn response(&self, response_opcode: Opcode, status: u8) -> Bytes {
        let mut out = Vec::with_capacity(4 + self.request_id.len());
        out.push(MAGIC_BYTE);
        out.push(PROTOCOL_VERSION);
        out.push(response_opcode.to_byte());
        out.push(status);
        out.extend_from_slice(&self.request_id);
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_header() {
        let raw = Bytes::from_static(&[0x31, 0x01, 0x10]);
        let header = Header::parse(&raw).unwrap();
        assert_eq!(header.opcode, Opcode::Read);
        assert_eq!(header.flags, None);
        assert!(header.request_id.is_empty());
    }

    #[test]
    fn parses_flags_and_request_id() {
        let raw = Bytes::from_static(&[0x31, 0x01, 0x20, 0x03, 0xAA, 0xBB]);
        let header = Header::parse(&raw).unwrap();
        assert_eq!(header.opcode, Opcode::Put);
        assert_eq!(header.flags, Some(0x03));
        assert_eq!(&header.request_id[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn rejects_bad_magic_and_version_and_short_headers() {
        assert!(matches!(
            Header::parse(&Bytes::from_static(&[0x00, 0x01, 0x10])),
            Err(ProtocolError::InvalidMagic(0x00))
        ));
        assert!(matches!(
            Header::parse(&Bytes::from_static(&[0x31, 0x02, 0x10])),
            Err(ProtocolError::InvalidVersion(0x02))
        ));
        assert!(matches!(
            Header::parse(&Bytes::from_static(&[0x31, 0x01])),
            Err(ProtocolError::HeaderTooShort(2))
        ));
        assert!(matches!(
            Header::parse(&Bytes::from_static(&[0x31, 0x01, 0xEE])),
            Err(ProtocolError::UnknownOpcode(0xEE))
        ));
    }

    #[test]
    fn response_header_preserves_request_id_tail() {
        let raw = Bytes::from_static(&[0x31, 0x01, 0x10, 0x00, 1, 2, 3, 4]);
        let header = Header::parse(&raw).unwrap();
        let resp = header.response(Opcode::Read, STATUS_OK);
        assert_eq!(&resp[4..], &[1, 2, 3, 4]);
        assert_eq!(resp[2], Opcode::Read.to_byte());
        assert_eq!(resp[3], STATUS_OK);
    }
}
