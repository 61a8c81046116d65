//! Connection setup messages, shared by every Sv2 sub-protocol.

use crate::{
    codec::{Decodable, Encodable, Reader},
    datatypes::Str0255,
    error::Result,
};

/// Protocol discriminant for the Template Distribution sub-protocol.
pub const PROTOCOL_TEMPLATE_DISTRIBUTION: u8 = 2;

/// The protocol version this provider speaks.
pub const SUPPORTED_VERSION: u16 = 2;

/// `SetupConnection.Error` codes defined by the protocol.
pub const ERROR_CODE_UNSUPPORTED_PROTOCOL: &str = "unsupported-protocol";
pub const ERROR_CODE_PROTOCOL_VERSION_MISMATCH: &str = "protocol-version-mismatch";
pub const ERROR_CODE_UNSUPPORTED_FEATURE_FLAGS: &str = "unsupported-feature-flags";
/// Emitted on a message that is invalid in the connection's current phase.
pub const ERROR_CODE_UNEXPECTED_MESSAGE: &str = "unexpected-message";

/// Initiates a connection after the handshake. First message from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnection {
    /// Sub-protocol to be used; must be [`PROTOCOL_TEMPLATE_DISTRIBUTION`].
    pub protocol: u8,
    pub min_version: u16,
    pub max_version: u16,
    /// Optional-feature flags. Advisory for Template Distribution.
    pub flags: u32,
    pub endpoint_host: Str0255,
    pub endpoint_port: u16,
    pub vendor: Str0255,
    pub hardware_version: Str0255,
    pub firmware: Str0255,
    pub device_id: Str0255,
}

impl Encodable for SetupConnection {
    fn encoded_len(&self) -> usize {
        1 + 2
            + 2
            + 4
            + self.endpoint_host.encoded_len()
            + 2
            + self.vendor.encoded_len()
            + self.hardware_version.encoded_len()
            + self.firmware.encoded_len()
            + self.device_id.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.protocol.encode(out);
        self.min_version.encode(out);
        self.max_version.encode(out);
        self.flags.encode(out);
        self.endpoint_host.encode(out);
        self.endpoint_port.encode(out);
        self.vendor.encode(out);
        self.hardware_version.encode(out);
        self.firmware.encode(out);
        self.device_id.encode(out);
    }
}

impl Decodable for SetupConnection {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            protocol: u8::decode(reader)?,
            min_version: u16::decode(reader)?,
            max_version: u16::decode(reader)?,
            flags: u32::decode(reader)?,
            endpoint_host: Str0255::decode(reader)?,
            endpoint_port: u16::decode(reader)?,
            vendor: Str0255::decode(reader)?,
            hardware_version: Str0255::decode(reader)?,
            firmware: Str0255::decode(reader)?,
            device_id: Str0255::decode(reader)?,
        })
    }
}

/// Accepts a [`SetupConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupConnectionSuccess {
    /// Version to be used for the connection.
    pub used_version: u16,
    /// Optional features the server turns on; zero for this provider.
    pub flags: u32,
}

impl Encodable for SetupConnectionSuccess {
    fn encoded_len(&self) -> usize {
        6
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.used_version.encode(out);
        self.flags.encode(out);
    }
}

impl Decodable for SetupConnectionSuccess {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            used_version: u16::decode(reader)?,
            flags: u32::decode(reader)?,
        })
    }
}

/// Rejects a [`SetupConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnectionError {
    /// Flags the server could not honor, when applicable.
    pub flags: u32,
    pub error_code: Str0255,
}

impl Encodable for SetupConnectionError {
    fn encoded_len(&self) -> usize {
        4 + self.error_code.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.flags.encode(out);
        self.error_code.encode(out);
    }
}

impl Decodable for SetupConnectionError {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            flags: u32::decode(reader)?,
            error_code: Str0255::decode(reader)?,
        })
    }
}
