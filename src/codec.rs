//! WebSocket frame encoding and decoding (RFC 6455 section 5).
//!
//! Decoding reads straight from a [`StreamReader`]; encoding goes through the
//! [`WebsocketCodec`] encoder, which owns the masking RNG and the negotiated
//! extensions.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use tokio_util::bytes::{BufMut as _, Bytes, BytesMut};

use crate::errors::WebsocketCodecError;
use crate::extensions::Extension;
use crate::stream::StreamReader;

const FIN_MASK: u8 = 0x80;
const RSV1_MASK: u8 = 0x40;
const RSV2_MASK: u8 = 0x20;
const RSV3_MASK: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0F;
const MASKBIT_MASK: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close codes a peer may legitimately send, besides the 3000-4999 range.
pub const EXTERNAL_CLOSE_CODES: [u16; 9] = [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011];

/// Frame opcode (4 bits).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    ContinuationFrame = 0x0,
    TextFrame = 0x1,
    BinaryFrame = 0x2,
    ConnectionClose = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, ping and pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::ConnectionClose | Self::Ping | Self::Pong)
    }

    /// Continuation, text and binary.
    #[must_use]
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WebsocketCodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::ContinuationFrame),
            0x1 => Ok(Self::TextFrame),
            0x2 => Ok(Self::BinaryFrame),
            0x8 => Ok(Self::ConnectionClose),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            x => Err(WebsocketCodecError::UnknownOpcode(x)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

/// A single WebSocket frame, unmasked.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "RFC 6455 exposes these as independent header bits"
)]
pub struct WebsocketFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl WebsocketFrame {
    /// A frame with all reserved bits cleared.
    #[must_use]
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload: payload.into(),
        }
    }

    /// Validates reserved bits and control frame constraints.
    ///
    /// # Errors
    /// [`WebsocketCodecError::ProtocolViolation`] when a reserved bit is set,
    /// or a control frame is fragmented or carries more than 125 bytes.
    pub fn check(&self) -> Result<(), WebsocketCodecError> {
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(WebsocketCodecError::protocol("reserved bits must be 0"));
        }
        if self.opcode.is_control() {
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebsocketCodecError::protocol("control frame too long"));
            }
            if !self.fin {
                return Err(WebsocketCodecError::protocol("fragmented control frame"));
            }
        }
        Ok(())
    }
}

/// XORs `data` in place with the 4-byte `mask`. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mut words = data.chunks_exact_mut(4);
    for word in &mut words {
        for (byte, key) in word.iter_mut().zip(mask) {
            *byte ^= key;
        }
    }
    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

/// Reads one frame from `reader`.
///
/// `mask` is whether the peer must mask its frames, i.e. whether this side is
/// the server. Extensions are applied in the order they were negotiated,
/// then the frame is checked.
///
/// # Errors
/// Stream errors, [`WebsocketCodecError::PayloadTooLarge`] when the announced
/// length exceeds `max_size`, or protocol violations.
pub async fn read_frame(
    reader: &StreamReader,
    mask: bool,
    max_size: Option<usize>,
    extensions: &[Arc<dyn Extension>],
) -> Result<WebsocketFrame, WebsocketCodecError> {
    let head = reader.read_exactly(2).await?;
    let fin = head[0] & FIN_MASK != 0;
    let rsv1 = head[0] & RSV1_MASK != 0;
    let rsv2 = head[0] & RSV2_MASK != 0;
    let rsv3 = head[0] & RSV3_MASK != 0;
    let opcode = Opcode::try_from(head[0] & OPCODE_MASK)?;

    if (head[1] & MASKBIT_MASK != 0) != mask {
        return Err(WebsocketCodecError::protocol("incorrect masking"));
    }

    let length = match head[1] & LENGTH_MASK {
        126 => {
            let raw = reader.read_exactly(2).await?;
            u64::from(u16::from_be_bytes([raw[0], raw[1]]))
        }
        127 => {
            let raw = reader.read_exactly(8).await?;
            let mut be = [0u8; 8];
            be.copy_from_slice(&raw);
            u64::from_be_bytes(be)
        }
        short => u64::from(short),
    };
    if let Some(max) = max_size
        && length > max as u64
    {
        return Err(WebsocketCodecError::PayloadTooLarge { size: length, max });
    }
    let length = usize::try_from(length).map_err(|_| WebsocketCodecError::PayloadTooLarge {
        size: length,
        max: usize::MAX,
    })?;

    let mask_key = if mask {
        let raw = reader.read_exactly(4).await?;
        Some([raw[0], raw[1], raw[2], raw[3]])
    } else {
        None
    };

    let data = reader.read_exactly(length).await?;
    let payload = match mask_key {
        Some(key) => {
            let mut owned = BytesMut::from(&data[..]);
            apply_mask(&mut owned, key);
            owned.freeze()
        }
        None => data,
    };

    let mut frame = WebsocketFrame {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        payload,
    };
    for extension in extensions {
        frame = extension.decode(frame, max_size)?;
    }
    frame.check()?;
    Ok(frame)
}

/// Which side of the connection a codec serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointType {
    Client,
    Server,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Frame encoder: masks client frames and runs outgoing extensions.
pub struct WebsocketCodec {
    endpoint_type: EndpointType,
    extensions: Vec<Arc<dyn Extension>>,
    rng: rand::rngs::StdRng,
}

impl std::fmt::Debug for WebsocketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketCodec")
            .field("endpoint_type", &self.endpoint_type)
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

impl WebsocketCodec {
    /// Create a new WebSocket encoder.
    ///
    /// `endpoint_type` specifies whether frames are masked (client) or not (server).
    #[must_use]
    pub fn new(endpoint_type: EndpointType) -> Self {
        let rng = rand::rngs::StdRng::from_os_rng();
        Self {
            endpoint_type,
            extensions: Vec::new(),
            rng,
        }
    }

    /// Sets the extensions applied, in order, to every outgoing frame.
    pub fn set_extensions(&mut self, extensions: Vec<Arc<dyn Extension>>) {
        self.extensions = extensions;
    }

    /// Encodes `item` into a fresh buffer.
    ///
    /// # Errors
    /// Propagates extension failures.
    pub fn encode_to_bytes(&mut self, item: WebsocketFrame) -> Result<Bytes, WebsocketCodecError> {
        let mut dst = BytesMut::with_capacity(item.payload.len() + 14);
        tokio_util::codec::Encoder::encode(self, item, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl tokio_util::codec::Encoder<WebsocketFrame> for WebsocketCodec {
    type Error = WebsocketCodecError;

    fn encode(&mut self, item: WebsocketFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut item = item;
        for extension in &self.extensions {
            item = extension.encode(item)?;
        }

        let mut header = [0u8; 2];
        if item.fin {
            header[0] |= FIN_MASK;
        }
        if item.rsv1 {
            header[0] |= RSV1_MASK;
        }
        if item.rsv2 {
            header[0] |= RSV2_MASK;
        }
        if item.rsv3 {
            header[0] |= RSV3_MASK;
        }
        header[0] |= u8::from(item.opcode);

        let mask_key = match self.endpoint_type {
            EndpointType::Client => {
                header[1] |= MASKBIT_MASK;
                Some(self.rng.random::<[u8; 4]>())
            }
            EndpointType::Server => None,
        };

        // Encode length
        let len = item.payload.len();
        #[allow(
            clippy::cast_possible_truncation,
            reason = "The lengths have been checked"
        )]
        match len {
            ..=125 => {
                header[1] |= len as u8;
                dst.extend_from_slice(&header);
            }
            126..=0xFFFF => {
                header[1] |= 126;
                dst.extend_from_slice(&header);
                dst.put_u16(len as u16);
            }
            _ => {
                header[1] |= 127;
                dst.extend_from_slice(&header);
                dst.put_u64(len as u64);
            }
        }

        match mask_key {
            Some(key) => {
                dst.extend_from_slice(&key);
                let start = dst.len();
                dst.extend_from_slice(&item.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.extend_from_slice(&item.payload),
        }

        Ok(())
    }
}

/// Whether `code` may appear in a close frame on the wire.
#[must_use]
pub fn is_valid_close_code(code: u16) -> bool {
    EXTERNAL_CLOSE_CODES.contains(&code) || (3000..5000).contains(&code)
}

/// Parses a close frame payload into its code and reason.
///
/// An empty payload means 1005 (no status received).
///
/// # Errors
/// [`WebsocketCodecError::ProtocolViolation`] for a 1-byte payload or an
/// invalid code, [`WebsocketCodecError::InvalidUtf8`] for a bad reason.
pub fn parse_close(data: &[u8]) -> Result<(u16, String), WebsocketCodecError> {
    match data {
        [] => Ok((1005, String::new())),
        [_] => Err(WebsocketCodecError::protocol("close frame too short")),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            if !is_valid_close_code(code) {
                return Err(WebsocketCodecError::protocol(format!(
                    "invalid status code {code}"
                )));
            }
            let reason = std::str::from_utf8(reason)
                .map_err(|_| WebsocketCodecError::InvalidUtf8)?
                .to_owned();
            Ok((code, reason))
        }
    }
}

/// Builds a close frame payload.
///
/// # Errors
/// [`WebsocketCodecError::ProtocolViolation`] for a code that may not be sent.
pub fn serialize_close(code: u16, reason: &str) -> Result<Bytes, WebsocketCodecError> {
    if !is_valid_close_code(code) {
        return Err(WebsocketCodecError::protocol(format!(
            "invalid status code {code}"
        )));
    }
    let mut data = BytesMut::with_capacity(2 + reason.len());
    data.put_u16(code);
    data.extend_from_slice(reason.as_bytes());
    Ok(data.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_codec() -> WebsocketCodec {
        WebsocketCodec::new(EndpointType::Server)
    }

    #[test]
    fn length_field_boundaries() {
        let cases: [(usize, usize, u8); 7] = [
            (0, 2, 0),
            (1, 2, 1),
            (125, 2, 125),
            (126, 4, 126),
            (127, 4, 126),
            (65535, 4, 126),
            (65536, 10, 127),
        ];
        for (len, header_len, len7) in cases {
            let frame = WebsocketFrame::new(true, Opcode::BinaryFrame, vec![0u8; len]);
            let wire = server_codec().encode_to_bytes(frame).unwrap();
            assert_eq!(wire.len(), header_len + len, "payload of {len} bytes");
            assert_eq!(wire[1] & LENGTH_MASK, len7, "payload of {len} bytes");
        }
    }

    #[test]
    fn client_frames_are_masked() {
        let frame = WebsocketFrame::new(true, Opcode::TextFrame, &b"Hello"[..]);
        let wire = WebsocketCodec::new(EndpointType::Client)
            .encode_to_bytes(frame)
            .unwrap();
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x80 | 5);
        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, [wire[2], wire[3], wire[4], wire[5]]);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn mask_matches_rfc_example() {
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn reserved_bit_fails_check_for_any_opcode() {
        for opcode in [Opcode::TextFrame, Opcode::ContinuationFrame, Opcode::Ping] {
            let mut frame = WebsocketFrame::new(true, opcode, Bytes::new());
            frame.rsv1 = true;
            assert!(matches!(
                frame.check(),
                Err(WebsocketCodecError::ProtocolViolation(_))
            ));
        }
    }

    #[test]
    fn control_frames_must_be_short_and_final() {
        let long = WebsocketFrame::new(true, Opcode::Ping, vec![0u8; 126]);
        assert!(long.check().is_err());
        let fragmented = WebsocketFrame::new(false, Opcode::ConnectionClose, Bytes::new());
        assert!(fragmented.check().is_err());
        let fine = WebsocketFrame::new(true, Opcode::Pong, vec![0u8; 125]);
        assert!(fine.check().is_ok());
    }

    #[test]
    fn close_payloads() {
        assert_eq!(parse_close(b"").unwrap(), (1005, String::new()));
        assert!(matches!(
            parse_close(b"\x03"),
            Err(WebsocketCodecError::ProtocolViolation(_))
        ));
        assert_eq!(parse_close(b"\x03\xe8").unwrap(), (1000, String::new()));
        assert_eq!(parse_close(b"\x0f\xa0bye").unwrap(), (4000, "bye".to_owned()));
        assert!(parse_close(b"\x03\xed").is_err());
        assert!(matches!(
            parse_close(b"\x03\xe8\xff"),
            Err(WebsocketCodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn serialize_close_refuses_reserved_codes() {
        assert_eq!(serialize_close(1001, "bye").unwrap(), &b"\x03\xe9bye"[..]);
        assert!(serialize_close(1006, "").is_err());
        assert!(serialize_close(1005, "").is_err());
    }

    #[tokio::test]
    async fn decode_rejects_wrong_masking() {
        let reader = StreamReader::new();
        reader.feed_data(Bytes::from_static(b"\x81\x00"));
        let err = read_frame(&reader, true, None, &[]).await.unwrap_err();
        assert!(matches!(err, WebsocketCodecError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn decode_rejects_oversized_frame_before_reading_payload() {
        let reader = StreamReader::new();
        reader.feed_data(Bytes::from_static(b"\x82\x7e\x01\x00"));
        let err = read_frame(&reader, false, Some(255), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            WebsocketCodecError::PayloadTooLarge { size: 256, max: 255 }
        ));
    }

    #[test]
    fn framed_encoder_writes_the_same_bytes() {
        use tokio_util::codec::Encoder as _;

        let frame = WebsocketFrame::new(true, Opcode::TextFrame, "hi");
        let mut dst = BytesMut::new();
        server_codec().encode(frame.clone(), &mut dst).unwrap();
        assert_eq!(dst.freeze(), server_codec().encode_to_bytes(frame).unwrap());

        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        let err = WebsocketCodecError::from(broken);
        assert!(matches!(err, WebsocketCodecError::Stream(_)));
        assert_eq!(err.close_code(), 1006);
    }

    #[tokio::test]
    async fn decode_rejects_unknown_opcode() {
        let reader = StreamReader::new();
        reader.feed_data(Bytes::from_static(b"\x83\x00"));
        let err = read_frame(&reader, false, None, &[]).await.unwrap_err();
        assert!(matches!(err, WebsocketCodecError::UnknownOpcode(3)));
    }
}
