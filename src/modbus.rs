use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::catalog::AccessCode;

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub access: AccessCode,
    pub address: u16,
    pub count: u16,
}

impl Request {
    /// Estimate how many bytes the response to this request occupies on a serial line.
    ///
    /// Used to give the device enough time to transmit the response at the configured baudrate.
    pub fn expected_response_length(&self) -> u16 {
        // unit id, function code, byte count, data, 2 bytes of crc.
        self.count.saturating_mul(2).saturating_add(5)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub function_code: u8,
    pub kind: ResponseKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(u8),
    Registers { values: Vec<u8> },
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception(c) => Some(*c),
            ResponseKind::Registers { .. } => None,
        }
    }

    /// Register values as big-endian words.
    pub fn words(&self) -> Option<Vec<u16>> {
        let ResponseKind::Registers { values } = &self.kind else {
            return None;
        };
        Some(values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect())
    }
}

pub trait Codec:
    for<'a> Encoder<&'a Request, Error = std::io::Error>
    + Decoder<Item = Response, Error = std::io::Error>
{
}

fn invalid_data(message: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

fn put_pdu(req: &Request, dst: &mut BytesMut) {
    dst.extend_from_slice(&[req.device_id, req.access.function_code()]);
    dst.extend_from_slice(&req.address.to_be_bytes());
    dst.extend_from_slice(&req.count.to_be_bytes());
}

/// Modbus TCP, for serial gateways that expose the bus over the network.
#[derive(Default)]
pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&req.transaction_id.to_be_bytes());
        // Protocol identifier, then the length of everything that follows.
        dst.extend_from_slice(&[0, 0, 0, 6]);
        put_pdu(req, dst);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            if src.len() < 9 {
                return Ok(None);
            }
            let transaction_id = u16::from_be_bytes([src[0], src[1]]);
            let proto = u16::from_be_bytes([src[2], src[3]]);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let length = usize::from(u16::from_be_bytes([src[4], src[5]]));
            if length < 3 {
                src.advance(1);
                continue;
            }
            if src.len() < 6 + length {
                src.reserve(6 + length - src.len());
                return Ok(None);
            }
            let (device_id, function_code, code) = (src[6], src[7], src[8]);
            let kind = if function_code & 0x80 != 0 {
                ResponseKind::Exception(code)
            } else {
                // `code` is the byte count, but the MBAP length is the authoritative one.
                ResponseKind::Registers { values: src[9..6 + length].to_vec() }
            };
            src.advance(6 + length);
            return Ok(Some(Response { device_id, transaction_id, function_code, kind }));
        }
    }
}

impl Codec for ModbusTCPCodec {}

/// Modbus RTU over a serial line.
///
/// RTU frames carry no transaction id, so the id of the most recently encoded request is
/// attached to decoded responses. Only one request may be outstanding at a time.
#[derive(Default)]
pub struct ModbusRTUCodec {
    transaction_id: u16,
}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        put_pdu(req, dst);
        let crc = CRC.checksum(&dst[start..]);
        dst.extend_from_slice(&crc.to_le_bytes());
        self.transaction_id = req.transaction_id;
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message = "attempt at decoding", buffer = ?src);
        let &[device_id, function_code, code, ..] = &src[..] else {
            return Ok(None);
        };
        let frame_length = if function_code & 0x80 != 0 {
            5
        } else if function_code == 3 || function_code == 4 {
            3 + usize::from(code) + 2
        } else {
            return Err(invalid_data("unsupported function code in the response"));
        };
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }
        let (body, crc) = src[..frame_length].split_at(frame_length - 2);
        if CRC.checksum(body).to_le_bytes() != crc {
            return Err(invalid_data("response CRC does not match"));
        }
        let kind = if function_code & 0x80 != 0 {
            ResponseKind::Exception(code)
        } else {
            ResponseKind::Registers { values: body[3..].to_vec() }
        };
        src.advance(frame_length);
        Ok(Some(Response { device_id, transaction_id: self.transaction_id, function_code, kind }))
    }
}

impl Codec for ModbusRTUCodec {}
