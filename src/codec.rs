//! Modbus RTU framing for "read holding registers" transactions.
//!
//! A request frame is `[address, function, start_hi, start_lo, count_hi,
//! count_lo, crc_lo, crc_hi]`. A regular response is `[address, function,
//! byte_count, data.., crc_lo, crc_hi]`, an exception response is
//! `[address, function | 0x80, code, crc_lo, crc_hi]`.
use crate::protocol::{self as proto, Address};
use crate::{Error, Result};
use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Length of an exception response frame.
pub const EXCEPTION_FRAME_LEN: usize = 5;
/// Address, function code, byte count and CRC of a regular response.
pub const RESPONSE_OVERHEAD: usize = 5;

/// Computes the CRC-16/MODBUS checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// A single read request addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: Address,
    pub function: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn holding_registers(address: Address, start: u16, count: u16) -> Self {
        Self {
            address,
            function: proto::READ_HOLDING_REGISTERS,
            start,
            count,
        }
    }

    /// Encodes the request into a frame with the CRC appended.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8);
        frame.push(*self.address);
        frame.push(self.function);
        frame.extend_from_slice(&self.start.to_be_bytes());
        frame.extend_from_slice(&self.count.to_be_bytes());
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Length of a complete regular response to this request.
    pub fn response_len(&self) -> usize {
        RESPONSE_OVERHEAD + 2 * usize::from(self.count)
    }
}

/// Returns the total length of the frame once enough header bytes are known.
pub fn expected_frame_len(partial: &[u8]) -> Option<usize> {
    match partial {
        [_, function, ..] if function & proto::EXCEPTION_FLAG != 0 => Some(EXCEPTION_FRAME_LEN),
        [_, _, byte_count, ..] => Some(RESPONSE_OVERHEAD + usize::from(*byte_count)),
        _ => None,
    }
}

/// Validates a response frame and returns its register payload.
///
/// The payload may hold fewer registers than requested; deciding whether
/// that is enough is up to the register decoder.
pub fn decode_response(request: &ReadRequest, frame: &[u8]) -> Result<Vec<u16>> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(Error::Corrupt(format!(
            "frame of {} bytes is too short",
            frame.len()
        )));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let calculated = checksum(body);
    if received != calculated {
        return Err(Error::Corrupt(format!(
            "CRC mismatch: received {received:#06x}, calculated {calculated:#06x}"
        )));
    }
    if body[0] != *request.address {
        return Err(Error::Corrupt(format!(
            "response from address {} to a request for {}",
            body[0], request.address
        )));
    }
    let function = body[1];
    if function == request.function | proto::EXCEPTION_FLAG {
        return Err(Error::DeviceFault(body[2]));
    }
    if function != request.function {
        return Err(Error::Corrupt(format!(
            "unexpected function code {function:#04x}, expected {:#04x}",
            request.function
        )));
    }
    let byte_count = usize::from(body[2]);
    let data = &body[3..];
    if byte_count % 2 != 0 || data.len() != byte_count {
        return Err(Error::Corrupt(format!(
            "byte count {byte_count} does not match {} payload bytes",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Builds a valid response frame carrying `words`.
    pub(crate) fn response_frame(address: u8, words: &[u16]) -> Vec<u8> {
        let mut frame = vec![address, proto::READ_HOLDING_REGISTERS, (words.len() * 2) as u8];
        for word in words {
            frame.extend_from_slice(&word.to_be_bytes());
        }
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    pub(crate) fn exception_frame(address: u8, code: u8) -> Vec<u8> {
        let mut frame = vec![address, proto::READ_HOLDING_REGISTERS | proto::EXCEPTION_FLAG, code];
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn request() -> ReadRequest {
        ReadRequest::holding_registers(Address::try_from(1).unwrap(), 4, 8)
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn encode_request() {
        // Well-known frame: read 1 register at 0 from unit 1.
        let frame = ReadRequest::holding_registers(Address::try_from(1).unwrap(), 0, 1).encode();
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);

        let frame = request().encode();
        assert_eq!(&frame[..6], &[0x01, 0x03, 0x00, 0x04, 0x00, 0x08]);
        assert_eq!(checksum(&frame[..6]).to_le_bytes(), [frame[6], frame[7]]);
        assert_eq!(request().response_len(), 21);
    }

    #[test]
    fn frame_length_from_header() {
        assert_eq!(expected_frame_len(&[]), None);
        assert_eq!(expected_frame_len(&[0x01]), None);
        assert_eq!(expected_frame_len(&[0x01, 0x03]), None);
        assert_eq!(expected_frame_len(&[0x01, 0x03, 16]), Some(21));
        assert_eq!(expected_frame_len(&[0x01, 0x83]), Some(5));
    }

    #[test]
    fn decode_valid_response() {
        let words = [0, 0, 452, 123, 1876, 652, 135, 2150];
        let frame = response_frame(1, &words);
        assert_eq!(decode_response(&request(), &frame).unwrap(), words);
    }

    #[test]
    fn decode_exception_response() {
        let frame = exception_frame(1, 0x02);
        assert_matches!(
            decode_response(&request(), &frame),
            Err(Error::DeviceFault(0x02))
        );
    }

    #[test]
    fn decode_rejects_bad_crc() {
        let mut frame = response_frame(1, &[1, 2, 3]);
        frame[4] ^= 0xFF;
        assert_matches!(decode_response(&request(), &frame), Err(Error::Corrupt(..)));
    }

    #[test]
    fn decode_rejects_wrong_function_and_address() {
        let mut frame = vec![0x01, 0x04, 0x02, 0x00, 0x01];
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_matches!(decode_response(&request(), &frame), Err(Error::Corrupt(..)));

        let frame = response_frame(2, &[1]);
        assert_matches!(decode_response(&request(), &frame), Err(Error::Corrupt(..)));
    }

    #[test]
    fn decode_rejects_inconsistent_byte_count() {
        let mut frame = vec![0x01, 0x03, 0x04, 0x00, 0x01];
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_matches!(decode_response(&request(), &frame), Err(Error::Corrupt(..)));

        assert_matches!(
            decode_response(&request(), &[0x01, 0x03]),
            Err(Error::Corrupt(..))
        );
    }

    #[test]
    fn decode_short_payload_is_passed_through() {
        let frame = response_frame(1, &[1, 2, 3]);
        assert_eq!(decode_response(&request(), &frame).unwrap(), [1, 2, 3]);
    }
}
