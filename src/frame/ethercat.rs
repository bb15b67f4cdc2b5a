use bitfield::*;
use num_enum::TryFromPrimitive;

pub const ETHERNET_HEADER_LENGTH: usize = 14;
pub const ETHERCAT_HEADER_LENGTH: usize = 2;
pub const DATAGRAM_HEADER_LENGTH: usize = 10;
pub const WKC_LENGTH: usize = 2;
pub const ETHERCAT_TYPE: u16 = 0x88A4;
/// Length-and-type marker in the EtherCAT header upper bits.
pub const ETHERCAT_HEADER_TYPE_PDU: u8 = 0x1;

pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

pub const FRAME_MIN_LENGTH: usize =
    ETHERNET_HEADER_LENGTH + ETHERCAT_HEADER_LENGTH + DATAGRAM_HEADER_LENGTH + WKC_LENGTH;

/// EtherCAT datagram commands. The cyclic core issues APRD/APWR, BRD/BWR
/// and LRD/LWR/LRW; the remaining commands are decoded for completeness.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandType {
    Nop = 0x00,
    Aprd = 0x01,
    Apwr = 0x02,
    Aprw = 0x03,
    Fprd = 0x04,
    Fpwr = 0x05,
    Fprw = 0x06,
    Brd = 0x07,
    Bwr = 0x08,
    Brw = 0x09,
    Lrd = 0x0A,
    Lwr = 0x0B,
    Lrw = 0x0C,
    Armw = 0x0D,
    Frmw = 0x0E,
}

/// Auto-increment address of the slave at chain position `p`: the 16-bit
/// two's complement of `p`, so position 0 maps to 0, position 1 to 0xFFFF.
pub fn auto_increment_address(position: u16) -> u16 {
    0u16.wrapping_sub(position)
}

bitfield! {
    pub struct EtherCatHeader([u8]);
    u16;
    pub length, set_length: 10, 0;
    u8;
    pub frame_type, set_frame_type: 15, 12;
}

impl<B> EtherCatHeader<B> {
    pub const SIZE: usize = ETHERCAT_HEADER_LENGTH;
}

bitfield! {
    pub struct DatagramHeader([u8]);
    u8;
    pub command, set_command: 7, 0;
    pub index, set_index: 15, 8;
    u16;
    pub adp, set_adp: 31, 16;
    pub ado, set_ado: 47, 32;
    pub length, set_length: 58, 48;
    pub circulating, set_circulating: 62;
    pub more_follows, set_more_follows: 63;
    u16;
    pub irq, set_irq: 79, 64;
}

impl<B> DatagramHeader<B> {
    pub const SIZE: usize = DATAGRAM_HEADER_LENGTH;
}

/// One datagram to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramRequest {
    pub command: CommandType,
    pub index: u8,
    pub adp: u16,
    pub ado: u16,
    pub payload: Vec<u8>,
}

impl DatagramRequest {
    pub fn read(command: CommandType, index: u8, adp: u16, ado: u16, len: usize) -> Self {
        Self { command, index, adp, ado, payload: vec![0; len] }
    }

    pub fn write(command: CommandType, index: u8, adp: u16, ado: u16, payload: Vec<u8>) -> Self {
        Self { command, index, adp, ado, payload }
    }

    pub fn logical(command: CommandType, index: u8, logical_address: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            index,
            adp: (logical_address & 0xFFFF) as u16,
            ado: (logical_address >> 16) as u16,
            payload,
        }
    }
}

/// A datagram returned by the segment, with the slave-incremented WKC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramResponse {
    pub command: CommandType,
    pub index: u8,
    pub payload: Vec<u8>,
    pub working_counter: u16,
}

/// Build a complete Ethernet frame carrying one EtherCAT datagram.
pub fn build_datagram_frame(
    destination: &[u8; 6],
    source: &[u8; 6],
    request: &DatagramRequest,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_MIN_LENGTH + request.payload.len());
    frame.extend_from_slice(destination);
    frame.extend_from_slice(source);
    frame.extend_from_slice(&ETHERCAT_TYPE.to_be_bytes());

    let datagram_bytes =
        (DATAGRAM_HEADER_LENGTH + request.payload.len() + WKC_LENGTH) as u16;
    let mut ec_header = EtherCatHeader([0u8; ETHERCAT_HEADER_LENGTH]);
    ec_header.set_length(datagram_bytes);
    ec_header.set_frame_type(ETHERCAT_HEADER_TYPE_PDU);
    frame.extend_from_slice(&ec_header.0);

    let mut header = DatagramHeader([0u8; DATAGRAM_HEADER_LENGTH]);
    header.set_command(request.command as u8);
    header.set_index(request.index);
    header.set_adp(request.adp);
    header.set_ado(request.ado);
    header.set_length((request.payload.len() & 0x07FF) as u16);
    header.set_irq(0);
    frame.extend_from_slice(&header.0);

    frame.extend_from_slice(&request.payload);
    // Placeholder WKC in the request; slaves increment it in flight.
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame
}

/// Parse a received Ethernet frame against the expected command, datagram
/// index and payload length. Any mismatch yields `None` so the caller can
/// keep draining unrelated frames from the segment.
pub fn parse_datagram_frame(
    frame: &[u8],
    expected_command: CommandType,
    expected_index: u8,
    expected_payload_len: usize,
) -> Option<DatagramResponse> {
    if frame.len() < FRAME_MIN_LENGTH {
        return None;
    }

    let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    if ether_type != ETHERCAT_TYPE {
        return None;
    }

    let ec_header = EtherCatHeader(&frame[ETHERNET_HEADER_LENGTH..]);
    let ethercat_length: u16 = ec_header.length();
    if ETHERNET_HEADER_LENGTH + ETHERCAT_HEADER_LENGTH + ethercat_length as usize > frame.len() {
        return None;
    }

    let header_offset = ETHERNET_HEADER_LENGTH + ETHERCAT_HEADER_LENGTH;
    let header = DatagramHeader(&frame[header_offset..]);
    if header.command() != expected_command as u8 || header.index() != expected_index {
        return None;
    }
    let payload_len = (header.length() & 0x07FF) as usize;
    if payload_len != expected_payload_len {
        return None;
    }

    let payload_offset = header_offset + DATAGRAM_HEADER_LENGTH;
    let wkc_offset = payload_offset + payload_len;
    if wkc_offset + WKC_LENGTH > frame.len() {
        return None;
    }

    Some(DatagramResponse {
        command: expected_command,
        index: expected_index,
        payload: frame[payload_offset..wkc_offset].to_vec(),
        working_counter: u16::from_le_bytes([frame[wkc_offset], frame[wkc_offset + 1]]),
    })
}

/// Overwrite the WKC trailer of a built frame, used by test fixtures that
/// play the slave side of an exchange.
pub fn set_frame_working_counter(frame: &mut [u8], wkc: u16) {
    let len = frame.len();
    if len >= WKC_LENGTH {
        frame[len - 2..].copy_from_slice(&wkc.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> DatagramRequest {
        DatagramRequest::write(CommandType::Apwr, 0x42, 0xFFFF, 0x0120, vec![0x08, 0x00])
    }

    #[test]
    fn frame_layout_literal() {
        let frame = build_datagram_frame(&BROADCAST_MAC, &[0x02; 6], &sample_request());
        // dst, src, ethertype
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(&frame[6..12], &[0x02; 6]);
        assert_eq!(&frame[12..14], &[0x88, 0xA4]);
        // EtherCAT header: 10 + 2 + 2 = 14 bytes of datagram, type nibble 0x1
        assert_eq!(&frame[14..16], &[0x0E, 0x10]);
        // datagram header
        assert_eq!(frame[16], 0x02); // APWR
        assert_eq!(frame[17], 0x42); // index
        assert_eq!(&frame[18..20], &[0xFF, 0xFF]); // adp LE
        assert_eq!(&frame[20..22], &[0x20, 0x01]); // ado LE
        assert_eq!(&frame[22..24], &[0x02, 0x00]); // len
        assert_eq!(&frame[24..26], &[0x00, 0x00]); // irq
        assert_eq!(&frame[26..28], &[0x08, 0x00]); // payload
        assert_eq!(&frame[28..30], &[0x00, 0x00]); // wkc placeholder
    }

    #[test]
    fn build_parse_round_trip() {
        let request = sample_request();
        let mut frame = build_datagram_frame(&BROADCAST_MAC, &[0x02; 6], &request);
        set_frame_working_counter(&mut frame, 3);

        let response =
            parse_datagram_frame(&frame, request.command, request.index, request.payload.len())
                .expect("frame must match");
        assert_eq!(response.command, CommandType::Apwr);
        assert_eq!(response.index, 0x42);
        assert_eq!(response.payload, request.payload);
        assert_eq!(response.working_counter, 3);
    }

    #[test]
    fn mismatches_yield_no_match() {
        let request = sample_request();
        let frame = build_datagram_frame(&BROADCAST_MAC, &[0x02; 6], &request);

        assert!(parse_datagram_frame(&frame, CommandType::Aprd, 0x42, 2).is_none());
        assert!(parse_datagram_frame(&frame, CommandType::Apwr, 0x43, 2).is_none());
        assert!(parse_datagram_frame(&frame, CommandType::Apwr, 0x42, 3).is_none());

        let mut wrong_type = frame.clone();
        wrong_type[12] = 0x08;
        wrong_type[13] = 0x00;
        assert!(parse_datagram_frame(&wrong_type, CommandType::Apwr, 0x42, 2).is_none());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(parse_datagram_frame(&[0u8; 10], CommandType::Brd, 0, 0).is_none());
    }

    #[test]
    fn auto_increment_addresses() {
        assert_eq!(auto_increment_address(0), 0x0000);
        assert_eq!(auto_increment_address(1), 0xFFFF);
        assert_eq!(auto_increment_address(2), 0xFFFE);
    }
}
