use bitfield::*;
use num_enum::TryFromPrimitive;

pub const MAILBOX_HEADER_LENGTH: usize = 6;

/// Service nibble of the mailbox type/counter byte.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum MailboxType {
    Error = 0x00,
    Aoe = 0x01,
    Eoe = 0x02,
    Coe = 0x03,
    Foe = 0x04,
    Soe = 0x05,
}

bitfield! {
    /// ESC mailbox header: `len(2 LE) | address(2 LE) | chan/prio(1) | type/counter(1)`.
    pub struct MailboxHeader([u8]);
    u16;
    pub length, set_length: 15, 0;
    pub address, set_address: 31, 16;
    u8;
    pub priority, set_priority: 33, 32;
    pub channel, set_channel: 39, 36;
    pub counter, set_counter: 42, 40;
    pub mailbox_type, set_mailbox_type: 47, 44;
}

impl<B> MailboxHeader<B> {
    pub const SIZE: usize = MAILBOX_HEADER_LENGTH;
}

/// A decoded ESC mailbox frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxFrame {
    pub channel: u8,
    pub priority: u8,
    pub mailbox_type: u8,
    pub counter: u8,
    pub payload: Vec<u8>,
}

impl MailboxFrame {
    pub fn coe(counter: u8, payload: Vec<u8>) -> Self {
        Self { channel: 0, priority: 0, mailbox_type: MailboxType::Coe as u8, counter, payload }
    }
}

/// Encode a mailbox frame. The address field is 0 for master/slave
/// mailbox exchange.
pub fn encode_mailbox(frame: &MailboxFrame) -> Vec<u8> {
    let mut header = MailboxHeader([0u8; MAILBOX_HEADER_LENGTH]);
    header.set_length(frame.payload.len() as u16);
    header.set_address(0);
    header.set_priority(frame.priority & 0x03);
    header.set_channel(frame.channel & 0x0F);
    header.set_mailbox_type(frame.mailbox_type & 0x0F);
    header.set_counter(frame.counter & 0x07);

    let mut out = Vec::with_capacity(MAILBOX_HEADER_LENGTH + frame.payload.len());
    out.extend_from_slice(&header.0);
    out.extend_from_slice(&frame.payload);
    out
}

/// Decode an ESC mailbox frame read out of a SyncManager buffer. A zero
/// or over-long length field means the buffer holds no usable frame.
pub fn decode_mailbox(bytes: &[u8]) -> Option<MailboxFrame> {
    if bytes.len() < MAILBOX_HEADER_LENGTH {
        return None;
    }
    let header = MailboxHeader(bytes);
    let payload_len = header.length() as usize;
    if payload_len == 0 || MAILBOX_HEADER_LENGTH + payload_len > bytes.len() {
        return None;
    }
    Some(MailboxFrame {
        channel: header.channel(),
        priority: header.priority(),
        mailbox_type: header.mailbox_type(),
        counter: header.counter(),
        payload: bytes[MAILBOX_HEADER_LENGTH..MAILBOX_HEADER_LENGTH + payload_len].to_vec(),
    })
}

/// Advance the master-side mailbox counter: a 1..=7 rolling count where 0
/// is reserved and skipped.
pub fn next_mailbox_counter(counter: u8) -> u8 {
    if counter >= 7 {
        1
    } else {
        counter + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_literal() {
        let frame = MailboxFrame::coe(5, vec![0xAA, 0xBB, 0xCC]);
        let bytes = encode_mailbox(&frame);
        assert_eq!(&bytes[0..2], &[0x03, 0x00]); // payload length LE
        assert_eq!(&bytes[2..4], &[0x00, 0x00]); // address
        assert_eq!(bytes[4], 0x00); // channel/priority
        assert_eq!(bytes[5], 0x35); // type=CoE in high nibble, counter=5
        assert_eq!(&bytes[6..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn decode_round_trip() {
        let frame = MailboxFrame::coe(3, vec![1, 2, 3, 4]);
        let mut bytes = encode_mailbox(&frame);
        // Slaves usually hand back a full SM window; trailing padding must
        // not confuse the decoder.
        bytes.extend_from_slice(&[0u8; 16]);
        let decoded = decode_mailbox(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_window_is_no_frame() {
        assert!(decode_mailbox(&[0u8; 32]).is_none());
        assert!(decode_mailbox(&[0u8; 3]).is_none());
    }

    #[test]
    fn counter_rolls_one_to_seven() {
        let mut counter = 0;
        let mut seen = Vec::new();
        for _ in 0..9 {
            counter = next_mailbox_counter(counter);
            seen.push(counter);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }
}
