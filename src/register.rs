//! ESC register map used by the master. Offsets follow the Beckhoff ESC
//! datasheet; only the registers the runtime actually touches are listed.

use bitfield::bitfield;

pub const ESC_TYPE: u16 = 0x0008;
pub const ESC_REVISION: u16 = 0x000A;

pub const AL_CONTROL: u16 = 0x0120;
pub const AL_STATUS: u16 = 0x0130;
pub const AL_STATUS_CODE: u16 = 0x0134;

pub const EEPROM_CONTROL_STATUS: u16 = 0x0502;
pub const EEPROM_ADDRESS: u16 = 0x0504;
pub const EEPROM_DATA: u16 = 0x0508;
pub const EEPROM_COMMAND_READ: u16 = 0x0100;
pub const EEPROM_BUSY: u16 = 0x8000;
pub const EEPROM_ERROR_MASK: u16 = 0x7800;

/// SII word addresses for identity fields.
pub const SII_WORD_VENDOR_ID: u16 = 0x0008;
pub const SII_WORD_PRODUCT_CODE: u16 = 0x000A;

pub const FMMU_BASE: u16 = 0x0600;
pub const SM_BASE: u16 = 0x0800;
pub const SM_STATUS_OFFSET: u16 = 0x0005;
/// Bit 3 of the SM status register: mailbox full (SM1) / busy (SM0).
pub const SM_STATUS_MAILBOX_FULL: u8 = 0x08;

pub const DC_SYSTEM_TIME: u16 = 0x0910;
pub const DC_SYSTEM_TIME_OFFSET: u16 = 0x0920;

pub fn fmmu_address(fmmu_index: u8) -> u16 {
    FMMU_BASE + u16::from(fmmu_index) * FmmuEntry::<[u8; 0]>::SIZE as u16
}

pub fn sm_address(sm_index: u8) -> u16 {
    SM_BASE + u16::from(sm_index) * SyncManagerEntry::<[u8; 0]>::SIZE as u16
}

pub fn sm_status_address(sm_index: u8) -> u16 {
    sm_address(sm_index) + SM_STATUS_OFFSET
}

bitfield! {
    /// One FMMU configuration entry (16 bytes at 0x0600 + 16 * n).
    #[derive(Clone)]
    pub struct FmmuEntry([u8]);
    u32;
    pub logical_start_address, set_logical_start_address: 31, 0;
    u16;
    pub length, set_length: 47, 32;
    u8;
    pub logical_start_bit, set_logical_start_bit: 50, 48;
    pub logical_end_bit, set_logical_end_bit: 58, 56;
    u16;
    pub physical_start_address, set_physical_start_address: 79, 64;
    u8;
    pub physical_start_bit, set_physical_start_bit: 82, 80;
    pub read_enable, set_read_enable: 88;
    pub write_enable, set_write_enable: 89;
    pub enable, set_enable: 96;
}

impl<B> FmmuEntry<B> {
    pub const SIZE: usize = 16;
}

impl FmmuEntry<[u8; 16]> {
    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl Default for FmmuEntry<[u8; 16]> {
    fn default() -> Self {
        Self::new()
    }
}

bitfield! {
    /// One SyncManager configuration entry (8 bytes at 0x0800 + 8 * n).
    /// Byte 4 is the control register, byte 5 the status register and
    /// byte 6 the activate register.
    #[derive(Clone)]
    pub struct SyncManagerEntry([u8]);
    u16;
    pub physical_start_address, set_physical_start_address: 15, 0;
    pub length, set_length: 31, 16;
    u8;
    pub control, set_control: 39, 32;
    pub status, _: 47, 40;
    pub activate, set_activate: 55, 48;
}

impl<B> SyncManagerEntry<B> {
    pub const SIZE: usize = 8;
}

impl SyncManagerEntry<[u8; 8]> {
    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl Default for SyncManagerEntry<[u8; 8]> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmmu_entry_layout_is_bit_exact() {
        let mut entry = FmmuEntry::new();
        entry.set_logical_start_address(0x0001_1000);
        entry.set_length(0x0002);
        entry.set_logical_start_bit(0);
        entry.set_logical_end_bit(7);
        entry.set_physical_start_address(0x1100);
        entry.set_physical_start_bit(0);
        entry.set_write_enable(true);
        entry.set_enable(true);

        let expected: [u8; 16] = [
            0x00, 0x10, 0x01, 0x00, // logical start, LE
            0x02, 0x00, // length, LE
            0x00, 0x07, // start bit, end bit
            0x00, 0x11, // physical start, LE
            0x00, // physical start bit
            0x02, // direction: write enable
            0x01, // enable
            0x00, 0x00, 0x00,
        ];
        assert_eq!(entry.0, expected);
    }

    #[test]
    fn fmmu_read_direction_sets_bit_zero() {
        let mut entry = FmmuEntry::new();
        entry.set_read_enable(true);
        assert_eq!(entry.0[11], 0x01);
    }

    #[test]
    fn sm_entry_layout_is_bit_exact() {
        let mut entry = SyncManagerEntry::new();
        entry.set_physical_start_address(0x1100);
        entry.set_length(0x0001);
        entry.set_control(0x24);
        entry.set_activate(0x01);

        let expected: [u8; 8] = [0x00, 0x11, 0x01, 0x00, 0x24, 0x00, 0x01, 0x00];
        assert_eq!(entry.0, expected);
    }

    #[test]
    fn register_block_addressing() {
        assert_eq!(sm_address(2), 0x0810);
        assert_eq!(sm_status_address(1), 0x080D);
        assert_eq!(fmmu_address(1), 0x0610);
    }
}
