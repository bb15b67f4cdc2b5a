use bit_field::BitField;

/// Owned input/output process images with bit-level accessors. The buffers
/// are reset whenever the master is (re)configured.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessImage {
    input: Vec<u8>,
    output: Vec<u8>,
}

impl ProcessImage {
    pub fn new(input_bytes: usize, output_bytes: usize) -> Self {
        Self { input: vec![0; input_bytes], output: vec![0; output_bytes] }
    }

    pub fn input_bytes(&self) -> &[u8] {
        &self.input
    }

    pub fn input_bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.input
    }

    pub fn output_bytes(&self) -> &[u8] {
        &self.output
    }

    pub fn output_bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.output
    }

    pub fn read_input_bit(&self, byte_offset: usize, bit_index: u8) -> Option<bool> {
        if bit_index >= 8 {
            return None;
        }
        self.input.get(byte_offset).map(|byte| byte.get_bit(usize::from(bit_index)))
    }

    pub fn read_output_bit(&self, byte_offset: usize, bit_index: u8) -> Option<bool> {
        if bit_index >= 8 {
            return None;
        }
        self.output.get(byte_offset).map(|byte| byte.get_bit(usize::from(bit_index)))
    }

    pub fn write_output_bit(&mut self, byte_offset: usize, bit_index: u8, value: bool) -> bool {
        if bit_index >= 8 {
            return false;
        }
        match self.output.get_mut(byte_offset) {
            Some(byte) => {
                byte.set_bit(usize::from(bit_index), value);
                true
            }
            None => false,
        }
    }
}
