use crate::error::{LoadError, MachineError, Result};

pub const MEMORY_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    data: [u8; MEMORY_SIZE],
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: [0; MEMORY_SIZE],
        }
    }

    // Addresses are usize so that pc + 1 / pc + 2 past the top of memory is
    // reported instead of wrapping back to address 0.
    pub fn read(&self, address: usize) -> Result<u8> {
        self.data
            .get(address)
            .copied()
            .ok_or(MachineError::AddressOutOfRange(address))
    }

    pub fn write(&mut self, address: usize, value: u8) -> Result<()> {
        let cell = self
            .data
            .get_mut(address)
            .ok_or(MachineError::AddressOutOfRange(address))?;
        *cell = value;
        Ok(())
    }

    /// Unchecked peek for diagnostics.
    pub fn get(&self, address: usize) -> Option<u8> {
        self.data.get(address).copied()
    }

    /// Copy a program image to address 0. Cells past the image keep their contents.
    pub fn load_program(&mut self, program: &[u8]) -> std::result::Result<(), LoadError> {
        if program.len() > MEMORY_SIZE {
            return Err(LoadError::ProgramTooLarge(program.len()));
        }
        self.data[..program.len()].copy_from_slice(program);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8; MEMORY_SIZE] {
        &self.data
    }
}
