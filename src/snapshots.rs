use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cpu::{CpuState, REGISTER_COUNT};
use crate::error::SnapshotError;
use crate::machine::Machine;
use crate::memory::{Memory, MEMORY_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub registers: [u8; REGISTER_COUNT],
    pub pc: usize,
    pub fl: u8,
    pub state: CpuState,
    pub cycles: u64,
}

/// Point-in-time copy of a machine, kept in memory for inspection and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub cpu: CpuSnapshot,
    /// Base64 of the 256 memory cells.
    pub memory: String,
    /// Hex SHA-256 of the raw memory cells.
    pub checksum: String,
}

fn checksum(memory: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(memory);
    format!("{:x}", hasher.finalize())
}

impl MachineSnapshot {
    pub fn capture(machine: &Machine) -> Self {
        let memory = machine.memory.as_bytes();
        let cpu = &machine.cpu;

        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            cpu: CpuSnapshot {
                registers: cpu.reg,
                pc: cpu.pc,
                fl: cpu.fl,
                state: cpu.state,
                cycles: cpu.cycles,
            },
            memory: BASE64_STANDARD.encode(memory),
            checksum: checksum(memory),
        }
    }

    pub fn memory_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let bytes = BASE64_STANDARD
            .decode(&self.memory)
            .map_err(|_| SnapshotError::Decode)?;
        if bytes.len() != MEMORY_SIZE {
            return Err(SnapshotError::Size(bytes.len()));
        }
        if checksum(&bytes) != self.checksum {
            return Err(SnapshotError::Checksum);
        }
        Ok(bytes)
    }

    /// Overwrite the machine's CPU and memory. The machine is left untouched
    /// if the snapshot fails validation.
    pub fn restore_to(&self, machine: &mut Machine) -> Result<(), SnapshotError> {
        let bytes = self.memory_bytes()?;

        let mut memory = Memory::new();
        memory
            .load_program(&bytes)
            .map_err(|_| SnapshotError::Size(bytes.len()))?;

        machine.memory = memory;
        machine.cpu.reg = self.cpu.registers;
        machine.cpu.pc = self.cpu.pc;
        machine.cpu.fl = self.cpu.fl;
        machine.cpu.state = self.cpu.state;
        machine.cpu.cycles = self.cpu.cycles;
        Ok(())
    }
}
