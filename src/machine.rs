use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::cpu::{Cpu, CpuState, HaltReason};
use crate::dispatch::{DispatchTable, DISPATCH_TABLE};
use crate::error::{LoadError, MachineError, Result};
use crate::memory::Memory;
use crate::metrics::{record_fault, record_halt, record_instruction, record_program_load, Timer};
use crate::opcodes::instruction_name;

/// An LS-8 computer: CPU, 256 bytes of RAM and the sink PRN writes to.
pub struct Machine {
    pub cpu: Cpu,
    pub memory: Memory,
    output: Box<dyn Write + Send>,
    dispatch: &'static DispatchTable,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A machine printing to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Machine {
            cpu: Cpu::new(),
            memory: Memory::new(),
            output,
            dispatch: &DISPATCH_TABLE,
        }
    }

    pub fn load(&mut self, program: &[u8]) -> std::result::Result<(), LoadError> {
        self.memory.load_program(program)?;
        record_program_load();
        tracing::debug!(bytes = program.len(), "program loaded");
        Ok(())
    }

    /// Clear CPU state and memory.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.memory = Memory::new();
    }

    pub fn ram_read(&self, address: usize) -> Result<u8> {
        self.memory.read(address)
    }

    pub fn ram_write(&mut self, address: usize, value: u8) -> Result<()> {
        self.memory.write(address, value)
    }

    pub(crate) fn print(&mut self, value: u8) -> Result<()> {
        writeln!(self.output, "{}", value)?;
        Ok(())
    }

    /// Read the opcode at pc and the two bytes after it.
    ///
    /// The window is always three bytes wide, so an instruction in the last
    /// two cells of memory cannot be fetched.
    pub fn fetch(&self) -> Result<(u8, u8, u8)> {
        let pc = self.cpu.get_pc();
        Ok((
            self.ram_read(pc)?,
            self.ram_read(pc + 1)?,
            self.ram_read(pc + 2)?,
        ))
    }

    /// Execute one instruction. Returns `Ok(false)` if the machine had
    /// already halted.
    pub fn step(&mut self) -> Result<bool> {
        if self.cpu.is_halted() {
            return Ok(false);
        }
        self.cpu.state = CpuState::Running;

        let pc = self.cpu.get_pc();
        let (opcode, operand_a, operand_b) = match self.fetch() {
            Ok(window) => window,
            Err(err) => return Err(self.fault(err)),
        };
        let handler = match self.dispatch.get(opcode) {
            Some(handler) => handler,
            None => return Err(self.fault(MachineError::UnknownOpcode { opcode, pc })),
        };

        let timer = Timer::new();
        let name = instruction_name(opcode);
        tracing::trace!(pc, opcode, operand_a, operand_b, "{}", name);

        if let Err(err) = handler(self, operand_a, operand_b) {
            return Err(self.fault(err));
        }
        self.cpu.cycles += 1;
        record_instruction(opcode, timer.elapsed());

        if let Some(reason) = self.cpu.halt_reason() {
            record_halt(reason);
            match reason {
                HaltReason::DivisionByZero => {
                    tracing::warn!(pc, cycles = self.cpu.cycles, "halted on division by zero")
                }
                _ => tracing::debug!(pc, cycles = self.cpu.cycles, "halted"),
            }
        }
        Ok(true)
    }

    fn fault(&mut self, err: MachineError) -> MachineError {
        tracing::error!(pc = self.cpu.get_pc(), "machine fault: {}", err);
        record_fault(&err);
        self.cpu.halt(HaltReason::Fault);
        err
    }

    /// Run until the machine halts.
    pub fn run(&mut self) -> Result<HaltReason> {
        self.run_with(0, |_| {})
    }

    /// Run until the machine halts or `max_steps` instructions have executed
    /// (0 means no limit). `before_step` sees the machine ahead of every fetch.
    pub fn run_with<F>(&mut self, max_steps: u64, mut before_step: F) -> Result<HaltReason>
    where
        F: FnMut(&Machine),
    {
        if self.cpu.state == CpuState::Ready {
            self.cpu.state = CpuState::Running;
        }

        let mut executed = 0u64;
        while self.cpu.is_running() {
            if max_steps != 0 && executed == max_steps {
                self.output.flush()?;
                return Err(MachineError::StepLimitExceeded(max_steps));
            }
            before_step(self);
            self.step()?;
            executed += 1;
        }
        self.output.flush()?;

        Ok(self.cpu.halt_reason().unwrap_or(HaltReason::Halt))
    }

    /// One line of machine state: pc, flags, the fetch window, then the
    /// registers. Cells past the end of memory show as `--`.
    pub fn trace(&self) -> String {
        let pc = self.cpu.get_pc();
        let cell = |address: usize| match self.memory.get(address) {
            Some(value) => format!("{:02X}", value),
            None => String::from("--"),
        };

        let mut line = format!(
            "TRACE: {:02X} {:02X} | {} {} {} |",
            pc,
            self.cpu.get_flags(),
            cell(pc),
            cell(pc + 1),
            cell(pc + 2)
        );
        for value in self.cpu.reg {
            line.push_str(&format!(" {:02X}", value));
        }
        line
    }
}

/// Cloneable in-memory sink for program output.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut buffer) = self.0.lock() {
            buffer.clear();
        }
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
