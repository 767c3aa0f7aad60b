//! Mock Hardware Implementations
//!
//! Provides a simulated backplane for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockRegisterBus` - in-memory register file with single-coil writes
//!   landing in the digital-output register, plus fault injection
//!
//! # Fault Injection
//!
//! - `fail_reads_at(address)` - every read touching `address` fails
//! - `stick_coil(index)` - writes to that coil are accepted but ignored, so a
//!   confirming read disagrees with the request

use crate::error::{AppResult, IebError};
use crate::hardware::register_bus::RegisterBus;
use crate::hardware::register_map::DIGITAL_OUTPUT_ADDRESS;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct MockState {
    registers: BTreeMap<u16, u16>,
    failing: BTreeSet<u16>,
    stuck: BTreeSet<u16>,
    reads: usize,
    writes: Vec<(u16, bool)>,
}

/// In-memory register bus.
///
/// Registers that were never set read as zero. Coil `n` maps to bit `n` of
/// the digital-output register.
#[derive(Debug, Default)]
pub struct MockRegisterBus {
    state: Mutex<MockState>,
}

impl MockRegisterBus {
    /// Creates an empty bus (all registers zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a register value.
    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    /// Sets consecutive registers starting at `address`.
    pub fn set_block(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, &value) in (0u16..).zip(values) {
            state.registers.insert(address + offset, value);
        }
    }

    /// Current register value.
    pub fn register(&self, address: u16) -> u16 {
        self.state.lock().registers.get(&address).copied().unwrap_or(0)
    }

    /// Current digital-output register.
    pub fn outputs(&self) -> u16 {
        self.register(DIGITAL_OUTPUT_ADDRESS)
    }

    /// Makes every read covering `address` fail.
    pub fn fail_reads_at(&self, address: u16) {
        self.state.lock().failing.insert(address);
    }

    /// Makes writes to coil `index` succeed on the wire but change nothing.
    pub fn stick_coil(&self, index: u16) {
        self.state.lock().stuck.insert(index);
    }

    /// Number of read requests served (including failed ones).
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Coil writes received, in order.
    pub fn coil_writes(&self) -> Vec<(u16, bool)> {
        self.state.lock().writes.clone()
    }
}

#[async_trait]
impl RegisterBus for MockRegisterBus {
    fn endpoint(&self) -> &str {
        "mock:502"
    }

    async fn read_registers(&self, address: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut state = self.state.lock();
        state.reads += 1;

        let range = address..address.saturating_add(count);
        if let Some(bad) = state.failing.iter().find(|&&a| range.contains(&a)) {
            return Err(IebError::Fieldbus {
                endpoint: "mock:502".to_string(),
                detail: format!("injected read failure at {bad}"),
            });
        }

        Ok(range
            .map(|a| state.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_coil(&self, address: u16, value: bool) -> AppResult<()> {
        let mut state = self.state.lock();
        state.writes.push((address, value));
        if address >= 16 {
            return Err(IebError::Fieldbus {
                endpoint: "mock:502".to_string(),
                detail: format!("illegal coil address {address}"),
            });
        }
        if state.stuck.contains(&address) {
            return Ok(());
        }

        let register = state.registers.entry(DIGITAL_OUTPUT_ADDRESS).or_insert(0);
        if value {
            *register |= 1 << address;
        } else {
            *register &= !(1 << address);
        }
        Ok(())
    }
}
