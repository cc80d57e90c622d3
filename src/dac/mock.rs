//! Recording bus transport for tests and `--dry-run`
//!
//! Keeps a register file in memory, logs every transaction with its start
//! and end time, and can inject failures and latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::bus::BusTransport;
use super::registers::{CHIP_ID_ES9018K2M, POWER_ON_DEFAULTS, REG_CHIP_STATUS};
use crate::error::BusError;

/// Kind of a logged transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOpKind {
    Write,
    Read,
}

/// One logged transaction
#[derive(Debug, Clone)]
pub struct BusOp {
    pub kind: BusOpKind,
    pub reg: u8,
    pub value: u8,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

#[derive(Debug, Default)]
struct MockState {
    registers: BTreeMap<u8, u8>,
    log: Vec<BusOp>,
    fail_writes: usize,
    fail_reads: bool,
    failing_registers: HashSet<u8>,
    latency: Duration,
    in_flight: bool,
    overlapped: bool,
}

/// In-memory stand-in for the DAC
///
/// Clones share state, so a test can keep one clone and hand the other to
/// the gateway.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Clears the in-flight flag even when the gateway abandons a timed-out call
struct InFlight<'a>(&'a Mutex<MockState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight = false;
    }
}

impl MockTransport {
    /// A present ES9018K2M, revision 1
    pub fn new() -> Self {
        Self::with_chip_status(CHIP_ID_ES9018K2M | 0x01)
    }

    /// A device answering `status` on the chip status register
    pub fn with_chip_status(status: u8) -> Self {
        let mut registers: BTreeMap<u8, u8> = POWER_ON_DEFAULTS.iter().copied().collect();
        registers.insert(REG_CHIP_STATUS, status);
        Self {
            state: Arc::new(Mutex::new(MockState {
                registers,
                ..Default::default()
            })),
        }
    }

    /// Nothing on the bus: every read fails
    pub fn absent() -> Self {
        let mock = Self::new();
        mock.set_fail_reads(true);
        mock
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Fail the next `n` writes
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().fail_writes = n;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Fail every transaction on `reg` until cleared
    pub fn fail_register(&self, reg: u8, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_registers.insert(reg);
        } else {
            state.failing_registers.remove(&reg);
        }
    }

    pub fn set_register(&self, reg: u8, value: u8) {
        self.state.lock().registers.insert(reg, value);
    }

    /// Current content of `reg` as the device sees it
    pub fn register(&self, reg: u8) -> Option<u8> {
        self.state.lock().registers.get(&reg).copied()
    }

    /// Every logged transaction, successful or not
    pub fn ops(&self) -> Vec<BusOp> {
        self.state.lock().log.clone()
    }

    /// Successful writes as `(reg, value)` in bus order
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|op| op.kind == BusOpKind::Write && op.ok)
            .map(|op| (op.reg, op.value))
            .collect()
    }

    /// Values successfully written to `reg`, in bus order
    pub fn writes_to(&self, reg: u8) -> Vec<u8> {
        self.writes()
            .into_iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// True if two transactions were ever in flight at the same time
    pub fn overlapped(&self) -> bool {
        self.state.lock().overlapped
    }

    async fn transaction(&self, kind: BusOpKind, reg: u8, value: u8) -> Result<u8, BusError> {
        let started = Instant::now();
        let latency = {
            let mut state = self.state.lock();
            if state.in_flight {
                state.overlapped = true;
            }
            state.in_flight = true;
            state.latency
        };
        let _guard = InFlight(&self.state);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let fail = state.failing_registers.contains(&reg)
            || match kind {
                BusOpKind::Write if state.fail_writes > 0 => {
                    state.fail_writes -= 1;
                    true
                }
                BusOpKind::Write => false,
                BusOpKind::Read => state.fail_reads,
            };

        let result = if fail {
            Err(BusError::Transport {
                reg,
                reason: "no acknowledge".to_string(),
            })
        } else {
            match kind {
                BusOpKind::Write => {
                    state.registers.insert(reg, value);
                    Ok(value)
                }
                BusOpKind::Read => Ok(state.registers.get(&reg).copied().unwrap_or(0)),
            }
        };

        let logged_value = match (&result, kind) {
            (Ok(v), BusOpKind::Read) => *v,
            _ => value,
        };
        state.log.push(BusOp {
            kind,
            reg,
            value: logged_value,
            started,
            finished: Instant::now(),
            ok: result.is_ok(),
        });
        result
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn write(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
        self.transaction(BusOpKind::Write, reg, value).await.map(|_| ())
    }

    async fn read(&mut self, reg: u8) -> Result<u8, BusError> {
        self.transaction(BusOpKind::Read, reg, 0).await
    }
}
