//! Bus gateway - serialized, throttled access to the DAC's control bus
//!
//! All register traffic goes through one worker task that owns the queue.
//! Queued operations run strictly in submission order, one at a time, and
//! each one waits until the throttle window (measured from the end of the
//! previous operation) has elapsed. A write submitted too early is delayed,
//! never dropped.
//!
//! # Synchronous mute path
//!
//! [`BusGateway::write_sync`] skips the queue. It still takes the bus lock, so
//! it never overlaps another transaction and honours the throttle gap, but it
//! runs ahead of everything that is waiting in the queue. The caller awaits
//! completion under a bounded timeout; a timeout is reported as
//! [`BusError::Timeout`], never as a hang.
//!
//! Queued writes that were submitted before a synchronous write and touch the
//! same register bits are stale by the time they reach the bus. Those bits are
//! stripped from the queued write so a pre-emptive mute cannot be undone by an
//! older unmute still sitting in the queue.
//!
//! # Masked writes
//!
//! Queued updates carry `(reg, mask, value)` rather than a finished byte. The
//! worker computes the byte from the register shadow at execution time, so
//! independent updates of different fields of one register never clobber
//! each other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::registers::is_shadowed;
use super::shadow::RegisterShadow;
use crate::error::BusError;

/// Default minimum gap between two bus operations
pub const DEFAULT_THROTTLE_MS: u64 = 30;

/// Default time budget for one transaction (and for the whole synchronous write)
pub const DEFAULT_BUS_TIMEOUT_MS: u64 = 100;

/// Physical access to the chip's registers
///
/// Implementations perform exactly one transaction per call. Serialization,
/// throttling and timeouts are the gateway's job.
#[async_trait]
pub trait BusTransport: Send {
    /// Human-readable location of the device (e.g. "i2c-1@0x48")
    fn describe(&self) -> String;

    /// Write one register
    async fn write(&mut self, reg: u8, value: u8) -> Result<(), BusError>;

    /// Read one register
    async fn read(&mut self, reg: u8) -> Result<u8, BusError>;
}

/// Timing parameters of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Minimum gap between the end of one operation and the start of the next
    pub throttle: Duration,
    /// Time budget for a single transaction, and for a whole synchronous write
    pub timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(DEFAULT_THROTTLE_MS),
            timeout: Duration::from_millis(DEFAULT_BUS_TIMEOUT_MS),
        }
    }
}

/// Counters exposed for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BusStats {
    /// Successful writes
    pub writes: u64,
    /// Failed reads and writes
    pub failures: u64,
}

type Reply<T> = oneshot::Sender<Result<T, BusError>>;

/// Commands processed by the gateway worker
enum BusCommand {
    Update {
        reg: u8,
        mask: u8,
        value: u8,
        epoch: u64,
        reply: Option<Reply<u8>>,
    },
    Read {
        reg: u8,
        reply: Reply<u8>,
    },
    Flush(oneshot::Sender<()>),
}

/// The transport plus the time its last operation ended
struct BusLine {
    transport: Box<dyn BusTransport>,
    last_op_end: Option<Instant>,
}

/// State shared between the worker and the synchronous path
struct BusCore {
    line: tokio::sync::Mutex<BusLine>,
    shadow: RegisterShadow,
    enabled: AtomicBool,
    settings: BusSettings,
    /// Bumped by every synchronous write
    epoch: AtomicU64,
    /// Register -> (epoch, mask) of the latest synchronous write
    preempted: Mutex<HashMap<u8, (u64, u8)>>,
    writes: AtomicU64,
    failures: AtomicU64,
}

enum Op {
    Write(u8, u8),
    Read(u8),
}

impl BusCore {
    /// Run one transaction after the throttle window
    async fn transact(&self, line: &mut BusLine, op: Op) -> Result<u8, BusError> {
        if let Some(end) = line.last_op_end {
            let ready = end + self.settings.throttle;
            if Instant::now() < ready {
                trace!("Throttling bus for {:?}", ready - Instant::now());
                tokio::time::sleep_until(ready).await;
            }
        }

        let timeout = self.settings.timeout;
        let result = match op {
            Op::Write(reg, value) => {
                tokio::time::timeout(timeout, line.transport.write(reg, value))
                    .await
                    .map(|r| r.map(|_| value))
            }
            Op::Read(reg) => tokio::time::timeout(timeout, line.transport.read(reg)).await,
        };
        line.last_op_end = Some(Instant::now());

        match result {
            Ok(r) => r,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Apply a masked update: compute from shadow, write, commit on success
    async fn apply_update(&self, reg: u8, mask: u8, value: u8) -> Result<u8, BusError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(BusError::DeviceAbsent);
        }

        let mut line = self.line.lock().await;
        let byte = self.shadow.set_bits(reg, mask, value);
        match self.transact(&mut line, Op::Write(reg, byte)).await {
            Ok(_) => {
                self.shadow.store(reg, byte);
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!("reg {:#04x} <- {:#04x}", reg, byte);
                Ok(byte)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn read(&self, reg: u8) -> Result<u8, BusError> {
        let mut line = self.line.lock().await;
        match self.transact(&mut line, Op::Read(reg)).await {
            Ok(value) => {
                if is_shadowed(reg) {
                    self.shadow.store(reg, value);
                }
                trace!("reg {:#04x} -> {:#04x}", reg, value);
                Ok(value)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Mask bits of a queued update still valid after any synchronous write
    fn effective_mask(&self, reg: u8, mask: u8, epoch: u64) -> u8 {
        match self.preempted.lock().get(&reg) {
            Some((sync_epoch, sync_mask)) if *sync_epoch > epoch => mask & !sync_mask,
            _ => mask,
        }
    }
}

/// Handle to the bus gateway
///
/// Cheap to clone. The worker stops once every handle has been dropped.
#[derive(Clone)]
pub struct BusGateway {
    cmd_tx: mpsc::UnboundedSender<BusCommand>,
    core: Arc<BusCore>,
}

impl BusGateway {
    /// Spawn the gateway worker around `transport`
    ///
    /// Writes start disabled; the bootstrap enables them once the chip has
    /// been identified.
    pub fn spawn(
        transport: Box<dyn BusTransport>,
        shadow: RegisterShadow,
        settings: BusSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        debug!(
            "Bus gateway on {} (throttle {:?}, timeout {:?})",
            transport.describe(),
            settings.throttle,
            settings.timeout
        );

        let core = Arc::new(BusCore {
            line: tokio::sync::Mutex::new(BusLine {
                transport,
                last_op_end: None,
            }),
            shadow,
            enabled: AtomicBool::new(false),
            settings,
            epoch: AtomicU64::new(0),
            preempted: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        tokio::spawn(Self::run(Arc::clone(&core), cmd_rx));

        Self { cmd_tx, core }
    }

    /// Worker loop: one command at a time, in submission order
    async fn run(core: Arc<BusCore>, mut cmd_rx: mpsc::UnboundedReceiver<BusCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                BusCommand::Update {
                    reg,
                    mask,
                    value,
                    epoch,
                    reply,
                } => {
                    let mask = core.effective_mask(reg, mask, epoch);
                    let result = if mask == 0 {
                        debug!(
                            "Queued write to {:#04x} superseded by synchronous write",
                            reg
                        );
                        Ok(core.shadow.value(reg))
                    } else {
                        core.apply_update(reg, mask, value).await
                    };

                    match &result {
                        Err(BusError::DeviceAbsent) => {
                            trace!("Dropping write to {:#04x}, device absent", reg)
                        }
                        Err(e) => warn!("Bus write to {:#04x} failed: {}", reg, e),
                        Ok(_) => {}
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                BusCommand::Read { reg, reply } => {
                    let _ = reply.send(core.read(reg).await);
                }
                BusCommand::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        debug!("Bus gateway worker stopped");
    }

    fn submit(&self, reg: u8, mask: u8, value: u8, reply: Option<Reply<u8>>) -> bool {
        let cmd = BusCommand::Update {
            reg,
            mask,
            value,
            epoch: self.core.epoch.load(Ordering::SeqCst),
            reply,
        };
        self.cmd_tx.send(cmd).is_ok()
    }

    /// Register shadow maintained by this gateway
    pub fn shadow(&self) -> &RegisterShadow {
        &self.core.shadow
    }

    /// Allow or forbid hardware writes
    pub fn set_enabled(&self, enabled: bool) {
        self.core.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether hardware writes are currently allowed
    pub fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::SeqCst)
    }

    /// Queue a full-byte write without waiting for it
    pub fn queue_write(&self, reg: u8, value: u8) {
        self.queue_update(reg, 0xFF, value);
    }

    /// Queue a masked write without waiting for it
    ///
    /// Failures are logged by the worker.
    pub fn queue_update(&self, reg: u8, mask: u8, value: u8) {
        if !self.submit(reg, mask, value, None) {
            warn!("Bus gateway closed, dropping write to {:#04x}", reg);
        }
    }

    /// Queue a full-byte write and wait for the result
    pub async fn write(&self, reg: u8, value: u8) -> Result<(), BusError> {
        self.update_bits(reg, 0xFF, value).await.map(|_| ())
    }

    /// Queue a masked write and wait for the result
    ///
    /// Returns the full byte now held by the register.
    pub async fn update_bits(&self, reg: u8, mask: u8, value: u8) -> Result<u8, BusError> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(reg, mask, value, Some(tx)) {
            return Err(BusError::Closed);
        }
        rx.await.map_err(|_| BusError::Closed)?
    }

    /// Queue a register read and wait for the value
    pub async fn read(&self, reg: u8) -> Result<u8, BusError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BusCommand::Read { reg, reply: tx })
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    /// Masked write that bypasses the queue and completes before returning
    ///
    /// The whole call, including waiting for an in-flight transaction, is
    /// bounded by the gateway timeout.
    pub async fn write_sync(&self, reg: u8, mask: u8, value: u8) -> Result<u8, BusError> {
        let epoch = self.core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.preempted.lock().insert(reg, (epoch, mask));

        let timeout = self.core.settings.timeout;
        let result = match tokio::time::timeout(timeout, self.core.apply_update(reg, mask, value))
            .await
        {
            Ok(r) => r,
            Err(_) => {
                self.core.failures.fetch_add(1, Ordering::Relaxed);
                Err(BusError::Timeout(timeout))
            }
        };

        if let Err(e) = &result {
            warn!("Synchronous write to {:#04x} failed: {}", reg, e);
        }
        result
    }

    /// Wait until everything queued before this call has been processed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(BusCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Write and failure counters
    pub fn stats(&self) -> BusStats {
        BusStats {
            writes: self.core.writes.load(Ordering::Relaxed),
            failures: self.core.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dac::mock::{BusOpKind, MockTransport};
    use crate::dac::registers::*;

    fn spawn_gateway(mock: &MockTransport) -> BusGateway {
        let gw = BusGateway::spawn(
            Box::new(mock.clone()),
            RegisterShadow::new(),
            BusSettings::default(),
        );
        gw.set_enabled(true);
        gw
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_keep_submission_order() {
        let mock = MockTransport::new();
        let gw = spawn_gateway(&mock);

        gw.queue_write(REG_VOLUME_LEFT, 0x10);
        gw.queue_write(REG_VOLUME_RIGHT, 0x20);
        gw.queue_write(REG_VOLUME_LEFT, 0x30);
        gw.flush().await;

        assert_eq!(
            mock.writes(),
            vec![
                (REG_VOLUME_LEFT, 0x10),
                (REG_VOLUME_RIGHT, 0x20),
                (REG_VOLUME_LEFT, 0x30)
            ]
        );
        assert_eq!(gw.shadow().value(REG_VOLUME_LEFT), 0x30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_gap_between_operations() {
        let mock = MockTransport::new();
        mock.set_latency(Duration::from_millis(5));
        let gw = spawn_gateway(&mock);

        for i in 0..5 {
            gw.queue_write(REG_VOLUME_LEFT, i);
        }
        let _ = gw.read(REG_CHIP_STATUS).await;
        gw.flush().await;

        let ops = mock.ops();
        assert_eq!(ops.len(), 6);
        for pair in ops.windows(2) {
            let gap = pair[1].started - pair[0].finished;
            assert!(
                gap >= Duration::from_millis(DEFAULT_THROTTLE_MS),
                "gap {:?} shorter than throttle window",
                gap
            );
        }
        assert!(!mock.overlapped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_leaves_shadow_unchanged() {
        let mock = MockTransport::new();
        let gw = spawn_gateway(&mock);
        gw.write(REG_VOLUME_LEFT, 0x40).await.unwrap();

        mock.fail_next_writes(1);
        let err = gw.write(REG_VOLUME_LEFT, 0x80).await.unwrap_err();
        assert!(matches!(err, BusError::Transport { reg: REG_VOLUME_LEFT, .. }));
        assert_eq!(gw.shadow().value(REG_VOLUME_LEFT), 0x40);
        assert_eq!(gw.stats().failures, 1);

        // Playback continues: the next write goes through
        gw.write(REG_VOLUME_LEFT, 0x81).await.unwrap();
        assert_eq!(gw.shadow().value(REG_VOLUME_LEFT), 0x81);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transaction_times_out() {
        let mock = MockTransport::new();
        mock.set_latency(Duration::from_millis(500));
        let gw = spawn_gateway(&mock);

        let err = gw.write(REG_VOLUME_LEFT, 0x40).await.unwrap_err();
        assert_eq!(err, BusError::Timeout(Duration::from_millis(DEFAULT_BUS_TIMEOUT_MS)));
        assert_eq!(gw.shadow().value(REG_VOLUME_LEFT), ATT_FULL_VOLUME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_gateway_rejects_writes_but_allows_reads() {
        let mock = MockTransport::new();
        let gw = BusGateway::spawn(
            Box::new(mock.clone()),
            RegisterShadow::new(),
            BusSettings::default(),
        );

        let err = gw.write(REG_VOLUME_LEFT, 0x40).await.unwrap_err();
        assert_eq!(err, BusError::DeviceAbsent);
        assert!(mock.writes().is_empty());

        assert!(gw.read(REG_CHIP_STATUS).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_masked_updates_do_not_clobber() {
        let mock = MockTransport::new();
        let gw = spawn_gateway(&mock);

        gw.queue_update(REG_GENERAL, GENERAL_FIR_MASK, 0b0100_0000);
        gw.queue_update(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE);
        gw.flush().await;

        assert_eq!(gw.shadow().value(REG_GENERAL), 0x80 | 0b0100_0000 | GENERAL_MUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_write_jumps_the_queue() {
        let mock = MockTransport::new();
        mock.set_latency(Duration::from_millis(5));
        let gw = spawn_gateway(&mock);

        for i in 0..4 {
            gw.queue_write(REG_VOLUME_LEFT, i);
        }
        // Let the worker start on the first queued write
        tokio::time::sleep(Duration::from_millis(1)).await;

        gw.write_sync(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
            .await
            .unwrap();
        let sync_pos = mock
            .ops()
            .iter()
            .position(|op| op.kind == BusOpKind::Write && op.reg == REG_GENERAL)
            .unwrap();
        assert!(sync_pos < 4, "synchronous write should not wait for the whole queue");

        gw.flush().await;
        assert_eq!(mock.writes().len(), 5);
        assert!(!mock.overlapped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_mute_strips_stale_queued_unmute() {
        let mock = MockTransport::new();
        mock.set_latency(Duration::from_millis(5));
        let gw = spawn_gateway(&mock);

        // Keep the worker busy so the unmute stays queued
        gw.queue_write(REG_VOLUME_LEFT, 0x10);
        gw.queue_update(REG_GENERAL, GENERAL_MUTE, 0);
        gw.queue_update(REG_GENERAL, GENERAL_MUTE | GENERAL_FIR_MASK, 0b0010_0000);
        tokio::time::sleep(Duration::from_millis(1)).await;

        gw.write_sync(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
            .await
            .unwrap();
        gw.flush().await;

        let general = gw.shadow().value(REG_GENERAL);
        assert_eq!(general & GENERAL_MUTE, GENERAL_MUTE, "mute must survive");
        assert_eq!(general & GENERAL_FIR_MASK, 0b0010_0000, "filter bits still applied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_write_timeout_is_failure() {
        let mock = MockTransport::new();
        mock.set_latency(Duration::from_millis(250));
        let gw = spawn_gateway(&mock);

        let err = gw
            .write_sync(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert_eq!(gw.shadow().value(REG_GENERAL) & GENERAL_MUTE, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_read_updates_shadow() {
        let mock = MockTransport::new();
        mock.set_register(REG_DPLL, 0x33);
        let gw = spawn_gateway(&mock);

        assert_eq!(gw.read(REG_DPLL).await.unwrap(), 0x33);
        assert_eq!(gw.shadow().value(REG_DPLL), 0x33);
    }
}
