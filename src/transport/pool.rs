//! Bulk transfer pool.
//!
//! Manages the outstanding transfers of one opened device:
//! - a fixed set of read slots, each resubmitted with the same buffer as soon
//!   as it completes ([`ReadPump`])
//! - a growable set of write slots, recycled through an idle list before a
//!   new one is allocated
//!
//! ```text
//! ReadPump ── submit_read × N ──► DeviceHandle ──► completions (in order) ──► FrameCodec
//! Writer task ── write() ── acquire slot ── submit_write ──► DeviceHandle
//! ```
//!
//! Read timeouts are resubmitted. Any other transfer error is returned to the
//! caller, which escalates it to the session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{FuturesOrdered, StreamExt};

use super::device::{BoxFuture, Completion, DeviceHandle};
use super::in_flight::InFlightTracker;
use crate::config::TransferConfig;
use crate::error::{AccessoryError, Result};
use crate::protocol::FrameCodec;
use crate::shutdown::ShutdownSignal;
use crate::writer::{FrameSink, OutboundMessage};

/// A reusable outbound buffer.
#[derive(Debug, Default)]
pub struct WriteSlot {
    buffer: BytesMut,
}

impl WriteSlot {
    fn new() -> Self {
        Self::default()
    }

    /// Bytes the slot can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// Transfer pool for one device session.
pub struct TransferPool {
    device: Arc<dyn DeviceHandle>,
    config: TransferConfig,
    idle_writes: Mutex<Vec<WriteSlot>>,
    allocated_writes: AtomicUsize,
    in_flight: InFlightTracker,
    cancel: ShutdownSignal,
}

impl TransferPool {
    /// Create a pool with `config.write_slots` idle write slots.
    pub fn new(device: Arc<dyn DeviceHandle>, config: TransferConfig) -> Arc<Self> {
        let idle: Vec<WriteSlot> = (0..config.write_slots).map(|_| WriteSlot::new()).collect();

        Arc::new(Self {
            device,
            allocated_writes: AtomicUsize::new(idle.len()),
            idle_writes: Mutex::new(idle),
            config,
            in_flight: InFlightTracker::new(),
            cancel: ShutdownSignal::new(),
        })
    }

    /// Take an idle write slot, allocating a new one if none is free.
    pub fn acquire_write_slot(&self) -> WriteSlot {
        let reused = self
            .idle_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        match reused {
            Some(slot) => slot,
            None => {
                let total = self.allocated_writes.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(total, "allocated new write slot");
                WriteSlot::new()
            }
        }
    }

    /// Return a slot to the idle list.
    pub fn release_write_slot(&self, slot: WriteSlot) {
        self.idle_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(slot);
    }

    /// Write one message as a single bulk OUT transfer and wait for it.
    ///
    /// Returns `TransportTimeout` if the device did not accept the data in
    /// time and `ConnectionClosed` if the pool was cancelled meanwhile.
    pub async fn write(&self, message: &OutboundMessage) -> Result<()> {
        if self.cancel.is_triggered() {
            return Err(AccessoryError::ConnectionClosed);
        }

        let WriteSlot { mut buffer } = self.acquire_write_slot();
        buffer.clear();
        buffer.reserve(message.size());
        buffer.extend_from_slice(&message.header);
        buffer.extend_from_slice(&message.payload);
        let expected = buffer.len();

        let guard = self.in_flight.guard();
        let transfer = self
            .device
            .submit_write(buffer, self.config.write_timeout());

        let completion = tokio::select! {
            biased;
            _ = self.cancel.triggered() => None,
            completion = transfer => Some(completion),
        };
        drop(guard);

        let Completion { buffer, result } = match completion {
            Some(c) => c,
            None => {
                // The buffer went down with the cancelled transfer.
                self.allocated_writes.fetch_sub(1, Ordering::AcqRel);
                return Err(AccessoryError::ConnectionClosed);
            }
        };
        self.release_write_slot(WriteSlot { buffer });

        match result {
            Ok(written) if written == expected => Ok(()),
            Ok(written) => Err(AccessoryError::Transport(format!(
                "short write: {} of {} bytes",
                written, expected
            ))),
            Err(e) => Err(e),
        }
    }

    /// Cancel every outstanding transfer. Idempotent.
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_triggered()
    }

    /// Signal triggered by [`cancel`](Self::cancel).
    pub fn cancel_signal(&self) -> ShutdownSignal {
        self.cancel.clone()
    }

    /// Wait (bounded) for every transfer to retire.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(timeout).await
    }

    /// Transfers currently submitted to the device.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Write slots allocated so far (idle or in use).
    pub fn allocated_write_slots(&self) -> usize {
        self.allocated_writes.load(Ordering::Acquire)
    }

    /// Write slots currently idle.
    pub fn idle_write_slots(&self) -> usize {
        self.idle_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }
}

impl FrameSink for TransferPool {
    fn write_message<'a>(&'a self, message: &'a OutboundMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(message))
    }
}

/// Result of one [`ReadPump::read_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// This many bytes were appended to the codec.
    Data(usize),
    /// The pool was cancelled; outstanding reads are dropped with the pump.
    Cancelled,
}

type ReadTransfer = BoxFuture<'static, (usize, Completion)>;

/// Perpetual bulk IN reads.
///
/// Completions are consumed in submission order, so bytes reach the codec in
/// wire order however many reads are outstanding. Dropping the pump cancels
/// every outstanding read.
pub struct ReadPump {
    pool: Arc<TransferPool>,
    pending: FuturesOrdered<ReadTransfer>,
}

impl ReadPump {
    /// Submit `read_slots` reads of `read_size` bytes each.
    pub fn start(pool: Arc<TransferPool>) -> Self {
        let slots = pool.config.read_slots;
        let mut pump = Self {
            pool,
            pending: FuturesOrdered::new(),
        };
        for slot in 0..slots {
            pump.submit(slot, BytesMut::new());
        }
        tracing::debug!(slots, "read slots submitted");
        pump
    }

    fn submit(&mut self, slot: usize, mut buffer: BytesMut) {
        buffer.clear();
        buffer.resize(self.pool.config.read_size, 0);

        let guard = self.pool.in_flight.guard();
        let transfer = self
            .pool
            .device
            .submit_read(buffer, self.pool.config.read_timeout());

        self.pending.push_back(Box::pin(async move {
            let completion = transfer.await;
            drop(guard);
            (slot, completion)
        }));
    }

    /// Wait for the next read carrying data and append it to `codec`.
    ///
    /// The completed slot is resubmitted before this returns. Timeouts and
    /// empty reads are resubmitted silently.
    pub async fn read_into(&mut self, codec: &mut FrameCodec) -> Result<ReadEvent> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.pool.cancel.triggered() => return Ok(ReadEvent::Cancelled),
                next = self.pending.next() => next,
            };

            let (slot, Completion { buffer, result }) = match next {
                Some(done) => done,
                None => return Ok(ReadEvent::Cancelled),
            };

            match result {
                Ok(received) => {
                    let received = received.min(buffer.len());
                    codec.extend(&buffer[..received]);
                    self.submit(slot, buffer);
                    if received > 0 {
                        tracing::trace!(slot, received, "bulk read completed");
                        return Ok(ReadEvent::Data(received));
                    }
                }
                Err(e) if e.is_timeout() => {
                    tracing::trace!(slot, "bulk read timed out, resubmitting");
                    self.submit(slot, buffer);
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "bulk read failed");
                    return Err(e);
                }
            }
        }
    }

    /// Reads currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, Command};
    use crate::transport::memory::MemoryDevice;
    use bytes::Bytes;

    fn small_config() -> TransferConfig {
        TransferConfig {
            read_slots: 4,
            read_size: 8,
            write_slots: 2,
            read_timeout_ms: 20,
            write_timeout_ms: 50,
            cancel_timeout_ms: 200,
        }
    }

    #[test]
    fn test_write_slots_are_recycled() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device), small_config());
        assert_eq!(pool.allocated_write_slots(), 2);

        let a = pool.acquire_write_slot();
        let b = pool.acquire_write_slot();
        assert_eq!(pool.idle_write_slots(), 0);

        // Pool is empty: grows by one.
        let c = pool.acquire_write_slot();
        assert_eq!(pool.allocated_write_slots(), 3);

        pool.release_write_slot(a);
        pool.release_write_slot(b);
        pool.release_write_slot(c);
        assert_eq!(pool.idle_write_slots(), 3);

        let _d = pool.acquire_write_slot();
        assert_eq!(pool.allocated_write_slots(), 3);
    }

    #[tokio::test]
    async fn test_write_sends_header_and_payload_together() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device.clone()), small_config());

        let message = OutboundMessage::new(Command::Test, Bytes::from_static(&[0x00, 0x0F])).unwrap();
        pool.write(&message).await.unwrap();

        assert_eq!(
            device.written(),
            vec![Bytes::from(build_frame(Command::Test, &[0x00, 0x0F]).unwrap())]
        );
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.idle_write_slots(), 2);
    }

    #[tokio::test]
    async fn test_write_timeout_reported() {
        let device = MemoryDevice::new();
        device.close_write_gate();
        let pool = TransferPool::new(Arc::new(device.clone()), small_config());

        let result = pool.write(&OutboundMessage::empty(Command::Exit)).await;
        assert!(matches!(result, Err(AccessoryError::TransportTimeout)));
        assert!(device.written().is_empty());
        // Slot came back with the completion.
        assert_eq!(pool.idle_write_slots(), 2);
    }

    #[tokio::test]
    async fn test_write_after_cancel_fails() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device), small_config());
        pool.cancel();

        let result = pool.write(&OutboundMessage::empty(Command::Exit)).await;
        assert!(matches!(result, Err(AccessoryError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_write() {
        let device = MemoryDevice::new();
        device.close_write_gate();
        let mut config = small_config();
        config.write_timeout_ms = 10_000;
        let pool = TransferPool::new(Arc::new(device), config);

        let writer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.write(&OutboundMessage::empty(Command::Exit)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.in_flight(), 1);

        pool.cancel();
        let result = writer.await.unwrap();
        assert!(matches!(result, Err(AccessoryError::ConnectionClosed)));
        assert!(pool.wait_idle(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_reads_deliver_in_wire_order() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device.clone()), small_config());
        let mut pump = ReadPump::start(pool.clone());
        assert_eq!(pump.outstanding(), 4);

        // 20 bytes spread across several 8-byte reads.
        let mut bytes = build_frame(Command::Test, &[0, 5]).unwrap();
        bytes.extend(build_frame(Command::CamFrame, &[1, 2, 3, 4, 5, 6]).unwrap());
        device.inject(bytes);

        let mut codec = FrameCodec::new();
        let mut frames = Vec::new();
        while frames.len() < 2 {
            let event = pump.read_into(&mut codec).await.unwrap();
            assert!(matches!(event, ReadEvent::Data(_)));
            frames.extend(codec.frames().map(|f| f.unwrap()));
        }

        assert_eq!(frames[0].command, Command::Test);
        assert_eq!(frames[1].payload(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(pump.outstanding(), 4);
    }

    #[tokio::test]
    async fn test_read_timeouts_are_resubmitted() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device.clone()), small_config());
        let mut pump = ReadPump::start(pool);

        let injector = {
            let device = device.clone();
            tokio::spawn(async move {
                // Several read timeouts pass first.
                tokio::time::sleep(Duration::from_millis(80)).await;
                device.inject(build_frame(Command::AppConnected, &[]).unwrap());
            })
        };

        let mut codec = FrameCodec::new();
        let event = pump.read_into(&mut codec).await.unwrap();
        assert_eq!(event, ReadEvent::Data(6));
        assert_eq!(
            codec.push(&[]).unwrap()[0].command,
            Command::AppConnected
        );
        injector.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_transport_error_escalates() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device.clone()), small_config());
        let mut pump = ReadPump::start(pool);

        device.disconnect();
        let mut codec = FrameCodec::new();
        let result = pump.read_into(&mut codec).await;
        assert!(matches!(result, Err(AccessoryError::Transport(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_reads_and_retires_transfers() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device), small_config());
        let mut pump = ReadPump::start(pool.clone());
        assert_eq!(pool.in_flight(), 4);

        pool.cancel();
        let mut codec = FrameCodec::new();
        assert_eq!(pump.read_into(&mut codec).await.unwrap(), ReadEvent::Cancelled);

        drop(pump);
        assert!(pool.wait_idle(Duration::from_millis(100)).await);
    }
}
