//! In-memory device for tests and the loopback demo.
//!
//! [`MemoryDevice`] plays the Android side of the link: bytes passed to
//! [`MemoryDevice::inject`] are handed to outstanding reads in submission
//! order, and every completed bulk OUT transfer is recorded for inspection.
//! [`MemoryProvider`] scripts detection and the mode switch around it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, watch};

use super::device::{
    BoxFuture, Completion, DetectedDevice, DeviceHandle, DeviceProvider, ACCESSORY_VENDOR_ID,
};
use crate::config::AccessoryIdentity;
use crate::error::{AccessoryError, Result};
use crate::protocol::{build_frame, Command, Frame, FrameCodec};

struct PendingRead {
    max_len: usize,
    tx: oneshot::Sender<Result<Bytes>>,
}

#[derive(Default)]
struct State {
    pending_reads: VecDeque<PendingRead>,
    inbound: VecDeque<Bytes>,
    written: Vec<Bytes>,
    disconnected: bool,
}

struct Inner {
    state: Mutex<State>,
    written_count: watch::Sender<usize>,
    write_gate: watch::Sender<bool>,
    claimed: AtomicBool,
    released: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scriptable accessory endpoint pair.
#[derive(Clone)]
pub struct MemoryDevice {
    inner: Arc<Inner>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        let (written_count, _) = watch::channel(0);
        let (write_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                written_count,
                write_gate,
                claimed: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver bytes from the device side.
    ///
    /// Data goes to the oldest outstanding read first; what does not fit is
    /// buffered for reads submitted later.
    pub fn inject(&self, data: impl Into<Bytes>) {
        let mut data: Bytes = data.into();
        let mut state = self.inner.lock();

        while !data.is_empty() {
            let Some(read) = state.pending_reads.pop_front() else {
                break;
            };
            if read.tx.is_closed() {
                continue;
            }

            let chunk = data.split_to(read.max_len.min(data.len()));
            if let Err(Ok(chunk)) = read.tx.send(Ok(chunk)) {
                // Reader went away between the check and the send.
                let mut merged = BytesMut::from(&chunk[..]);
                merged.extend_from_slice(&data);
                data = merged.freeze();
            }
        }

        if !data.is_empty() {
            state.inbound.push_back(data);
        }
    }

    /// Deliver one encoded frame from the device side.
    pub fn inject_frame(&self, command: Command, payload: &[u8]) {
        match build_frame(command, payload) {
            Ok(frame) => self.inject(frame),
            Err(e) => tracing::warn!(%command, error = %e, "frame not injected"),
        }
    }

    /// Fail every outstanding and future transfer with a transport error.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.disconnected = true;
        for read in state.pending_reads.drain(..) {
            let _ = read
                .tx
                .send(Err(AccessoryError::Transport("device disconnected".into())));
        }
    }

    /// Bring a disconnected device back with empty buffers.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        *state = State::default();
        drop(state);
        self.inner.written_count.send_replace(0);
        self.inner.claimed.store(false, Ordering::Release);
        self.inner.released.store(false, Ordering::Release);
    }

    /// Hold bulk OUT transfers until the gate is reopened or they time out.
    pub fn close_write_gate(&self) {
        self.inner.write_gate.send_replace(false);
    }

    pub fn open_write_gate(&self) {
        self.inner.write_gate.send_replace(true);
    }

    /// Every completed bulk OUT transfer, in completion order.
    pub fn written(&self) -> Vec<Bytes> {
        self.inner.lock().written.clone()
    }

    /// Decode everything written so far as a frame stream.
    pub fn written_frames(&self) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        for chunk in self.written() {
            codec.extend(&chunk);
        }
        codec.frames().filter_map(|frame| frame.ok()).collect()
    }

    /// Wait until at least `count` writes completed. Returns `false` on timeout.
    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.inner.written_count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|written| *written >= count))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false)
    }

    /// Reads currently waiting for data.
    pub fn pending_reads(&self) -> usize {
        self.inner
            .lock()
            .pending_reads
            .iter()
            .filter(|read| !read.tx.is_closed())
            .count()
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn fill(mut buffer: BytesMut, chunk: Bytes) -> Completion {
    buffer.clear();
    buffer.extend_from_slice(&chunk);
    Completion::ok(buffer, chunk.len())
}

fn take_chunk(inbound: &mut VecDeque<Bytes>, max_len: usize) -> Option<Bytes> {
    let mut chunk = inbound.pop_front()?;
    if chunk.len() > max_len {
        let rest = chunk.split_off(max_len);
        inbound.push_front(rest);
    }
    Some(chunk)
}

impl DeviceHandle for MemoryDevice {
    fn claim(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.inner.lock().disconnected {
                return Err(AccessoryError::Transport("device disconnected".into()));
            }
            self.inner.claimed.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn submit_read(&self, buffer: BytesMut, timeout: Duration) -> BoxFuture<'static, Completion> {
        let max_len = buffer.len();
        let rx = {
            let mut state = self.inner.lock();
            if state.disconnected {
                let error = AccessoryError::Transport("device disconnected".into());
                return Box::pin(async move { Completion::err(buffer, error) });
            }
            if let Some(chunk) = take_chunk(&mut state.inbound, max_len) {
                return Box::pin(async move { fill(buffer, chunk) });
            }

            let (tx, rx) = oneshot::channel();
            state.pending_reads.push_back(PendingRead { max_len, tx });
            rx
        };

        let inner = self.inner.clone();
        Box::pin(async move {
            let mut rx = rx;
            let received = match tokio::time::timeout(timeout, &mut rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    // Settle under the state lock: `inject` either delivered
                    // before this point or sees the read as closed.
                    let _state = inner.lock();
                    match rx.try_recv() {
                        Ok(received) => Some(received),
                        Err(oneshot::error::TryRecvError::Empty) => {
                            rx.close();
                            return Completion::err(buffer, AccessoryError::TransportTimeout);
                        }
                        Err(oneshot::error::TryRecvError::Closed) => None,
                    }
                }
            };

            match received {
                Some(Ok(chunk)) => fill(buffer, chunk),
                Some(Err(e)) => Completion::err(buffer, e),
                None => Completion::err(
                    buffer,
                    AccessoryError::Transport("read abandoned by device".into()),
                ),
            }
        })
    }

    fn submit_write(&self, buffer: BytesMut, timeout: Duration) -> BoxFuture<'static, Completion> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut gate = inner.write_gate.subscribe();
            let opened = tokio::time::timeout(timeout, gate.wait_for(|open| *open))
                .await
                .map(|waited| waited.is_ok());
            match opened {
                Ok(true) => {}
                Ok(false) => {
                    return Completion::err(
                        buffer,
                        AccessoryError::Transport("write gate dropped".into()),
                    )
                }
                Err(_) => return Completion::err(buffer, AccessoryError::TransportTimeout),
            }

            let count = {
                let mut state = inner.lock();
                if state.disconnected {
                    drop(state);
                    return Completion::err(
                        buffer,
                        AccessoryError::Transport("device disconnected".into()),
                    );
                }
                state.written.push(Bytes::copy_from_slice(&buffer));
                state.written.len()
            };
            inner.written_count.send_replace(count);

            let written = buffer.len();
            Completion::ok(buffer, written)
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.released.store(true, Ordering::Release);
            Ok(())
        })
    }
}

/// Product id the scripted device re-enumerates with after a mode switch.
const SWITCHED_PRODUCT_ID: u16 = 0x2D01;

struct ProviderState {
    current: Option<DetectedDevice>,
    /// Detections that report nothing before `current` shows up.
    absent_polls: u32,
    switch_requests: Vec<AccessoryIdentity>,
    follows_switch: bool,
    /// Opens that fail before one succeeds.
    failing_opens: u32,
}

/// Scripted detection, mode switch and open around one [`MemoryDevice`].
pub struct MemoryProvider {
    device: MemoryDevice,
    state: Mutex<ProviderState>,
    detections: AtomicU32,
    opens: AtomicU32,
}

impl MemoryProvider {
    fn with_state(device: MemoryDevice, current: Option<DetectedDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(ProviderState {
                current,
                absent_polls: 0,
                switch_requests: Vec::new(),
                follows_switch: true,
                failing_opens: 0,
            }),
            detections: AtomicU32::new(0),
            opens: AtomicU32::new(0),
        }
    }

    /// A device already enumerated in accessory mode.
    pub fn accessory(device: MemoryDevice) -> Self {
        Self::with_state(
            device,
            Some(DetectedDevice::new(ACCESSORY_VENDOR_ID, 0x2D00)),
        )
    }

    /// A phone in normal mode that re-enumerates as an accessory when asked.
    pub fn phone(device: MemoryDevice, vendor_id: u16, product_id: u16) -> Self {
        Self::with_state(device, Some(DetectedDevice::new(vendor_id, product_id)))
    }

    /// Nothing attached.
    pub fn absent(device: MemoryDevice) -> Self {
        Self::with_state(device, None)
    }

    /// Report nothing for the first `polls` detections.
    pub fn appear_after(self, polls: u32) -> Self {
        self.lock().absent_polls = polls;
        self
    }

    /// Keep reporting the original ids after a switch request.
    pub fn ignore_switch(self) -> Self {
        self.lock().follows_switch = false;
        self
    }

    /// Fail the first `count` opens with a transport error.
    pub fn fail_opens(self, count: u32) -> Self {
        self.lock().failing_opens = count;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identities received by `switch_to_accessory`, in call order.
    pub fn switch_requests(&self) -> Vec<AccessoryIdentity> {
        self.lock().switch_requests.clone()
    }

    pub fn detections(&self) -> u32 {
        self.detections.load(Ordering::Acquire)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Acquire)
    }

    pub fn device(&self) -> &MemoryDevice {
        &self.device
    }
}

impl DeviceProvider for MemoryProvider {
    fn detect(&self) -> BoxFuture<'_, Result<Option<DetectedDevice>>> {
        Box::pin(async move {
            self.detections.fetch_add(1, Ordering::AcqRel);
            let mut state = self.lock();
            if state.absent_polls > 0 {
                state.absent_polls -= 1;
                return Ok(None);
            }
            Ok(state.current)
        })
    }

    fn switch_to_accessory<'a>(
        &'a self,
        device: DetectedDevice,
        identity: &'a AccessoryIdentity,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.switch_requests.push(identity.clone());
            if state.follows_switch && state.current == Some(device) {
                state.current = Some(DetectedDevice::new(ACCESSORY_VENDOR_ID, SWITCHED_PRODUCT_ID));
            }
            Ok(())
        })
    }

    fn open(&self, device: DetectedDevice) -> BoxFuture<'_, Result<Arc<dyn DeviceHandle>>> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                if state.current != Some(device) {
                    return Err(AccessoryError::Transport(format!("device {} is gone", device)));
                }
                if state.failing_opens > 0 {
                    state.failing_opens -= 1;
                    return Err(AccessoryError::Transport(format!("device {} is busy", device)));
                }
            }
            self.opens.fetch_add(1, Ordering::AcqRel);
            let handle: Arc<dyn DeviceHandle> = Arc::new(self.device.clone());
            Ok(handle)
        })
    }
}
