//! Virtual compute device: platforms, in-order command queues, buffers, kernels
//!
//! This module reifies the usual GPU-runtime surface (platform enumeration,
//! one in-order command queue per device, named host-mirrored buffers, named
//! kernels with launch geometry and positional buffer arguments) as an
//! in-process engine. A dedicated queue thread drains submitted operations in
//! FIFO order, so every happens-before relationship a real device queue would
//! provide holds here too:
//!
//! - enqueue order **is** execution order within one queue;
//! - [`Device::queue_barrier`] is an explicit ordering marker between prior
//!   and subsequent enqueues;
//! - [`Device::block_until_finished`] returns only once everything previously
//!   enqueued has executed, surfacing the first recorded execution failure.
//!
//! Buffers keep a *device image* (bytes visible to kernels) and a *host
//! mirror* (bytes visible to the host). `queue_write_all` snapshots the mirror
//! at enqueue time; `queue_read_all` copies device → mirror when the command
//! executes and then fires the optional read callback on the queue thread.
//!
//! Kernel bodies receive a [`LaunchContext`] and lock their argument buffers
//! on demand. Binding the same buffer to two arguments of one kernel is
//! rejected at schedule time; within one launch, arguments are therefore
//! independently lockable without deadlock.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Precision;

// ============================================================================
// Errors
// ============================================================================

/// Failures raised by the device layer. All of them are model-stop severity:
/// the current simulation is unusable but the process carries on.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no compute device matches the requested filter")]
    NoDeviceMatched,
    #[error("buffer `{0}` was used before create()")]
    BufferNotCreated(String),
    #[error("buffer `{0}` was created twice")]
    BufferAlreadyCreated(String),
    #[error("buffer `{0}` has no initialised host block to upload")]
    HostBlockMissing(String),
    #[error("buffer `{name}`: {len} bytes at offset {offset} overrun the {size}-byte allocation")]
    RangeOverrun {
        name: String,
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("kernel `{0}`: argument {1} is unbound at schedule time")]
    UnboundArgument(String, usize),
    #[error("kernel `{0}`: argument {1} is out of range for arity {2}")]
    ArgumentOutOfRange(String, usize, usize),
    #[error("kernel `{0}`: the same buffer is bound to more than one argument")]
    AliasedArguments(String),
    #[error("device queue is no longer accepting work")]
    QueueClosed,
    #[error("device execution failed: {0}")]
    ExecutionFailed(String),
}

/// Failures raised *inside* a kernel body while it executes on the queue.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel requested argument {0} but only {1} are bound")]
    MissingArgument(usize, usize),
    #[error("kernel configuration invalid: {0}")]
    Configuration(String),
    #[error("kernel accessed device memory out of range: {0}")]
    OutOfRange(String),
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Platform & device enumeration
// ============================================================================

/// Static capabilities of one enumerable device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub short_name: String,
    pub vendor: String,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub compute_units: usize,
}

/// One enumerable platform and the devices it exposes.
#[derive(Clone, Debug)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub devices: Vec<DeviceInfo>,
}

/// Enumerate the compute platforms visible to this process.
///
/// The in-process engine exposes a single platform with one queue-backed
/// device whose limits mirror a typical discrete accelerator.
pub fn list_platforms() -> Vec<PlatformInfo> {
    let units = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    vec![PlatformInfo {
        name: "In-process compute".to_string(),
        vendor: "inundate".to_string(),
        devices: vec![DeviceInfo {
            name: "Host command queue".to_string(),
            short_name: "HOST0".to_string(),
            vendor: "inundate".to_string(),
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            compute_units: units,
        }],
    }]
}

/// Selection criteria for [`Executor::select_device`]. Empty matches the
/// first device of the first platform.
#[derive(Clone, Debug, Default)]
pub struct DeviceFilter {
    pub platform: Option<usize>,
    pub device: Option<usize>,
    pub name_contains: Option<String>,
}

/// Owns the enumerated platforms and the currently selected device.
pub struct Executor {
    platforms: Vec<PlatformInfo>,
    selected: Option<Device>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            platforms: list_platforms(),
            selected: None,
        }
    }

    pub fn platforms(&self) -> &[PlatformInfo] {
        &self.platforms
    }

    /// Write a summary of every platform and device to the log.
    pub fn log_platforms(&self) {
        for (pi, platform) in self.platforms.iter().enumerate() {
            info!(
                platform = pi,
                name = %platform.name,
                vendor = %platform.vendor,
                devices = platform.devices.len(),
                "compute platform"
            );
            for (di, dev) in platform.devices.iter().enumerate() {
                info!(
                    platform = pi,
                    device = di,
                    name = %dev.name,
                    max_work_group = dev.max_work_group_size,
                    compute_units = dev.compute_units,
                    "compute device"
                );
            }
        }
    }

    /// Select a device and spin up its command queue.
    pub fn select_device(&mut self, filter: &DeviceFilter) -> Result<Device, DeviceError> {
        let platform_range = match filter.platform {
            Some(p) => p..p.saturating_add(1),
            None => 0..self.platforms.len(),
        };
        for pi in platform_range {
            let Some(platform) = self.platforms.get(pi) else {
                continue;
            };
            for (di, dev) in platform.devices.iter().enumerate() {
                if let Some(wanted) = filter.device {
                    if di != wanted {
                        continue;
                    }
                }
                if let Some(fragment) = &filter.name_contains {
                    if !dev.name.contains(fragment.as_str()) {
                        continue;
                    }
                }
                let device = Device::start(dev.clone());
                info!(name = %dev.name, short = %dev.short_name, "device selected");
                self.selected = Some(device.clone());
                return Ok(device);
            }
        }
        Err(DeviceError::NoDeviceMatched)
    }

    pub fn device(&self) -> Option<&Device> {
        self.selected.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.selected.is_some()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Command queue
// ============================================================================

struct QueueState {
    pending: usize,
    failed: Option<String>,
}

struct DeviceShared {
    info: DeviceInfo,
    tx: Sender<QueueOp>,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<Condvar>,
}

/// Handle to one in-order device queue. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

enum QueueOp {
    Write {
        buffer: Arc<BufferInner>,
        offset: usize,
        bytes: Vec<u8>,
    },
    Read {
        buffer: Arc<BufferInner>,
    },
    Run(LaunchRequest),
    Barrier,
}

struct LaunchRequest {
    kernel: String,
    entry: Arc<KernelEntry>,
    args: Vec<Arc<BufferInner>>,
    global: [usize; 3],
    group: [usize; 3],
}

impl Device {
    fn start(info: DeviceInfo) -> Device {
        let (tx, rx) = unbounded::<QueueOp>();
        let state = Arc::new(Mutex::new(QueueState {
            pending: 0,
            failed: None,
        }));
        let idle = Arc::new(Condvar::new());
        {
            let state = Arc::clone(&state);
            let idle = Arc::clone(&idle);
            let name = info.short_name.clone();
            thread::Builder::new()
                .name(format!("device-queue-{name}"))
                .spawn(move || queue_thread(rx, state, idle))
                .ok();
        }
        Device {
            shared: Arc::new(DeviceShared {
                info,
                tx,
                state,
                idle,
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub fn short_name(&self) -> &str {
        &self.shared.info.short_name
    }

    fn enqueue(&self, op: QueueOp) -> Result<(), DeviceError> {
        {
            let mut st = lock(&self.shared.state);
            st.pending += 1;
        }
        if self.shared.tx.send(op).is_err() {
            let mut st = lock(&self.shared.state);
            st.pending -= 1;
            return Err(DeviceError::QueueClosed);
        }
        Ok(())
    }

    /// Ordering marker: everything enqueued before it happens-before
    /// everything enqueued after. A no-op beyond ordering on an in-order
    /// queue, but kept explicit so schedules read like the device they model.
    pub fn queue_barrier(&self) -> Result<(), DeviceError> {
        self.enqueue(QueueOp::Barrier)
    }

    /// Submissions are eager, so flushing is a formality; kept for parity
    /// with queue implementations that batch on the host side.
    pub fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// True while previously submitted work is still executing.
    pub fn is_busy(&self) -> bool {
        lock(&self.shared.state).pending > 0
    }

    /// Block until the queue drains, then surface the first execution failure
    /// recorded since the last call, if any.
    pub fn block_until_finished(&self) -> Result<(), DeviceError> {
        let mut st = lock(&self.shared.state);
        while st.pending > 0 {
            st = match self.shared.idle.wait(st) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        match st.failed.take() {
            Some(msg) => Err(DeviceError::ExecutionFailed(msg)),
            None => Ok(()),
        }
    }
}

fn queue_thread(rx: Receiver<QueueOp>, state: Arc<Mutex<QueueState>>, idle: Arc<Condvar>) {
    while let Ok(op) = rx.recv() {
        let failure = execute_op(op);
        let mut st = lock(&state);
        st.pending = st.pending.saturating_sub(1);
        if let Some(msg) = failure {
            warn!(error = %msg, "device queue recorded a failure");
            if st.failed.is_none() {
                st.failed = Some(msg);
            }
        }
        if st.pending == 0 {
            idle.notify_all();
        }
    }
    debug!("device queue thread exiting");
}

fn execute_op(op: QueueOp) -> Option<String> {
    match op {
        QueueOp::Barrier => None,
        QueueOp::Write {
            buffer,
            offset,
            bytes,
        } => {
            let mut data = lock(&buffer.device_data);
            if offset + bytes.len() > data.len() {
                return Some(format!(
                    "write overruns buffer `{}` ({} + {} > {})",
                    buffer.name,
                    offset,
                    bytes.len(),
                    data.len()
                ));
            }
            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            None
        }
        QueueOp::Read { buffer } => {
            let snapshot = lock(&buffer.device_data).clone();
            *lock(&buffer.host_mirror) = snapshot.clone();
            if let Some(cb) = lock(&buffer.read_callback).as_ref() {
                cb(&snapshot);
            }
            None
        }
        QueueOp::Run(req) => {
            let ctx = LaunchContext {
                global: req.global,
                group: req.group,
                args: &req.args,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (req.entry.body)(&ctx)));
            match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("kernel `{}`: {e}", req.kernel)),
                Err(_) => Some(format!("kernel `{}` panicked", req.kernel)),
            }
        }
    }
}

// ============================================================================
// Buffers
// ============================================================================

type ReadCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct BufferInner {
    name: String,
    readable: bool,
    writable: bool,
    device_data: Mutex<Vec<u8>>,
    host_mirror: Mutex<Vec<u8>>,
    created: Mutex<Option<usize>>,
    read_callback: Mutex<Option<ReadCallback>>,
}

/// A named device allocation with a persistent host mirror.
///
/// `readable`/`writable` describe device-side visibility, mirroring the usual
/// buffer creation flags. The mirror must be initialised (via
/// [`Buffer::set_host_block`] or one of the sized constructors) before
/// [`Buffer::queue_write_all`] is legal.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
    device: Device,
}

impl Buffer {
    /// Bare buffer: no host block, not yet created on the device.
    pub fn new(
        device: &Device,
        name: impl Into<String>,
        readable: bool,
        writable: bool,
    ) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                name: name.into(),
                readable,
                writable,
                device_data: Mutex::new(Vec::new()),
                host_mirror: Mutex::new(Vec::new()),
                created: Mutex::new(None),
                read_callback: Mutex::new(None),
            }),
            device: device.clone(),
        }
    }

    /// Buffer with a zero-initialised host block of `size` bytes, created on
    /// the device immediately.
    pub fn with_size(
        device: &Device,
        name: impl Into<String>,
        readable: bool,
        writable: bool,
        size: usize,
    ) -> Result<Buffer, DeviceError> {
        let buf = Buffer::new(device, name, readable, writable);
        buf.set_host_block(vec![0u8; size]);
        buf.create(size)?;
        Ok(buf)
    }

    /// Buffer seeded from an existing host image, created at the image size.
    pub fn from_image(
        device: &Device,
        name: impl Into<String>,
        readable: bool,
        writable: bool,
        image: Vec<u8>,
    ) -> Result<Buffer, DeviceError> {
        let size = image.len();
        let buf = Buffer::new(device, name, readable, writable);
        buf.set_host_block(image);
        buf.create(size)?;
        Ok(buf)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_readable(&self) -> bool {
        self.inner.readable
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// Replace the host mirror wholesale.
    pub fn set_host_block(&self, bytes: Vec<u8>) {
        *lock(&self.inner.host_mirror) = bytes;
    }

    /// Clone the host mirror out.
    pub fn host_block(&self) -> Vec<u8> {
        lock(&self.inner.host_mirror).clone()
    }

    /// Allocate the device image. `size` is frozen afterwards.
    pub fn create(&self, size: usize) -> Result<(), DeviceError> {
        let mut created = lock(&self.inner.created);
        if created.is_some() {
            return Err(DeviceError::BufferAlreadyCreated(self.inner.name.clone()));
        }
        *lock(&self.inner.device_data) = vec![0u8; size];
        *created = Some(size);
        Ok(())
    }

    pub fn is_created(&self) -> bool {
        lock(&self.inner.created).is_some()
    }

    /// Frozen allocation size; zero before creation.
    pub fn size(&self) -> usize {
        lock(&self.inner.created).unwrap_or(0)
    }

    fn require_created(&self) -> Result<usize, DeviceError> {
        lock(&self.inner.created)
            .ok_or_else(|| DeviceError::BufferNotCreated(self.inner.name.clone()))
    }

    /// Upload the whole host mirror, snapshotted now, ordered on the queue.
    pub fn queue_write_all(&self) -> Result<(), DeviceError> {
        let size = self.require_created()?;
        let snapshot = self.host_block();
        if snapshot.len() != size {
            return Err(DeviceError::HostBlockMissing(self.inner.name.clone()));
        }
        self.device.enqueue(QueueOp::Write {
            buffer: Arc::clone(&self.inner),
            offset: 0,
            bytes: snapshot,
        })
    }

    /// Upload an explicit byte range.
    pub fn queue_write_partial(&self, offset: usize, bytes: Vec<u8>) -> Result<(), DeviceError> {
        let size = self.require_created()?;
        if offset + bytes.len() > size {
            return Err(DeviceError::RangeOverrun {
                name: self.inner.name.clone(),
                offset,
                len: bytes.len(),
                size,
            });
        }
        self.device.enqueue(QueueOp::Write {
            buffer: Arc::clone(&self.inner),
            offset,
            bytes,
        })
    }

    /// Download device → host mirror, ordered on the queue; fires the read
    /// callback (if any) on the queue thread once the copy completes.
    pub fn queue_read_all(&self) -> Result<(), DeviceError> {
        self.require_created()?;
        self.device.enqueue(QueueOp::Read {
            buffer: Arc::clone(&self.inner),
        })
    }

    /// Install a callback observing every completed read of this buffer.
    pub fn set_read_callback(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        *lock(&self.inner.read_callback) = Some(Box::new(cb));
    }

    // -- host-mirror scalar accessors -----------------------------------

    /// Read the mirror's first scalar in the given precision.
    pub fn host_scalar(&self, precision: Precision) -> f64 {
        scalar_at(&lock(&self.inner.host_mirror), precision, 0)
    }

    /// Overwrite the mirror's first scalar in the given precision.
    pub fn set_host_scalar(&self, precision: Precision, value: f64) {
        let mut mirror = lock(&self.inner.host_mirror);
        if mirror.len() < precision.scalar_size() {
            *mirror = vec![0u8; precision.scalar_size()];
        }
        set_scalar_at(&mut mirror, precision, 0, value);
    }

    /// Read the mirror's first 32-bit counter.
    pub fn host_word(&self) -> u32 {
        word_at(&lock(&self.inner.host_mirror), 0)
    }

    /// Overwrite the mirror's first 32-bit counter.
    pub fn set_host_word(&self, value: u32) {
        let mut mirror = lock(&self.inner.host_mirror);
        if mirror.len() < 4 {
            *mirror = vec![0u8; 4];
        }
        set_word_at(&mut mirror, 0, value);
    }
}

// ============================================================================
// Kernels
// ============================================================================

/// Kernel body: runs on the queue thread against a [`LaunchContext`].
pub type KernelBody = Box<dyn Fn(&LaunchContext<'_>) -> Result<(), KernelError> + Send + Sync>;

/// A compiled kernel entry point: name, argument arity, body.
pub struct KernelEntry {
    pub name: String,
    pub arity: usize,
    pub body: KernelBody,
}

/// Execution context handed to a kernel body.
pub struct LaunchContext<'a> {
    pub global: [usize; 3],
    pub group: [usize; 3],
    args: &'a [Arc<BufferInner>],
}

impl<'a> LaunchContext<'a> {
    /// Lock argument `index`'s device image for the duration of the guard.
    pub fn arg(&self, index: usize) -> Result<ArgGuard<'a>, KernelError> {
        let inner = self
            .args
            .get(index)
            .ok_or(KernelError::MissingArgument(index, self.args.len()))?;
        Ok(ArgGuard {
            data: lock(&inner.device_data),
        })
    }

    /// Number of work groups along dimension `dim`.
    pub fn group_count(&self, dim: usize) -> usize {
        if self.group[dim] == 0 {
            0
        } else {
            self.global[dim] / self.group[dim]
        }
    }
}

/// Locked view of one argument's device bytes.
pub struct ArgGuard<'a> {
    data: MutexGuard<'a, Vec<u8>>,
}

impl ArgGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A kernel object: entry point plus launch geometry and bound arguments.
///
/// Arguments bind positionally; binding `None` is tolerated (the slot is
/// rebound later) but scheduling with any slot still unbound is an error.
pub struct Kernel {
    device: Device,
    entry: Arc<KernelEntry>,
    global: [usize; 3],
    group: [usize; 3],
    args: Vec<Option<Buffer>>,
}

impl Kernel {
    pub(crate) fn from_entry(device: Device, entry: Arc<KernelEntry>) -> Kernel {
        let arity = entry.arity;
        Kernel {
            device,
            entry,
            global: [1, 1, 1],
            group: [1, 1, 1],
            args: vec![None; arity],
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn set_group_size(&mut self, x: usize, y: usize, z: usize) {
        self.group = [x.max(1), y.max(1), z.max(1)];
    }

    pub fn set_global_size(&mut self, x: usize, y: usize, z: usize) {
        self.global = [x.max(1), y.max(1), z.max(1)];
    }

    /// Bind argument `index`; `None` leaves it unbound until later.
    pub fn assign_argument(
        &mut self,
        index: usize,
        buffer: Option<&Buffer>,
    ) -> Result<(), DeviceError> {
        if index >= self.args.len() {
            return Err(DeviceError::ArgumentOutOfRange(
                self.entry.name.clone(),
                index,
                self.args.len(),
            ));
        }
        self.args[index] = buffer.cloned();
        Ok(())
    }

    /// Bind every argument positionally; the slice length must equal arity.
    pub fn assign_arguments(&mut self, buffers: &[Option<&Buffer>]) -> Result<(), DeviceError> {
        if buffers.len() != self.args.len() {
            return Err(DeviceError::ArgumentOutOfRange(
                self.entry.name.clone(),
                buffers.len(),
                self.args.len(),
            ));
        }
        for (i, b) in buffers.iter().enumerate() {
            self.args[i] = b.cloned();
        }
        Ok(())
    }

    /// Submit one launch. The global size is rounded up to a whole number of
    /// work groups per dimension at submission time.
    pub fn schedule_execution(&self) -> Result<(), DeviceError> {
        let mut resolved = Vec::with_capacity(self.args.len());
        for (i, arg) in self.args.iter().enumerate() {
            match arg {
                Some(buffer) => {
                    buffer.require_created()?;
                    resolved.push(Arc::clone(&buffer.inner));
                }
                None => {
                    return Err(DeviceError::UnboundArgument(self.entry.name.clone(), i));
                }
            }
        }
        for a in 0..resolved.len() {
            for b in a + 1..resolved.len() {
                if Arc::ptr_eq(&resolved[a], &resolved[b]) {
                    return Err(DeviceError::AliasedArguments(self.entry.name.clone()));
                }
            }
        }
        let mut global = [1usize; 3];
        for d in 0..3 {
            let g = self.group[d];
            global[d] = self.global[d].div_ceil(g) * g;
        }
        self.device.enqueue(QueueOp::Run(LaunchRequest {
            kernel: self.entry.name.clone(),
            entry: Arc::clone(&self.entry),
            args: resolved,
            global,
            group: self.group,
        }))
    }

    /// Submit and flush in one call.
    pub fn schedule_execution_and_flush(&self) -> Result<(), DeviceError> {
        self.schedule_execution()?;
        self.device.flush()
    }
}

// ============================================================================
// Raw scalar access (little-endian device images)
// ============================================================================

/// Read scalar `index` from a device image in the given precision.
#[inline]
pub fn scalar_at(bytes: &[u8], precision: Precision, index: usize) -> f64 {
    match precision {
        Precision::Single => {
            let at = index * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            f32::from_le_bytes(raw) as f64
        }
        Precision::Double => {
            let at = index * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            f64::from_le_bytes(raw)
        }
    }
}

/// Write scalar `index` into a device image in the given precision.
#[inline]
pub fn set_scalar_at(bytes: &mut [u8], precision: Precision, index: usize, value: f64) {
    match precision {
        Precision::Single => {
            let at = index * 4;
            bytes[at..at + 4].copy_from_slice(&(value as f32).to_le_bytes());
        }
        Precision::Double => {
            let at = index * 8;
            bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read 32-bit word `index` (counters, flag words).
#[inline]
pub fn word_at(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

/// Write 32-bit word `index`.
#[inline]
pub fn set_word_at(bytes: &mut [u8], index: usize, value: u32) {
    let at = index * 4;
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read 64-bit word `index` (cell-relation tables).
#[inline]
pub fn qword_at(bytes: &[u8], index: usize) -> u64 {
    let at = index * 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Write 64-bit word `index`.
#[inline]
pub fn set_qword_at(bytes: &mut [u8], index: usize, value: u64) {
    let at = index * 8;
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_device() -> Device {
        let mut exec = Executor::new();
        exec.select_device(&DeviceFilter::default()).unwrap()
    }

    fn noop_entry(name: &str, arity: usize) -> Arc<KernelEntry> {
        Arc::new(KernelEntry {
            name: name.to_string(),
            arity,
            body: Box::new(|_| Ok(())),
        })
    }

    #[test]
    fn enumeration_yields_a_selectable_device() {
        let mut exec = Executor::new();
        assert!(!exec.platforms().is_empty());
        let dev = exec.select_device(&DeviceFilter::default()).unwrap();
        assert_eq!(dev.short_name(), "HOST0");
        assert!(exec.is_ready());
    }

    #[test]
    fn filter_mismatch_is_an_error() {
        let mut exec = Executor::new();
        let filter = DeviceFilter {
            name_contains: Some("no-such-device".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            exec.select_device(&filter),
            Err(DeviceError::NoDeviceMatched)
        ));
    }

    #[test]
    fn write_then_read_round_trips_through_the_queue() {
        let dev = test_device();
        let buf = Buffer::from_image(&dev, "rt", true, true, vec![1, 2, 3, 4]).unwrap();
        buf.set_host_block(vec![9, 8, 7, 6]);
        buf.queue_write_all().unwrap();
        buf.set_host_block(vec![0, 0, 0, 0]);
        buf.queue_read_all().unwrap();
        dev.block_until_finished().unwrap();
        assert_eq!(buf.host_block(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn writes_require_a_created_buffer_and_a_host_block() {
        let dev = test_device();
        let buf = Buffer::new(&dev, "late", false, true);
        assert!(matches!(
            buf.queue_write_all(),
            Err(DeviceError::BufferNotCreated(_))
        ));
        buf.create(8).unwrap();
        assert!(matches!(
            buf.queue_write_all(),
            Err(DeviceError::HostBlockMissing(_))
        ));
        assert!(matches!(
            buf.create(8),
            Err(DeviceError::BufferAlreadyCreated(_))
        ));
    }

    #[test]
    fn partial_writes_are_range_checked() {
        let dev = test_device();
        let buf = Buffer::with_size(&dev, "part", false, true, 8).unwrap();
        assert!(matches!(
            buf.queue_write_partial(6, vec![0, 0, 0]),
            Err(DeviceError::RangeOverrun { .. })
        ));
        buf.queue_write_partial(4, vec![5, 5, 5, 5]).unwrap();
        buf.queue_read_all().unwrap();
        dev.block_until_finished().unwrap();
        assert_eq!(buf.host_block(), vec![0, 0, 0, 0, 5, 5, 5, 5]);
    }

    #[test]
    fn unbound_argument_refuses_to_schedule() {
        let dev = test_device();
        let mut k = Kernel::from_entry(dev.clone(), noop_entry("k", 2));
        let buf = Buffer::with_size(&dev, "a", true, true, 4).unwrap();
        k.assign_argument(0, Some(&buf)).unwrap();
        assert!(matches!(
            k.schedule_execution(),
            Err(DeviceError::UnboundArgument(_, 1))
        ));
    }

    #[test]
    fn aliased_arguments_refuse_to_schedule() {
        let dev = test_device();
        let mut k = Kernel::from_entry(dev.clone(), noop_entry("k", 2));
        let buf = Buffer::with_size(&dev, "a", true, true, 4).unwrap();
        k.assign_arguments(&[Some(&buf), Some(&buf)]).unwrap();
        assert!(matches!(
            k.schedule_execution(),
            Err(DeviceError::AliasedArguments(_))
        ));
    }

    #[test]
    fn global_size_rounds_up_to_group_multiples() {
        let dev = test_device();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let entry = Arc::new(KernelEntry {
            name: "probe".to_string(),
            arity: 0,
            body: Box::new(move |ctx| {
                seen2.store(ctx.global[0], Ordering::SeqCst);
                Ok(())
            }),
        });
        let mut k = Kernel::from_entry(dev.clone(), entry);
        k.set_group_size(8, 1, 1);
        k.set_global_size(100, 1, 1);
        k.schedule_execution().unwrap();
        dev.block_until_finished().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 104);
    }

    #[test]
    fn kernel_failure_surfaces_at_the_next_finish_wait() {
        let dev = test_device();
        let entry = Arc::new(KernelEntry {
            name: "bad".to_string(),
            arity: 0,
            body: Box::new(|_| Err(KernelError::Configuration("broken".to_string()))),
        });
        let k = Kernel::from_entry(dev.clone(), entry);
        k.schedule_execution().unwrap();
        assert!(matches!(
            dev.block_until_finished(),
            Err(DeviceError::ExecutionFailed(_))
        ));
        // The failure is consumed; the queue remains usable afterwards.
        dev.queue_barrier().unwrap();
        dev.block_until_finished().unwrap();
    }

    #[test]
    fn read_callback_fires_after_the_copy() {
        let dev = test_device();
        let buf = Buffer::with_size(&dev, "cb", true, true, 4).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        buf.set_read_callback(move |bytes| {
            assert_eq!(bytes.len(), 4);
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        buf.queue_read_all().unwrap();
        dev.block_until_finished().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scalar_views_respect_precision() {
        let mut single = vec![0u8; 8];
        set_scalar_at(&mut single, Precision::Single, 1, 2.5);
        assert_eq!(scalar_at(&single, Precision::Single, 1), 2.5);

        let mut double = vec![0u8; 16];
        set_scalar_at(&mut double, Precision::Double, 1, -9999.0);
        assert_eq!(scalar_at(&double, Precision::Double, 1), -9999.0);

        let mut words = vec![0u8; 8];
        set_word_at(&mut words, 1, 77);
        assert_eq!(word_at(&words, 1), 77);
        let mut qwords = vec![0u8; 16];
        set_qword_at(&mut qwords, 1, 1 << 40);
        assert_eq!(qword_at(&qwords, 1), 1 << 40);
    }
}
