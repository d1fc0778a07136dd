// Journal Device Implementation
// Asynchronous block write interface with completion handles,
// plus in-memory and file-backed devices

use jcommit_core::{BlockNumber, JournalError, JournalResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Outcome of a submitted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Data is on stable storage
    Complete,
    /// The block did not become up to date
    Failed,
    /// The device refused the ordering barrier; nothing was written
    BarrierNotSupported,
}

/// Waitable completion of one write request.
#[derive(Clone, Default)]
pub struct IoCompletion {
    inner: Arc<(Mutex<Option<IoStatus>>, Condvar)>,
}

impl IoCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the device when the request finishes.
    pub fn complete(&self, status: IoStatus) {
        let (lock, cond) = &*self.inner;
        *lock.lock() = Some(status);
        cond.notify_all();
    }

    pub fn status(&self) -> Option<IoStatus> {
        *self.inner.0.lock()
    }

    /// Block until the device reports completion.
    pub fn wait(&self) -> IoStatus {
        let (lock, cond) = &*self.inner;
        let mut status = lock.lock();
        loop {
            if let Some(done) = *status {
                return done;
            }
            cond.wait(&mut status);
        }
    }
}

/// A single block write
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub block: BlockNumber,
    pub data: Vec<u8>,
    /// Order this write after everything submitted before it
    pub barrier: bool,
}

/// Block device used for both the log and the filesystem blocks.
///
/// `submit_write` never blocks on the write itself; the device reports
/// the result through `done`, possibly from another thread.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;
    fn read_block(&self, block: BlockNumber) -> JournalResult<Vec<u8>>;
    fn submit_write(&self, request: WriteRequest, done: IoCompletion);
    fn flush(&self) -> JournalResult<()>;
}

/// Submit one write and wait for it.
pub fn write_block_sync(device: &dyn BlockDevice, block: BlockNumber, data: Vec<u8>, barrier: bool) -> JournalResult<()> {
    let done = IoCompletion::new();
    device.submit_write(
        WriteRequest {
            block,
            data,
            barrier,
        },
        done.clone(),
    );
    match done.wait() {
        IoStatus::Complete => Ok(()),
        IoStatus::Failed => Err(JournalError::IoFailed { block }),
        IoStatus::BarrierNotSupported => Err(JournalError::BarrierNotSupported),
    }
}

/// Trace of device activity, in the order it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Submitted { block: BlockNumber, barrier: bool },
    Completed { block: BlockNumber, status: IoStatus },
}

#[derive(Default)]
struct MemoryState {
    blocks: HashMap<BlockNumber, Vec<u8>>,
    events: Vec<IoEvent>,
    failing: HashSet<BlockNumber>,
    reject_barriers: bool,
}

/// In-memory block device. Writes complete inline and every submission
/// and completion is recorded for inspection.
pub struct MemoryDevice {
    block_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryDevice {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Make every write to `block` complete as failed.
    pub fn fail_block(&self, block: BlockNumber) {
        self.state.lock().failing.insert(block);
    }

    pub fn heal_block(&self, block: BlockNumber) {
        self.state.lock().failing.remove(&block);
    }

    /// Emulate a device without barrier support.
    pub fn reject_barriers(&self, reject: bool) {
        self.state.lock().reject_barriers = reject;
    }

    pub fn events(&self) -> Vec<IoEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Blocks whose writes completed successfully, in completion order.
    pub fn written_blocks(&self) -> Vec<BlockNumber> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                IoEvent::Completed {
                    block,
                    status: IoStatus::Complete,
                } => Some(*block),
                _ => None,
            })
            .collect()
    }

    pub fn block(&self, block: BlockNumber) -> Option<Vec<u8>> {
        self.state.lock().blocks.get(&block).cloned()
    }

    /// Overwrite a block directly, bypassing the event trace.
    pub fn poke(&self, block: BlockNumber, data: Vec<u8>) {
        self.state.lock().blocks.insert(block, data);
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: BlockNumber) -> JournalResult<Vec<u8>> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size]))
    }

    fn submit_write(&self, request: WriteRequest, done: IoCompletion) {
        let status = {
            let mut state = self.state.lock();
            state.events.push(IoEvent::Submitted {
                block: request.block,
                barrier: request.barrier,
            });

            let status = if request.barrier && state.reject_barriers {
                IoStatus::BarrierNotSupported
            } else if request.data.len() != self.block_size || state.failing.contains(&request.block) {
                IoStatus::Failed
            } else {
                state.blocks.insert(request.block, request.data);
                IoStatus::Complete
            };
            state.events.push(IoEvent::Completed {
                block: request.block,
                status,
            });
            status
        };
        done.complete(status);
    }

    fn flush(&self) -> JournalResult<()> {
        // No-op for in-memory device
        Ok(())
    }
}

/// Block device backed by a regular file or device node.
pub struct FileDevice {
    file: Mutex<File>,
    block_size: usize,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> JournalResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
        })
    }

    /// Create (or truncate) an image of `blocks` zeroed blocks.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, blocks: u64) -> JournalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * block_size as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
        })
    }

    fn write_at(&self, request: &WriteRequest) -> std::io::Result<()> {
        let mut file = self.file.lock();
        if request.barrier {
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(request.block * self.block_size as u64))?;
        file.write_all(&request.data)?;
        if request.barrier {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: BlockNumber) -> JournalResult<Vec<u8>> {
        let mut file = self.file.lock();
        let mut data = vec![0u8; self.block_size];
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    fn submit_write(&self, request: WriteRequest, done: IoCompletion) {
        if request.data.len() != self.block_size {
            log::error!(
                "Invalid block size: expected {}, got {}",
                self.block_size,
                request.data.len()
            );
            done.complete(IoStatus::Failed);
            return;
        }
        match self.write_at(&request) {
            Ok(()) => done.complete(IoStatus::Complete),
            Err(e) => {
                log::error!("Write of block {} failed: {}", request.block, e);
                done.complete(IoStatus::Failed);
            }
        }
    }

    fn flush(&self) -> JournalResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_records_events() {
        let dev = MemoryDevice::new(1024);
        write_block_sync(&dev, 3, vec![1u8; 1024], false).unwrap();
        assert_eq!(
            dev.events(),
            vec![
                IoEvent::Submitted {
                    block: 3,
                    barrier: false
                },
                IoEvent::Completed {
                    block: 3,
                    status: IoStatus::Complete
                },
            ]
        );
        assert_eq!(dev.read_block(3).unwrap(), vec![1u8; 1024]);
        assert_eq!(dev.read_block(4).unwrap(), vec![0u8; 1024]);
    }

    #[test]
    fn test_memory_device_failures() {
        let dev = MemoryDevice::new(1024);
        dev.fail_block(5);
        assert!(matches!(
            write_block_sync(&dev, 5, vec![0u8; 1024], false),
            Err(JournalError::IoFailed { block: 5 })
        ));
        assert!(write_block_sync(&dev, 6, vec![0u8; 10], false).is_err());

        dev.reject_barriers(true);
        assert!(matches!(
            write_block_sync(&dev, 7, vec![0u8; 1024], true),
            Err(JournalError::BarrierNotSupported)
        ));
        assert!(dev.block(7).is_none());
    }

    #[test]
    fn test_file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.img");
        let dev = FileDevice::create(&path, 1024, 8).unwrap();
        write_block_sync(&dev, 2, vec![0xAB; 1024], true).unwrap();
        dev.flush().unwrap();

        let reopened = FileDevice::open(&path, 1024).unwrap();
        assert_eq!(reopened.read_block(2).unwrap(), vec![0xAB; 1024]);
        assert_eq!(reopened.read_block(1).unwrap(), vec![0u8; 1024]);
    }

    #[test]
    fn test_completion_from_other_thread() {
        let done = IoCompletion::new();
        let signal = done.clone();
        let worker = std::thread::spawn(move || signal.complete(IoStatus::Failed));
        assert_eq!(done.wait(), IoStatus::Failed);
        worker.join().unwrap();
    }
}
