//! 测试辅助：内存磁盘与协作者替身

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{
    Bio, BioOp, BlockDev, DeviceManager, Disk, DiskGeometry, DiskId, MakeRequest, OpenMode,
    Partition,
};
use crate::cache::{
    BindingConfig, CacheBinding, CacheEngine, Cleaner, Collaborators, IoGate, MetadataStore,
};
use crate::consts::SECTOR_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::io::Event;

/// 内存磁盘驱动
///
/// 可选延迟完成（bio 暂存，`complete_pending` 时执行）和按扇区注入介质错误。
pub struct MemDisk {
    storage: Mutex<Vec<u8>>,
    deferred: AtomicBool,
    pending: Mutex<Vec<Bio>>,
    faults: Mutex<Vec<u64>>,
    log: Mutex<Vec<(BioOp, u64, usize)>>,
}

impl MemDisk {
    pub fn new(capacity_sectors: u64) -> Arc<Self> {
        Arc::new(Self {
            storage: Mutex::new(vec![0; capacity_sectors as usize * SECTOR_SIZE]),
            deferred: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn with_storage<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.storage.lock())
    }

    pub fn with_storage_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.storage.lock())
    }

    pub fn set_deferred(&self, on: bool) {
        self.deferred.store(on, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// 执行所有暂存的 bio
    pub fn complete_pending(&self) {
        let pending = core::mem::take(&mut *self.pending.lock());
        for bio in pending {
            self.execute(bio);
        }
    }

    pub fn fail_sector(&self, sector: u64) {
        self.faults.lock().push(sector);
    }

    /// 某类操作的 `(扇区, 字节数)` 记录
    pub fn bios_of(&self, op: BioOp) -> Vec<(u64, usize)> {
        self.log
            .lock()
            .iter()
            .filter(|(o, _, _)| *o == op)
            .map(|(_, s, n)| (*s, *n))
            .collect()
    }

    pub fn bio_count(&self) -> usize {
        self.log.lock().len()
    }

    fn execute(&self, bio: Bio) {
        let result = self.transfer(&bio);
        bio.complete(result);
    }

    fn transfer(&self, bio: &Bio) -> Result<()> {
        let first = bio.sector();
        let end = first + bio.nr_sectors();
        if self.faults.lock().iter().any(|f| (first..end).contains(f)) {
            return Err(Error::new(ErrorKind::Io, "injected media error"));
        }

        let mut storage = self.storage.lock();
        let mut pos = first as usize * SECTOR_SIZE;
        if pos + bio.size() > storage.len() {
            return Err(Error::new(ErrorKind::Io, "access beyond end of medium"));
        }
        for seg in bio.segments() {
            let window = &mut storage[pos..pos + seg.len()];
            match bio.op() {
                BioOp::Read => seg.copy_from(window),
                BioOp::Write => seg.copy_to(window),
                BioOp::Flush | BioOp::Discard => {}
            }
            pos += seg.len();
        }
        Ok(())
    }
}

impl MakeRequest for MemDisk {
    fn make_request(&self, bio: Bio) {
        self.log.lock().push((bio.op(), bio.sector(), bio.size()));
        if self.deferred.load(Ordering::SeqCst) {
            self.pending.lock().push(bio);
        } else {
            self.execute(bio);
        }
    }
}

/// 记录型缓存引擎
///
/// 默认直接完成 bio；`hold` 打开后 bio 暂存，模拟在途的缓存 I/O。
#[derive(Default)]
pub struct TestEngine {
    pub mapped: Mutex<Vec<(String, BioOp, u64, usize)>>,
    pub hold: AtomicBool,
    held: Mutex<Vec<Bio>>,
    pub fail_wb_alloc: AtomicBool,
    pub wb_allocs: AtomicUsize,
    pub wb_frees: AtomicUsize,
    /// 关闭时回写资源分配阻塞
    pub wb_gate: IoGate,
    pub wb_entered: Event,
}

impl TestEngine {
    pub fn release_held(&self) {
        let held = core::mem::take(&mut *self.held.lock());
        for bio in held {
            bio.complete(Ok(()));
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    pub fn mapped_sectors(&self) -> Vec<(String, u64)> {
        self.mapped
            .lock()
            .iter()
            .map(|(name, _, sector, _)| (name.clone(), *sector))
            .collect()
    }
}

impl CacheEngine for TestEngine {
    fn map(&self, binding: &Arc<CacheBinding>, bio: Bio) {
        self.mapped.lock().push((
            binding.name().to_string(),
            bio.op(),
            bio.sector(),
            bio.size(),
        ));
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(bio);
        } else {
            bio.complete(Ok(()));
        }
    }

    fn allocate_wb_resources(&self, _binding: &CacheBinding) -> Result<()> {
        self.wb_entered.set();
        self.wb_gate.await_open();
        if self.fail_wb_alloc.load(Ordering::SeqCst) {
            return Err(Error::out_of_memory("write-back resources"));
        }
        self.wb_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn free_wb_resources(&self, _binding: &CacheBinding) {
        self.wb_frees.fetch_add(1, Ordering::SeqCst);
    }
}

/// 记录型清理器
pub struct TestCleaner {
    /// 每次排空清掉的脏块数
    pub drain_per_call: AtomicU64,
    pub fail_drain: AtomicBool,
    pub drain_calls: AtomicUsize,
    pub reboot_cleans: AtomicUsize,
    pub stops: AtomicUsize,
    pub starts: AtomicUsize,
    pub scheduled: Mutex<Vec<u32>>,
    /// 关闭时排空阻塞，用于制造长时间的编辑
    pub drain_gate: IoGate,
    pub drain_entered: Event,
}

impl Default for TestCleaner {
    fn default() -> Self {
        Self {
            drain_per_call: AtomicU64::new(u64::MAX),
            fail_drain: AtomicBool::new(false),
            drain_calls: AtomicUsize::new(0),
            reboot_cleans: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            scheduled: Mutex::new(Vec::new()),
            drain_gate: IoGate::default(),
            drain_entered: Event::default(),
        }
    }
}

impl Cleaner for TestCleaner {
    fn drain_dirty_blocks(&self, binding: &CacheBinding) -> Result<()> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        self.drain_entered.set();
        self.drain_gate.await_open();
        if self.fail_drain.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Io, "cleaner write failed"));
        }
        binding.clear_dirty_blocks(self.drain_per_call.load(Ordering::SeqCst));
        Ok(())
    }

    fn clean_for_reboot(&self, binding: &CacheBinding) -> Result<()> {
        self.reboot_cleans.fetch_add(1, Ordering::SeqCst);
        binding.set_dirty_blocks(0);
        Ok(())
    }

    fn stop_async_tasks(&self, binding: &CacheBinding) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        binding.set_clean_interval(0);
    }

    fn start_clean_thread(&self, _binding: &CacheBinding) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn schedule_aged_clean(&self, _binding: &CacheBinding, interval: u32) {
        self.scheduled.lock().push(interval);
    }
}

/// 记录型元数据存储
#[derive(Default)]
pub struct TestMetadata {
    pub superblocks: AtomicUsize,
    pub metadata: AtomicUsize,
    pub fail_metadata: AtomicBool,
    /// 关闭时元数据持久化阻塞
    pub metadata_gate: IoGate,
    pub metadata_entered: Event,
}

impl MetadataStore for TestMetadata {
    fn store_superblock(&self, _binding: &CacheBinding) -> Result<()> {
        self.superblocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn store_metadata(&self, _binding: &CacheBinding) -> Result<()> {
        self.metadata.fetch_add(1, Ordering::SeqCst);
        self.metadata_entered.set();
        self.metadata_gate.await_open();
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Io, "metadata write failed"));
        }
        Ok(())
    }
}

/// 测试环境
///
/// - `sdb`（8:16）：512B 逻辑块，2048 扇区；分区 1 `[100,199]`、2 `[200,299]`、3 `[400,599]`
/// - `sdc`（8:32）：缓存盘，8192 扇区
/// - `sde`（8:64）：第二块源盘，1024 扇区，无分区
pub struct TestBed {
    pub manager: DeviceManager,
    mems: BTreeMap<String, Arc<MemDisk>>,
    pub engine: Arc<TestEngine>,
    pub cleaner: Arc<TestCleaner>,
    pub metadata: Arc<TestMetadata>,
}

impl TestBed {
    pub fn new() -> Self {
        let manager = DeviceManager::new();
        let mut mems = BTreeMap::new();
        let specs: [(&str, DiskId, u64, Vec<Partition>); 3] = [
            (
                "sdb",
                DiskId::new(8, 16),
                2048,
                vec![
                    Partition { index: 1, start_sect: 100, nr_sects: 100 },
                    Partition { index: 2, start_sect: 200, nr_sects: 100 },
                    Partition { index: 3, start_sect: 400, nr_sects: 200 },
                ],
            ),
            ("sdc", DiskId::new(8, 32), 8192, Vec::new()),
            ("sde", DiskId::new(8, 64), 1024, Vec::new()),
        ];
        for (name, id, capacity, partitions) in specs {
            let mem = MemDisk::new(capacity);
            let geometry = DiskGeometry {
                logical_block_size: 512,
                capacity,
                max_segments: 16,
            };
            let disk = Disk::new(id, name, geometry, partitions, mem.clone()).unwrap();
            manager.register(disk).unwrap();
            mems.insert(name.to_string(), mem);
        }
        Self {
            manager,
            mems,
            engine: Arc::new(TestEngine::default()),
            cleaner: Arc::new(TestCleaner::default()),
            metadata: Arc::new(TestMetadata::default()),
        }
    }

    pub fn open(&self, path: &str) -> BlockDev {
        self.manager
            .open(path, OpenMode::READ | OpenMode::WRITE, "test")
            .unwrap()
    }

    pub fn mem(&self, name: &str) -> Arc<MemDisk> {
        self.mems[name].clone()
    }

    pub fn disk(&self, name: &str) -> Arc<Disk> {
        self.open(name).disk().clone()
    }

    /// 以 `sdc` 为缓存盘创建绑定
    pub fn binding(&self, name: &str, source: &str, config: BindingConfig) -> CacheBinding {
        let config = BindingConfig {
            name: name.to_string(),
            ..config
        };
        CacheBinding::new(config, self.open(source), self.open("sdc")).unwrap()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.engine.clone(),
            self.cleaner.clone(),
            self.metadata.clone(),
        )
    }
}
