//! 拦截入口点
//!
//! 激活第一个绑定时，本入口点替换磁盘请求队列上的驱动入口点。
//! 它不拥有注册表（只持有弱引用），注册表先于磁盘释放时 I/O 以错误完成。

use std::sync::{Arc, Weak};

use super::registry::RegistryInner;
use super::route::Decision;
use super::split::overlap_split;
use crate::block::{Bio, BioOp, MakeRequest};
use crate::consts::ROUTE_RETRY_LIMIT;
use crate::error::{Error, ErrorKind};
use crate::io::process_zero_size_bio;

pub(crate) struct Interceptor {
    registry: Weak<RegistryInner>,
}

impl Interceptor {
    pub(crate) fn new(registry: Weak<RegistryInner>) -> Self {
        Self { registry }
    }
}

impl MakeRequest for Interceptor {
    fn make_request(&self, bio: Bio) {
        match self.registry.upgrade() {
            Some(inner) => inner.submit(bio),
            None => {
                log::error!("[TTC] registry gone, failing {:?}", bio);
                bio.complete(Err(Error::new(ErrorKind::Io, "interception registry released")));
            }
        }
    }

    fn is_interceptor(&self) -> bool {
        true
    }
}

impl RegistryInner {
    /// 路由并发出一个 bio（扇区为整盘绝对地址）
    pub(crate) fn submit(self: &Arc<Self>, mut bio: Bio) {
        let Some(disk) = bio.disk().cloned() else {
            bio.complete(Err(Error::new(ErrorKind::InvalidInput, "bio has no target disk")));
            return;
        };

        if bio.sector().checked_add(bio.nr_sectors()).is_none() {
            log::error!("[ROUTE] {:?}: sector range overflows", bio);
            bio.complete(Err(Error::new(ErrorKind::InvalidInput, "sector range overflows")));
            return;
        }

        // 只有直通路径上读到过期入口点才计入重试次数，闸门前的等待不计
        let mut stale = 0;
        loop {
            match self.decide(disk.id(), bio.sector(), bio.nr_sectors()) {
                Decision::Gated(binding) => {
                    log::trace!("[ROUTE] {}: I/O parked while binding is quiesced", binding.name());
                    binding.gate().await_open();
                }
                Decision::Cache(guard) => {
                    let binding = Arc::clone(guard.binding());
                    if bio.size() == 0 {
                        bio.attach(guard);
                        process_zero_size_bio(&binding, bio);
                        return;
                    }
                    bio.set_sector(bio.sector() - binding.start_sect());
                    bio.attach(guard);
                    self.collab.engine.map(&binding, bio);
                    return;
                }
                Decision::Split => {
                    if bio.op() == BioOp::Discard {
                        log::error!(
                            "[ROUTE] discard overlapping cached region at sector {} not supported",
                            bio.sector()
                        );
                        bio.complete(Err(Error::new(
                            ErrorKind::Unsupported,
                            "discard on overlapping region",
                        )));
                        return;
                    }
                    overlap_split(self, bio);
                    return;
                }
                Decision::Passthrough(original) => {
                    let entry = original.unwrap_or_else(|| disk.queue().entry());
                    if !entry.is_interceptor() {
                        entry.make_request(bio);
                        return;
                    }
                    // 另一次激活刚装上拦截入口点，重新查找
                    stale += 1;
                    if stale >= ROUTE_RETRY_LIMIT {
                        log::error!(
                            "[ROUTE] {}: no usable entry point after {} lookups",
                            disk.name(),
                            ROUTE_RETRY_LIMIT
                        );
                        bio.complete(Err(Error::new(ErrorKind::Io, "routing did not converge")));
                        return;
                    }
                    log::debug!("[ROUTE] stale original entry on {}, re-looking up", disk.name());
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BioFlags, Page, Segment};
    use crate::cache::BindingConfig;
    use crate::config::TtcConfig;
    use crate::testing::TestBed;
    use crate::ttc::Registry;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    fn write_bio(sector: u64, sectors: usize, fill: u8) -> (Bio, Arc<Mutex<Option<crate::Result<()>>>>) {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let page = Page::from_vec(vec![fill; sectors * 512]);
        let bio = Bio::new(BioOp::Write, sector)
            .with_segments(vec![Segment::whole(page)])
            .on_complete(move |r| *s.lock() = Some(r));
        (bio, seen)
    }

    #[test]
    fn test_cache_path_rebases_sector() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        registry.activate(bed.binding("p1", "sdb1", BindingConfig::new("p1"))).unwrap();

        let part = bed.open("sdb1");
        let (bio, seen) = write_bio(10, 2, 1);
        part.submit_bio(bio);

        assert!(seen.lock().take().unwrap().is_ok());
        assert_eq!(bed.engine.mapped_sectors(), vec![("p1".to_string(), 10)]);
        // 源盘只收到激活时的屏障
        assert!(bed.mem("sdb").bios_of(BioOp::Write).is_empty());
    }

    #[test]
    fn test_passthrough_reaches_driver() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        registry.activate(bed.binding("p1", "sdb1", BindingConfig::new("p1"))).unwrap();

        let disk = bed.disk("sdb");
        let (bio, seen) = write_bio(300, 4, 0x33);
        disk.submit_bio(bio);

        assert!(seen.lock().take().unwrap().is_ok());
        assert!(bed.engine.mapped_sectors().is_empty());
        assert_eq!(bed.mem("sdb").bios_of(BioOp::Write), vec![(300, 2048)]);
    }

    #[test]
    fn test_inflight_held_until_engine_completes() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        let binding = registry.activate(bed.binding("p1", "sdb1", BindingConfig::new("p1"))).unwrap();

        bed.engine.hold.store(true, Ordering::SeqCst);
        let (bio, seen) = write_bio(120, 1, 0);
        bed.disk("sdb").submit_bio(bio);
        assert_eq!(binding.inflight(), 1);
        assert!(seen.lock().is_none());

        bed.engine.release_held();
        assert_eq!(binding.inflight(), 0);
        assert!(seen.lock().take().unwrap().is_ok());
    }

    #[test]
    fn test_zero_size_flush_in_binding() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        let binding = registry.activate(bed.binding("p1", "sdb1", BindingConfig::new("p1"))).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bed.disk("sdb").submit_bio(
            Bio::new(BioOp::Flush, 150)
                .with_flags(BioFlags::PREFLUSH)
                .on_complete(move |r| *s.lock() = Some(r)),
        );
        assert!(seen.lock().take().unwrap().is_ok());
        assert_eq!(binding.inflight(), 0);
        assert!(bed.engine.mapped_sectors().is_empty());
        // 激活屏障一次，零长度 bio 一次
        assert_eq!(bed.mem("sdb").bios_of(BioOp::Flush), vec![(100, 0), (100, 0)]);
        assert_eq!(bed.mem("sdc").bios_of(BioOp::Flush), vec![(0, 0)]);
    }

    #[test]
    fn test_discard_overlap_unsupported() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        registry.activate(bed.binding("p1", "sdb1", BindingConfig::new("p1"))).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let page = Page::from_vec(vec![0; 8 * 512]);
        bed.disk("sdb").submit_bio(
            Bio::new(BioOp::Discard, 96)
                .with_segments(vec![Segment::whole(page)])
                .on_complete(move |r| *s.lock() = Some(r)),
        );
        assert_eq!(
            seen.lock().take().unwrap().unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_io_survives_repeated_quiesce() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        let binding = registry.activate(bed.binding("c", "sde", BindingConfig::new("c"))).unwrap();
        let disk = bed.disk("sde");
        let shard = registry.inner.shard_of(disk.id());
        binding.gate().close();

        let (bio, seen) = write_bio(16, 1, 7);
        std::thread::scope(|s| {
            let io = s.spawn(|| disk.submit_bio(bio));
            for _ in 0..(ROUTE_RETRY_LIMIT + 8) {
                {
                    let _bindings = shard.bindings.write();
                    binding.gate().open();
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    binding.gate().close();
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                assert!(seen.lock().is_none());
            }
            binding.gate().open();
            io.join().unwrap();
        });

        assert!(seen.lock().take().unwrap().is_ok());
        assert_eq!(bed.engine.mapped_sectors(), vec![("c".to_string(), 16)]);
        assert_eq!(binding.inflight(), 0);
    }

    #[test]
    fn test_overflowing_sector_rejected() {
        let bed = TestBed::new();
        let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
        registry.activate(bed.binding("c", "sde", BindingConfig::new("c"))).unwrap();

        let (mut bio, seen) = write_bio(u64::MAX, 1, 0);
        bio.set_disk(bed.disk("sde"));
        registry.interceptor().make_request(bio);
        assert_eq!(
            seen.lock().take().unwrap().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_released_registry_fails_io() {
        let bed = TestBed::new();
        let interceptor = {
            let registry = Registry::new(TtcConfig::default(), bed.collaborators()).unwrap();
            registry.interceptor().clone()
        };
        let (mut bio, seen) = write_bio(0, 1, 0);
        bio.set_disk(bed.disk("sdb"));
        interceptor.make_request(bio);
        assert_eq!(seen.lock().take().unwrap().unwrap_err().kind(), ErrorKind::Io);
    }
}
