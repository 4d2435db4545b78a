//! Guest address space: region map, stage-2 population and fault policy

mod common;

use std::sync::{Arc, Mutex};

use common::{config_with_cpus, Harness};
use vmm_core::arch::aarch64::defs::{EC_DABT_SAME, ESR_EC_SHIFT, ISS_WNR, VECTOR_CURRENT_SPX_SYNC};
use vmm_core::arch::VcpuContextOps;
use vmm_core::guest::{AccessKind, AspaceEvent, FaultOutcome, Guest, RegionFlags, RegionKind, RegionType, Stage2Fault};
use vmm_core::mm::{HostMemFlags, MapFlags, PAGE_SIZE};
use vmm_core::{Error, GuestConfig, GuestId, RegionConfig, VcpuConfig, VcpuState};

const RAM_BASE: u64 = 0x4000_0000;
const RAM_SIZE: u64 = 0x40_0000;
const ROM_BASE: u64 = 0x0;
const MB2: u64 = 0x20_0000;

fn setup() -> (Harness, GuestId) {
    let mut config = config_with_cpus(1);
    let mut guest = GuestConfig::new("vm");
    guest.vcpus.push(VcpuConfig::new("cpu0", RAM_BASE));
    guest.regions.push(RegionConfig {
        align: MB2,
        ..RegionConfig::ram("ram", RAM_BASE, RAM_SIZE)
    });
    guest.regions.push(RegionConfig::rom("rom", ROM_BASE, 0x1_0000));
    config.guests.push(guest);
    let mut h = Harness::new(config);
    let gid = h.hv.guest_find_by_name("vm").unwrap().id();
    h.start();
    h.hv.guest_kick(gid).unwrap();
    h.service();
    (h, gid)
}

fn data_fault(h: &mut Harness, gpa: u64, access: AccessKind) -> FaultOutcome {
    let fault = Stage2Fault {
        gpa,
        gva: gpa,
        access,
        size: 4,
        is_unpriv: false,
        mmio: None,
    };
    h.hv.handle_stage2_fault(0, &mut h.regs[0], &fault)
}

fn ram_backing(h: &Harness, gid: GuestId, gpa: u64) -> u64 {
    match h.hv.guest_find_region(gid, gpa).unwrap().kind {
        RegionKind::Ram { hpa } => hpa,
        ref other => panic!("not RAM: {:?}", other),
    }
}

#[test]
fn unmapped_address_gets_data_abort() {
    let (mut h, _) = setup();
    let pc = h.regs[0].pc();

    assert_eq!(data_fault(&mut h, 0xDEAD_BEE0, AccessKind::Read), FaultOutcome::AbortInjected);

    let st = h.arch.live_state(0);
    assert_eq!(st.far_el1, 0xDEAD_BEE0);
    assert_eq!((st.esr_el1 >> ESR_EC_SHIFT) & 0x3f, EC_DABT_SAME);
    assert_eq!(st.esr_el1 & ISS_WNR as u64, 0);
    assert_eq!(st.elr_el1, pc);
    assert_eq!(h.regs[0].pc(), st.vbar_el1 + VECTOR_CURRENT_SPX_SYNC);
}

#[test]
fn ram_fault_maps_declared_backing() {
    let (mut h, gid) = setup();
    let hpa = ram_backing(&h, gid, RAM_BASE);
    assert_eq!(hpa % MB2, 0);
    assert!(h.hv.guest_translate(gid, RAM_BASE + 0x1234).is_none());

    // Test 1: one fault installs the whole 2 MiB block around it
    assert_eq!(data_fault(&mut h, RAM_BASE + 0x1234, AccessKind::Write), FaultOutcome::Mapped);
    let (pa, flags, size) = h.hv.guest_translate(gid, RAM_BASE + 0x1234).unwrap();
    assert_eq!(pa, hpa + 0x1234);
    assert_eq!(size, MB2);
    assert!(flags.contains(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC));
    assert_eq!(h.hv.guest_translate(gid, RAM_BASE + MB2 - 8).unwrap().0, hpa + MB2 - 8);

    // Test 2: the second block stays unmapped until touched
    assert!(h.hv.guest_translate(gid, RAM_BASE + MB2).is_none());
    assert_eq!(data_fault(&mut h, RAM_BASE + MB2 + 8, AccessKind::Read), FaultOutcome::Mapped);
    assert_eq!(h.hv.guest_translate(gid, RAM_BASE + MB2).unwrap().0, hpa + MB2);

    // Test 3: translation ends at the region
    assert!(h.hv.guest_translate(gid, RAM_BASE + RAM_SIZE).is_none());
}

#[test]
fn rom_is_read_only_to_the_guest() {
    let (mut h, gid) = setup();

    assert_eq!(data_fault(&mut h, ROM_BASE + 0x100, AccessKind::Read), FaultOutcome::Mapped);
    let (_, flags, _) = h.hv.guest_translate(gid, ROM_BASE + 0x100).unwrap();
    assert!(!flags.contains(MapFlags::WRITE));

    // Test 1: store into ROM is a write abort
    assert_eq!(data_fault(&mut h, ROM_BASE + 0x200, AccessKind::Write), FaultOutcome::AbortInjected);
    let st = h.arch.live_state(0);
    assert_eq!(st.far_el1, ROM_BASE + 0x200);
    assert_ne!(st.esr_el1 & ISS_WNR as u64, 0);

    // Test 2: the hypervisor itself may still load an image into it
    assert_eq!(h.hv.guest_physical_write(gid, ROM_BASE, b"boot"), Ok(4));
    let mut buf = [0u8; 4];
    h.hv.guest_physical_read(gid, ROM_BASE, &mut buf).unwrap();
    assert_eq!(&buf, b"boot");
}

#[test]
fn physical_copy_spans_regions() {
    let (h, gid) = setup();
    let next = RAM_BASE + RAM_SIZE;
    h.hv.guest_add_region(gid, &RegionConfig::ram("ram2", next, 0x1000)).unwrap();

    // Test 1: a copy across two adjacent RAM regions
    let data: Vec<u8> = (0..64u8).collect();
    assert_eq!(h.hv.guest_physical_write(gid, next - 32, &data), Ok(64));
    let mut back = [0u8; 64];
    assert_eq!(h.hv.guest_physical_read(gid, next - 32, &mut back), Ok(64));
    assert_eq!(&back[..], &data[..]);

    // Test 2: it lands in each region's own backing
    let hpa = ram_backing(&h, gid, next);
    let va = h.hv.host().pa2va(hpa);
    let head = unsafe { std::slice::from_raw_parts(va as *const u8, 32) };
    assert_eq!(head, &data[32..]);

    // Test 3: copies stop at a hole, and fail when they start in one
    let end = next + 0x1000;
    assert_eq!(h.hv.guest_physical_write(gid, end - 16, &data), Ok(16));
    assert_eq!(h.hv.guest_physical_read(gid, end, &mut back), Err(Error::Fault));
}

#[test]
fn regions_never_overlap() {
    let (h, gid) = setup();
    let free = h.hv.host().free_page_count();

    let clash = RegionConfig::ram("clash", RAM_BASE + 0x10_0000, 0x10_0000);
    assert_eq!(h.hv.guest_add_region(gid, &clash), Err(Error::Overlap));
    // Backing allocated for the refused region went back to the pool
    assert_eq!(h.hv.host().free_page_count(), free);

    assert_eq!(
        h.hv.guest_add_region(gid, &RegionConfig::ram("odd", 0x8000_0800, 0x1000)),
        Err(Error::Invalid)
    );

    let regions = h.hv.guest_find(gid).unwrap().regions();
    for (i, a) in regions.iter().enumerate() {
        for b in regions.iter().skip(i + 1) {
            assert!(!a.overlaps(b.base, b.size), "{} overlaps {}", a.name, b.name);
        }
    }
}

#[test]
fn add_and_remove_restore_state() {
    let (mut h, gid) = setup();
    let free = h.hv.host().free_page_count();
    let generation = h.hv.guest_find(gid).unwrap().generation();
    let base = 0x8000_0000;

    h.hv.guest_add_region(gid, &RegionConfig::ram("extra", base, 0x4000)).unwrap();
    assert!(h.hv.host().free_page_count() < free);
    assert_eq!(data_fault(&mut h, base, AccessKind::Read), FaultOutcome::Mapped);
    assert!(h.hv.guest_translate(gid, base).is_some());

    // Test 1: removal unmaps, frees and flushes
    let flushes = h.arch.tlb_flushes();
    h.hv.guest_remove_region(gid, base).unwrap();
    assert!(h.hv.guest_translate(gid, base).is_none());
    assert!(h.arch.tlb_flushes() > flushes);
    assert!(h.hv.guest_find_region(gid, base).is_none());
    assert!(h.hv.guest_find(gid).unwrap().generation() > generation);

    // Test 2: a second removal has nothing to remove
    assert_eq!(h.hv.guest_remove_region(gid, base), Err(Error::NotAvail));
    assert_eq!(data_fault(&mut h, base, AccessKind::Read), FaultOutcome::AbortInjected);

    // Test 3: re-adding works and removal hands the frames back
    h.hv.guest_add_region(gid, &RegionConfig::ram("extra", base, 0x4000)).unwrap();
    let before = h.hv.host().free_page_count();
    h.hv.guest_remove_region(gid, base).unwrap();
    assert_eq!(h.hv.host().free_page_count(), before + 4);
}

#[test]
fn eager_region_is_mapped_up_front() {
    let (h, gid) = setup();
    let cfg = RegionConfig {
        flags: RegionFlags::RAM | RegionFlags::EAGER,
        ..RegionConfig::ram("eager", 0x9000_0000, 0x3000)
    };
    h.hv.guest_add_region(gid, &cfg).unwrap();
    for off in (0..0x3000).step_by(PAGE_SIZE as usize) {
        let (pa, _, size) = h.hv.guest_translate(gid, 0x9000_0000 + off).unwrap();
        assert_eq!(pa, ram_backing(&h, gid, 0x9000_0000) + off);
        assert_eq!(size, PAGE_SIZE);
    }
}

#[test]
fn fixed_host_backing_is_used_as_is() {
    let (h, gid) = setup();
    let va = h.hv.host().alloc_pages(2, HostMemFlags::NORMAL | HostMemFlags::ZERO).unwrap();
    let pa = h.hv.host().va2pa(va).unwrap();
    let cfg = RegionConfig {
        host_phys: Some(pa),
        ..RegionConfig::ram("fixed", 0xA000_0000, 0x2000)
    };
    h.hv.guest_add_region(gid, &cfg).unwrap();
    assert_eq!(h.hv.guest_map(gid, 0xA000_0010, 0x1000), Ok(pa + 0x10));
    assert_eq!(h.hv.guest_translate(gid, 0xA000_1000).unwrap().0, pa + 0x1000);

    // Test 1: not ours to free
    let free = h.hv.host().free_page_count();
    h.hv.guest_remove_region(gid, 0xA000_0000).unwrap();
    assert_eq!(h.hv.host().free_page_count(), free);
    h.hv.host().free_pages(va, 2).unwrap();
}

#[test]
fn alias_follows_its_target() {
    let (mut h, gid) = setup();
    let alias = 0x5000_0000;
    h.hv
        .guest_add_region(gid, &RegionConfig::alias("low", alias, 0x2000, RAM_BASE + 0x1000))
        .unwrap();
    assert_eq!(
        h.hv.guest_find_region(gid, alias).unwrap().kind.region_type(),
        RegionType::Alias
    );

    // Test 1: writes through the alias show up in the target
    h.hv.guest_physical_write(gid, alias + 4, &[0xAB; 4]).unwrap();
    let mut buf = [0u8; 4];
    h.hv.guest_physical_read(gid, RAM_BASE + 0x1004, &mut buf).unwrap();
    assert_eq!(buf, [0xAB; 4]);

    // Test 2: stage-2 maps the alias onto the target's frames
    assert_eq!(data_fault(&mut h, alias + 0x1008, AccessKind::Read), FaultOutcome::Mapped);
    let hpa = ram_backing(&h, gid, RAM_BASE);
    assert_eq!(h.hv.guest_translate(gid, alias + 0x1008).unwrap().0, hpa + 0x2008);

    // Test 3: aliases of nothing, or past the target's end, are refused
    let bad = RegionConfig::alias("bad", 0x5100_0000, 0x1000, 0x7000_0000);
    assert_eq!(h.hv.guest_add_region(gid, &bad), Err(Error::Invalid));
    let long = RegionConfig::alias("long", 0x5100_0000, 0x2000, RAM_BASE + RAM_SIZE - 0x1000);
    assert_eq!(h.hv.guest_add_region(gid, &long), Err(Error::Invalid));
}

#[test]
fn aliased_region_outlives_no_alias() {
    let (mut h, gid) = setup();
    let alias = 0x1000_0000;
    h.hv
        .guest_add_region(gid, &RegionConfig::alias("win", alias, 0x1000, RAM_BASE))
        .unwrap();
    assert_eq!(data_fault(&mut h, alias, AccessKind::Read), FaultOutcome::Mapped);
    let free = h.hv.host().free_page_count();

    // Test 1: the target stays while an alias points into it
    assert_eq!(h.hv.guest_remove_region(gid, RAM_BASE), Err(Error::Busy));
    assert!(h.hv.guest_find_region(gid, RAM_BASE).is_some());
    assert_eq!(h.hv.host().free_page_count(), free);
    assert!(h.hv.guest_translate(gid, alias).is_some());

    // Test 2: alias first, then the target
    h.hv.guest_remove_region(gid, alias).unwrap();
    assert!(h.hv.guest_translate(gid, alias).is_none());
    h.hv.guest_remove_region(gid, RAM_BASE).unwrap();
    assert!(h.hv.guest_find_region(gid, RAM_BASE).is_none());
    assert!(h.hv.host().free_page_count() > free);
}

#[test]
fn reserved_range_faults() {
    let (mut h, gid) = setup();
    h.hv.guest_add_region(gid, &RegionConfig::reserved("hole", 0x6000_0000, 0x1000)).unwrap();
    assert_eq!(data_fault(&mut h, 0x6000_0010, AccessKind::Read), FaultOutcome::AbortInjected);
    assert_eq!(h.hv.guest_map(gid, 0x6000_0000, 0x1000), Err(Error::Invalid));
}

#[test]
fn protect_downgrades_mapping() {
    let (mut h, gid) = setup();
    data_fault(&mut h, RAM_BASE, AccessKind::Read);
    h.hv.guest_protect(gid, RAM_BASE, MB2, MapFlags::READ).unwrap();
    let (_, flags, _) = h.hv.guest_translate(gid, RAM_BASE + 0x40).unwrap();
    assert!(flags.contains(MapFlags::READ));
    assert!(!flags.contains(MapFlags::WRITE));
}

#[test]
fn write_after_protect_restores_access() {
    let (mut h, gid) = setup();
    let vid = h.hv.guest_find(gid).unwrap().vcpu_ids()[0];
    assert_eq!(data_fault(&mut h, RAM_BASE, AccessKind::Read), FaultOutcome::Mapped);
    h.hv.guest_protect(gid, RAM_BASE + 0x1000, 0x1000, MapFlags::READ | MapFlags::CACHEABLE).unwrap();

    assert_eq!(data_fault(&mut h, RAM_BASE + 0x1008, AccessKind::Write), FaultOutcome::Mapped);
    assert_ne!(h.hv.vcpu_state(vid), Ok(VcpuState::Halted));
    let (hpa, flags, size) = h.hv.guest_translate(gid, RAM_BASE + 0x1008).unwrap();
    assert_eq!(hpa, ram_backing(&h, gid, RAM_BASE) + 0x1008);
    assert!(flags.contains(MapFlags::WRITE));
    assert_eq!(size, PAGE_SIZE);

    // Untouched neighbours keep their rights
    let (_, flags, _) = h.hv.guest_translate(gid, RAM_BASE + 0x2000).unwrap();
    assert!(flags.contains(MapFlags::WRITE));
}

#[test]
fn notifiers_see_map_changes() {
    let (h, gid) = setup();
    let seen: Arc<Mutex<Vec<AspaceEvent>>> = Arc::default();
    let log = seen.clone();
    let id = h
        .hv
        .guest_aspace_register_notifier(
            gid,
            Arc::new(move |_: &Guest, ev: &AspaceEvent| log.lock().unwrap().push(*ev)),
        )
        .unwrap();

    h.hv.guest_add_region(gid, &RegionConfig::ram("n", 0xB000_0000, 0x1000)).unwrap();
    h.hv.guest_remove_region(gid, 0xB000_0000).unwrap();
    h.hv.guest_reset(gid).unwrap();
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[
            AspaceEvent::RegionAdded { base: 0xB000_0000, size: 0x1000, kind: RegionType::Ram },
            AspaceEvent::RegionRemoved { base: 0xB000_0000, size: 0x1000, kind: RegionType::Ram },
            AspaceEvent::Reset,
        ]
    );

    // Test 1: unregistered notifiers are quiet
    h.hv.guest_aspace_unregister_notifier(gid, id).unwrap();
    h.hv.guest_add_region(gid, &RegionConfig::ram("n", 0xB000_0000, 0x1000)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(h.hv.guest_aspace_unregister_notifier(gid, id), Err(Error::NotAvail));
}
