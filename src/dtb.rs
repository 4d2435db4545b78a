//! Boot device tree parsing
//!
//! Turns the flattened device tree handed over at boot into a `VmmConfig`.
//! The `fdt` crate parses in place without allocating; the result is plain
//! owned data so the blob can be dropped afterwards.
//!
//! Recognized layout:
//!
//! ```text
//! / { compatible; #address-cells; #size-cells;
//!     vmm { mterm_priority; sched_tick_ns; };
//!     memory@.. { reg; };
//!     cpus { cpu@.. { reg; }; };
//!     chosen { bootargs; };          (or host/chosen)
//!     guests { <name> { endian; guest_irq_count;
//!         vcpus { <name> { start_pc; priority; time_slice; affinity; poweroff; }; };
//!         aspace { <name> { phys; size; type; host_phys; alias_guest_phys;
//!                           emulator; flags; align_order; interrupts; }; };
//!     }; };
//! };
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use fdt::node::FdtNode;
use fdt::Fdt;
use log::{debug, warn};

use crate::config::{GuestConfig, MemoryBank, RegionConfig, VcpuConfig, VmmConfig};
use crate::error::{Error, Result};
use crate::guest::{RegionFlags, RegionType};
use crate::percpu::CpuMask;

/// Parse a device tree blob
pub fn parse(blob: &[u8]) -> Result<VmmConfig> {
    let fdt = Fdt::new(blob)?;
    let root = fdt.find_node("/").ok_or(Error::Invalid)?;
    let addr_cells = prop_u64(&root, "#address-cells").unwrap_or(2) as usize;
    let size_cells = prop_u64(&root, "#size-cells").unwrap_or(1) as usize;

    let mut config = VmmConfig {
        compatible: root
            .compatible()
            .map(|c| c.all().map(String::from).collect())
            .unwrap_or_default(),
        ..VmmConfig::default()
    };

    if let Some(vmm) = fdt.find_node("/vmm") {
        if let Some(prio) = prop_u64(&vmm, "mterm_priority") {
            config.mterm_priority = u8::try_from(prio).map_err(|_| Error::Invalid)?;
        }
        if let Some(tick) = prop_u64(&vmm, "sched_tick_ns") {
            config.sched_tick_ns = tick;
        }
    }

    config.memory = root
        .children()
        .filter(|n| node_base_name(n.name) == "memory")
        .map(|n| parse_reg(&n, addr_cells, size_cells))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .map(|(base, size)| MemoryBank { base, size })
        .collect();

    if let Some(cpus) = fdt.find_node("/cpus") {
        let cpu_cells = prop_u64(&cpus, "#address-cells").unwrap_or(1) as usize;
        let ids: Vec<u64> = cpus
            .children()
            .filter(|n| node_base_name(n.name) == "cpu")
            .filter_map(|n| n.property("reg").and_then(|p| read_cells(p.value, cpu_cells)))
            .collect();
        if !ids.is_empty() {
            config.cpus = ids;
        }
    }

    let chosen = fdt.find_node("/host/chosen").or_else(|| fdt.find_node("/chosen"));
    if let Some(bootargs) = chosen.as_ref().and_then(|c| prop_str(c, "bootargs")) {
        config.bootargs = String::from(bootargs);
    }

    if let Some(guests) = fdt.find_node("/guests") {
        for node in guests.children() {
            config.guests.push(parse_guest(&node)?);
        }
    }

    debug!(
        "dtb: {} memory banks, {} cpus, {} guests",
        config.memory.len(),
        config.cpus.len(),
        config.guests.len()
    );
    Ok(config)
}

fn parse_guest(node: &FdtNode) -> Result<GuestConfig> {
    let mut guest = GuestConfig::new(node.name);
    guest.big_endian = match prop_str(node, "endian") {
        None | Some("little") => false,
        Some("big") => true,
        Some(other) => {
            warn!("guest {}: bad endian {}", node.name, other);
            return Err(Error::Invalid);
        }
    };
    if let Some(count) = prop_u64(node, "guest_irq_count") {
        guest.irq_count = u32::try_from(count).map_err(|_| Error::Invalid)?;
    }
    for child in node.children() {
        match child.name {
            "vcpus" => {
                for v in child.children() {
                    guest.vcpus.push(parse_vcpu(&v)?);
                }
            }
            "aspace" => {
                for r in child.children() {
                    guest.regions.push(parse_region(&r)?);
                }
            }
            _ => {}
        }
    }
    Ok(guest)
}

fn parse_vcpu(node: &FdtNode) -> Result<VcpuConfig> {
    let start_pc = prop_u64(node, "start_pc").ok_or(Error::Invalid)?;
    let mut vcpu = VcpuConfig::new(node.name, start_pc);
    if let Some(prio) = prop_u64(node, "priority") {
        vcpu.priority = u8::try_from(prio).map_err(|_| Error::Invalid)?;
    }
    if let Some(slice) = prop_u64(node, "time_slice") {
        vcpu.time_slice_ns = slice;
    }
    if let Some(mask) = prop_u64(node, "affinity") {
        vcpu.affinity = Some(CpuMask(mask));
    }
    vcpu.poweroff = match node.property("poweroff") {
        None => false,
        Some(p) if p.value.is_empty() => true,
        Some(p) => read_cells(p.value, p.value.len() / 4).map_or(false, |v| v != 0),
    };
    Ok(vcpu)
}

fn parse_region(node: &FdtNode) -> Result<RegionConfig> {
    let gpa = prop_u64(node, "phys").ok_or(Error::Invalid)?;
    let size = prop_u64(node, "size").ok_or(Error::Invalid)?;
    let kind = RegionType::parse(prop_str(node, "type").ok_or(Error::Invalid)?)?;
    let name = node.name;

    let mut region = match kind {
        RegionType::Ram => RegionConfig::ram(name, gpa, size),
        RegionType::Rom => RegionConfig::rom(name, gpa, size),
        RegionType::Alias => {
            let target = prop_u64(node, "alias_guest_phys")
                .or_else(|| prop_u64(node, "alias_phys"))
                .ok_or(Error::Invalid)?;
            RegionConfig::alias(name, gpa, size, target)
        }
        RegionType::Emulated => {
            let compat = prop_str(node, "emulator").ok_or(Error::Invalid)?;
            RegionConfig::emulated(name, gpa, size, compat)
        }
        RegionType::Reserved => RegionConfig::reserved(name, gpa, size),
    };

    if let Some(hpa) = prop_u64(node, "host_phys") {
        region.host_phys = Some(hpa);
        region.flags.remove(RegionFlags::ALLOC);
    }
    if let Some(flags) = node.property("flags") {
        let alloc = region.flags & RegionFlags::ALLOC;
        region.flags = parse_flags(flags.value)? | alloc;
    }
    if let Some(order) = prop_u64(node, "align_order") {
        if order >= 64 {
            return Err(Error::Invalid);
        }
        region.align = 1 << order;
    }
    if let Some(irq) = prop_u64(node, "interrupts") {
        region.irq = Some(u32::try_from(irq).map_err(|_| Error::Invalid)?);
    }
    Ok(region)
}

/// String list (NUL or comma separated) of flag names
fn parse_flags(value: &[u8]) -> Result<RegionFlags> {
    let text = core::str::from_utf8(value).map_err(|_| Error::Invalid)?;
    let mut flags = RegionFlags::empty();
    for name in text.split(|c| c == '\0' || c == ',').map(str::trim).filter(|s| !s.is_empty()) {
        flags |= match name {
            "read" => RegionFlags::READ,
            "write" => RegionFlags::WRITE,
            "exec" => RegionFlags::EXEC,
            "cacheable" => RegionFlags::CACHEABLE,
            "eager" => RegionFlags::EAGER,
            _ => return Err(Error::Invalid),
        };
    }
    Ok(flags)
}

/// `memory@40000000` -> `memory`
fn node_base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

fn parse_reg(node: &FdtNode, addr_cells: usize, size_cells: usize) -> Result<Vec<(u64, u64)>> {
    let Some(reg) = node.property("reg") else {
        return Err(Error::Invalid);
    };
    let stride = (addr_cells + size_cells) * 4;
    if stride == 0 || reg.value.len() % stride != 0 {
        return Err(Error::Invalid);
    }
    reg.value
        .chunks_exact(stride)
        .map(|entry| {
            let (a, s) = entry.split_at(addr_cells * 4);
            let base = read_cells(a, addr_cells).ok_or(Error::Invalid)?;
            let size = read_cells(s, size_cells).ok_or(Error::Invalid)?;
            Ok((base, size))
        })
        .collect()
}

/// Big-endian value of one or two 32-bit cells
fn read_cells(bytes: &[u8], cells: usize) -> Option<u64> {
    if bytes.len() < cells * 4 {
        return None;
    }
    match cells {
        1 => Some(u32::from_be_bytes(bytes[..4].try_into().ok()?) as u64),
        2 => Some(u64::from_be_bytes(bytes[..8].try_into().ok()?)),
        _ => None,
    }
}

fn prop_u64(node: &FdtNode, name: &str) -> Option<u64> {
    let prop = node.property(name)?;
    match prop.value.len() {
        4 => read_cells(prop.value, 1),
        8 => read_cells(prop.value, 2),
        _ => None,
    }
}

fn prop_str<'a>(node: &FdtNode<'_, 'a>, name: &str) -> Option<&'a str> {
    node.property(name)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_are_big_endian() {
        assert_eq!(read_cells(&[0, 0, 0x10, 0], 1), Some(0x1000));
        assert_eq!(read_cells(&[0, 0, 0, 1, 0, 0, 0, 2], 2), Some(0x1_0000_0002));
        assert_eq!(read_cells(&[0, 0], 1), None);
        assert_eq!(read_cells(&[0; 12], 3), None);
    }

    #[test]
    fn flag_lists() {
        assert_eq!(
            parse_flags(b"read\0write\0"),
            Ok(RegionFlags::READ | RegionFlags::WRITE)
        );
        assert_eq!(parse_flags(b"read,exec,eager"), Ok(RegionFlags::READ | RegionFlags::EXEC | RegionFlags::EAGER));
        assert_eq!(parse_flags(b"bogus"), Err(Error::Invalid));
    }

    #[test]
    fn unit_address_stripped() {
        assert_eq!(node_base_name("memory@40000000"), "memory");
        assert_eq!(node_base_name("cpus"), "cpus");
    }
}
