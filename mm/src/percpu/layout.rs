//! Unit layout: where each CPU's replica of a chunk lives.
//!
//! [`AllocInfo`] is the caller's description of the boot area and is only
//! validated and consumed here; [`UnitLayout`] is the resolved table the
//! allocator uses for every chunk afterwards.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;

use pcpu_lib::{KlogLevel, align_up, klog};

use crate::error::{PcpuError, PcpuResult};
use crate::mm_constants::{
    PAGE_SHIFT, PAGE_SIZE, PCPU_MIN_UNIT_SIZE, PERCPU_DYNAMIC_EARLY_SIZE, pages_to_bits,
};

/// Units that should be colocated; `cpu_map[i]` is the CPU served by unit
/// `i` of the group, `None` for an unused unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub base_offset: usize,
    pub nr_units: usize,
    pub cpu_map: Vec<Option<usize>>,
}

/// Shape of the boot area: one unit per CPU, each holding the static
/// variables, the reserved region and the early dynamic region in that
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocInfo {
    pub static_size: usize,
    pub reserved_size: usize,
    pub dyn_size: usize,
    pub unit_size: usize,
    pub atom_size: usize,
    pub alloc_size: usize,
    pub nr_cpus: usize,
    pub groups: Vec<GroupInfo>,
}

impl AllocInfo {
    /// All CPUs in one group, units laid out back to back.
    ///
    /// The dynamic size is raised to `PERCPU_DYNAMIC_EARLY_SIZE` and grown
    /// so the three regions end on a page boundary.
    pub fn single_group(nr_cpus: usize, static_size: usize, reserved_size: usize, dyn_size: usize) -> Self {
        let size_sum = align_up(
            static_size + reserved_size + dyn_size.max(PERCPU_DYNAMIC_EARLY_SIZE),
            PAGE_SIZE,
        );
        let dyn_size = size_sum - static_size - reserved_size;
        let unit_size = size_sum.max(PCPU_MIN_UNIT_SIZE);

        Self {
            static_size,
            reserved_size,
            dyn_size,
            unit_size,
            atom_size: PAGE_SIZE,
            alloc_size: unit_size,
            nr_cpus,
            groups: vec![GroupInfo {
                base_offset: 0,
                nr_units: nr_cpus,
                cpu_map: (0..nr_cpus).map(Some).collect(),
            }],
        }
    }

    pub fn nr_units(&self) -> usize {
        self.groups.iter().map(|group| group.nr_units).sum()
    }

    /// Log the layout, one line for the sizes and one per group.
    pub fn dump(&self, level: KlogLevel) {
        klog!(
            level,
            "pcpu-alloc: s{} r{} d{} u{} alloc={}*{}",
            self.static_size,
            self.reserved_size,
            self.dyn_size,
            self.unit_size,
            self.alloc_size / self.atom_size.max(1),
            self.atom_size
        );

        let cpu_width = digits(self.nr_cpus.saturating_sub(1));
        let group_width = digits(self.groups.len().saturating_sub(1));
        for (index, group) in self.groups.iter().enumerate() {
            let mut line = String::new();
            let _ = write!(line, "[{:0w$}]", index, w = group_width);
            for cpu in group.cpu_map.iter().take(group.nr_units) {
                let _ = match cpu {
                    Some(cpu) => write!(line, " {:0w$}", cpu, w = cpu_width),
                    None => write!(line, " {:-<w$}", "", w = cpu_width),
                };
            }
            klog!(level, "pcpu-alloc: {}", line);
        }
    }
}

fn digits(mut value: usize) -> usize {
    let mut width = 1;
    while value >= 10 {
        value /= 10;
        width += 1;
    }
    width
}

/// Resolved per-CPU unit geometry shared by every chunk.
#[derive(Debug, Clone)]
pub struct UnitLayout {
    unit_pages: usize,
    nr_units: usize,
    atom_size: usize,
    /// `cpu -> unit index`.
    unit_map: Vec<usize>,
    /// `cpu -> byte offset of its unit from the chunk base`.
    unit_offsets: Vec<usize>,
    group_offsets: Vec<usize>,
    group_sizes: Vec<usize>,
    low_unit_cpu: usize,
    high_unit_cpu: usize,
}

impl UnitLayout {
    /// Resolve the group tables of `ai`, checking that every CPU is served
    /// by exactly one unit.
    pub fn from_alloc_info(ai: &AllocInfo) -> PcpuResult<Self> {
        let mut unit_map: Vec<Option<usize>> = vec![None; ai.nr_cpus];
        let mut unit_offsets = vec![0; ai.nr_cpus];
        let mut group_offsets = Vec::with_capacity(ai.groups.len());
        let mut group_sizes = Vec::with_capacity(ai.groups.len());
        let mut low_unit_cpu: Option<usize> = None;
        let mut high_unit_cpu: Option<usize> = None;
        let mut unit = 0;

        for group in &ai.groups {
            group_offsets.push(group.base_offset);
            group_sizes.push(group.nr_units * ai.unit_size);

            for (i, cpu) in group.cpu_map.iter().take(group.nr_units).enumerate() {
                let Some(cpu) = *cpu else {
                    continue;
                };
                if cpu >= ai.nr_cpus {
                    return Err(PcpuError::InvalidLayout("cpu >= nr_cpus"));
                }
                if unit_map[cpu].is_some() {
                    return Err(PcpuError::InvalidLayout("unit_map[cpu] != UNSET"));
                }
                unit_map[cpu] = Some(unit + i);
                unit_offsets[cpu] = group.base_offset + i * ai.unit_size;

                if low_unit_cpu.is_none_or(|low| unit_offsets[cpu] < unit_offsets[low]) {
                    low_unit_cpu = Some(cpu);
                }
                if high_unit_cpu.is_none_or(|high| unit_offsets[cpu] > unit_offsets[high]) {
                    high_unit_cpu = Some(cpu);
                }
            }
            unit += group.nr_units;
        }

        let unit_map = unit_map
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(PcpuError::InvalidLayout("unit_map[cpu] == UNSET"))?;
        let (Some(low_unit_cpu), Some(high_unit_cpu)) = (low_unit_cpu, high_unit_cpu) else {
            return Err(PcpuError::InvalidLayout("no cpu mapped"));
        };

        Ok(Self {
            unit_pages: ai.unit_size >> PAGE_SHIFT,
            nr_units: unit,
            atom_size: ai.atom_size,
            unit_map,
            unit_offsets,
            group_offsets,
            group_sizes,
            low_unit_cpu,
            high_unit_cpu,
        })
    }

    #[inline]
    pub fn unit_pages(&self) -> usize {
        self.unit_pages
    }

    #[inline]
    pub fn unit_size(&self) -> usize {
        self.unit_pages << PAGE_SHIFT
    }

    /// Allocation units in a full-size chunk.
    #[inline]
    pub fn unit_bits(&self) -> usize {
        pages_to_bits(self.unit_pages)
    }

    #[inline]
    pub fn nr_units(&self) -> usize {
        self.nr_units
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.unit_map.len()
    }

    #[inline]
    pub fn atom_size(&self) -> usize {
        self.atom_size
    }

    pub fn unit_index(&self, cpu: usize) -> usize {
        self.unit_map[cpu]
    }

    pub fn unit_offset(&self, cpu: usize) -> usize {
        self.unit_offsets[cpu]
    }

    pub fn group_offsets(&self) -> &[usize] {
        &self.group_offsets
    }

    pub fn group_sizes(&self) -> &[usize] {
        &self.group_sizes
    }

    #[inline]
    pub fn low_unit_cpu(&self) -> usize {
        self.low_unit_cpu
    }

    #[inline]
    pub fn high_unit_cpu(&self) -> usize {
        self.high_unit_cpu
    }

    /// Address of `page` inside `cpu`'s replica of the chunk at `base`.
    #[inline]
    pub fn chunk_addr(&self, base: usize, cpu: usize, page: usize) -> usize {
        base + self.unit_offsets[cpu] + (page << PAGE_SHIFT)
    }

    /// Bytes from the chunk base to the end of the highest unit.
    pub fn chunk_span(&self) -> usize {
        self.unit_offsets[self.high_unit_cpu] + self.unit_size()
    }

    pub fn cpus(&self) -> core::ops::Range<usize> {
        0..self.nr_cpus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_group_rounds_sizes() {
        let ai = AllocInfo::single_group(4, 0x1234, 0, 0);
        assert_eq!(ai.dyn_size, 5 * PAGE_SIZE - 0x1234);
        assert_eq!((ai.static_size + ai.dyn_size) % PAGE_SIZE, 0);
        assert_eq!(ai.unit_size, PCPU_MIN_UNIT_SIZE);
        assert_eq!(ai.nr_units(), 4);

        let layout = UnitLayout::from_alloc_info(&ai).unwrap();
        assert_eq!(layout.unit_pages(), PCPU_MIN_UNIT_SIZE / PAGE_SIZE);
        assert_eq!(layout.unit_offset(3), 3 * PCPU_MIN_UNIT_SIZE);
        assert_eq!((layout.low_unit_cpu(), layout.high_unit_cpu()), (0, 3));
        assert_eq!(layout.chunk_span(), 4 * PCPU_MIN_UNIT_SIZE);
        assert_eq!(
            layout.chunk_addr(0x100000, 2, 1),
            0x100000 + 2 * PCPU_MIN_UNIT_SIZE + PAGE_SIZE
        );
    }

    #[test]
    fn test_split_groups_map_cpus() {
        let mut ai = AllocInfo::single_group(3, 0x2000, 0, 0x3000);
        ai.groups = vec![
            GroupInfo {
                base_offset: 0,
                nr_units: 2,
                cpu_map: vec![Some(2), None],
            },
            GroupInfo {
                base_offset: 4 * ai.unit_size,
                nr_units: 2,
                cpu_map: vec![Some(0), Some(1)],
            },
        ];

        let layout = UnitLayout::from_alloc_info(&ai).unwrap();
        assert_eq!(layout.nr_units(), 4);
        assert_eq!(layout.unit_index(0), 2);
        assert_eq!(layout.unit_index(2), 0);
        assert_eq!(layout.unit_offset(1), 5 * ai.unit_size);
        assert_eq!((layout.low_unit_cpu(), layout.high_unit_cpu()), (2, 1));
        assert_eq!(layout.group_sizes(), &[2 * ai.unit_size, 2 * ai.unit_size]);
    }

    #[test]
    fn test_rejects_double_and_missing_cpus() {
        let mut ai = AllocInfo::single_group(2, 0x2000, 0, 0);
        ai.groups[0].cpu_map = vec![Some(1), Some(1)];
        assert_eq!(
            UnitLayout::from_alloc_info(&ai).unwrap_err(),
            PcpuError::InvalidLayout("unit_map[cpu] != UNSET")
        );

        ai.groups[0].cpu_map = vec![Some(0), None];
        assert_eq!(
            UnitLayout::from_alloc_info(&ai).unwrap_err(),
            PcpuError::InvalidLayout("unit_map[cpu] == UNSET")
        );
    }
}
