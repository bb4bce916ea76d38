use serde::{Deserialize, Serialize};

use crate::config::{FtlConfig, NandLayout, PageAllocation};
use crate::types::{Lpn, Lspn, Ppn, Psbn, Pspn};

/// A physical page number decomposed into its NAND coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalAddress {
    pub channel: u32,
    pub way: u32,
    pub die: u32,
    pub plane: u32,
    pub block: u32,
    pub page: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct Pow2 {
    shift: [u32; 4],
    mask: [u64; 4],
    shift_block: u32,
    mask_block: u64,
    shift_page: u32,
}

/// Immutable dimensions and address packing.
///
/// The packed PPN space puts the four parallelism dimensions in the
/// configured `page_allocation` order in the lowest digits, then the block
/// index, then the page index. Consequently:
///
/// - `PPN  = PSPN * superpage + superpage_index`
/// - `PSPN = PSBN + total_superblocks * page_index`
/// - `parallelism_index(PSBN) = PSBN % units`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub channel: u32,
    pub way: u32,
    pub die: u32,
    pub plane: u32,
    pub block: u32,
    pub page: u32,
    pub page_size: u32,
    pub spare_size: u32,
    pub page_allocation: [PageAllocation; 4],

    pub superpage: u32,
    pub parallelism: u64,
    /// Parallelism units: `parallelism / superpage`.
    pub units: u64,
    pub total_physical_blocks: u64,
    pub total_logical_blocks: u64,
    pub total_physical_pages: u64,
    pub total_logical_pages: u64,
    pub total_physical_super_pages: u64,
    pub total_logical_super_pages: u64,
    pub total_superblocks: u64,

    pow2: Option<Pow2>,
}

impl Parameter {
    pub fn new(config: &FtlConfig) -> Self {
        let l = &config.layout;
        let parallelism = l.parallelism();
        let superpage = config.superpage;
        let total_physical_blocks = l.total_physical_blocks();
        let total_logical_blocks =
            (total_physical_blocks as f64 * (1.0 - config.overprovision as f64)) as u64;
        let total_physical_pages = total_physical_blocks * l.page as u64;
        let total_logical_pages = total_logical_blocks * l.page as u64;

        Parameter {
            channel: l.channel,
            way: l.way,
            die: l.die,
            plane: l.plane,
            block: l.block,
            page: l.page,
            page_size: l.page_size,
            spare_size: l.spare_size,
            page_allocation: l.page_allocation,
            superpage,
            parallelism,
            units: parallelism / superpage as u64,
            total_physical_blocks,
            total_logical_blocks,
            total_physical_pages,
            total_logical_pages,
            total_physical_super_pages: total_physical_pages / superpage as u64,
            total_logical_super_pages: total_logical_pages / superpage as u64,
            total_superblocks: total_physical_blocks / superpage as u64,
            pow2: Self::make_pow2(l),
        }
    }

    fn make_pow2(l: &NandLayout) -> Option<Pow2> {
        let all_pow2 = [l.channel, l.way, l.die, l.plane, l.block, l.page]
            .iter()
            .all(|d| d.is_power_of_two());
        if !all_pow2 {
            return None;
        }

        let mut shift = [0u32; 4];
        let mut mask = [0u64; 4];
        let mut sum = 0u32;

        for dim in l.page_allocation {
            let width = l.dimension(dim).trailing_zeros();
            shift[dim as usize] = sum;
            mask[dim as usize] = l.dimension(dim) as u64 - 1;
            sum += width;
        }

        let shift_block = sum;
        sum += l.block.trailing_zeros();

        Some(Pow2 {
            shift,
            mask,
            shift_block,
            mask_block: l.block as u64 - 1,
            shift_page: sum,
        })
    }

    // Logical side.

    pub fn lspn_of_lpn(&self, lpn: Lpn) -> Lspn {
        assert!(lpn.0 < self.total_logical_pages, "LPN {lpn} out of range");
        Lspn(lpn.0 / self.superpage as u64)
    }

    pub fn superpage_index_of_lpn(&self, lpn: Lpn) -> u32 {
        (lpn.0 % self.superpage as u64) as u32
    }

    pub fn make_lpn(&self, lspn: Lspn, superpage_index: u32) -> Lpn {
        assert!(
            lspn.0 < self.total_logical_super_pages && superpage_index < self.superpage,
            "LSPN {lspn} / index {superpage_index} out of range"
        );
        Lpn(lspn.0 * self.superpage as u64 + superpage_index as u64)
    }

    // Physical side.

    pub fn make_pspn(&self, psbn: Psbn, page_index: u32) -> Pspn {
        assert!(
            psbn.0 < self.total_superblocks && page_index < self.page,
            "PSBN {psbn} / page {page_index} out of range"
        );
        Pspn(psbn.0 + self.total_superblocks * page_index as u64)
    }

    pub fn psbn_of_pspn(&self, pspn: Pspn) -> Psbn {
        assert!(
            pspn.0 < self.total_physical_super_pages,
            "PSPN {pspn} out of range"
        );
        Psbn(pspn.0 % self.total_superblocks)
    }

    pub fn page_index_of_pspn(&self, pspn: Pspn) -> u32 {
        assert!(
            pspn.0 < self.total_physical_super_pages,
            "PSPN {pspn} out of range"
        );
        (pspn.0 / self.total_superblocks) as u32
    }

    /// PPN of one sub-page of a super-page.
    pub fn make_ppn_of_pspn(&self, pspn: Pspn, superpage_index: u32) -> Ppn {
        assert!(
            pspn.0 < self.total_physical_super_pages && superpage_index < self.superpage,
            "PSPN {pspn} / index {superpage_index} out of range"
        );
        Ppn(pspn.0 * self.superpage as u64 + superpage_index as u64)
    }

    /// PPN of sub-page `superpage_index` of page `page_index` in `psbn`.
    pub fn make_ppn(&self, psbn: Psbn, superpage_index: u32, page_index: u32) -> Ppn {
        self.make_ppn_of_pspn(self.make_pspn(psbn, page_index), superpage_index)
    }

    pub fn pspn_of_ppn(&self, ppn: Ppn) -> Pspn {
        assert!(ppn.0 < self.total_physical_pages, "PPN {ppn} out of range");
        Pspn(ppn.0 / self.superpage as u64)
    }

    /// Allocator unit that owns this super-block.
    pub fn unit_of_psbn(&self, psbn: Psbn) -> u64 {
        assert!(psbn.0 < self.total_superblocks, "PSBN {psbn} out of range");
        psbn.0 % self.units
    }

    /// Flat (channel, way, die, plane) index of a PPN, used for per-die
    /// serialization in the flash model.
    pub fn parallel_index_of_ppn(&self, ppn: Ppn) -> u64 {
        assert!(ppn.0 < self.total_physical_pages, "PPN {ppn} out of range");
        ppn.0 % self.parallelism
    }

    /// Split a PPN into NAND coordinates.
    pub fn decompose(&self, ppn: Ppn) -> PhysicalAddress {
        assert!(ppn.0 < self.total_physical_pages, "PPN {ppn} out of range");

        let mut out = PhysicalAddress {
            channel: 0,
            way: 0,
            die: 0,
            plane: 0,
            block: 0,
            page: 0,
        };

        if let Some(p) = &self.pow2 {
            for dim in self.page_allocation {
                let value = ((ppn.0 >> p.shift[dim as usize]) & p.mask[dim as usize]) as u32;
                *Self::field(&mut out, dim) = value;
            }
            out.block = ((ppn.0 >> p.shift_block) & p.mask_block) as u32;
            out.page = (ppn.0 >> p.shift_page) as u32;
        } else {
            let mut rest = ppn.0;
            for dim in self.page_allocation {
                let size = self.dimension(dim) as u64;
                *Self::field(&mut out, dim) = (rest % size) as u32;
                rest /= size;
            }
            out.block = (rest % self.block as u64) as u32;
            out.page = (rest / self.block as u64) as u32;
        }

        out
    }

    /// Inverse of [`decompose`](Self::decompose).
    pub fn compose(&self, addr: PhysicalAddress) -> Ppn {
        assert!(
            addr.channel < self.channel
                && addr.way < self.way
                && addr.die < self.die
                && addr.plane < self.plane
                && addr.block < self.block
                && addr.page < self.page,
            "physical address {addr:?} out of range"
        );

        let mut ppn = 0u64;
        let mut scale = 1u64;
        let mut addr = addr;

        for dim in self.page_allocation {
            ppn += *Self::field(&mut addr, dim) as u64 * scale;
            scale *= self.dimension(dim) as u64;
        }
        ppn += addr.block as u64 * scale;
        scale *= self.block as u64;
        ppn += addr.page as u64 * scale;

        Ppn(ppn)
    }

    fn dimension(&self, dim: PageAllocation) -> u32 {
        match dim {
            PageAllocation::Channel => self.channel,
            PageAllocation::Way => self.way,
            PageAllocation::Die => self.die,
            PageAllocation::Plane => self.plane,
        }
    }

    fn field(addr: &mut PhysicalAddress, dim: PageAllocation) -> &mut u32 {
        match dim {
            PageAllocation::Channel => &mut addr.channel,
            PageAllocation::Way => &mut addr.way,
            PageAllocation::Die => &mut addr.die,
            PageAllocation::Plane => &mut addr.plane,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::FtlConfig;

    fn layout(channel: u32, way: u32, die: u32, plane: u32, block: u32, page: u32) -> NandLayout {
        NandLayout {
            channel,
            way,
            die,
            plane,
            block,
            page,
            page_size: 4096,
            spare_size: 16,
            page_allocation: [
                PageAllocation::Channel,
                PageAllocation::Way,
                PageAllocation::Die,
                PageAllocation::Plane,
            ],
        }
    }

    fn parameter(superpage: u32) -> Parameter {
        let mut config = FtlConfig::new(layout(2, 2, 1, 1, 16, 32));
        config.superpage = superpage;
        config.overprovision = 0.25;
        config.validate().unwrap();
        Parameter::new(&config)
    }

    #[test]
    fn derived_dimensions_match_reference_scenario() {
        let param = parameter(1);

        assert_eq!(4, param.parallelism);
        assert_eq!(64, param.total_physical_blocks);
        assert_eq!(48, param.total_logical_blocks);
        assert_eq!(2048, param.total_physical_pages);
        assert_eq!(1536, param.total_logical_pages);
        assert_eq!(64, param.total_superblocks);
        assert_eq!(4, param.units);
    }

    #[test]
    fn superpage_identities() {
        let param = parameter(4);

        assert_eq!(Lspn(5), param.lspn_of_lpn(Lpn(21)));
        assert_eq!(1, param.superpage_index_of_lpn(Lpn(21)));
        assert_eq!(Lpn(21), param.make_lpn(Lspn(5), 1));

        let pspn = param.make_pspn(Psbn(3), 7);
        assert_eq!(Psbn(3), param.psbn_of_pspn(pspn));
        assert_eq!(7, param.page_index_of_pspn(pspn));

        let ppn = param.make_ppn(Psbn(3), 2, 7);
        assert_eq!(pspn, param.pspn_of_ppn(ppn));
        assert_eq!(ppn, param.make_ppn_of_pspn(pspn, 2));
    }

    #[test]
    fn units_partition_superblocks() {
        let param = parameter(1);

        for psbn in 0..param.total_superblocks {
            assert_eq!(psbn % 4, param.unit_of_psbn(Psbn(psbn)));
        }
    }

    #[test]
    fn non_pow2_falls_back_to_modulo_chain() {
        let config = FtlConfig::new(layout(3, 2, 1, 1, 10, 12));
        let param = Parameter::new(&config);
        assert!(param.pow2.is_none());

        for ppn in 0..param.total_physical_pages {
            let addr = param.decompose(Ppn(ppn));
            assert_eq!(Ppn(ppn), param.compose(addr));
        }
    }

    proptest! {
        #[test]
        fn decompose_compose_bijection(ppn in 0u64..2048) {
            let param = parameter(1);
            let addr = param.decompose(Ppn(ppn));
            prop_assert_eq!(Ppn(ppn), param.compose(addr));
        }

        #[test]
        fn ppn_pspn_psbn_round_trip(psbn in 0u64..16, s in 0u32..4, page in 0u32..32) {
            let param = parameter(4);
            let ppn = param.make_ppn(Psbn(psbn), s, page);
            let pspn = param.pspn_of_ppn(ppn);
            prop_assert_eq!(Psbn(psbn), param.psbn_of_pspn(pspn));
            prop_assert_eq!(page, param.page_index_of_pspn(pspn));
        }
    }
}
