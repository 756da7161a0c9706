/// Generate `align_down_$suffix` and `align_up_$suffix` for a given integer type.
///
/// Both functions treat `alignment == 0` as a no-op (returns `value` unchanged).
/// `align_up` uses saturating arithmetic to prevent overflow.
macro_rules! impl_align_fns {
    ($ty:ty, $suffix:ident) => {
        paste::paste! {
            /// Align `value` down to the nearest multiple of `alignment`.
            /// If `alignment` is zero, the input is returned unchanged.
            #[inline(always)]
            pub const fn [<align_down_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value & !(alignment - 1)
            }

            /// Align `value` up to the nearest multiple of `alignment`.
            /// If `alignment` is zero, the input is returned unchanged.
            /// Uses saturating arithmetic to prevent overflow.
            #[inline(always)]
            pub const fn [<align_up_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                let adjusted = value.saturating_add(alignment - 1);
                adjusted & !(alignment - 1)
            }

            /// `true` when `value` is a non-zero power of two.
            #[inline(always)]
            pub const fn [<is_power_of_two_ $suffix>](value: $ty) -> bool {
                value != 0 && (value & (value - 1)) == 0
            }
        }
    };
}

impl_align_fns!(usize, usize);

/// Index of the page containing byte offset `off` (`PFN_DOWN`).
#[inline(always)]
pub const fn pfn_down(off: usize, page_shift: u32) -> usize {
    off >> page_shift
}

/// Number of pages needed to cover `off` bytes (`PFN_UP`).
#[inline(always)]
pub const fn pfn_up(off: usize, page_shift: u32) -> usize {
    (off + (1usize << page_shift) - 1) >> page_shift
}

/// 1-based index of the most significant set bit, 0 for `0` (`fls`).
#[inline(always)]
pub const fn fls(value: usize) -> u32 {
    usize::BITS - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up_usize(5, 8), 8);
        assert_eq!(align_up_usize(16, 8), 16);
        assert_eq!(align_down_usize(15, 8), 8);
        assert_eq!(align_up_usize(7, 0), 7);
        assert!(is_power_of_two_usize(4096));
        assert!(!is_power_of_two_usize(0));
        assert!(!is_power_of_two_usize(12));
    }

    #[test]
    fn page_frame_helpers() {
        assert_eq!(pfn_down(4095, 12), 0);
        assert_eq!(pfn_down(4096, 12), 1);
        assert_eq!(pfn_up(1, 12), 1);
        assert_eq!(pfn_up(4096, 12), 1);
        assert_eq!(pfn_up(4097, 12), 2);
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(1024), 11);
    }
}
