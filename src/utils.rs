use super::types::ALIGN;

/// round `value` up to the next multiple of `align` (a power of two),
/// returning `None` on overflow
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// return the ceiling of a / b
#[inline]
pub const fn ceil(a: usize, b: usize) -> usize {
    a / b + (if a % b != 0 { 1 } else { 0 })
}

/// whether `addr` sits on a pool alignment boundary
#[inline]
pub fn is_aligned(addr: usize) -> bool {
    addr & (ALIGN - 1) == 0
}

#[test]
fn test_align_up() {
    for i in 0..10 {
        let expected = ALIGN * (i + 1);
        for size in (ALIGN * i + 1)..=(ALIGN * (i + 1)) {
            assert_eq!(align_up(size, ALIGN), Some(expected));
        }
    }
    assert_eq!(align_up(0, ALIGN), Some(0));
    assert_eq!(align_up(usize::MAX, ALIGN), None);
}

#[test]
fn test_ceil() {
    assert_eq!(ceil(0, 8), 0);
    assert_eq!(ceil(1, 8), 1);
    assert_eq!(ceil(8, 8), 1);
    assert_eq!(ceil(9, 8), 2);
}
