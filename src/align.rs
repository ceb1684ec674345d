//! Wire alignment. Every D-Bus value starts at a multiple of its type's
//! alignment (1, 2, 4 or 8), measured from the start of the body.

/// Bytes of padding needed to bring `offset` up to `alignment`.
pub(crate) fn padding(offset: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment {} is not a power of two",
        alignment
    );
    offset.wrapping_neg() & (alignment - 1)
}

/// `offset` rounded up to the next multiple of `alignment`.
pub(crate) fn align(offset: usize, alignment: usize) -> usize {
    offset + padding(offset, alignment)
}

/// Zero-pads `buf` up to the next multiple of `alignment`.
pub(crate) fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    let n = padding(buf.len(), alignment);
    buf.extend(std::iter::repeat(0u8).take(n));
}
