/// Mask/unmask a frame payload.
///
/// XORs every byte with `mask[i % 4]`. Applying the same mask twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    #[cfg(target_pointer_width = "64")]
    apply_mask_wide64(buf, mask);
    #[cfg(not(target_pointer_width = "64"))]
    apply_mask_wide32(buf, mask);
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Masks 8 bytes at a time against the key replicated into a `u64`.
///
/// Chunks start at offset 0 and are a multiple of 4 bytes long, so the tail always
/// starts at key index 0.
#[inline]
#[cfg_attr(not(target_pointer_width = "64"), allow(dead_code))]
fn apply_mask_wide64(buf: &mut [u8], mask: [u8; 4]) {
    let [a, b, c, d] = mask;
    let mask_u64 = u64::from_ne_bytes([a, b, c, d, a, b, c, d]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let word = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), mask);
}

/// 4-byte variant of [`apply_mask_wide64`] for narrower pointer widths.
#[inline]
#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
fn apply_mask_wide32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        let word = u32::from_ne_bytes(word) ^ mask_u32;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), mask);
}
