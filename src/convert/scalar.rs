#[inline(always)]
pub(crate) fn swap_bgra_to_rgba(pixel: u32) -> u32 {
    ((pixel & 0x0000_00FF) << 16)
        | (pixel & 0x0000_FF00)
        | ((pixel & 0x00FF_0000) >> 16)
        | (pixel & 0xFF00_0000)
}

/// Swizzle one row of BGRA pixels into RGBA. Both slices must hold the
/// same number of whole pixels.
pub(crate) fn bgra_row_to_rgba(src: &[u8], dst: &mut [u8]) {
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let pixel = u32::from_le_bytes([src_px[0], src_px[1], src_px[2], src_px[3]]);
        dst_px.copy_from_slice(&swap_bgra_to_rgba(pixel).to_le_bytes());
    }
}

/// Drop alpha while swizzling: BGRA in, RGB out.
pub(crate) fn bgra_row_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
        dst_px[0] = src_px[2];
        dst_px[1] = src_px[1];
        dst_px[2] = src_px[0];
    }
}

pub(crate) fn rgba_row_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
        dst_px.copy_from_slice(&src_px[..3]);
    }
}
