use capros_store::PageBuf;

/// Checksum of a page's contents: the first eight bytes of its BLAKE3 hash.
pub fn page_checksum(page: &PageBuf) -> u64 {
    let hash = blake3::hash(page.as_bytes());
    let mut b = [0u8; 8];
    b.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(b)
}
