use std::fmt;

use capros_types::PAGE_SIZE;

/// One page of data: the contents of a data page or of one log frame.
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuf(Box<[u8; PAGE_SIZE]>);

impl PageBuf {
    pub fn zeroed() -> Self {
        Self(Box::new([0u8; PAGE_SIZE]))
    }

    /// A page with every byte set to `byte`.
    pub fn filled(byte: u8) -> Self {
        Self(Box::new([byte; PAGE_SIZE]))
    }

    /// Copy up to one page from `bytes`; the remainder stays zero.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut page = Self::zeroed();
        let n = bytes.len().min(PAGE_SIZE);
        page.0[..n].copy_from_slice(&bytes[..n]);
        page
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    pub(crate) fn put_u16(&mut self, at: usize, v: u16) {
        self.0[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, at: usize, v: u32) {
        self.0[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, at: usize, v: u64) {
        self.0[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn get_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.0[at], self.0[at + 1]])
    }

    pub(crate) fn get_u32(&self, at: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[at..at + 4]);
        u32::from_le_bytes(b)
    }

    pub(crate) fn get_u64(&self, at: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[at..at + 8]);
        u64::from_le_bytes(b)
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonzero = self.0.iter().filter(|&&b| b != 0).count();
        f.debug_struct("PageBuf")
            .field("first", &self.0[0])
            .field("nonzero_bytes", &nonzero)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_page_is_zero() {
        assert!(PageBuf::zeroed().is_zero());
        assert!(!PageBuf::filled(0xAA).is_zero());
    }

    #[test]
    fn from_slice_pads_with_zero() {
        let page = PageBuf::from_slice(b"abc");
        assert_eq!(&page.as_bytes()[..3], b"abc");
        assert!(page.as_bytes()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn little_endian_accessors() {
        let mut page = PageBuf::zeroed();
        page.put_u32(8, 0xdead_beef);
        page.put_u64(16, 0x0102_0304_0506_0708);
        page.put_u16(30, 0xabcd);
        assert_eq!(page.as_bytes()[8], 0xef);
        assert_eq!(page.get_u32(8), 0xdead_beef);
        assert_eq!(page.get_u64(16), 0x0102_0304_0506_0708);
        assert_eq!(page.get_u16(30), 0xabcd);
    }
}
