use super::*;

/// Volatile storage in an anonymous mapping. Contents are lost when the pool
/// is dropped.
pub struct Memory {
    mmap: MmapMut,
    size: usize,
}

impl Memory {
    /// Map `size` bytes of zeroed memory. The mapping is rounded up to whole
    /// pages but only `size` bytes are exposed. With `prefault` set, every
    /// page is touched before returning.
    pub fn create(size: usize, prefault: bool) -> Result<Self, std::io::Error> {
        if size == 0 {
            return Err(Error::other("datapool size must be non-zero"));
        }

        let mut options = MmapOptions::new();
        options.len(page_align(size));
        if prefault {
            options.populate();
        }
        let mut mmap = options.map_anon()?;

        if prefault {
            super::prefault(&mut mmap[..]);
        }

        Ok(Self { mmap, size })
    }
}

impl Datapool for Memory {
    fn as_slice(&self) -> &[u8] {
        &self.mmap[..self.size]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..self.size]
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_datapool() {
        let datapool = Memory::create(2 * PAGE_SIZE, true).expect("failed to create pool");
        assert_eq!(datapool.len(), 2 * PAGE_SIZE);
        assert!(datapool.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn unaligned_size() {
        let mut datapool = Memory::create(1000, false).expect("failed to create pool");
        assert_eq!(datapool.len(), 1000);
        datapool.as_mut_slice()[999] = 1;
        assert_eq!(datapool.as_slice()[999], 1);
        assert!(datapool.flush().is_ok());
    }

    #[test]
    fn empty() {
        assert!(Memory::create(0, false).is_err());
    }
}
