use super::*;

/// Storage which lives in a memory-mapped file. The first page of the file
/// holds a [`Header`] whose checksum covers the data region, so the arena can
/// be reopened after a clean shutdown. Without a flush before shutdown the
/// checksum is stale and the file will be rejected on open.
pub struct MmapFile {
    mmap: MmapMut,
    data: Range<usize>,
    user_version: u64,
}

/// Total file length for a data region of `data_size` bytes.
fn file_size(data_size: usize) -> usize {
    page_align(HEADER_SIZE + data_size)
}

impl MmapFile {
    /// Open an existing datapool file. Fails if the file is missing, has the
    /// wrong size or layout version, or if its checksum does not match the
    /// contents.
    pub fn open<T: AsRef<Path>>(
        path: T,
        data_size: usize,
        user_version: u64,
    ) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        if file.metadata()?.len() != file_size(data_size) as u64 {
            return Err(Error::other("filesize mismatch"));
        }

        let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
        let data = HEADER_SIZE..(HEADER_SIZE + data_size);

        let header = Header::read_from(&mmap[0..HEADER_SIZE]);
        header.check(user_version, data_size)?;

        // hashing reads every data page, which also faults them in
        let digest = header.digest(&mmap[data.clone()]);
        if mmap[0..32] != digest.as_bytes()[0..32] {
            return Err(Error::other("checksum mismatch"));
        }

        Ok(Self {
            mmap,
            data,
            user_version,
        })
    }

    /// Create a new datapool file. Fails if the file already exists or could
    /// not be sized and mapped. The data region starts zeroed.
    pub fn create<T: AsRef<Path>>(
        path: T,
        data_size: usize,
        user_version: u64,
    ) -> Result<Self, std::io::Error> {
        if data_size == 0 {
            return Err(Error::other("datapool size must be non-zero"));
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        let total_size = file_size(data_size);
        file.set_len(total_size as u64)?;

        let mut mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
        prefault(&mut mmap[..]);
        mmap.flush()?;

        Ok(Self {
            mmap,
            data: HEADER_SIZE..(HEADER_SIZE + data_size),
            user_version,
        })
    }

    /// A copy of the header as it was last written.
    pub fn header(&self) -> Header {
        Header::read_from(&self.mmap[0..HEADER_SIZE])
    }
}

impl Datapool for MmapFile {
    fn as_slice(&self) -> &[u8] {
        &self.mmap[self.data.start..self.data.end]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[self.data.start..self.data.end]
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.mmap.flush()?;

        let mut header = Header::new(self.user_version, self.data.len());
        let digest = header.digest(&self.mmap[self.data.clone()]);
        header.set_checksum(digest);

        self.mmap[0..HEADER_SIZE].copy_from_slice(header.as_bytes());

        self.mmap.flush_range(0, HEADER_SIZE)
    }
}
