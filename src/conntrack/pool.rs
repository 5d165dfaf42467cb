//! Page-sized receive buffer recycling.
//!
//! Every socket read borrows one buffer from the pool and hands it onward
//! inside the resulting [`Event`](crate::conntrack::Event); releasing the
//! event returns the buffer for reuse. The worker thread holds at most one
//! buffer per in-flight read, but the pool itself is shared state (several
//! consumers may hand out events referencing it concurrently) and is
//! synchronized internally.

use std::sync::Mutex;

/// Fallback when `sysconf(_SC_PAGESIZE)` is unavailable.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// A synchronized free list of page-sized byte buffers.
pub struct BufferPool {
    page_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        // SAFETY: sysconf() is always safe to call; a negative return means
        // the limit is indeterminate and we fall back to a sane default.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page > 0 {
            page as usize
        } else {
            DEFAULT_PAGE_SIZE
        };

        Self {
            page_size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Size of every buffer handed out by this pool.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Take a buffer from the free list, allocating only when it is empty.
    pub fn get(&self) -> Vec<u8> {
        let recycled = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        recycled.unwrap_or_else(|| vec![0u8; self.page_size])
    }

    /// Return a buffer for reuse.
    pub fn put(&self, buf: Vec<u8>) {
        match self.free.lock() {
            Ok(mut free) => free.push(buf),
            Err(poisoned) => poisoned.into_inner().push(buf),
        }
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        match self.free.lock() {
            Ok(free) => free.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::BufferPool;

    #[test]
    fn buffers_are_page_sized() {
        let pool = BufferPool::new();
        let buf = pool.get();
        assert_eq!(buf.len(), pool.page_size());
        assert!(pool.page_size() >= 4096);
    }

    #[test]
    fn recycles_returned_buffers() {
        let pool = BufferPool::new();
        assert_eq!(pool.available(), 0);

        let buf = pool.get();
        let ptr = buf.as_ptr();
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        // The next get must reuse the returned buffer, not allocate.
        let again = pool.get();
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn concurrent_lending_cycles() {
        let pool = Arc::new(BufferPool::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let buf = pool.get();
                    pool.put(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every lending cycle returned its buffer exactly once.
        assert!(pool.available() <= 4);
    }
}
