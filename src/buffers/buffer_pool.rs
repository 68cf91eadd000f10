use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};

/// Recycles wire buffers for serialized outbound packets and inbound datagrams
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buf_size {
            // the buffer's storage was split off or frozen
            trace!("discarding returned buffer with reduced capacity {}", buffer.capacity());
            return;
        }

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(10, 10);

        let mut buf = pool.get_from_pool();
        buf.put_u8(1);
        buf.put_u8(2);
        pool.return_to_pool(buf);
        assert_eq!(pool.len(), 1);

        assert!(pool.get_from_pool().is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_full_pool_discards() {
        let pool = BufferPool::new(10, 1);
        pool.return_to_pool(BytesMut::with_capacity(10));
        pool.return_to_pool(BytesMut::with_capacity(10));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_small_buffer_is_discarded() {
        let pool = BufferPool::new(100, 10);
        pool.return_to_pool(BytesMut::with_capacity(5));
        assert_eq!(pool.len(), 0);
    }
}
