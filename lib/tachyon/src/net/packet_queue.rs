/// Verbatim staging buffer for one snapshot's mini-packets. The client
/// appends node events here while a snapshot is streaming in; once the
/// `EndSnapshot` proves all fragments arrived, the buffer is re-decoded into
/// the state tree as one atomic batch. A fractured snapshot discards it.
pub struct PacketQueue {
    buf: Vec<u8>,
    frame_index: u32,
    timestamp: i64,
}

impl PacketQueue {
    #[inline]
    pub fn new() -> PacketQueue {
        PacketQueue {
            buf: Vec::with_capacity(65536),
            frame_index: 0,
            timestamp: 0,
        }
    }

    /// Stamps the snapshot index and receive time the staged packets belong
    /// to. Restamping within the same snapshot refreshes the timestamp.
    #[inline]
    pub fn set_frame(&mut self, frame_index: u32, timestamp: i64) {
        debug_assert!(self.frame_index == 0 || self.frame_index == frame_index);
        self.frame_index = frame_index;
        self.timestamp = timestamp;
    }

    #[inline]
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Appends one raw mini-packet (header included) unchanged.
    #[inline]
    pub fn copy_packet(&mut self, raw: &[u8]) {
        self.buf.extend_from_slice(raw);
    }

    /// The staged mini-packet stream, decodable by `WireReader`.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.buf.clear();
        self.frame_index = 0;
        self.timestamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_reset() {
        let mut queue = PacketQueue::new();
        assert!(queue.is_empty());

        queue.set_frame(7, 1000);
        queue.copy_packet(&[1, 2, 3, 4]);
        queue.copy_packet(&[5, 6, 7, 8]);

        assert_eq!(queue.frame_index(), 7);
        assert_eq!(queue.timestamp(), 1000);
        assert_eq!(queue.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.frame_index(), 0);
    }
}
