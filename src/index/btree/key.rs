use byteorder::{ByteOrder, LittleEndian};

/// Fixed-width key stored in B+ tree node slots. Ordering comes from `Ord`
/// on the decoded value, so variable-endianness concerns stay out of the
/// node code.
pub trait IndexKey: Ord + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Encoded width of one key in a node slot.
    const ENCODED_SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}
