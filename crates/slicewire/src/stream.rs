use std::mem;

use crate::buffer::Buffer;
use crate::error::{MarshalError, Result};
use crate::instance::Instance;
use crate::protocol::{
    ENCODING_MAJOR, ENCODING_MINOR, MAX_COMPACT_SIZE, SIZE_MARKER, SLICE_HEADER_SIZE,
};

/// One nested write encapsulation: records where its header begins so the
/// placeholder length can be patched when the frame closes.
#[derive(Debug, Clone, Copy)]
struct WriteEncaps {
    start: usize,
}

/// One nested read encapsulation: header offset, declared size, and the
/// version bytes it announced.
#[derive(Debug, Clone, Copy)]
struct ReadEncaps {
    start: usize,
    size: i32,
    encoding_major: u8,
    encoding_minor: u8,
}

/// One currently-open sequence of variable-size elements being read.
///
/// `num_elements * min_size` bounds the wire bytes the rest of the sequence
/// must still occupy, which is what lets a hostile declared count be
/// rejected before any allocation.
#[derive(Debug, Clone, Copy)]
struct SeqData {
    num_elements: i32,
    min_size: i32,
}

/// Byte-oriented marshalling stream for one RPC message.
///
/// A stream is created per message, mutated by exactly one thread, and
/// discarded or [`reset`](Stream::reset) when the message is done. Writes
/// append at the end of the buffer; reads advance an independent cursor, so
/// a freshly written message can be read back from the same stream.
///
/// All integers travel in little-endian order regardless of host
/// architecture; `to_le_bytes`/`from_le_bytes` perform the swap on
/// big-endian targets.
#[derive(Debug)]
pub struct Stream<'a> {
    instance: &'a Instance,
    buf: Buffer,
    write_encaps: Vec<WriteEncaps>,
    read_encaps: Vec<ReadEncaps>,
    write_slices: Vec<usize>,
    read_slices: Vec<usize>,
    seq_data: Vec<SeqData>,
}

macro_rules! fixed_width_codec {
    ($ty:ty, $width:expr, $write:ident, $read:ident, $write_seq:ident, $read_seq:ident) => {
        /// Append one little-endian value.
        pub fn $write(&mut self, v: $ty) -> Result<()> {
            self.buf.append(&v.to_le_bytes())
        }

        /// Consume one little-endian value, bounds-checked.
        pub fn $read(&mut self) -> Result<$ty> {
            Ok(<$ty>::from_le_bytes(self.buf.fetch::<{ $width }>()?))
        }

        /// Sequence: size header followed by packed little-endian elements.
        pub fn $write_seq(&mut self, v: &[$ty]) -> Result<()> {
            debug_assert!(v.len() <= i32::MAX as usize);
            self.write_size(v.len() as i32)?;
            for &e in v {
                self.$write(e)?;
            }
            Ok(())
        }

        /// Read a sequence, validating the declared count against the
        /// remaining bytes before allocating.
        pub fn $read_seq(&mut self) -> Result<Vec<$ty>> {
            let n = self.read_size()?;
            self.check_fixed_seq(n, $width)?;
            let mut out = Vec::with_capacity(n as usize);
            for _ in 0..n {
                out.push(self.$read()?);
            }
            Ok(out)
        }
    };
}

impl<'a> Stream<'a> {
    /// Create an empty stream bound to the instance's resource policy.
    pub fn new(instance: &'a Instance) -> Self {
        Self {
            instance,
            buf: Buffer::new(instance.message_size_max),
            write_encaps: Vec::new(),
            read_encaps: Vec::new(),
            write_slices: Vec::new(),
            read_slices: Vec::new(),
            seq_data: Vec::new(),
        }
    }

    /// Create a stream seeded with received wire bytes, ready for decoding.
    ///
    /// Fails with `MemoryLimitExceeded` if the message is larger than the
    /// instance allows.
    pub fn with_data(instance: &'a Instance, data: &[u8]) -> Result<Self> {
        let mut stream = Self::new(instance);
        stream.buf.append(data)?;
        Ok(stream)
    }

    /// The owning runtime handle, consulted for configuration only.
    pub fn instance(&self) -> &Instance {
        self.instance
    }

    /// Wire bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read cursor position.
    pub fn pos(&self) -> usize {
        self.buf.pos()
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Rewind for reuse across messages, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.buf.reset();
        self.clear();
    }

    /// Drop every pending encapsulation, slice, and sequence frame.
    ///
    /// Called on teardown after a mid-decode failure; the frame stacks are
    /// plain vectors, so this (and `Drop`) can never leak a frame.
    pub fn clear(&mut self) {
        self.write_encaps.clear();
        self.read_encaps.clear();
        self.write_slices.clear();
        self.read_slices.clear();
        self.seq_data.clear();
    }

    /// Exchange the entire marshalling state with another stream.
    pub fn swap(&mut self, other: &mut Stream<'a>) {
        mem::swap(&mut self.instance, &mut other.instance);
        mem::swap(&mut self.buf, &mut other.buf);
        mem::swap(&mut self.write_encaps, &mut other.write_encaps);
        mem::swap(&mut self.read_encaps, &mut other.read_encaps);
        mem::swap(&mut self.write_slices, &mut other.write_slices);
        mem::swap(&mut self.read_slices, &mut other.read_slices);
        mem::swap(&mut self.seq_data, &mut other.seq_data);
    }

    // ------------------------------------------------------------------
    // Primitive codec
    // ------------------------------------------------------------------

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.buf.append(&[v])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.buf.fetch::<1>()?[0])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fixed_width_codec!(i16, 2, write_i16, read_i16, write_i16_seq, read_i16_seq);
    fixed_width_codec!(i32, 4, write_i32, read_i32, write_i32_seq, read_i32_seq);
    fixed_width_codec!(i64, 8, write_i64, read_i64, write_i64_seq, read_i64_seq);
    fixed_width_codec!(f32, 4, write_f32, read_f32, write_f32_seq, read_f32_seq);
    fixed_width_codec!(f64, 8, write_f64, read_f64, write_f64_seq, read_f64_seq);

    /// Byte sequence: size header + raw bytes, copied in one gulp.
    pub fn write_u8_seq(&mut self, v: &[u8]) -> Result<()> {
        debug_assert!(v.len() <= i32::MAX as usize);
        self.write_size(v.len() as i32)?;
        self.buf.append(v)
    }

    pub fn read_u8_seq(&mut self) -> Result<Vec<u8>> {
        let n = self.read_size()?;
        Ok(self.buf.read_slice(n as usize)?.to_vec())
    }

    pub fn write_bool_seq(&mut self, v: &[bool]) -> Result<()> {
        debug_assert!(v.len() <= i32::MAX as usize);
        self.write_size(v.len() as i32)?;
        for &b in v {
            self.write_u8(b as u8)?;
        }
        Ok(())
    }

    pub fn read_bool_seq(&mut self) -> Result<Vec<bool>> {
        let n = self.read_size()?;
        let bytes = self.buf.read_slice(n as usize)?;
        Ok(bytes.iter().map(|&b| b != 0).collect())
    }

    /// Raw bytes with no size header; the caller owns the length contract.
    pub fn write_blob(&mut self, v: &[u8]) -> Result<()> {
        self.buf.append(v)
    }

    pub fn read_blob(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buf.read_slice(n)?.to_vec())
    }

    // ------------------------------------------------------------------
    // Size encoding
    // ------------------------------------------------------------------

    /// Write a size or count: one byte for 0..=254, otherwise the marker
    /// byte 255 followed by a 4-byte integer.
    ///
    /// Negative sizes never occur on the write path; they are a programmer
    /// error, not wire input.
    pub fn write_size(&mut self, v: i32) -> Result<()> {
        debug_assert!(v >= 0, "sizes are never negative");
        if v > MAX_COMPACT_SIZE {
            self.write_u8(SIZE_MARKER)?;
            self.write_i32(v)
        } else {
            self.write_u8(v as u8)
        }
    }

    /// Read a size or count, rejecting negative 5-byte encodings.
    pub fn read_size(&mut self) -> Result<i32> {
        let b = self.read_u8()?;
        if b == SIZE_MARKER {
            let v = self.read_i32()?;
            if v < 0 {
                return Err(MarshalError::NegativeSize { value: v });
            }
            Ok(v)
        } else {
            Ok(i32::from(b))
        }
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Size-encoded byte length followed by raw UTF-8 bytes.
    pub fn write_string(&mut self, v: &str) -> Result<()> {
        debug_assert!(v.len() <= i32::MAX as usize);
        self.write_size(v.len() as i32)?;
        self.buf.append(v.as_bytes())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let n = self.read_size()? as usize;
        if n == 0 {
            return Ok(String::new());
        }
        let bytes = self.buf.read_slice(n)?.to_vec();
        Ok(String::from_utf8(bytes)?)
    }

    pub fn write_string_seq(&mut self, v: &[String]) -> Result<()> {
        debug_assert!(v.len() <= i32::MAX as usize);
        self.write_size(v.len() as i32)?;
        for s in v {
            self.write_string(s)?;
        }
        Ok(())
    }

    /// Strings are variable-size, so the sequence guard runs per element:
    /// each string occupies at least its 1-byte size header.
    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let n = self.read_size()?;
        self.start_seq(n, 1)?;
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(self.read_string()?);
            self.end_element();
            self.check_seq()?;
        }
        self.end_seq();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Encapsulations
    // ------------------------------------------------------------------

    /// Open a nested, versioned, length-prefixed region: a placeholder
    /// 4-byte length (patched on close) followed by the version bytes.
    pub fn start_write_encaps(&mut self) -> Result<()> {
        self.write_encaps.push(WriteEncaps {
            start: self.buf.len(),
        });
        self.write_i32(0)?; // Length placeholder, patched in end_write_encaps.
        self.write_u8(ENCODING_MAJOR)?;
        self.write_u8(ENCODING_MINOR)
    }

    /// Close the current write encapsulation, patching its length field in
    /// place. The recorded size includes the 6-byte header itself.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching `start_write_encaps`.
    pub fn end_write_encaps(&mut self) {
        let frame = self
            .write_encaps
            .pop()
            .expect("end_write_encaps without matching start_write_encaps");
        let size = (self.buf.len() - frame.start) as i32;
        self.buf.patch4(frame.start, size.to_le_bytes());
    }

    /// Open a read encapsulation: validate its declared size against the
    /// buffer and its version bytes against what we speak.
    pub fn start_read_encaps(&mut self) -> Result<()> {
        let start = self.buf.pos();
        let size = self.read_i32()?;
        if size < 0 {
            return Err(MarshalError::NegativeSize { value: size });
        }
        if start + size as usize > self.buf.len() {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: start,
                requested: size as usize,
                available: self.buf.len() - start,
            });
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        if major != ENCODING_MAJOR || minor > ENCODING_MINOR {
            return Err(MarshalError::UnsupportedEncoding { major, minor });
        }
        self.read_encaps.push(ReadEncaps {
            start,
            size,
            encoding_major: major,
            encoding_minor: minor,
        });
        Ok(())
    }

    /// Close the current read encapsulation, seeking unconditionally to its
    /// declared end. Unread trailing bytes are forward-compatible data from
    /// a newer sender and are discarded here.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching `start_read_encaps`.
    pub fn end_read_encaps(&mut self) {
        let frame = self
            .read_encaps
            .pop()
            .expect("end_read_encaps without matching start_read_encaps");
        // Validated against the buffer length when the frame was opened.
        self.buf.seek(frame.start + frame.size as usize);
    }

    /// Declared size of the current read encapsulation, header included.
    ///
    /// # Panics
    ///
    /// Panics if no read encapsulation is open.
    pub fn read_encaps_size(&self) -> i32 {
        self.read_encaps
            .last()
            .expect("read_encaps_size with no open encapsulation")
            .size
    }

    /// Encoding version announced by the current read encapsulation.
    pub fn read_encaps_encoding(&self) -> Option<(u8, u8)> {
        self.read_encaps
            .last()
            .map(|e| (e.encoding_major, e.encoding_minor))
    }

    /// Jump past an encapsulation without interpreting it, returning its
    /// declared size. No frame state is entered or exited.
    pub fn skip_encaps(&mut self) -> Result<i32> {
        let start = self.buf.pos();
        let size = self.read_i32()?;
        if size < 0 {
            return Err(MarshalError::NegativeSize { value: size });
        }
        let end = start + size as usize;
        if end > self.buf.len() {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: start,
                requested: size as usize,
                available: self.buf.len() - start,
            });
        }
        self.buf.seek(end);
        Ok(size)
    }

    /// End offset of the innermost open read encapsulation, or the buffer
    /// length when none is open.
    pub(crate) fn read_limit(&self) -> usize {
        self.read_encaps
            .last()
            .map_or(self.buf.len(), |e| e.start + e.size as usize)
    }

    // ------------------------------------------------------------------
    // Slices
    // ------------------------------------------------------------------

    /// Open one type-hierarchy level's fields: a placeholder 4-byte length,
    /// patched on close, scoped inside the current encapsulation.
    pub fn start_write_slice(&mut self) -> Result<()> {
        self.write_i32(0)?; // Length placeholder, patched in end_write_slice.
        self.write_slices.push(self.buf.len());
        Ok(())
    }

    /// Close the current write slice. The recorded size counts its own
    /// 4-byte length field.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching `start_write_slice`.
    pub fn end_write_slice(&mut self) {
        let start = self
            .write_slices
            .pop()
            .expect("end_write_slice without matching start_write_slice");
        let size = (self.buf.len() - start + SLICE_HEADER_SIZE) as i32;
        self.buf.patch4(start - SLICE_HEADER_SIZE, size.to_le_bytes());
    }

    /// Open a read slice, validating its declared length.
    pub fn start_read_slice(&mut self) -> Result<()> {
        let end = self.checked_slice_end()?;
        self.read_slices.push(end);
        Ok(())
    }

    /// Close the current read slice, seeking to its declared end so fields
    /// this decoder did not understand are stepped over and the cursor lands
    /// exactly on the next sibling.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching `start_read_slice`.
    pub fn end_read_slice(&mut self) {
        let end = self
            .read_slices
            .pop()
            .expect("end_read_slice without matching start_read_slice");
        self.buf.seek(end);
    }

    /// Jump the cursor past one slice whose type this decoder cannot
    /// interpret.
    pub fn skip_slice(&mut self) -> Result<()> {
        let end = self.checked_slice_end()?;
        self.buf.seek(end);
        Ok(())
    }

    /// Read and validate a slice length, returning the slice's end offset.
    fn checked_slice_end(&mut self) -> Result<usize> {
        let start = self.buf.pos();
        let size = self.read_i32()?;
        if size < 0 {
            return Err(MarshalError::NegativeSize { value: size });
        }
        // A slice shorter than its own length field is corrupt.
        if (size as usize) < SLICE_HEADER_SIZE {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: start,
                requested: SLICE_HEADER_SIZE,
                available: size as usize,
            });
        }
        let end = start + size as usize;
        if end > self.buf.len() {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: start,
                requested: size as usize,
                available: self.buf.len() - start,
            });
        }
        Ok(end)
    }

    // ------------------------------------------------------------------
    // Sequence-size guard
    // ------------------------------------------------------------------

    /// Open a sequence of `num_elements` elements, each occupying at least
    /// `min_size` wire bytes, and immediately reject the declared count if
    /// the whole stack of open sequences cannot fit in the remaining buffer.
    /// O(depth), before any per-element work or allocation.
    pub fn start_seq(&mut self, num_elements: i32, min_size: i32) -> Result<()> {
        debug_assert!(num_elements >= 0);
        debug_assert!(min_size > 0);
        self.seq_data.push(SeqData {
            num_elements,
            min_size,
        });
        if let Err(err) = self.check_seq() {
            // The rejected frame must not linger: a failed open has no
            // matching close.
            self.seq_data.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Re-validate every open sequence against the bytes currently left,
    /// catching sequences truncated mid-stream rather than at the header.
    pub fn check_seq(&self) -> Result<()> {
        self.check_seq_within(self.buf.remaining())
    }

    /// Validate a fixed-width element run about to be consumed in one gulp,
    /// accounting for any enclosing open sequences.
    pub fn check_fixed_seq(&self, num_elements: i32, elem_size: i32) -> Result<()> {
        debug_assert!(num_elements >= 0);
        debug_assert!(elem_size > 0);
        let needed = num_elements as u64 * elem_size as u64;
        let remaining = self.buf.remaining() as u64;
        if needed > remaining {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: self.buf.pos(),
                requested: needed as usize,
                available: remaining as usize,
            });
        }
        self.check_seq_within((remaining - needed) as usize)
    }

    fn check_seq_within(&self, bytes_left: usize) -> Result<()> {
        // u64 arithmetic: a hostile count times a width must not wrap.
        let required: u64 = self
            .seq_data
            .iter()
            .map(|sd| sd.num_elements as u64 * sd.min_size as u64)
            .sum();
        if required > bytes_left as u64 {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: self.buf.pos(),
                requested: required as usize,
                available: bytes_left,
            });
        }
        Ok(())
    }

    /// Mark one element of the innermost open sequence as consumed.
    ///
    /// # Panics
    ///
    /// Panics if no sequence is open.
    pub fn end_element(&mut self) {
        let sd = self
            .seq_data
            .last_mut()
            .expect("end_element outside an open sequence");
        sd.num_elements -= 1;
    }

    /// Close the innermost open sequence.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching `start_seq`.
    pub fn end_seq(&mut self) {
        self.seq_data
            .pop()
            .expect("end_seq without matching start_seq");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ENCAPS_HEADER_SIZE;

    fn instance() -> Instance {
        Instance::default()
    }

    #[test]
    fn primitive_roundtrip_boundaries() {
        let inst = instance();
        let mut s = Stream::new(&inst);

        s.write_u8(0).unwrap();
        s.write_u8(u8::MAX).unwrap();
        s.write_bool(true).unwrap();
        s.write_bool(false).unwrap();
        s.write_i16(i16::MIN).unwrap();
        s.write_i16(i16::MAX).unwrap();
        s.write_i32(0).unwrap();
        s.write_i32(-1).unwrap();
        s.write_i32(i32::MIN).unwrap();
        s.write_i32(i32::MAX).unwrap();
        s.write_i64(i64::MIN).unwrap();
        s.write_i64(i64::MAX).unwrap();
        s.write_f32(0.0).unwrap();
        s.write_f32(-0.0).unwrap();
        s.write_f64(f64::MAX).unwrap();
        s.write_f64(f64::NAN).unwrap();

        assert_eq!(s.read_u8().unwrap(), 0);
        assert_eq!(s.read_u8().unwrap(), u8::MAX);
        assert!(s.read_bool().unwrap());
        assert!(!s.read_bool().unwrap());
        assert_eq!(s.read_i16().unwrap(), i16::MIN);
        assert_eq!(s.read_i16().unwrap(), i16::MAX);
        assert_eq!(s.read_i32().unwrap(), 0);
        assert_eq!(s.read_i32().unwrap(), -1);
        assert_eq!(s.read_i32().unwrap(), i32::MIN);
        assert_eq!(s.read_i32().unwrap(), i32::MAX);
        assert_eq!(s.read_i64().unwrap(), i64::MIN);
        assert_eq!(s.read_i64().unwrap(), i64::MAX);
        assert_eq!(s.read_f32().unwrap(), 0.0);
        let neg_zero = s.read_f32().unwrap();
        assert_eq!(neg_zero, 0.0);
        assert!(neg_zero.is_sign_negative());
        assert_eq!(s.read_f64().unwrap(), f64::MAX);
        assert!(s.read_f64().unwrap().is_nan());
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn canonical_wire_order_is_little_endian() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_i32(0x0102_0304).unwrap();
        assert_eq!(s.as_slice(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn size_encoding_boundaries() {
        let inst = instance();
        for v in [0, 1, 254] {
            let mut s = Stream::new(&inst);
            s.write_size(v).unwrap();
            assert_eq!(s.len(), 1, "size {v} should be compact");
            assert_eq!(s.read_size().unwrap(), v);
        }
        for v in [255, 100_000] {
            let mut s = Stream::new(&inst);
            s.write_size(v).unwrap();
            assert_eq!(s.len(), 5, "size {v} should be marker + i32");
            assert_eq!(s.as_slice()[0], SIZE_MARKER);
            assert_eq!(s.read_size().unwrap(), v);
        }
    }

    #[test]
    fn negative_five_byte_size_rejected() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_u8(SIZE_MARKER).unwrap();
        s.write_i32(-7).unwrap();
        let err = s.read_size().unwrap_err();
        assert!(matches!(err, MarshalError::NegativeSize { value: -7 }));
    }

    #[test]
    fn string_roundtrip() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_string("").unwrap();
        s.write_string("hello").unwrap();
        s.write_string("héllo wörld ☃").unwrap();
        assert_eq!(s.read_string().unwrap(), "");
        assert_eq!(s.read_string().unwrap(), "hello");
        assert_eq!(s.read_string().unwrap(), "héllo wörld ☃");
    }

    #[test]
    fn string_with_invalid_utf8_rejected() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_size(2).unwrap();
        s.write_blob(&[0xC3, 0x28]).unwrap();
        let err = s.read_string().unwrap_err();
        assert!(matches!(err, MarshalError::InvalidString(_)));
    }

    #[test]
    fn string_length_overrunning_buffer_rejected() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_size(10).unwrap();
        s.write_blob(b"abc").unwrap();
        let err = s.read_string().unwrap_err();
        assert!(matches!(err, MarshalError::UnmarshalOutOfBounds { .. }));
    }

    #[test]
    fn fixed_seq_roundtrip() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        let ints = vec![i32::MIN, -1, 0, 1, i32::MAX];
        let longs = vec![i64::MIN, i64::MAX];
        s.write_i32_seq(&ints).unwrap();
        s.write_i64_seq(&longs).unwrap();
        s.write_u8_seq(&[1, 2, 3]).unwrap();
        s.write_bool_seq(&[true, false, true]).unwrap();
        assert_eq!(s.read_i32_seq().unwrap(), ints);
        assert_eq!(s.read_i64_seq().unwrap(), longs);
        assert_eq!(s.read_u8_seq().unwrap(), vec![1, 2, 3]);
        assert_eq!(s.read_bool_seq().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn string_seq_roundtrip() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        let strings = vec!["a".to_string(), String::new(), "longer entry".to_string()];
        s.write_string_seq(&strings).unwrap();
        assert_eq!(s.read_string_seq().unwrap(), strings);
    }

    #[test]
    fn adversarial_sequence_header_rejected_before_allocation() {
        // Declared count of 10,000,000 elements of at least 4 bytes each,
        // with only 16 bytes actually in the buffer.
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_blob(&[0u8; 16]).unwrap();
        let err = s.start_seq(10_000_000, 4).unwrap_err();
        assert!(matches!(err, MarshalError::UnmarshalOutOfBounds { .. }));
    }

    #[test]
    fn check_fixed_seq_detects_truncation() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_size(4).unwrap();
        s.write_i32(1).unwrap(); // Only one of the four declared elements.
        let n = s.read_size().unwrap();
        let err = s.check_fixed_seq(n, 4).unwrap_err();
        assert!(matches!(err, MarshalError::UnmarshalOutOfBounds { .. }));
    }

    #[test]
    fn nested_sequence_accounting() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_blob(&[0u8; 8]).unwrap();
        // Outer sequence of 4 one-byte elements fits; an inner claim of 8
        // more must fail because the outer still reserves its elements.
        s.start_seq(4, 1).unwrap();
        let err = s.start_seq(8, 1).unwrap_err();
        assert!(matches!(err, MarshalError::UnmarshalOutOfBounds { .. }));
        // After consuming outer elements the same inner claim shrinks.
        s.end_element();
        s.end_element();
        s.end_element();
        s.end_element();
        s.start_seq(8, 1).unwrap();
        s.end_seq();
        s.end_seq();
    }

    #[test]
    fn encaps_roundtrip_nested() {
        let inst = instance();
        let mut s = Stream::new(&inst);

        s.start_write_encaps().unwrap();
        s.write_i32(1).unwrap();
        s.start_write_encaps().unwrap();
        s.write_string("middle").unwrap();
        s.start_write_encaps().unwrap();
        s.write_i16(-3).unwrap();
        s.end_write_encaps();
        s.end_write_encaps();
        s.write_i32(2).unwrap();
        s.end_write_encaps();

        s.start_read_encaps().unwrap();
        assert_eq!(s.read_encaps_encoding(), Some((ENCODING_MAJOR, ENCODING_MINOR)));
        assert_eq!(s.read_i32().unwrap(), 1);
        s.start_read_encaps().unwrap();
        assert_eq!(s.read_string().unwrap(), "middle");
        s.start_read_encaps().unwrap();
        assert_eq!(s.read_i16().unwrap(), -3);
        s.end_read_encaps();
        s.end_read_encaps();
        assert_eq!(s.read_i32().unwrap(), 2);
        s.end_read_encaps();
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn end_read_encaps_skips_unread_trailing_fields() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.start_write_encaps().unwrap();
        s.write_i32(42).unwrap();
        s.write_string("a field this reader does not know about").unwrap();
        s.end_write_encaps();
        s.write_i32(7).unwrap();

        s.start_read_encaps().unwrap();
        assert_eq!(s.read_i32().unwrap(), 42);
        // Reader stops early; the close must land on the next sibling.
        s.end_read_encaps();
        assert_eq!(s.read_i32().unwrap(), 7);
    }

    #[test]
    fn encaps_declared_size_matches_wire() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.start_write_encaps().unwrap();
        s.write_i32(0xAB).unwrap();
        s.end_write_encaps();
        let expected = (ENCAPS_HEADER_SIZE + 4) as i32;

        s.start_read_encaps().unwrap();
        assert_eq!(s.read_encaps_size(), expected);
        s.end_read_encaps();
    }

    #[test]
    fn skip_encaps_returns_declared_size() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.start_write_encaps().unwrap();
        s.write_f64(1.5).unwrap();
        s.end_write_encaps();
        s.write_u8(9).unwrap();

        let size = s.skip_encaps().unwrap();
        assert_eq!(size, (ENCAPS_HEADER_SIZE + 8) as i32);
        assert_eq!(s.read_u8().unwrap(), 9);
    }

    #[test]
    fn encaps_negative_size_rejected() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_i32(-5).unwrap();
        s.write_u8(ENCODING_MAJOR).unwrap();
        s.write_u8(ENCODING_MINOR).unwrap();
        let err = s.start_read_encaps().unwrap_err();
        assert!(matches!(err, MarshalError::NegativeSize { value: -5 }));
    }

    #[test]
    fn encaps_overrunning_buffer_rejected() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.write_i32(100).unwrap(); // Claims 100 bytes; only 6 exist.
        s.write_u8(ENCODING_MAJOR).unwrap();
        s.write_u8(ENCODING_MINOR).unwrap();
        let err = s.start_read_encaps().unwrap_err();
        assert!(matches!(err, MarshalError::UnmarshalOutOfBounds { .. }));
    }

    #[test]
    fn encaps_version_mismatch_rejected() {
        let inst = instance();

        // Wrong major.
        let mut s = Stream::new(&inst);
        s.write_i32(ENCAPS_HEADER_SIZE as i32).unwrap();
        s.write_u8(ENCODING_MAJOR + 1).unwrap();
        s.write_u8(ENCODING_MINOR).unwrap();
        let err = s.start_read_encaps().unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedEncoding { .. }));

        // Minor higher than we understand.
        let mut s = Stream::new(&inst);
        s.write_i32(ENCAPS_HEADER_SIZE as i32).unwrap();
        s.write_u8(ENCODING_MAJOR).unwrap();
        s.write_u8(ENCODING_MINOR + 1).unwrap();
        let err = s.start_read_encaps().unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedEncoding { .. }));
    }

    #[test]
    fn slice_skipping_lands_on_next_sibling() {
        let inst = instance();
        let mut s = Stream::new(&inst);

        // Derived slice (unknown to the reader) then base slice.
        s.start_write_slice().unwrap();
        s.write_i64(0xDEAD).unwrap();
        s.write_string("derived-only field").unwrap();
        s.end_write_slice();
        s.start_write_slice().unwrap();
        s.write_i32(11).unwrap();
        s.end_write_slice();
        s.write_u8(0x7E).unwrap();

        s.skip_slice().unwrap();
        s.start_read_slice().unwrap();
        assert_eq!(s.read_i32().unwrap(), 11);
        s.end_read_slice();
        assert_eq!(s.read_u8().unwrap(), 0x7E);
    }

    #[test]
    fn partially_read_slice_ends_at_declared_boundary() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.start_write_slice().unwrap();
        s.write_i32(1).unwrap();
        s.write_i32(2).unwrap(); // Field this reader does not consume.
        s.end_write_slice();
        s.write_i32(3).unwrap();

        s.start_read_slice().unwrap();
        assert_eq!(s.read_i32().unwrap(), 1);
        s.end_read_slice();
        assert_eq!(s.read_i32().unwrap(), 3);
    }

    #[test]
    fn corrupt_slice_lengths_rejected() {
        let inst = instance();

        let mut s = Stream::new(&inst);
        s.write_i32(-1).unwrap();
        assert!(matches!(
            s.skip_slice().unwrap_err(),
            MarshalError::NegativeSize { value: -1 }
        ));

        // A slice shorter than its own length field.
        let mut s = Stream::new(&inst);
        s.write_i32(2).unwrap();
        assert!(matches!(
            s.skip_slice().unwrap_err(),
            MarshalError::UnmarshalOutOfBounds { .. }
        ));

        // A slice extending past the buffer.
        let mut s = Stream::new(&inst);
        s.write_i32(64).unwrap();
        assert!(matches!(
            s.skip_slice().unwrap_err(),
            MarshalError::UnmarshalOutOfBounds { .. }
        ));
    }

    #[test]
    fn message_size_cap_enforced_on_write() {
        let inst = Instance::new(8);
        let mut s = Stream::new(&inst);
        s.write_i64(1).unwrap(); // Exactly at the cap.
        let err = s.write_u8(0).unwrap_err();
        assert!(matches!(
            err,
            MarshalError::MemoryLimitExceeded { requested: 9, max: 8 }
        ));
    }

    #[test]
    fn with_data_respects_message_size_cap() {
        let inst = Instance::new(4);
        assert!(Stream::with_data(&inst, &[0; 4]).is_ok());
        assert!(matches!(
            Stream::with_data(&inst, &[0; 5]).unwrap_err(),
            MarshalError::MemoryLimitExceeded { .. }
        ));
    }

    #[test]
    fn reset_clears_state_and_reuses_buffer() {
        let inst = instance();
        let mut s = Stream::new(&inst);
        s.start_write_encaps().unwrap();
        s.write_i32(1).unwrap();
        s.reset();
        assert!(s.is_empty());
        assert_eq!(s.pos(), 0);
        s.write_u8(5).unwrap();
        assert_eq!(s.as_slice(), &[5]);
    }

    #[test]
    fn swap_exchanges_stream_state() {
        let inst = instance();
        let mut a = Stream::new(&inst);
        let mut b = Stream::new(&inst);
        a.write_string("from a").unwrap();
        b.write_string("from b").unwrap();
        a.swap(&mut b);
        assert_eq!(a.read_string().unwrap(), "from b");
        assert_eq!(b.read_string().unwrap(), "from a");
    }
}
