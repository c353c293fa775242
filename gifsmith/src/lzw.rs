use std::io::Write;

use crate::writer::GIFWriterError;

// Low-order bit masks indexed by the number of bits to keep.
const MASK: [u16; 9] = [0x00, 0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

// GIF codes are at most 12 bits wide, so the dictionary never holds
// more than 4097 entries.
const MAX_CODES: usize = 4097;
const MAX_CODE_LEN: u8 = 12;

/// Packs variable-width codes LSB-first into a byte buffer and emits the
/// buffer as length-prefixed sub-blocks of at most 255 bytes.
pub struct BitPacker<'a, W: Write> {
    sink: &'a mut W,
    buf: [u8; 256],
    buf_index: usize,
    empty_bits: u8, // unfilled bits in buf[buf_index]
}

impl<'a, W: Write> BitPacker<'a, W> {

    pub fn new(sink: &'a mut W) -> Self {
        BitPacker {
            sink,
            buf: [0; 256],
            buf_index: 0,
            empty_bits: 8,
        }
    }

    /// Appends the `code_len` low-order bits of `code` to the buffer,
    /// carrying bits that do not fit the current byte into the next ones.
    pub fn send_code(&mut self, code: u16, code_len: u8) -> Result<(), GIFWriterError> {
        self.buf[self.buf_index] |= ((code & MASK[self.empty_bits as usize]) << (8 - self.empty_bits)) as u8;

        let mut code = code >> self.empty_bits;
        let mut remaining = code_len as i8 - self.empty_bits as i8;

        while remaining > 0 {
            self.buf_index += 1;
            if self.buf_index >= 0xff {
                self.flush(0xff)?;
            }

            self.buf[self.buf_index] |= (code & 0xff) as u8;
            code >>= 8;
            remaining -= 8;
        }

        self.empty_bits = (-remaining) as u8;

        Ok(())
    }

    /// Emits whatever is buffered as the final sub-block of a frame.
    pub fn flush_partial(&mut self) -> Result<(), GIFWriterError> {
        let len = self.buf_index + 1;
        self.flush(len)
    }

    fn flush(&mut self, len: usize) -> Result<(), GIFWriterError> {
        self.sink.write_all(&[len as u8]).map_err(|err| GIFWriterError::IOError {
            description: format!("failed to write sub-block length: {}", err),
        })?;
        self.sink.write_all(&self.buf[..len]).map_err(|err| GIFWriterError::IOError {
            description: format!("failed to write sub-block data: {}", err),
        })?;

        self.buf_index = 0;
        self.buf = [0; 256];

        Ok(())
    }
}

/// Tree-search LZW encoder.
///
/// A child is made up of a parent (or prefix) code plus a suffix color,
/// and siblings are strings with a common parent and different suffix
/// colors. The three parallel arrays are indexed by code.
pub struct Encoder {
    child: [u16; MAX_CODES],
    siblings: [u16; MAX_CODES],
    suffix: [u16; MAX_CODES],
    clear_code: u16,
    end_of_image: u16,
    code_len: u8,
    code_index: u16,
    bits_per_pixel: u8,
}

impl Encoder {

    pub fn new(bits_per_pixel: u8) -> Self {
        let clear_code = 1 << bits_per_pixel;

        Encoder {
            child: [0; MAX_CODES],
            siblings: [0; MAX_CODES],
            suffix: [0; MAX_CODES],
            clear_code,
            end_of_image: clear_code + 1,
            code_len: bits_per_pixel + 1,
            code_index: clear_code + 2,
            bits_per_pixel,
        }
    }

    /// Encodes a buffer of palette indices as a variable-width code stream,
    /// terminated by the end-of-information code, and flushes the packer.
    pub fn encode<W: Write>(&mut self, indices: &[u8], packer: &mut BitPacker<W>) -> Result<(), GIFWriterError> {
        let mut parent = match indices.first() {
            Some(first) => *first as u16,
            None => return Err(GIFWriterError::InvalidInput {
                description: "cannot encode an empty index buffer".to_string(),
            }),
        };

        // tell the decoder to start from a fresh string table
        packer.send_code(self.clear_code, self.code_len)?;

        for &index in &indices[1..] {
            let color = index as u16;
            let son = self.child[parent as usize];

            if son > 0 {
                if self.suffix[son as usize] == color {
                    parent = son;
                    continue;
                }

                let mut brother = son;
                loop {
                    if self.siblings[brother as usize] > 0 {
                        brother = self.siblings[brother as usize];
                        if self.suffix[brother as usize] == color {
                            parent = brother;
                            break;
                        }
                    } else {
                        self.siblings[brother as usize] = self.code_index;
                        parent = self.append_code(parent, color, packer)?;
                        break;
                    }
                }
            } else {
                self.child[parent as usize] = self.code_index;
                parent = self.append_code(parent, color, packer)?;
            }
        }

        // the last prefix has no continuation, send it as-is
        packer.send_code(parent, self.code_len)?;
        packer.send_code(self.end_of_image, self.code_len)?;
        packer.flush_partial()
    }

    /// Registers `color` as the suffix of the next free code, emits the
    /// current prefix and widens the code (or clears the whole table once
    /// 12-bit codes run out). Returns the new prefix.
    fn append_code<W: Write>(&mut self, parent: u16, color: u16, packer: &mut BitPacker<W>) -> Result<u16, GIFWriterError> {
        if self.code_index as usize >= MAX_CODES {
            return Err(GIFWriterError::EncodingOverflow {
                description: format!("code index {} left the dictionary without a reset", self.code_index),
            });
        }

        self.suffix[self.code_index as usize] = color;
        packer.send_code(parent, self.code_len)?;
        self.code_index += 1;

        if self.code_index > (1 << self.code_len) {
            if self.code_len == MAX_CODE_LEN {
                packer.send_code(self.clear_code, self.code_len)?;
                self.reset();
            } else {
                self.code_len += 1;
            }
        }

        Ok(color)
    }

    fn reset(&mut self) {
        self.child = [0; MAX_CODES];
        self.siblings = [0; MAX_CODES];
        self.suffix = [0; MAX_CODES];
        self.code_len = self.bits_per_pixel + 1;
        self.code_index = self.end_of_image + 1;
    }
}
