//! Test-only GIF parser: walks the container blocks and decodes image data
//! with a conformant LZW decoder, so writer tests can check what a real
//! decoder would see.

use bit_vec::BitVec;
use byteorder::{ByteOrder, LittleEndian};

pub struct DecodedFrameData {
    pub indices: Vec<u8>,
    pub min_code_size: u8,
    pub clear_codes_seen: usize,
    pub bytes_consumed: usize,
}

pub struct ParsedFrame {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
    pub delay_centis: u16,
    pub transparent_color: Option<u8>,
    pub local_palette: Option<Vec<(u8, u8, u8)>>,
    pub data: DecodedFrameData,
}

pub struct ParsedGif {
    pub signature: Vec<u8>,
    pub screen_width: u16,
    pub screen_height: u16,
    pub bits_per_pixel: u8,
    pub background_color: u8,
    pub global_palette: Vec<(u8, u8, u8)>,
    pub loop_count: Option<u16>,
    pub frames: Vec<ParsedFrame>,
}

pub fn parse_gif(data: &[u8]) -> ParsedGif {
    let signature = data[0..6].to_vec();
    assert!(signature == b"GIF89a" || signature == b"GIF87a", "unexpected signature: {:x?}", signature);

    let screen_width = LittleEndian::read_u16(&data[6..8]);
    let screen_height = LittleEndian::read_u16(&data[8..10]);

    let packed = data[10];
    assert_eq!(packed & 0b10000000, 0b10000000, "expected a global color table");
    let bits_per_pixel = (packed & 0b111) + 1;

    let background_color = data[11];

    let mut pos = 13;
    let global_palette = read_palette(data, &mut pos, bits_per_pixel);

    let mut loop_count = None;
    let mut frames = Vec::new();
    let mut pending_control: Option<(u16, Option<u8>)> = None;

    loop {
        match data[pos] {
            0x21 => match data[pos + 1] {
                0xff => {
                    assert_eq!(data[pos + 2], 0x0b);
                    assert_eq!(&data[pos + 3..pos + 14], b"NETSCAPE2.0");
                    assert_eq!(data[pos + 14], 0x03);
                    assert_eq!(data[pos + 15], 0x01);
                    assert_eq!(data[pos + 18], 0x00);
                    loop_count = Some(LittleEndian::read_u16(&data[pos + 16..pos + 18]));
                    pos += 19;
                },
                0xf9 => {
                    assert_eq!(data[pos + 2], 0x04);
                    let flags = data[pos + 3];
                    let delay = LittleEndian::read_u16(&data[pos + 4..pos + 6]);
                    let transparent = if flags & 0b1 == 1 {
                        Some(data[pos + 6])
                    } else {
                        None
                    };
                    assert_eq!(data[pos + 7], 0x00);
                    pending_control = Some((delay, transparent));
                    pos += 8;
                },
                label => panic!("unexpected extension label {:#x} at {}", label, pos),
            },
            0x2c => {
                let left = LittleEndian::read_u16(&data[pos + 1..pos + 3]);
                let top = LittleEndian::read_u16(&data[pos + 3..pos + 5]);
                let width = LittleEndian::read_u16(&data[pos + 5..pos + 7]);
                let height = LittleEndian::read_u16(&data[pos + 7..pos + 9]);
                let packed = data[pos + 9];
                pos += 10;

                let local_palette = if packed & 0b10000000 != 0 {
                    let bits = (packed & 0b111) + 1;
                    Some(read_palette(data, &mut pos, bits))
                } else {
                    None
                };

                let frame_data = decode_frame_data(&data[pos..]);
                pos += frame_data.bytes_consumed;

                let (delay_centis, transparent_color) = pending_control.take()
                    .expect("an image descriptor must follow a graphic control block");

                frames.push(ParsedFrame {
                    left,
                    top,
                    width,
                    height,
                    delay_centis,
                    transparent_color,
                    local_palette,
                    data: frame_data,
                });
            },
            0x3b => {
                assert_eq!(pos, data.len() - 1, "the trailer must be the last byte of the stream");
                break;
            },
            introducer => panic!("unexpected block introducer {:#x} at {}", introducer, pos),
        }
    }

    ParsedGif {
        signature,
        screen_width,
        screen_height,
        bits_per_pixel,
        background_color,
        global_palette,
        loop_count,
        frames,
    }
}

fn read_palette(data: &[u8], pos: &mut usize, bits: u8) -> Vec<(u8, u8, u8)> {
    let mut colors = Vec::new();

    for _ in 0..1usize << bits {
        colors.push((data[*pos], data[*pos + 1], data[*pos + 2]));
        *pos += 3;
    }

    colors
}

/// Decodes one frame's image data section, starting at the minimum code
/// size byte and ending after the zero length terminator.
pub fn decode_frame_data(data: &[u8]) -> DecodedFrameData {
    let min_code_size = data[0];
    let mut rest = &data[1..];
    let mut compressed = Vec::new();
    let mut bytes_consumed = 1;

    loop {
        let len = rest[0] as usize;
        bytes_consumed += 1;
        if len == 0 {
            break;
        }

        compressed.extend_from_slice(&rest[1..len + 1]);
        rest = &rest[len + 1..];
        bytes_consumed += len;
    }

    let bits = bits_for_bytes(&compressed);
    let roots = 1usize << min_code_size;

    let mut dictionary: Vec<Vec<u8>> = Vec::new();
    let (mut clear_index, mut end_index) = init_dictionary(&mut dictionary, roots);

    let mut code_size = min_code_size + 1;
    let mut offset = 0;
    let mut prev_code: Option<usize> = None;
    let mut indices = Vec::new();
    let mut clear_codes_seen = 0;

    while offset + (code_size as usize) <= bits.len() {
        let code = read_bits(&bits, offset, code_size) as usize;
        offset += code_size as usize;

        if code == clear_index {
            clear_codes_seen += 1;
            let (clear, end) = init_dictionary(&mut dictionary, roots);
            clear_index = clear;
            end_index = end;
            code_size = min_code_size + 1;
            prev_code = None;
            continue;
        }
        if code == end_index {
            break;
        }

        if code < dictionary.len() {
            let value = dictionary[code].clone();
            indices.extend_from_slice(&value);

            if let Some(prev) = prev_code {
                let mut entry = dictionary[prev].clone();
                entry.push(value[0]);
                dictionary.push(entry);
            }
        } else if code == dictionary.len() {
            // match to an entry that has just been encoded
            let prev = prev_code.expect("a not yet defined code must follow a previous one");
            let mut entry = dictionary[prev].clone();
            entry.push(entry[0]);
            dictionary.push(entry.clone());
            indices.extend_from_slice(&entry);
        } else {
            panic!("code {} is out of range for a dictionary of {}", code, dictionary.len());
        }

        prev_code = Some(code);

        // the code width only ever grows between clears, and never past 12
        if dictionary.len() == 1 << code_size && code_size < 12 {
            code_size += 1;
        }
        assert!(code_size <= 12, "code width outgrew 12 bits");
    }

    DecodedFrameData {
        indices,
        min_code_size,
        clear_codes_seen,
        bytes_consumed,
    }
}

fn init_dictionary(dictionary: &mut Vec<Vec<u8>>, roots: usize) -> (usize, usize) {
    dictionary.clear();

    for i in 0..roots {
        dictionary.push(vec![i as u8]);
    }

    let clear_index = dictionary.len();
    dictionary.push(Vec::new());

    let end_index = dictionary.len();
    dictionary.push(Vec::new());

    (clear_index, end_index)
}

fn read_bits(bits: &BitVec, offset: usize, total: u8) -> u16 {
    let mut result = 0;

    for i in 0..total as usize {
        result = result << 1;
        let bit = if bits[offset + (total as usize - 1 - i)] { 1 } else { 0 };
        result = result | bit;
    }

    result
}

fn bits_for_bytes(data: &[u8]) -> BitVec {
    BitVec::from_fn(data.len() * 8, |x| (data[x / 8] >> (x % 8)) & 0b1 == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_cursor_offsets() {
        let data: Vec<u8> = vec![
            0b10000000,
            0b00000001,
            0b00000111,
            0b00011100,
        ];

        let bits = bits_for_bytes(&data);

        let offset = 0;
        let code_size = 9;
        assert_eq!(read_bits(&bits, offset, code_size), 0b110_000_000);

        let offset = offset + code_size as usize;
        assert_eq!(read_bits(&bits, offset, code_size), 0b110_000_000);

        let offset = offset + code_size as usize;
        let code_size = code_size + 1;
        assert_eq!(read_bits(&bits, offset, code_size), 0b110_000_000_1);
    }
}
