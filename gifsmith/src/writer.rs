use std::cmp::max;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use custom_error::custom_error;

use gifsmith_core::models::{AnimationWriter, Image, ImageIOError, ImageWriter, ImageWriterOptions, Pixel};

use crate::lzw::{BitPacker, Encoder};
use crate::quantizer::{ClusterQuantizer, Quantizer};

pub const OPTION_MAX_COLORS: &str = "max_colors";
pub const OPTION_LOOP_COUNT: &str = "loop_count";
pub const OPTION_LEGACY_FORMAT: &str = "legacy_format";

const IMAGE_SEPARATOR: u8 = 0x2c; // ","
const EXTENSION_INTRODUCER: u8 = 0x21; // "!"
const GRAPHIC_CONTROL_LABEL: u8 = 0xf9;
const APPLICATION_EXTENSION_LABEL: u8 = 0xff;
const IMAGE_TRAILER: u8 = 0x3b; // ";"

custom_error! {pub GIFWriterError
    InvalidInput {description: String} = "Invalid input: {description}",
    EncodingOverflow {description: String} = "Encoding overflow: {description}",
    IOError {description: String} = "IO error: {description}",
}

pub struct GIFWriter {
    quantizer: Box<dyn Quantizer>,
}

impl GIFWriter {

    pub fn new() -> Self {
        GIFWriter {
            quantizer: Box::new(ClusterQuantizer::new()),
        }
    }

    pub fn with_quantizer(quantizer: Box<dyn Quantizer>) -> Self {
        GIFWriter {
            quantizer,
        }
    }

    /// Writes a single static GIF to the sink.
    pub fn write_image<W: Write>(&self, image: &Image, options: &ImageWriterOptions, sink: &mut W) -> Result<(), GIFWriterError> {
        let settings = WriterSettings::from_options(options)?;
        validate_frame(image)?;

        write_signature(sink, settings.legacy_format)?;

        let mut stream = FrameStream {
            sink: &mut *sink,
            logical_screen_width: image.width as u16,
            logical_screen_height: image.height as u16,
            animated: false,
            loop_count: 0,
            max_bits_per_pixel: settings.max_bits_per_pixel,
        };
        stream.write_frame(self.quantizer.as_ref(), image, 0, 0, 0, true)?;

        finish_stream(sink)
    }

    /// Writes a multi-frame, looping GIF to the sink. Frames are quantized
    /// and encoded one after another, each with its own palette.
    pub fn write_animation<W: Write>(&self, frames: &[Image], delays_ms: &[u32], options: &ImageWriterOptions, sink: &mut W) -> Result<(), GIFWriterError> {
        let settings = WriterSettings::from_options(options)?;

        if frames.is_empty() {
            return Err(GIFWriterError::InvalidInput {
                description: "an animation must contain at least one frame".to_string(),
            });
        }
        if frames.len() != delays_ms.len() {
            return Err(GIFWriterError::InvalidInput {
                description: format!("got {} frames but {} delays", frames.len(), delays_ms.len()),
            });
        }
        for frame in frames {
            validate_frame(frame)?;
        }

        info!("writing animated gif with {} frames", frames.len());

        let (screen_width, screen_height) = logical_screen_size(frames);

        write_signature(sink, settings.legacy_format)?;

        let mut stream = FrameStream {
            sink: &mut *sink,
            logical_screen_width: screen_width,
            logical_screen_height: screen_height,
            animated: true,
            loop_count: settings.loop_count,
            max_bits_per_pixel: settings.max_bits_per_pixel,
        };

        for (i, frame) in frames.iter().enumerate() {
            stream.write_frame(self.quantizer.as_ref(), frame, 0, 0, delays_ms[i], i == 0)?;
        }

        finish_stream(sink)
    }
}

impl ImageWriter for GIFWriter {

    fn write(&self, image: &Image, options: &ImageWriterOptions) -> Result<Vec<u8>, ImageIOError> {
        let mut data = Vec::new();
        self.write_image(image, options, &mut data).map_err(|err| ImageIOError::FailedToWrite {
            description: format!("failed to write gif: {}", err),
        })?;

        Ok(data)
    }
}

impl AnimationWriter for GIFWriter {

    fn write_animation(&self, frames: &[Image], delays_ms: &[u32], options: &ImageWriterOptions) -> Result<Vec<u8>, ImageIOError> {
        let mut data = Vec::new();
        GIFWriter::write_animation(self, frames, delays_ms, options, &mut data).map_err(|err| ImageIOError::FailedToWrite {
            description: format!("failed to write animated gif: {}", err),
        })?;

        Ok(data)
    }
}

struct WriterSettings {
    max_bits_per_pixel: u8,
    loop_count: u16,
    legacy_format: bool,
}

impl WriterSettings {

    fn from_options(options: &ImageWriterOptions) -> Result<Self, GIFWriterError> {
        let max_colors = options.get_u32(OPTION_MAX_COLORS, 256).map_err(invalid_options)?;
        if max_colors < 2 || max_colors > 256 {
            return Err(GIFWriterError::InvalidInput {
                description: format!("max_colors must be within [2, 256], got {}", max_colors),
            });
        }

        let loop_count = options.get_u32(OPTION_LOOP_COUNT, 0).map_err(invalid_options)?;
        if loop_count > u16::MAX as u32 {
            return Err(GIFWriterError::InvalidInput {
                description: format!("loop_count does not fit 16 bits: {}", loop_count),
            });
        }

        let legacy_format = options.get_bool(OPTION_LEGACY_FORMAT, false).map_err(invalid_options)?;

        Ok(WriterSettings {
            max_bits_per_pixel: max_bits_for_colors(max_colors),
            loop_count: loop_count as u16,
            legacy_format,
        })
    }
}

fn invalid_options(err: ImageIOError) -> GIFWriterError {
    GIFWriterError::InvalidInput {
        description: format!("{}", err),
    }
}

// The largest palette depth whose table still fits the color budget.
fn max_bits_for_colors(max_colors: u32) -> u8 {
    let mut bits = 1;
    while (1u32 << (bits + 1)) <= max_colors {
        bits += 1;
    }

    bits
}

fn validate_frame(image: &Image) -> Result<(), GIFWriterError> {
    if image.width == 0 || image.height == 0 {
        return Err(GIFWriterError::InvalidInput {
            description: format!("frame dimensions must be non-zero, got {}x{}", image.width, image.height),
        });
    }
    if image.width > u16::MAX as usize || image.height > u16::MAX as usize {
        return Err(GIFWriterError::InvalidInput {
            description: format!("frame does not fit a gif logical screen: {}x{}", image.width, image.height),
        });
    }
    if image.pixels.len() != image.width * image.height {
        return Err(GIFWriterError::InvalidInput {
            description: format!("pixel buffer holds {} pixels, expected {}x{}", image.pixels.len(), image.width, image.height),
        });
    }

    Ok(())
}

fn logical_screen_size(frames: &[Image]) -> (u16, u16) {
    let mut width = 0;
    let mut height = 0;

    for frame in frames {
        width = max(width, frame.width);
        height = max(height, frame.height);
    }

    (width as u16, height as u16)
}

fn finish_stream<W: Write>(sink: &mut W) -> Result<(), GIFWriterError> {
    sink.write_all(&[IMAGE_TRAILER]).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write trailer: {}", err),
    })?;
    sink.flush().map_err(|err| GIFWriterError::IOError {
        description: format!("failed to flush sink: {}", err),
    })
}

/// One output stream in progress. Frames are encoded strictly one after
/// another against fresh per-frame encoder state.
struct FrameStream<'a, W: Write> {
    sink: &'a mut W,
    logical_screen_width: u16,
    logical_screen_height: u16,
    animated: bool,
    loop_count: u16,
    max_bits_per_pixel: u8,
}

impl<'a, W: Write> FrameStream<'a, W> {

    fn write_frame(&mut self, quantizer: &dyn Quantizer, image: &Image, left: u16, top: u16, delay_ms: u32, first: bool) -> Result<(), GIFWriterError> {
        let frame = quantizer.quantize(image, self.max_bits_per_pixel)?;

        if frame.palette.len() != 1 << frame.bits_per_pixel {
            return Err(GIFWriterError::InvalidInput {
                description: format!(
                    "quantizer returned a palette of {} colors for {} bits per pixel",
                    frame.palette.len(), frame.bits_per_pixel
                ),
            });
        }

        debug!("frame quantized to {} colors, {} bits per pixel", frame.palette.len(), frame.bits_per_pixel);

        if first {
            write_logical_screen_descriptor(
                self.sink,
                self.logical_screen_width,
                self.logical_screen_height,
                frame.bits_per_pixel,
                frame.transparent_color.unwrap_or(0),
            )?;
            write_palette(self.sink, &frame.palette)?;

            if self.animated {
                write_netscape_application_block(self.sink, self.loop_count)?;
            }
        }

        write_graphic_control_block(self.sink, delay_ms, frame.transparent_color)?;

        if first {
            write_image_descriptor(self.sink, image.width as u16, image.height as u16, left, top, None)?;
        } else {
            write_image_descriptor(self.sink, image.width as u16, image.height as u16, left, top, Some(frame.bits_per_pixel - 1))?;
            write_palette(self.sink, &frame.palette)?;
        }

        write_image_data(self.sink, &frame.indices, frame.bits_per_pixel)?;

        // a zero length sub-block ends the frame's data stream
        self.sink.write_all(&[0x00]).map_err(|err| GIFWriterError::IOError {
            description: format!("failed to terminate image data: {}", err),
        })
    }
}

fn write_signature<W: Write>(sink: &mut W, legacy_format: bool) -> Result<(), GIFWriterError> {
    let signature: &[u8] = if legacy_format {
        b"GIF87a"
    } else {
        b"GIF89a"
    };

    sink.write_all(signature).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write signature: {}", err),
    })
}

fn write_logical_screen_descriptor<W: Write>(sink: &mut W, screen_width: u16, screen_height: u16, bits_per_pixel: u8, background_color: u8) -> Result<(), GIFWriterError> {
    let mut descriptor = vec![0u8; 7];

    LittleEndian::write_u16(&mut descriptor[0..2], screen_width);
    LittleEndian::write_u16(&mut descriptor[2..4], screen_height);

    // global color table present, sorted, color resolution 7,
    // table size encoded as bits per pixel - 1
    let mut packed: u8 = 0x88;
    packed |= 7 << 4;
    packed |= bits_per_pixel - 1;
    descriptor[4] = packed;

    descriptor[5] = background_color;
    descriptor[6] = 0x00; // aspect ratio unspecified

    sink.write_all(&descriptor).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write logical screen descriptor: {}", err),
    })
}

fn write_palette<W: Write>(sink: &mut W, palette: &[Pixel]) -> Result<(), GIFWriterError> {
    let mut colors = Vec::with_capacity(palette.len() * 3);

    for color in palette {
        colors.push(color.red);
        colors.push(color.green);
        colors.push(color.blue);
    }

    sink.write_all(&colors).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write color table: {}", err),
    })
}

fn write_netscape_application_block<W: Write>(sink: &mut W, loop_count: u16) -> Result<(), GIFWriterError> {
    let mut buf = vec![0u8; 19];

    buf[0] = EXTENSION_INTRODUCER;
    buf[1] = APPLICATION_EXTENSION_LABEL;
    buf[2] = 0x0b; // block size
    buf[3..14].copy_from_slice(b"NETSCAPE2.0");
    buf[14] = 0x03;
    buf[15] = 0x01;
    LittleEndian::write_u16(&mut buf[16..18], loop_count); // 0 means loop forever
    buf[18] = 0x00; // block terminator

    sink.write_all(&buf).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write netscape application block: {}", err),
    })
}

fn write_graphic_control_block<W: Write>(sink: &mut W, delay_ms: u32, transparent_color: Option<u8>) -> Result<(), GIFWriterError> {
    // delay is carried in centiseconds
    let delay = (delay_ms + 5) / 10;

    let mut buf = vec![0u8; 8];

    buf[0] = EXTENSION_INTRODUCER;
    buf[1] = GRAPHIC_CONTROL_LABEL;
    buf[2] = 0x04; // block size
    buf[3] = 0x00;
    LittleEndian::write_u16(&mut buf[4..6], delay as u16);
    // the index byte is ignored by decoders unless the transparency flag is set
    buf[6] = transparent_color.unwrap_or(0xff);
    buf[7] = 0x00; // block terminator

    if transparent_color.is_some() {
        buf[3] |= 0x01 | 0x10;
    }

    sink.write_all(&buf).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write graphic control block: {}", err),
    })
}

fn write_image_descriptor<W: Write>(sink: &mut W, width: u16, height: u16, left: u16, top: u16, local_color_table_size: Option<u8>) -> Result<(), GIFWriterError> {
    let mut descriptor = vec![0u8; 10];

    descriptor[0] = IMAGE_SEPARATOR;
    LittleEndian::write_u16(&mut descriptor[1..3], left);
    LittleEndian::write_u16(&mut descriptor[3..5], top);
    LittleEndian::write_u16(&mut descriptor[5..7], width);
    LittleEndian::write_u16(&mut descriptor[7..9], height);

    descriptor[9] = 0x20;
    if let Some(size) = local_color_table_size {
        descriptor[9] |= 0x80 | size;
    }

    sink.write_all(&descriptor).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write image descriptor: {}", err),
    })
}

fn write_image_data<W: Write>(sink: &mut W, indices: &[u8], bits_per_pixel: u8) -> Result<(), GIFWriterError> {
    // GIF has no 1 bit minimum code size
    let min_code_size = if bits_per_pixel == 1 {
        2
    } else {
        bits_per_pixel
    };

    sink.write_all(&[min_code_size]).map_err(|err| GIFWriterError::IOError {
        description: format!("failed to write minimum code size: {}", err),
    })?;

    let mut encoder = Encoder::new(min_code_size);
    let mut packer = BitPacker::new(sink);
    encoder.encode(indices, &mut packer)
}
