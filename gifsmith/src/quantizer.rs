use std::collections::HashMap;

use rand_distr::{Distribution, Normal};

use gifsmith_core::models::{Image, Pixel};

use crate::writer::GIFWriterError;

/// One frame reduced to indexed color. The palette always holds exactly
/// `1 << bits_per_pixel` entries and every index stays below that bound.
pub struct QuantizedFrame {
    pub indices: Vec<u8>,
    pub bits_per_pixel: u8,
    pub transparent_color: Option<u8>,
    pub palette: Vec<Pixel>,
}

pub trait Quantizer {

    fn quantize(&self, image: &Image, max_bits_per_pixel: u8) -> Result<QuantizedFrame, GIFWriterError>;
}

/// Default quantizer: keeps the exact colors when they fit the budget,
/// otherwise clusters them down to it.
pub struct ClusterQuantizer {
    max_iterations: usize,
}

impl ClusterQuantizer {

    pub fn new() -> Self {
        ClusterQuantizer {
            max_iterations: 20,
        }
    }
}

impl Quantizer for ClusterQuantizer {

    fn quantize(&self, image: &Image, max_bits_per_pixel: u8) -> Result<QuantizedFrame, GIFWriterError> {
        let max_colors = 1usize << max_bits_per_pixel;
        let has_transparency = image.pixels.iter().any(|pixel| pixel.is_transparent());

        if let Some(frame) = exact_palette(image, max_colors, has_transparency) {
            return Ok(frame);
        }

        Ok(reduce_palette(image, max_colors, has_transparency, self.max_iterations))
    }
}

/// Builds the palette straight from the image when the distinct colors
/// (plus a slot for transparency) fit the budget.
fn exact_palette(image: &Image, max_colors: usize, has_transparency: bool) -> Option<QuantizedFrame> {
    let budget = if has_transparency {
        max_colors - 1
    } else {
        max_colors
    };

    let mut palette = Vec::new();
    let mut positions: HashMap<(u8, u8, u8), u8> = HashMap::new();

    for pixel in &image.pixels {
        if pixel.is_transparent() {
            continue;
        }

        let key = (pixel.red, pixel.green, pixel.blue);
        if !positions.contains_key(&key) {
            if palette.len() >= budget {
                return None;
            }

            positions.insert(key, palette.len() as u8);
            palette.push(Pixel::from_rgb(pixel.red, pixel.green, pixel.blue));
        }
    }

    let transparent_color = if has_transparency {
        let index = palette.len() as u8;
        palette.push(Pixel::black());
        Some(index)
    } else {
        None
    };

    let bits_per_pixel = bits_for_colors(palette.len());
    palette.resize(1 << bits_per_pixel, Pixel::black());

    let transparent_index = transparent_color.unwrap_or(0);
    let indices = image.pixels.iter()
        .map(|pixel| if pixel.is_transparent() {
            transparent_index
        } else {
            *positions.get(&(pixel.red, pixel.green, pixel.blue))
                .expect("every opaque color was registered in the first pass")
        })
        .collect();

    Some(QuantizedFrame {
        indices,
        bits_per_pixel,
        transparent_color,
        palette,
    })
}

fn reduce_palette(image: &Image, max_colors: usize, has_transparency: bool, max_iterations: usize) -> QuantizedFrame {
    let total_clusters = if has_transparency {
        max_colors - 1
    } else {
        max_colors
    };

    info!("reducing {} pixels to {} colors", image.pixels.len(), total_clusters);

    let opaque: Vec<(u8, u8, u8)> = image.pixels.iter()
        .filter(|pixel| !pixel.is_transparent())
        .map(|pixel| (pixel.red, pixel.green, pixel.blue))
        .collect();
    let centers = cluster(&opaque, total_clusters, max_iterations);

    let mut palette: Vec<Pixel> = centers.iter()
        .map(|center| Pixel::from_rgb(center.0, center.1, center.2))
        .collect();

    let transparent_color = if has_transparency {
        let index = palette.len() as u8;
        palette.push(Pixel::black());
        Some(index)
    } else {
        None
    };

    let bits_per_pixel = bits_for_colors(palette.len());
    palette.resize(1 << bits_per_pixel, Pixel::black());

    let transparent_index = transparent_color.unwrap_or(0);
    let indices = image.pixels.iter()
        .map(|pixel| if pixel.is_transparent() {
            transparent_index
        } else {
            nearest_center(&centers, (pixel.red, pixel.green, pixel.blue)) as u8
        })
        .collect();

    QuantizedFrame {
        indices,
        bits_per_pixel,
        transparent_color,
        palette,
    }
}

// The smallest palette depth covering this many colors.
fn bits_for_colors(colors: usize) -> u8 {
    let mut bits = 1;
    while (1usize << bits) < colors {
        bits += 1;
    }

    bits
}

/// Plain k-means over the opaque pixels. Centers are seeded around the
/// per-channel mean, spread by the per-channel deviation.
fn cluster(pixels: &[(u8, u8, u8)], total_clusters: usize, max_iterations: usize) -> Vec<(u8, u8, u8)> {
    if pixels.is_empty() {
        return vec![(0, 0, 0); total_clusters];
    }

    let mean = channel_mean(pixels);
    let std = channel_std(pixels, mean);

    let normal = Normal::new(0.0, 1.0).expect("a unit normal distribution is always valid");
    let mut rng = rand::thread_rng();

    let mut centers: Vec<(u8, u8, u8)> = (0..total_clusters)
        .map(|_| clamp_channels((
            mean.0 + std.0 * normal.sample(&mut rng),
            mean.1 + std.1 * normal.sample(&mut rng),
            mean.2 + std.2 * normal.sample(&mut rng),
        )))
        .collect();

    for _ in 0..max_iterations {
        // sum of member channels plus member count, per cluster
        let mut sums = vec![(0u64, 0u64, 0u64, 0u64); total_clusters];

        for pixel in pixels {
            let closest = nearest_center(&centers, *pixel);
            let entry = &mut sums[closest];
            entry.0 += pixel.0 as u64;
            entry.1 += pixel.1 as u64;
            entry.2 += pixel.2 as u64;
            entry.3 += 1;
        }

        let mut moved = 0;
        for (center, entry) in centers.iter_mut().zip(&sums) {
            if entry.3 == 0 {
                continue;
            }

            let updated = (
                (entry.0 / entry.3) as u8,
                (entry.1 / entry.3) as u8,
                (entry.2 / entry.3) as u8,
            );
            moved += distance(*center, updated);
            *center = updated;
        }

        if moved == 0 {
            break;
        }
    }

    centers
}

fn nearest_center(centers: &[(u8, u8, u8)], pixel: (u8, u8, u8)) -> usize {
    let mut closest = 0;
    let mut closest_distance = i32::MAX;

    for (index, center) in centers.iter().enumerate() {
        let distance = distance(pixel, *center);
        if distance < closest_distance {
            closest_distance = distance;
            closest = index;
        }
    }

    closest
}

// weighted RGB distance, see https://en.wikipedia.org/wiki/Color_difference
fn distance(a: (u8, u8, u8), b: (u8, u8, u8)) -> i32 {
    let drp2 = (a.0 as i32 - b.0 as i32).pow(2);
    let dgp2 = (a.1 as i32 - b.1 as i32).pow(2);
    let dbp2 = (a.2 as i32 - b.2 as i32).pow(2);

    let t = (a.0 as i32 + b.0 as i32) / 2;

    2 * drp2 + 4 * dgp2 + 3 * dbp2 + t * (drp2 - dbp2) / 256
}

fn channel_mean(pixels: &[(u8, u8, u8)]) -> (f64, f64, f64) {
    let mut sum = (0.0, 0.0, 0.0);

    for pixel in pixels {
        sum.0 += pixel.0 as f64;
        sum.1 += pixel.1 as f64;
        sum.2 += pixel.2 as f64;
    }

    let count = pixels.len() as f64;
    (sum.0 / count, sum.1 / count, sum.2 / count)
}

fn channel_std(pixels: &[(u8, u8, u8)], mean: (f64, f64, f64)) -> (f64, f64, f64) {
    let mut sum = (0.0, 0.0, 0.0);

    for pixel in pixels {
        sum.0 += (pixel.0 as f64 - mean.0).powi(2);
        sum.1 += (pixel.1 as f64 - mean.1).powi(2);
        sum.2 += (pixel.2 as f64 - mean.2).powi(2);
    }

    let count = pixels.len() as f64;
    ((sum.0 / count).sqrt(), (sum.1 / count).sqrt(), (sum.2 / count).sqrt())
}

fn clamp_channels(channels: (f64, f64, f64)) -> (u8, u8, u8) {
    (
        channels.0.max(0.0).min(255.0) as u8,
        channels.1.max(0.0).min(255.0) as u8,
        channels.2.max(0.0).min(255.0) as u8,
    )
}
