use crate::config::DiagnosticsConfig;
use image::GrayImage;
use imageproc::edges::canny;
use serde::Serialize;

/// Picture measurements for a single luminance frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameMetrics {
    /// Standard deviation of luminance
    pub contrast: f64,
    /// Variance of the Laplacian response
    pub sharpness: f64,
    /// Fraction of pixels marked as edges, 0..=1
    pub edge_density: f64,
    /// Fraction of complete tiles with almost no internal variation
    pub block_ratio: f64,
    /// Number of complete tiles the ratio was computed over
    pub blocks: usize,
}

impl FrameMetrics {
    pub fn compute(luma: &GrayImage, config: &DiagnosticsConfig) -> Self {
        let (blocks, flat) = count_flat_blocks(luma, config.block_size, config.block_std_threshold);
        let block_ratio = if blocks == 0 {
            0.0
        } else {
            flat as f64 / blocks as f64
        };

        Self {
            contrast: std_dev(luma.as_raw().iter().map(|&p| p as f64)),
            sharpness: laplacian_variance(luma),
            edge_density: edge_density(luma, config.canny_low, config.canny_high),
            block_ratio,
            blocks,
        }
    }

    /// Weighted quality score in [0, 1].
    ///
    /// Contrast and sharpness carry 0.3 each, edge density 0.2 and the
    /// artifact-free share of tiles 0.2. Frames too small for a single tile
    /// get no artifact credit.
    pub fn quality_score(&self) -> f64 {
        let contrast = (self.contrast / 50.0).min(1.0);
        let sharpness = (self.sharpness / 100.0).min(1.0);
        let edges = (self.edge_density / 0.1).min(1.0);

        let mut score = contrast * 0.3 + sharpness * 0.3 + edges * 0.2;
        if self.blocks > 0 {
            score += (1.0 - self.block_ratio) * 0.2;
        }

        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_pixelated(&self, config: &DiagnosticsConfig) -> bool {
        self.contrast < config.quality_threshold
            || self.edge_density < config.edge_density_threshold
            || self.sharpness < config.blur_threshold
            || self.block_ratio > config.block_ratio_threshold
    }
}

/// Difference between two consecutive frames of equal size
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameDelta {
    /// Sum of absolute per-pixel differences
    pub sum: f64,
    /// Standard deviation of the absolute difference image
    pub std: f64,
}

impl FrameDelta {
    /// `None` when the frames differ in size
    pub fn between(previous: &GrayImage, current: &GrayImage) -> Option<Self> {
        if previous.dimensions() != current.dimensions() {
            return None;
        }

        let diffs: Vec<f64> = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .map(|(&a, &b)| (a as i16 - b as i16).unsigned_abs() as f64)
            .collect();

        Some(Self {
            sum: diffs.iter().sum(),
            std: std_dev(diffs.iter().copied()),
        })
    }
}

fn std_dev<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let (count, total) = values
        .clone()
        .fold((0usize, 0.0), |(n, sum), v| (n + 1, sum + v));
    if count == 0 {
        return 0.0;
    }

    let mean = total / count as f64;
    let variance = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
    variance.sqrt()
}

/// Mirror an out-of-range index back into 0..len without repeating the edge
fn reflect(index: i64, len: i64) -> u32 {
    let reflected = if index < 0 {
        -index
    } else if index >= len {
        2 * len - index - 2
    } else {
        index
    };
    reflected.clamp(0, len - 1) as u32
}

/// Variance of the 4-neighbour Laplacian over the whole image
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (width, height) = luma.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let (w, h) = (width as i64, height as i64);
    let at = |x: i64, y: i64| luma.get_pixel(reflect(x, w), reflect(y, h))[0] as f64;

    let mut responses = Vec::with_capacity((width * height) as usize);
    for y in 0..h {
        for x in 0..w {
            let response =
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            responses.push(response);
        }
    }

    let std = std_dev(responses.iter().copied());
    std * std
}

fn edge_density(luma: &GrayImage, low: f32, high: f32) -> f64 {
    let (width, height) = luma.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let edges = canny(luma, low, high);
    let marked = edges.as_raw().iter().filter(|&&p| p > 0).count();
    marked as f64 / (width as f64 * height as f64)
}

/// Returns (complete tiles, tiles whose std is below `flat_std`)
fn count_flat_blocks(luma: &GrayImage, block_size: u32, flat_std: f64) -> (usize, usize) {
    let (width, height) = luma.dimensions();
    if block_size == 0 {
        return (0, 0);
    }

    let mut total = 0;
    let mut flat = 0;
    for by in 0..height / block_size {
        for bx in 0..width / block_size {
            let x0 = bx * block_size;
            let y0 = by * block_size;
            let pixels = (y0..y0 + block_size)
                .flat_map(|y| (x0..x0 + block_size).map(move |x| (x, y)))
                .map(|(x, y)| luma.get_pixel(x, y)[0] as f64);

            total += 1;
            if std_dev(pixels) < flat_std {
                flat += 1;
            }
        }
    }

    (total, flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stripes(width: u32, height: u32, period: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            if (x / period) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_black_frame_metrics() {
        let config = DiagnosticsConfig::default();
        let metrics = FrameMetrics::compute(&GrayImage::new(64, 48), &config);

        assert_eq!(metrics.contrast, 0.0);
        assert_eq!(metrics.sharpness, 0.0);
        assert_eq!(metrics.edge_density, 0.0);
        assert_eq!(metrics.block_ratio, 1.0);
        assert_eq!(metrics.blocks, 48);
        assert_eq!(metrics.quality_score(), 0.0);
        assert!(metrics.is_pixelated(&config));
    }

    #[test]
    fn test_striped_frame_scores_well() {
        let config = DiagnosticsConfig::default();
        let metrics = FrameMetrics::compute(&stripes(64, 64, 8), &config);

        assert!((metrics.contrast - 127.5).abs() < 1e-9);
        assert!(metrics.sharpness > 100.0);
        assert!(metrics.edge_density > 0.01);
        // every 8x8 tile sits inside one stripe
        assert_eq!(metrics.block_ratio, 1.0);
        assert!(metrics.quality_score() > 0.6);
        assert!(metrics.is_pixelated(&config));
    }

    #[test]
    fn test_checkerboard_has_no_flat_blocks() {
        let config = DiagnosticsConfig::default();
        let checker = GrayImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([20])
            } else {
                Luma([220])
            }
        });
        let metrics = FrameMetrics::compute(&checker, &config);

        assert_eq!(metrics.block_ratio, 0.0);
        assert!(metrics.quality_score() <= 1.0);
    }

    #[test]
    fn test_tiny_frame_is_finite() {
        let config = DiagnosticsConfig::default();
        for (w, h) in [(0, 0), (1, 1), (2, 5), (7, 7)] {
            let metrics = FrameMetrics::compute(&GrayImage::new(w, h), &config);
            let score = metrics.quality_score();
            assert!(score.is_finite());
            assert!((0.0..=1.0).contains(&score));
            assert_eq!(metrics.blocks, 0);
        }
    }

    #[test]
    fn test_score_weights() {
        let perfect = FrameMetrics {
            contrast: 80.0,
            sharpness: 500.0,
            edge_density: 0.5,
            block_ratio: 0.0,
            blocks: 4,
        };
        assert!((perfect.quality_score() - 1.0).abs() < 1e-9);

        let half = FrameMetrics {
            contrast: 25.0,
            sharpness: 50.0,
            edge_density: 0.05,
            block_ratio: 0.5,
            blocks: 4,
        };
        assert!((half.quality_score() - 0.5).abs() < 1e-9);

        let nan = FrameMetrics {
            contrast: f64::NAN,
            ..perfect
        };
        assert_eq!(nan.quality_score(), 0.0);
    }

    #[test]
    fn test_reflect_skips_edge_pixel() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(2, 5), 2);

        let flat = GrayImage::from_pixel(16, 16, Luma([90]));
        assert_eq!(laplacian_variance(&flat), 0.0);
    }

    #[test]
    fn test_frame_delta() {
        let a = GrayImage::from_pixel(4, 4, Luma([10]));
        let b = GrayImage::from_pixel(4, 4, Luma([13]));

        let delta = FrameDelta::between(&a, &b).unwrap();
        assert_eq!(delta.sum, 48.0);
        assert_eq!(delta.std, 0.0);

        let same = FrameDelta::between(&a, &a).unwrap();
        assert_eq!(same.sum, 0.0);

        assert!(FrameDelta::between(&a, &GrayImage::new(2, 2)).is_none());
    }
}
