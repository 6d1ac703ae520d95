//! License plate recognition over whole frames and detection regions.

use std::collections::VecDeque;

use anyhow::Result;
use clap::ValueEnum;
use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use ml_core::{BoundingBox, TextCandidate, TextRecognizer};
use tracing::debug;

pub type PlateCandidate = TextCandidate;

const ADAPTIVE_BLOCK_SIZE: u32 = 11;
const ADAPTIVE_OFFSET: i16 = 2;

/// How plates are attached to occupied detections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PlateStrategy {
    /// Pop whole-frame results in detection order. Spots left over once the
    /// list runs out get no plate.
    #[default]
    WholeFrame,
    /// Recognise inside each detection box.
    Scoped,
    /// Whole-frame results first, scoped recognition once they run out.
    WholeFrameThenScoped,
}

#[derive(Clone, Debug)]
pub struct PlateConfig {
    pub strategy: PlateStrategy,
    /// Minimum recognizer confidence for scoped candidates.
    pub min_confidence: f32,
    /// Crops taller than this are scaled down before thresholding.
    pub max_region_height: u32,
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self {
            strategy: PlateStrategy::default(),
            min_confidence: 0.6,
            max_region_height: 200,
        }
    }
}

/// Uppercase and strip everything but ASCII letters and digits.
pub fn clean_plate_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// 4 to 10 alphanumerics after cleaning, with at least one letter and one digit.
pub fn is_valid_plate(text: &str) -> bool {
    let cleaned = clean_plate_text(text);
    (4..=10).contains(&cleaned.len())
        && cleaned.chars().any(|c| c.is_ascii_alphabetic())
        && cleaned.chars().any(|c| c.is_ascii_digit())
}

/// Crop `bbox` out of `image`; `None` when the box is empty or leaves the frame.
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let x1 = bbox.x1.floor() as i64;
    let y1 = bbox.y1.floor() as i64;
    let x2 = bbox.x2.floor() as i64;
    let y2 = bbox.y2.floor() as i64;
    if x1 >= x2 || y1 >= y2 || x1 < 0 || y1 < 0 || x2 > width || y2 > height {
        return None;
    }
    let view = image::imageops::crop_imm(
        image,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    );
    Some(view.to_image())
}

/// Scale to at most `max_height` rows, convert to grey and binarise.
pub fn preprocess_region(region: &RgbImage, max_height: u32) -> GrayImage {
    let (width, height) = region.dimensions();
    let target_height = max_height.min(height).max(1);
    let target_width =
        ((target_height as u64 * width as u64) / height.max(1) as u64).max(1) as u32;
    let resized = if (target_width, target_height) == (width, height) {
        region.clone()
    } else {
        image::imageops::resize(region, target_width, target_height, FilterType::Triangle)
    };
    let gray = image::imageops::grayscale(&resized);
    adaptive_threshold(&gray, ADAPTIVE_BLOCK_SIZE, ADAPTIVE_OFFSET)
}

/// Inverted Gaussian adaptive threshold: a pixel becomes black when it is
/// brighter than its weighted neighbourhood mean minus `offset`, white
/// otherwise.
pub fn adaptive_threshold(gray: &GrayImage, block_size: u32, offset: i16) -> GrayImage {
    // Same kernel width OpenCV derives for a given block size.
    let sigma = 0.3 * ((block_size.max(3) as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let local_mean = image::imageops::blur(gray, sigma);
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        let mean = local_mean.get_pixel(x, y)[0] as i16;
        let value = if pixel[0] as i16 > mean - offset { 0 } else { 255 };
        out.put_pixel(x, y, Luma([value]));
    }
    out
}

/// Runs a [`TextRecognizer`] over frames and detection regions.
pub struct PlateRecognizer {
    recognizer: Box<dyn TextRecognizer>,
    config: PlateConfig,
}

impl PlateRecognizer {
    pub fn new(recognizer: Box<dyn TextRecognizer>, config: PlateConfig) -> Self {
        Self { recognizer, config }
    }

    pub fn config(&self) -> &PlateConfig {
        &self.config
    }

    /// All text found in the frame, in recognizer order.
    pub fn recognize_frame(&self, image: &RgbImage) -> Result<Vec<String>> {
        let gray = image::imageops::grayscale(image);
        let texts = self
            .recognizer
            .recognize(&gray)?
            .into_iter()
            .map(|candidate| candidate.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
        Ok(texts)
    }

    /// Best valid plate inside `bbox`, if any.
    pub fn recognize_region(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<Option<PlateCandidate>> {
        let Some(region) = crop_region(image, bbox) else {
            debug!("Plate region {bbox:?} outside {:?}", image.dimensions());
            return Ok(None);
        };
        let binary = preprocess_region(&region, self.config.max_region_height);
        let best = self
            .recognizer
            .recognize(&binary)?
            .into_iter()
            .filter(|candidate| candidate.confidence >= self.config.min_confidence)
            .filter_map(|candidate| {
                let text = clean_plate_text(&candidate.text);
                if is_valid_plate(&text) {
                    Some(PlateCandidate::new(text, candidate.confidence))
                } else {
                    debug!("Rejected plate text {:?}", candidate.text);
                    None
                }
            })
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        Ok(best)
    }

    /// Start assigning plates for one frame.
    pub fn for_frame<'a>(&'a self, image: &'a RgbImage) -> FramePlates<'a> {
        FramePlates {
            recognizer: self,
            image,
            whole_frame: None,
        }
    }
}

/// Per-frame plate assignment.
///
/// Whole-frame recognition runs on the first request only, and its results are
/// handed out first come first served. They are not matched to box positions.
pub struct FramePlates<'a> {
    recognizer: &'a PlateRecognizer,
    image: &'a RgbImage,
    whole_frame: Option<VecDeque<String>>,
}

impl FramePlates<'_> {
    /// Plate for the next occupied detection.
    pub fn next_plate(&mut self, bbox: &BoundingBox) -> Result<Option<String>> {
        match self.recognizer.config.strategy {
            PlateStrategy::WholeFrame => self.pop_whole_frame(),
            PlateStrategy::Scoped => self.scoped(bbox),
            PlateStrategy::WholeFrameThenScoped => match self.pop_whole_frame()? {
                Some(plate) => Ok(Some(plate)),
                None => self.scoped(bbox),
            },
        }
    }

    fn pop_whole_frame(&mut self) -> Result<Option<String>> {
        if self.whole_frame.is_none() {
            let texts = self.recognizer.recognize_frame(self.image)?;
            debug!("Whole-frame recognition returned {} strings", texts.len());
            self.whole_frame = Some(texts.into());
        }
        Ok(self.whole_frame.as_mut().and_then(VecDeque::pop_front))
    }

    fn scoped(&self, bbox: &BoundingBox) -> Result<Option<String>> {
        Ok(self
            .recognizer
            .recognize_region(self.image, bbox)?
            .map(|candidate| candidate.text))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use anyhow::bail;
    use image::Rgb;

    use super::*;

    struct Scripted {
        results: Vec<TextCandidate>,
        calls: Arc<AtomicUsize>,
    }

    impl TextRecognizer for Scripted {
        fn recognize(&self, _image: &GrayImage) -> Result<Vec<TextCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    struct Failing;

    impl TextRecognizer for Failing {
        fn recognize(&self, _image: &GrayImage) -> Result<Vec<TextCandidate>> {
            bail!("ocr backend crashed")
        }
    }

    fn recognizer(
        results: &[(&str, f32)],
        strategy: PlateStrategy,
    ) -> (PlateRecognizer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Scripted {
            results: results
                .iter()
                .map(|(text, conf)| TextCandidate::new(*text, *conf))
                .collect(),
            calls: calls.clone(),
        };
        let config = PlateConfig {
            strategy,
            ..PlateConfig::default()
        };
        (PlateRecognizer::new(Box::new(backend), config), calls)
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([200, 200, 200]))
    }

    #[test]
    fn validator_cases() {
        assert!(is_valid_plate("AB12CD"));
        assert!(is_valid_plate("ab-12 cd"));
        assert!(!is_valid_plate("1234"));
        assert!(!is_valid_plate("ABCD"));
        assert!(!is_valid_plate(""));
        assert!(!is_valid_plate("ABCDE123456"));
        assert!(!is_valid_plate("A1"));
        assert!(is_valid_plate("ABCDE12345"));
    }

    #[test]
    fn cleaning_uppercases_and_strips() {
        assert_eq!(clean_plate_text(" zg-123 ab!"), "ZG123AB");
    }

    #[test]
    fn crop_rejects_boxes_leaving_the_frame() {
        let image = frame();
        assert!(crop_region(&image, &BoundingBox::new(-1.0, 0.0, 10.0, 10.0)).is_none());
        assert!(crop_region(&image, &BoundingBox::new(0.0, 0.0, 65.0, 10.0)).is_none());
        assert!(crop_region(&image, &BoundingBox::new(5.0, 5.0, 5.0, 10.0)).is_none());
        let crop = crop_region(&image, &BoundingBox::new(0.0, 0.0, 64.0, 48.0)).unwrap();
        assert_eq!(crop.dimensions(), (64, 48));
        let crop = crop_region(&image, &BoundingBox::new(10.0, 4.0, 30.0, 14.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
    }

    #[test]
    fn preprocessing_caps_height_and_keeps_aspect() {
        let tall = RgbImage::from_pixel(100, 400, Rgb([10, 10, 10]));
        let binary = preprocess_region(&tall, 200);
        assert_eq!(binary.dimensions(), (50, 200));

        let small = RgbImage::from_pixel(40, 20, Rgb([10, 10, 10]));
        assert_eq!(preprocess_region(&small, 200).dimensions(), (40, 20));
    }

    #[test]
    fn adaptive_threshold_output_is_binary_and_inverted() {
        let mut gray = GrayImage::from_pixel(40, 40, Luma([220]));
        for y in 15..25 {
            for x in 15..25 {
                gray.put_pixel(x, y, Luma([20]));
            }
        }
        let out = adaptive_threshold(&gray, 11, 2);
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        // The dark side of an edge turns white, flat background black.
        assert_eq!(out.get_pixel(15, 20)[0], 255);
        assert_eq!(out.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn region_returns_best_valid_candidate() {
        let (plates, _) = recognizer(
            &[
                ("ab12cd", 0.7),
                ("XY99ZZ", 0.9),
                ("1234", 0.99),
                ("LOW123", 0.5),
            ],
            PlateStrategy::Scoped,
        );
        let best = plates
            .recognize_region(&frame(), &BoundingBox::new(0.0, 0.0, 32.0, 24.0))
            .unwrap()
            .unwrap();
        assert_eq!(best.text, "XY99ZZ");
        assert!((best.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn region_outside_frame_has_no_candidate() {
        let (plates, calls) = recognizer(&[("AB12CD", 0.9)], PlateStrategy::Scoped);
        let result = plates
            .recognize_region(&frame(), &BoundingBox::new(50.0, 0.0, 80.0, 10.0))
            .unwrap();
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn whole_frame_results_are_popped_in_order_and_run_once() {
        let (plates, calls) = recognizer(
            &[("XYZ123", 0.2), ("ABC999", 0.3)],
            PlateStrategy::WholeFrame,
        );
        let image = frame();
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut assigner = plates.for_frame(&image);
        assert_eq!(assigner.next_plate(&bbox).unwrap().as_deref(), Some("XYZ123"));
        assert_eq!(assigner.next_plate(&bbox).unwrap().as_deref(), Some("ABC999"));
        assert_eq!(assigner.next_plate(&bbox).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_strategy_leaves_spots_empty_once_exhausted() {
        let (plates, calls) = recognizer(&[("AB12CD", 0.8)], PlateConfig::default().strategy);
        let image = frame();
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let mut assigner = plates.for_frame(&image);
        assert_eq!(assigner.next_plate(&bbox).unwrap().as_deref(), Some("AB12CD"));
        assert_eq!(assigner.next_plate(&bbox).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn falls_back_to_scoped_once_exhausted() {
        let (plates, calls) = recognizer(&[("AB12CD", 0.8)], PlateStrategy::WholeFrameThenScoped);
        let image = frame();
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let mut assigner = plates.for_frame(&image);
        assert_eq!(assigner.next_plate(&bbox).unwrap().as_deref(), Some("AB12CD"));
        // Second request: whole-frame list is empty, scoped pass on the box.
        assert_eq!(assigner.next_plate(&bbox).unwrap().as_deref(), Some("AB12CD"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backend_errors_propagate() {
        let plates = PlateRecognizer::new(Box::new(Failing), PlateConfig::default());
        let image = frame();
        let mut assigner = plates.for_frame(&image);
        assert!(
            assigner
                .next_plate(&BoundingBox::new(0.0, 0.0, 10.0, 10.0))
                .is_err()
        );
    }
}
