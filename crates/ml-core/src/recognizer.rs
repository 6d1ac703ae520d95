use anyhow::Result;
use image::GrayImage;

/// Recognised text region.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCandidate {
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TextCandidate {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Text recognition capability.
///
/// Candidates are returned in the backend's reading order.
pub trait TextRecognizer: Send {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextCandidate>>;
}

impl<R: TextRecognizer + ?Sized> TextRecognizer for Box<R> {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextCandidate>> {
        (**self).recognize(image)
    }
}
