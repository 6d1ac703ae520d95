//! Inference building blocks shared by the parking pipeline: detector and
//! text recognizer traits, YOLO post-processing and the bundled backends.

pub mod detector;
pub mod postprocess;
pub mod recognizer;
pub mod tesseract;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{
    BoundingBox, Detection, DetectionClass, Detector, DetectorConfig, DevicePreference,
};
pub use recognizer::{TextCandidate, TextRecognizer};
pub use tesseract::TesseractCli;
#[cfg(feature = "with-tch")]
pub use torch::{TorchDetector, load_torch_cuda_runtime};

#[cfg(feature = "with-tch")]
pub use tch;
