//! TorchScript YOLO detector, available with the `with-tch` feature.

use std::{convert::TryFrom, sync::Once};

use anyhow::{Result, bail};
use image::{RgbImage, imageops::FilterType};
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tch::{self, Device, Kind, Tensor};
use tracing::{info, warn};

use crate::{
    detector::{Detection, DetectionClass, Detector, DetectorConfig, DevicePreference},
    postprocess::{decode_predictions, non_max_suppression, rescale},
};

/// Make the CUDA kernels of libtorch visible before the first device query.
pub fn load_torch_cuda_runtime(verbose: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut handles = Vec::new();
        for lib in [
            "libtorch_cuda.so",
            "libtorch_cuda_cu.so",
            "libtorch_cuda_cpp.so",
        ] {
            match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(handle) => {
                    if verbose {
                        info!("Loaded {lib}");
                    }
                    handles.push(handle);
                }
                Err(err) => {
                    if verbose {
                        warn!("Failed to load {lib}: {err}");
                    }
                }
            }
        }
        Box::leak(Box::new(handles));
    });
}

pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    config: DetectorConfig,
}

impl TorchDetector {
    /// Load the TorchScript module on the preferred device.
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let device = match config.device {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => {
                load_torch_cuda_runtime(false);
                Device::cuda_if_available()
            }
        };
        let module = tch::CModule::load_on_device(&config.model_path, device)?;
        info!(
            "Loaded detector {} on {:?}",
            config.model_path.display(),
            device
        );
        Ok(Self {
            module,
            device,
            config,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn to_tensor(&self, image: &RgbImage) -> Tensor {
        let edge = self.config.input_size;
        let resized = image::imageops::resize(image, edge, edge, FilterType::Triangle);
        let edge = edge as i64;
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, edge, edge, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }

    fn infer(&self, input: &Tensor) -> Result<Vec<Vec<f32>>> {
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,scores), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        Ok(Vec::<Vec<f32>>::try_from(&preds)?)
    }
}

impl Detector for TorchDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.to_tensor(image);
        let rows = self.infer(&input)?;
        let decoded = decode_predictions(&rows, self.config.confidence);
        let mut kept = non_max_suppression(
            decoded,
            self.config.iou_threshold,
            self.config.max_detections,
        );
        let edge = self.config.input_size;
        rescale(&mut kept, (edge, edge), image.dimensions());
        let occupied = kept
            .iter()
            .filter(|det| det.class == DetectionClass::Occupied)
            .count();
        tracing::trace!(total = kept.len(), occupied, "detector pass");
        Ok(kept)
    }
}
