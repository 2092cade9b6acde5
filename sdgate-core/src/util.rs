use anyhow::{bail, Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::warn;

use crate::codec::{RawImage, RGB_CHANNELS};
use crate::Placement;

pub fn select_best_device(placement: Placement) -> Result<Device> {
    match placement {
        Placement::ForceCpu => Ok(Device::Cpu),
        Placement::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        Placement::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        Placement::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("running on CPU, build with `--features metal` to run on the GPU");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("running on CPU, build with `--features cuda` to run on the GPU");
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB buffer.
pub fn tensor_to_image(img: &Tensor) -> Result<RawImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != RGB_CHANNELS as usize {
        bail!("tensor_to_image expects 3 channels, got {channels}");
    }
    let pixels = img.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    Ok(RawImage::rgb(width as u32, height as u32, pixels))
}

/// Resizes `image` to `width`x`height` and returns a (1, 3, h, w) f32 tensor in [-1, 1].
pub fn image_to_tensor(image: &RawImage, width: u32, height: u32, device: &Device) -> Result<Tensor> {
    if image.channels != RGB_CHANNELS {
        bail!("expected an RGB image, got {} channels", image.channels);
    }
    let rgb = RgbImage::from_raw(image.width, image.height, image.data.clone())
        .context("pixel buffer does not match image dimensions")?;
    let rgb = if rgb.dimensions() == (width, height) {
        rgb
    } else {
        imageops::resize(&rgb, width, height, FilterType::CatmullRom)
    };
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_placement() {
        assert!(select_best_device(Placement::ForceCpu).unwrap().is_cpu());
    }

    #[test]
    fn tensor_to_image_interleaves_channels() {
        // Planar (3, 1, 2): red plane, green plane, blue plane.
        let planar = Tensor::new(&[[[10u8, 11]], [[20, 21]], [[30, 31]]], &Device::Cpu).unwrap();
        let image = tensor_to_image(&planar).unwrap();
        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(image.data, vec![10, 20, 30, 11, 21, 31]);

        let gray = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&gray).is_err());
    }

    #[test]
    fn image_to_tensor_scales_and_resizes() {
        let image = RawImage::rgb(2, 2, vec![0, 255, 0, 0, 255, 0, 0, 255, 0, 0, 255, 0]);
        let tensor = image_to_tensor(&image, 2, 2, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 2]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[..4].iter().all(|v| (v + 1.0).abs() < 1e-5));
        assert!(values[4..8].iter().all(|v| (v - 1.0).abs() < 1e-5));

        let resized = image_to_tensor(&image, 8, 16, &Device::Cpu).unwrap();
        assert_eq!(resized.dims(), &[1, 3, 16, 8]);
    }
}
