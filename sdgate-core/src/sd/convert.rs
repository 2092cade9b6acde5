//! Offline weight conversion: safetensors in, safetensors or GGUF out.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::quantized::{gguf_file, GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::engine::{ConvertParams, WeightType};

/// Diffusers sub-models and the prefix their tensors get in the merged file.
const DIFFUSERS_COMPONENTS: [(&str, &str); 3] = [
    ("unet", "unet."),
    ("vae", "vae."),
    ("text_encoder", "text_encoder."),
];

const DIFFUSERS_WEIGHT_FILES: [&str; 4] = [
    "diffusion_pytorch_model.safetensors",
    "model.safetensors",
    "diffusion_pytorch_model.fp16.safetensors",
    "model.fp16.safetensors",
];

type Tensors = BTreeMap<String, Tensor>;

pub fn convert(params: &ConvertParams<'_>) -> Result<()> {
    let mut tensors = load_model(Path::new(params.model_path))?;
    if let Some(vae) = params.vae_path {
        merge(&mut tensors, load_file(vae)?, "vae.");
    }
    if tensors.is_empty() {
        bail!("no tensors found in {}", params.model_path);
    }
    info!(
        tensors = tensors.len(),
        weight_type = ?params.weight_type,
        output = %params.output_path.display(),
        "converting model"
    );

    if let Some(dir) = params.output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    match params.weight_type {
        Some(wtype) if wtype.is_quantized() => write_gguf(&tensors, wtype, params.output_path),
        wtype => write_safetensors(tensors, wtype, params.output_path),
    }
}

fn load_model(path: &Path) -> Result<Tensors> {
    if path.is_file() {
        return load_file(path);
    }
    if !path.is_dir() {
        bail!("model {} does not exist", path.display());
    }

    let mut tensors = Tensors::new();
    for (component, prefix) in DIFFUSERS_COMPONENTS {
        let Some(file) = component_file(&path.join(component)) else {
            debug!(component, "no weights for diffusers component");
            continue;
        };
        merge(&mut tensors, load_file(&file)?, prefix);
    }
    Ok(tensors)
}

fn component_file(dir: &Path) -> Option<PathBuf> {
    DIFFUSERS_WEIGHT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|file| file.is_file())
}

fn load_file(path: &Path) -> Result<Tensors> {
    if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
        bail!("unsupported weight format {}, expected .safetensors", path.display());
    }
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(tensors.into_iter().collect())
}

fn merge(into: &mut Tensors, from: Tensors, prefix: &str) {
    into.extend(from.into_iter().map(|(name, t)| (format!("{prefix}{name}"), t)));
}

fn write_safetensors(tensors: Tensors, wtype: Option<WeightType>, output: &Path) -> Result<()> {
    let target = match wtype {
        Some(WeightType::F16) => Some(DType::F16),
        Some(WeightType::F32) => Some(DType::F32),
        _ => None,
    };
    let tensors = tensors
        .into_iter()
        .map(|(name, tensor)| {
            let tensor = match target {
                Some(dtype) if tensor.dtype().is_float() => tensor.to_dtype(dtype)?,
                _ => tensor,
            };
            Ok((name, tensor))
        })
        .collect::<Result<std::collections::HashMap<_, _>>>()?;
    candle_core::safetensors::save(&tensors, output)
        .with_context(|| format!("failed to write {}", output.display()))
}

fn ggml_dtype(wtype: WeightType) -> GgmlDType {
    match wtype {
        WeightType::F32 => GgmlDType::F32,
        WeightType::F16 => GgmlDType::F16,
        WeightType::Q4_0 => GgmlDType::Q4_0,
        WeightType::Q4_1 => GgmlDType::Q4_1,
        WeightType::Q5_0 => GgmlDType::Q5_0,
        WeightType::Q5_1 => GgmlDType::Q5_1,
        WeightType::Q8_0 => GgmlDType::Q8_0,
    }
}

fn write_gguf(tensors: &Tensors, wtype: WeightType, output: &Path) -> Result<()> {
    let dtype = ggml_dtype(wtype);
    let mut quantized = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        // Block quantization works along rows; everything else stays f16.
        let row = tensor.dims().last().copied().unwrap_or(0);
        let target = if tensor.rank() >= 2 && row % dtype.block_size() == 0 {
            dtype
        } else {
            GgmlDType::F16
        };
        let qtensor = QTensor::quantize(&tensor.to_dtype(DType::F32)?, target)
            .with_context(|| format!("failed to quantize {name}"))?;
        quantized.push((name.as_str(), qtensor));
    }

    let architecture = gguf_file::Value::String("stable-diffusion".to_string());
    let file_type = gguf_file::Value::String(wtype.to_string());
    let metadata = [
        ("general.architecture", &architecture),
        ("general.file_type", &file_type),
    ];
    let tensors: Vec<_> = quantized.iter().map(|(name, t)| (*name, t)).collect();

    let file = File::create(output).with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    gguf_file::write(&mut writer, &metadata, &tensors)
        .with_context(|| format!("failed to write {}", output.display()))?;
    writer.flush()?;
    Ok(())
}
