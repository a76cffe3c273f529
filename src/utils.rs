use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Map a [-1, 1] normalized value back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert one CHW tensor in [-1, 1] back to an 8-bit RGB image.
///
/// A single-channel tensor is replicated across the three output channels.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<RgbImage> {
    let data = tensor.into_data().convert::<f32>();
    let [channels, height, width] = data.shape[..] else {
        return Err(anyhow::anyhow!(
            "expected rank-3 tensor for an image, got shape {:?}",
            data.shape
        ));
    };
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for an image, got {channels}"
        ));
    }

    let values = data
        .to_vec::<f32>()
        .ok()
        .context("failed to read tensor data as f32")?;
    let hw = height * width;
    let mut img = RgbImage::new(width as u32, height as u32);

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let channel = |c: usize| -> u8 {
                // Grayscale replicates channel 0.
                let offset = if channels == 1 { 0 } else { c * hw };
                (scale_back(values[offset + idx]).clamp(0.0, 1.0) * 255.0) as u8
            };
            img.put_pixel(
                x as u32,
                y as u32,
                Rgb([channel(0), channel(1), channel(2)]),
            );
        }
    }

    Ok(img)
}

/// Export one normalized tensor as an image file under `output_dir`.
pub fn save_image<B: Backend>(tensor: Tensor<B, 3>, output_dir: &Path, name: &str) -> Result<()> {
    let img = tensor_to_image(tensor)?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(name);
    img.save(&path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Concatenate equally-sized images horizontally into one comparison sheet.
pub fn side_by_side(images: &[RgbImage]) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("no images to concatenate"))?;
    let (width, height) = first.dimensions();
    let mut sheet = RgbImage::new(width * images.len() as u32, height);

    for (idx, img) in images.iter().enumerate() {
        sheet
            .copy_from(img, idx as u32 * width, 0)
            .context("failed to copy image into sheet")?;
    }

    Ok(sheet)
}

/// Write scalar metrics as a JSON object with 4-space indentation.
pub fn save_metrics_json(metrics: &HashMap<String, f64>, json_path: &Path) -> Result<()> {
    let file = File::create(json_path)
        .with_context(|| format!("failed to create {}", json_path.display()))?;
    let mut writer = BufWriter::new(file);

    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut writer, formatter);
    metrics
        .serialize(&mut serializer)
        .with_context(|| format!("failed to write metrics to {}", json_path.display()))?;
    writer.flush()?;
    Ok(())
}
