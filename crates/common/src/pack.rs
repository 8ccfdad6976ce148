//! Convert an image folder tree into a `VQI1` shard.
//!
//! Expected layout is one sub-directory per class, e.g. `train/n01440764/x.JPEG`.
//! Classes are numbered in sorted directory order. Every image is resized to
//! fill a `size × size` square (centre crop) and stored as RGB CHW bytes.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;

use crate::data::{ShardHeader, ShardWriter};
use crate::error::{Result, TrainError};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Sorted class directories and their image files.
pub fn scan_image_folder(root: &Path) -> Result<Vec<(String, Vec<PathBuf>)>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut files = Vec::new();
        for f in std::fs::read_dir(&path)? {
            let f = f?.path();
            let ext = f
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if f.is_file() && IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                files.push(f);
            }
        }
        files.sort();
        classes.push((name, files));
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));
    if classes.is_empty() {
        return Err(TrainError::Data(format!(
            "{} contains no class directories",
            root.display()
        )));
    }
    Ok(classes)
}

/// Decode and resize one image to `size × size` RGB, CHW order.
pub fn load_rgb_chw(path: &Path, size: u32) -> Result<Vec<u8>> {
    let img = image::open(path)
        .map_err(|e| TrainError::Data(format!("{}: {e}", path.display())))?
        .resize_to_fill(size, size, FilterType::Lanczos3)
        .to_rgb8();
    let plane = (size * size) as usize;
    let mut out = vec![0u8; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = px.0[c];
        }
    }
    Ok(out)
}

/// Pack `root` into a shard at `out`. Unreadable images are skipped with a
/// warning.
pub fn pack_image_folder(root: &Path, out: &Path, size: u32) -> Result<ShardHeader> {
    let classes = scan_image_folder(root)?;
    let mut writer = ShardWriter::create(out, 3, size as usize, size as usize, classes.len())?;
    let mut skipped = 0usize;
    for (label, (name, files)) in classes.iter().enumerate() {
        tracing::debug!(class = %name, label, images = files.len(), "packing class");
        for file in files {
            match load_rgb_chw(file, size) {
                Ok(pixels) => writer.push(label as u32, &pixels)?,
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(error = %e, "skipping unreadable image");
                }
            }
        }
    }
    let header = writer.finish()?;
    tracing::info!(
        samples = header.num_samples,
        classes = header.num_classes,
        skipped,
        out = %out.display(),
        "packed image folder"
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ImageDataset, ImageShardDataset};

    #[test]
    fn pack_small_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("train");
        for (class, colour) in [("b_dog", [0u8, 0, 255]), ("a_cat", [255u8, 0, 0])] {
            std::fs::create_dir_all(root.join(class)).unwrap();
            let img = image::RgbImage::from_pixel(6, 4, image::Rgb(colour));
            img.save(root.join(class).join("0.png")).unwrap();
        }
        std::fs::write(root.join("a_cat").join("notes.txt"), "ignored").unwrap();

        let out = dir.path().join("train.vqi");
        let header = pack_image_folder(&root, &out, 4).unwrap();
        assert_eq!(header.num_samples, 2);
        assert_eq!(header.num_classes, 2);

        let ds = ImageShardDataset::open(&out).unwrap();
        let (pixels, label) = ds.get(0).unwrap();
        assert_eq!(label, 0);
        // a_cat is red: R plane full, B plane empty.
        assert!(pixels[..16].iter().all(|&p| p >= 250));
        assert!(pixels[32..].iter().all(|&p| p <= 5));
        assert_eq!(ds.get(1).unwrap().1, 1);
    }

    #[test]
    fn empty_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_image_folder(dir.path()).is_err());
    }
}
