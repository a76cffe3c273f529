use anyhow::{bail, Context, Result};
use burn::config::Config;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Image domain within the translation task.
///
/// The source domain is the labeled synthetic dataset the generators
/// translate from; the target domain is the unlabeled real dataset they
/// adapt toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Source,
    Target,
}

impl Domain {
    fn dir_name(&self) -> &'static str {
        match self {
            Domain::Source => "Source",
            Domain::Target => "Target",
        }
    }

    /// Accepted file extension for the domain's image directory.
    fn extension(&self) -> &'static str {
        match self {
            Domain::Source => "png",
            Domain::Target => "jpg",
        }
    }
}

/// Dataset split, mapping to a directory under the dataset root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl FromStr for Split {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => bail!("unknown split [{other}], expected train, val or test"),
        }
    }
}

/// A single image enumerated from the dataset tree.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub domain: Domain,
    pub split: Split,
}

/// One source record associated with one target record for a single access.
///
/// Under randomized pairing the association is redrawn on every access, so
/// the same source may pair with different targets across epochs.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub source: ImageRecord,
    pub target: ImageRecord,
}

/// Enumerate the images of one domain for a split, sorted by filename.
fn list_domain_images(root: &Path, split: Split, domain: Domain) -> Result<Vec<ImageRecord>> {
    let dir = root
        .join(split.as_str())
        .join(domain.dir_name())
        .join("img");
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read image directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path
            .extension()
            .map(|ext| ext == domain.extension())
            .unwrap_or(false)
        {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        bail!(
            "no .{} images found in {}",
            domain.extension(),
            dir.display()
        );
    }

    Ok(paths
        .into_iter()
        .map(|path| ImageRecord { path, domain, split })
        .collect())
}

/// Uniform-length sampler over the two independently-sized domain collections.
///
/// The reported length is the larger of the two collection sizes; indices
/// beyond a domain's own size wrap via modulo. With `fixed_pair` the target
/// index is `i % target_len` and repeated accesses are reproducible;
/// otherwise the target is drawn uniformly at random per access to
/// decorrelate the cross-domain pairing across epochs.
#[derive(Debug)]
pub struct ImagePairDataset {
    source: Vec<ImageRecord>,
    target: Vec<ImageRecord>,
    fixed_pair: bool,
    rng: Mutex<StdRng>,
}

impl ImagePairDataset {
    pub fn new(root: &Path, split: Split, fixed_pair: bool, seed: u64) -> Result<Self> {
        let source = list_domain_images(root, split, Domain::Source)?;
        let target = list_domain_images(root, split, Domain::Target)?;

        Ok(Self {
            source,
            target,
            fixed_pair,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    pub fn target_len(&self) -> usize {
        self.target.len()
    }
}

impl Dataset<ImagePair> for ImagePairDataset {
    fn get(&self, index: usize) -> Option<ImagePair> {
        if index >= self.len() {
            return None;
        }

        let source = self.source[index % self.source.len()].clone();
        let target = if self.fixed_pair {
            self.target[index % self.target.len()].clone()
        } else {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            self.target[rng.gen_range(0..self.target.len())].clone()
        };

        Some(ImagePair { source, target })
    }

    fn len(&self) -> usize {
        self.source.len().max(self.target.len())
    }
}

/// Per-domain preprocessing: fixed resize, random horizontal flip and
/// normalization to [-1, 1].
#[derive(Debug, Clone)]
pub struct ImageTransform {
    pub height: usize,
    pub width: usize,
    pub random_flip: bool,
}

impl ImageTransform {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            random_flip: true,
        }
    }

    /// Apply the pipeline to one image, returning CHW floats in [-1, 1].
    ///
    /// The flip decision is drawn fresh from `rng` on every call, so flips
    /// stay uncorrelated across domains and across accesses.
    pub fn apply(&self, img: &RgbImage, rng: &mut impl Rng) -> Vec<f32> {
        let (width, height) = (self.width as u32, self.height as u32);
        let resized = if img.width() != width || img.height() != height {
            image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
        } else {
            img.clone()
        };

        let flipped = if self.random_flip && rng.gen_bool(0.5) {
            image::imageops::flip_horizontal(&resized)
        } else {
            resized
        };

        image_to_chw(&flipped)
    }
}

/// Build the two independent per-domain pipelines for a target size.
pub fn get_transformers(height: usize, width: usize) -> (ImageTransform, ImageTransform) {
    (
        ImageTransform::new(height, width),
        ImageTransform::new(height, width),
    )
}

/// Convert RGB image data to CHW f32 in [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
            out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
            out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
        }
    }

    out
}

/// A batch of source/target image tensors in BCHW layout, in [-1, 1].
#[derive(Clone, Debug)]
pub struct ImagePairBatch<B: Backend> {
    pub source: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
}

/// Decode and transform a list of pairs into one batch.
pub fn build_pair_batch<B: Backend>(
    items: &[ImagePair],
    source_transform: &ImageTransform,
    target_transform: &ImageTransform,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<ImagePairBatch<B>> {
    let batch_size = items.len();
    let (h, w) = (source_transform.height, source_transform.width);
    let mut source_data = Vec::with_capacity(batch_size * 3 * h * w);
    let mut target_data = Vec::with_capacity(batch_size * 3 * h * w);

    for item in items {
        let source_img = image::open(&item.source.path)
            .with_context(|| format!("failed to open {}", item.source.path.display()))?
            .to_rgb8();
        source_data.extend(source_transform.apply(&source_img, rng));

        let target_img = image::open(&item.target.path)
            .with_context(|| format!("failed to open {}", item.target.path.display()))?
            .to_rgb8();
        target_data.extend(target_transform.apply(&target_img, rng));
    }

    let source = Tensor::<B, 4>::from_data(
        TensorData::new(source_data, [batch_size, 3, h, w]),
        device,
    );
    let target = Tensor::<B, 4>::from_data(
        TensorData::new(
            target_data,
            [batch_size, 3, target_transform.height, target_transform.width],
        ),
        device,
    );

    Ok(ImagePairBatch { source, target })
}

/// Batcher applying the per-domain transforms to each pair.
#[derive(Clone)]
pub struct PairBatcher {
    source_transform: ImageTransform,
    target_transform: ImageTransform,
    rng: Arc<Mutex<StdRng>>,
}

impl PairBatcher {
    pub fn new(
        source_transform: ImageTransform,
        target_transform: ImageTransform,
        seed: u64,
    ) -> Self {
        Self {
            source_transform,
            target_transform,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, ImagePair, ImagePairBatch<B>> for PairBatcher {
    fn batch(&self, items: Vec<ImagePair>, device: &B::Device) -> ImagePairBatch<B> {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        build_pair_batch::<B>(
            &items,
            &self.source_transform,
            &self.target_transform,
            &mut *rng,
            device,
        )
        .expect("failed to build batch")
    }
}

/// Settings for assembling the per-split dataloaders.
#[derive(Config, Debug)]
pub struct DataConfig {
    pub root_dir: String,
    #[config(default = 576)]
    pub resize_h: usize,
    #[config(default = 1024)]
    pub resize_w: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 0)]
    pub num_workers: usize,
    #[config(default = false)]
    pub fixed_pair: bool,
    #[config(default = 42)]
    pub seed: u64,
}

/// Build a shuffled dataloader per requested split.
pub fn build_dataloaders<B: Backend>(
    splits: &[Split],
    config: &DataConfig,
    device: &B::Device,
) -> Result<HashMap<Split, Arc<dyn DataLoader<B, ImagePairBatch<B>>>>> {
    let (source_transform, target_transform) = get_transformers(config.resize_h, config.resize_w);
    let mut dataloaders = HashMap::new();

    for &split in splits {
        let dataset = ImagePairDataset::new(
            Path::new(&config.root_dir),
            split,
            config.fixed_pair,
            config.seed,
        )?;
        let batcher = PairBatcher::new(
            source_transform.clone(),
            target_transform.clone(),
            config.seed,
        );

        let mut builder = DataLoaderBuilder::<B, ImagePair, ImagePairBatch<B>>::new(batcher)
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .set_device(device.clone());
        if config.num_workers > 0 {
            builder = builder.num_workers(config.num_workers);
        }

        dataloaders.insert(split, builder.build(dataset));
    }

    Ok(dataloaders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_images(root: &Path, split: &str, domain: &str, ext: &str, count: usize) {
        let dir = root.join(split).join(domain).join("img");
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let mut img = RgbImage::new(8, 6);
            for pixel in img.pixels_mut() {
                *pixel = Rgb([i as u8 * 20, 0, 255 - i as u8 * 20]);
            }
            img.save(dir.join(format!("{i:03}.{ext}"))).unwrap();
        }
    }

    fn fixture(source_count: usize, target_count: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), "train", "Source", "png", source_count);
        write_images(dir.path(), "train", "Target", "jpg", target_count);
        dir
    }

    fn file_name(record: &ImageRecord) -> String {
        record
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn length_is_max_of_domain_sizes() {
        let root = fixture(5, 3);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, false, 0).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.source_len(), 5);
        assert_eq!(dataset.target_len(), 3);

        let root = fixture(2, 4);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, false, 0).unwrap();
        assert_eq!(dataset.len(), 4);
    }

    #[test]
    fn out_of_range_index_is_none() {
        let root = fixture(3, 2);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, true, 0).unwrap();
        assert!(dataset.get(2).is_some());
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn source_index_wraps_modulo() {
        let root = fixture(3, 5);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, true, 0).unwrap();
        // Index 4 wraps to source 4 % 3 = 1.
        let pair = dataset.get(4).unwrap();
        assert_eq!(file_name(&pair.source), "001.png");
        assert_eq!(pair.source.domain, Domain::Source);
        assert_eq!(pair.source.split, Split::Train);
    }

    #[test]
    fn fixed_pair_target_is_deterministic() {
        let root = fixture(10, 3);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, true, 0).unwrap();
        assert_eq!(dataset.len(), 10);
        // Index 4 pulls target 4 % 3 = 1, reproducibly.
        for _ in 0..3 {
            let pair = dataset.get(4).unwrap();
            assert_eq!(file_name(&pair.target), "001.jpg");
        }
    }

    #[test]
    fn random_pair_stays_in_range_and_follows_seed() {
        let root = fixture(6, 3);
        let first = ImagePairDataset::new(root.path(), Split::Train, false, 7).unwrap();
        let second = ImagePairDataset::new(root.path(), Split::Train, false, 7).unwrap();

        let names = |dataset: &ImagePairDataset| -> Vec<String> {
            (0..dataset.len())
                .map(|i| file_name(&dataset.get(i).unwrap().target))
                .collect()
        };

        let picks = names(&first);
        for name in &picks {
            assert!(["000.jpg", "001.jpg", "002.jpg"].contains(&name.as_str()));
        }
        assert_eq!(picks, names(&second));
    }

    #[test]
    fn missing_or_empty_domain_fails_construction() {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), "train", "Source", "png", 2);
        // Target directory missing entirely.
        let err = ImagePairDataset::new(dir.path(), Split::Train, false, 0).unwrap_err();
        assert!(err.to_string().contains("failed to read image directory"));

        // Present but with no matching extension.
        write_images(dir.path(), "train", "Target", "png", 2);
        let err = ImagePairDataset::new(dir.path(), Split::Train, false, 0).unwrap_err();
        assert!(err.to_string().contains("no .jpg images found"));
    }

    #[test]
    fn non_matching_extensions_are_ignored() {
        let root = fixture(3, 2);
        // A stray jpg in the source directory must not be picked up.
        let stray = root.path().join("train/Source/img/zzz.jpg");
        RgbImage::new(8, 6).save(&stray).unwrap();
        let dataset = ImagePairDataset::new(root.path(), Split::Train, false, 0).unwrap();
        assert_eq!(dataset.source_len(), 3);
    }

    #[test]
    fn transform_normalizes_without_flip() {
        let mut img = RgbImage::new(4, 4);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([0, 127, 255]);
        }
        let mut transform = ImageTransform::new(4, 4);
        transform.random_flip = false;

        let mut rng = StdRng::seed_from_u64(0);
        let data = transform.apply(&img, &mut rng);
        assert_eq!(data.len(), 3 * 4 * 4);
        assert!((data[0] - (-1.0)).abs() < 1e-6);
        assert!((data[16] - (127.0 / 127.5 - 1.0)).abs() < 1e-6);
        assert!((data[32] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn chw_layout_is_channel_major() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let data = image_to_chw(&img);
        // Red channel plane first, then green, then blue.
        assert_eq!(data, vec![1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn batch_has_expected_shape_and_range() {
        let root = fixture(4, 2);
        let dataset = ImagePairDataset::new(root.path(), Split::Train, true, 0).unwrap();
        let items: Vec<ImagePair> = (0..2).map(|i| dataset.get(i).unwrap()).collect();

        let (source_transform, target_transform) = get_transformers(6, 8);
        let batcher = PairBatcher::new(source_transform, target_transform, 0);
        let device = Default::default();
        let batch: ImagePairBatch<TestBackend> = batcher.batch(items, &device);

        assert_eq!(batch.source.dims(), [2, 3, 6, 8]);
        assert_eq!(batch.target.dims(), [2, 3, 6, 8]);
        let values = batch.source.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn dataloaders_cover_requested_splits() {
        let root = fixture(4, 2);
        write_images(root.path(), "val", "Source", "png", 2);
        write_images(root.path(), "val", "Target", "jpg", 2);

        let config = DataConfig::new(root.path().to_string_lossy().into_owned())
            .with_resize_h(6)
            .with_resize_w(8)
            .with_batch_size(2);
        let device = Default::default();
        let loaders =
            build_dataloaders::<TestBackend>(&[Split::Train, Split::Val], &config, &device)
                .unwrap();

        assert_eq!(loaders.len(), 2);
        let batch = loaders[&Split::Train].iter().next().unwrap();
        assert_eq!(batch.source.dims(), [2, 3, 6, 8]);
    }

    #[test]
    fn split_parses_from_names() {
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert_eq!("val".parse::<Split>().unwrap(), Split::Val);
        assert!("training".parse::<Split>().is_err());
    }
}
