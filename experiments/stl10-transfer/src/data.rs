//! STL-10 binary release: download, decoding, preprocessing and batching.
//!
//! Each `*_X.bin` file is a flat run of 96x96 RGB images. An image is stored channel by
//! channel, and every channel is column-major, so byte `c * 96 * 96 + x * 96 + y` holds
//! channel `c` of the pixel in column `x`, row `y`. Labels are one byte each, numbered 1-10.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_common::network::downloader::download_file_as_bytes;
use burn_dataset::Dataset;
use flate2::read::GzDecoder;
use headtune_core::{seeded_rng, shuffled_indices};
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::rngs::StdRng;
use tar::Archive;

use crate::{
    registry::{ExperimentConfig, NUM_CLASSES},
    training::BatchSource,
};

const STL10_URL: &str = "http://ai.stanford.edu/~acoates/stl10/stl10_binary.tar.gz";
const ARCHIVE_NAME: &str = "stl10_binary.tar.gz";
const DATASET_DIR: &str = "stl10_binary";
const CLASS_NAMES: &str = "class_names.txt";
/// The unlabeled split (100k images) is left inside the archive.
const EXTRACTED: [&str; 5] = [
    Split::Train.images_file(),
    Split::Train.labels_file(),
    Split::Test.images_file(),
    Split::Test.labels_file(),
    CLASS_NAMES,
];

pub const IMAGE_SIDE: usize = 96;
const CHANNELS: usize = 3;
const IMAGE_BYTES: usize = CHANNELS * IMAGE_SIDE * IMAGE_SIDE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    const fn images_file(&self) -> &'static str {
        match self {
            Self::Train => "train_X.bin",
            Self::Test => "test_X.bin",
        }
    }

    const fn labels_file(&self) -> &'static str {
        match self {
            Self::Train => "train_y.bin",
            Self::Test => "test_y.bin",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Stl10Item {
    pub image: RgbImage,
    /// Zero-based class index.
    pub label: u8,
}

/// One split of STL-10 held in memory as raw bytes.
pub struct Stl10Dataset {
    images: Vec<u8>,
    labels: Vec<u8>,
    class_names: Vec<String>,
}

impl Stl10Dataset {
    pub fn train(cache_dir: &Path) -> Result<Self> {
        Self::new(Split::Train, cache_dir)
    }

    /// Download (once) into `cache_dir` and load `split`.
    pub fn new(split: Split, cache_dir: &Path) -> Result<Self> {
        let dir = download(cache_dir)?;
        Self::load(&dir, split)
    }

    /// Load `split` from an extracted `stl10_binary` directory.
    pub fn load(dir: &Path, split: Split) -> Result<Self> {
        let images_path = dir.join(split.images_file());
        let labels_path = dir.join(split.labels_file());
        let images = fs::read(&images_path)
            .with_context(|| format!("failed to read {}", images_path.display()))?;
        let labels = fs::read(&labels_path)
            .with_context(|| format!("failed to read {}", labels_path.display()))?;

        let mut dataset = Self::from_raw(images, labels)
            .with_context(|| format!("malformed STL-10 split in {}", dir.display()))?;

        let names_path = dir.join(CLASS_NAMES);
        if names_path.exists() {
            let names = fs::read_to_string(&names_path)
                .with_context(|| format!("failed to read {}", names_path.display()))?;
            dataset.class_names = names
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect();
        }

        log::info!("loaded {} STL-10 {:?} images", dataset.len(), split);
        Ok(dataset)
    }

    /// Build from raw file contents; labels are the on-disk 1-based values.
    pub fn from_raw(images: Vec<u8>, labels: Vec<u8>) -> Result<Self> {
        ensure!(
            images.len() % IMAGE_BYTES == 0,
            "image data length {} is not a multiple of {}",
            images.len(),
            IMAGE_BYTES
        );
        ensure!(
            images.len() / IMAGE_BYTES == labels.len(),
            "{} images but {} labels",
            images.len() / IMAGE_BYTES,
            labels.len()
        );
        if let Some(bad) = labels
            .iter()
            .find(|&&label| label == 0 || label as usize > NUM_CLASSES)
        {
            bail!("label {} outside 1..={}", bad, NUM_CLASSES);
        }

        Ok(Self {
            images,
            labels: labels.into_iter().map(|label| label - 1).collect(),
            class_names: Vec::new(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn item(&self, index: usize) -> Stl10Item {
        let start = index * IMAGE_BYTES;
        Stl10Item {
            image: decode_image(&self.images[start..start + IMAGE_BYTES]),
            label: self.labels[index],
        }
    }
}

impl Dataset<Stl10Item> for Stl10Dataset {
    fn get(&self, index: usize) -> Option<Stl10Item> {
        (index < self.labels.len()).then(|| self.item(index))
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

fn decode_image(raw: &[u8]) -> RgbImage {
    let plane = IMAGE_SIDE * IMAGE_SIDE;
    RgbImage::from_fn(IMAGE_SIDE as u32, IMAGE_SIDE as u32, |x, y| {
        let offset = x as usize * IMAGE_SIDE + y as usize;
        Rgb([raw[offset], raw[plane + offset], raw[2 * plane + offset]])
    })
}

/// Fetch and unpack the binary release unless every needed file is already cached.
fn download(cache_dir: &Path) -> Result<PathBuf> {
    let dir = cache_dir.join(DATASET_DIR);
    if is_extracted(&dir) {
        return Ok(dir);
    }

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    log::info!("downloading STL-10 from {}", STL10_URL);
    let bytes = download_file_as_bytes(STL10_URL, ARCHIVE_NAME);
    extract(GzDecoder::new(&bytes[..]), &dir)?;

    Ok(dir)
}

fn is_extracted(dir: &Path) -> bool {
    EXTRACTED.iter().all(|name| dir.join(name).is_file())
}

/// Unpack the needed entries of a tar stream into `dir`.
///
/// Each entry lands in `<name>.part` and is renamed only once its full length is on disk,
/// so an interrupted extraction never leaves a file that looks cached.
fn extract<R: Read>(archive: R, dir: &Path) -> Result<()> {
    let mut archive = Archive::new(archive);
    for entry in archive
        .entries()
        .context("failed to read STL-10 archive")?
    {
        let mut entry = entry.context("corrupt STL-10 archive entry")?;
        let path = entry.path()?.into_owned();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !EXTRACTED.contains(&name) {
            continue;
        }

        let target = dir.join(name);
        let partial = dir.join(format!("{name}.part"));
        let expected = entry.header().size()?;
        log::debug!("extracting {} ({} bytes)", target.display(), expected);
        entry
            .unpack(&partial)
            .with_context(|| format!("failed to extract {}", partial.display()))?;

        let written = fs::metadata(&partial)
            .with_context(|| format!("failed to inspect {}", partial.display()))?
            .len();
        ensure!(
            written == expected,
            "STL-10 entry {} is truncated: {} of {} bytes",
            name,
            written,
            expected
        );
        fs::rename(&partial, &target)
            .with_context(|| format!("failed to move {} into place", target.display()))?;
    }

    if let Some(missing) = EXTRACTED.iter().find(|name| !dir.join(name).is_file()) {
        bail!("STL-10 archive did not contain {}", missing);
    }
    Ok(())
}

/// Resize, scale to `[0, 1]`, then normalize each channel as `(x - mean) / std`.
#[derive(Clone, Debug)]
pub struct ImageTransform {
    size: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageTransform {
    pub fn new(size: usize, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { size, mean, std }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.image_size, config.mean, config.std)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Channel-first `[3, size, size]` values.
    pub fn apply(&self, image: &RgbImage) -> Vec<f32> {
        let side = self.size as u32;
        let resized;
        let image = if image.dimensions() == (side, side) {
            image
        } else {
            resized = image::imageops::resize(image, side, side, FilterType::Triangle);
            &resized
        };

        let plane = self.size * self.size;
        let mut values = vec![0.0; CHANNELS * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * self.size + x as usize;
            for channel in 0..CHANNELS {
                let scaled = pixel[channel] as f32 / 255.0;
                values[channel * plane + offset] = (scaled - self.mean[channel]) / self.std[channel];
            }
        }
        values
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch]` class indices.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn from_items(items: &[Stl10Item], transform: &ImageTransform, device: &B::Device) -> Self {
        let side = transform.size();
        let mut images = Vec::with_capacity(items.len() * CHANNELS * side * side);
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            images.extend(transform.apply(&item.image));
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images, [items.len(), CHANNELS, side, side]),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_ints(TensorData::new(labels, [items.len()]), device);

        Self { images, targets }
    }

    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }
}

/// Iterates a dataset in batches, optionally reshuffling every epoch.
///
/// The final batch of an epoch may be smaller than `batch_size`.
pub struct Stl10Loader<'a, B: Backend> {
    dataset: &'a Stl10Dataset,
    transform: ImageTransform,
    batch_size: usize,
    device: B::Device,
    rng: Option<StdRng>,
    max_batches: Option<usize>,
}

impl<'a, B: Backend> Stl10Loader<'a, B> {
    pub fn new(
        dataset: &'a Stl10Dataset,
        transform: ImageTransform,
        batch_size: usize,
        device: B::Device,
    ) -> Self {
        Self {
            dataset,
            transform,
            batch_size: batch_size.max(1),
            device,
            rng: None,
            max_batches: None,
        }
    }

    /// Visit examples in a fresh seeded permutation each epoch.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(seeded_rng(seed));
        self
    }

    /// Stop each epoch after `limit` batches.
    pub fn with_max_batches(mut self, limit: Option<usize>) -> Self {
        self.max_batches = limit;
        self
    }

    pub fn num_batches(&self) -> usize {
        let full = self.dataset.len().div_ceil(self.batch_size);
        self.max_batches.map_or(full, |limit| full.min(limit))
    }

    fn epoch_order(&mut self) -> Vec<usize> {
        let len = self.dataset.len();
        match self.rng.as_mut() {
            Some(rng) => shuffled_indices(len, rng),
            None => (0..len).collect(),
        }
    }
}

impl<B: Backend> BatchSource<B> for Stl10Loader<'_, B> {
    fn epoch(&mut self) -> Box<dyn Iterator<Item = ImageBatch<B>> + '_> {
        let order = self.epoch_order();
        let batches = self.num_batches();
        let batch_size = self.batch_size;
        let dataset = self.dataset;
        let transform = &self.transform;
        let device = &self.device;

        Box::new((0..batches).map(move |batch| {
            let start = batch * batch_size;
            let end = (start + batch_size).min(order.len());
            let items: Vec<Stl10Item> = order[start..end]
                .iter()
                .map(|&index| dataset.item(index))
                .collect();
            ImageBatch::from_items(&items, transform, device)
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// `count` images whose pixels all carry the image index, labelled `index % 10 + 1` on disk.
    pub(crate) fn synthetic_dataset(count: usize) -> Stl10Dataset {
        let mut images = Vec::with_capacity(count * IMAGE_BYTES);
        let mut labels = Vec::with_capacity(count);
        for index in 0..count {
            images.extend(std::iter::repeat(index as u8).take(IMAGE_BYTES));
            labels.push((index % NUM_CLASSES) as u8 + 1);
        }
        Stl10Dataset::from_raw(images, labels).unwrap()
    }

    #[test]
    fn decodes_column_major_channel_planes() {
        let mut raw = vec![0u8; IMAGE_BYTES];
        let plane = IMAGE_SIDE * IMAGE_SIDE;
        // Column 2, row 5.
        let offset = 2 * IMAGE_SIDE + 5;
        raw[offset] = 10;
        raw[plane + offset] = 20;
        raw[2 * plane + offset] = 30;

        let image = decode_image(&raw);
        assert_eq!(image.get_pixel(2, 5).0, [10, 20, 30]);
        assert_eq!(image.get_pixel(5, 2).0, [0, 0, 0]);
    }

    #[test]
    fn labels_shift_to_zero_based() {
        let dataset = synthetic_dataset(12);
        assert_eq!(dataset.len(), 12);
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert_eq!(dataset.get(9).unwrap().label, 9);
        assert_eq!(dataset.get(11).unwrap().label, 1);
        assert!(dataset.get(12).is_none());
    }

    #[test]
    fn malformed_raw_data_is_rejected() {
        assert!(Stl10Dataset::from_raw(vec![0; IMAGE_BYTES + 1], vec![1]).is_err());
        assert!(Stl10Dataset::from_raw(vec![0; IMAGE_BYTES], vec![1, 2]).is_err());
        assert!(Stl10Dataset::from_raw(vec![0; IMAGE_BYTES], vec![0]).is_err());
        assert!(Stl10Dataset::from_raw(vec![0; IMAGE_BYTES], vec![11]).is_err());
    }

    #[test]
    fn loads_an_extracted_split_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_X.bin"), vec![255u8; 2 * IMAGE_BYTES]).unwrap();
        fs::write(dir.path().join("test_y.bin"), [3u8, 10]).unwrap();
        fs::write(dir.path().join(CLASS_NAMES), "airplane\nbird\n").unwrap();

        let dataset = Stl10Dataset::load(dir.path(), Split::Test).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).unwrap().label, 9);
        assert_eq!(dataset.class_names(), ["airplane", "bird"]);
        assert!(Stl10Dataset::load(dir.path(), Split::Train).is_err());
    }

    #[test]
    fn transform_resizes_and_normalizes() {
        let transform = ImageTransform::new(32, [0.5; 3], [0.5; 3]);

        let white = transform.apply(&RgbImage::from_pixel(96, 96, Rgb([255, 255, 255])));
        assert_eq!(white.len(), 3 * 32 * 32);
        assert!(white.iter().all(|&value| (value - 1.0).abs() < 1e-6));

        let black = transform.apply(&RgbImage::from_pixel(96, 96, Rgb([0, 0, 0])));
        assert!(black.iter().all(|&value| (value + 1.0).abs() < 1e-6));
    }

    #[test]
    fn transform_lays_out_channels_first() {
        let transform = ImageTransform::new(2, [0.0; 3], [1.0; 3]);
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([255, 0, 51]));

        let values = transform.apply(&image);
        // Channel planes of 4 values each, row-major inside a plane.
        assert_eq!(values[1], 1.0);
        assert_eq!(values[4 + 1], 0.0);
        assert!((values[8 + 1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn loader_keeps_the_partial_tail_batch() {
        let dataset = synthetic_dataset(70);
        let transform = ImageTransform::new(8, [0.5; 3], [0.5; 3]);
        let mut loader =
            Stl10Loader::<TestBackend>::new(&dataset, transform, 32, Default::default());

        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader.epoch().map(|batch| batch.len()).collect();
        assert_eq!(sizes, [32, 32, 6]);

        let first = loader.epoch().next().unwrap();
        assert_eq!(first.images.dims(), [32, 3, 8, 8]);
        let targets = first.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, (0..32).map(|i| i % 10).collect::<Vec<i64>>());
    }

    #[test]
    fn shuffled_epochs_cover_every_example_once() {
        let dataset = synthetic_dataset(50);
        // Native size, so pixel values survive untouched.
        let transform = ImageTransform::new(IMAGE_SIDE, [0.0; 3], [1.0; 3]);
        let mut loader = Stl10Loader::<TestBackend>::new(&dataset, transform, 16, Default::default())
            .shuffled(9);

        let mut epochs = Vec::new();
        for _ in 0..2 {
            let mut seen: Vec<i64> = Vec::new();
            for batch in loader.epoch() {
                // Every pixel of image `i` is `i / 255`, so the first value identifies it.
                let values = batch.images.into_data().convert::<f32>().to_vec::<f32>().unwrap();
                let per_image = IMAGE_BYTES;
                seen.extend(
                    values
                        .chunks(per_image)
                        .map(|chunk| (chunk[0] * 255.0).round() as i64),
                );
            }
            epochs.push(seen);
        }

        for seen in &epochs {
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..50).collect::<Vec<i64>>());
        }
        assert_ne!(epochs[0], epochs[1]);
    }

    #[test]
    fn max_batches_truncates_each_epoch() {
        let dataset = synthetic_dataset(100);
        let transform = ImageTransform::new(4, [0.5; 3], [0.5; 3]);
        let mut loader = Stl10Loader::<TestBackend>::new(&dataset, transform, 32, Default::default())
            .with_max_batches(Some(2));

        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.epoch().count(), 2);
    }

    /// A tar stream holding `entries` under the release's top-level directory.
    fn tar_archive(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{DATASET_DIR}/{name}"), &data[..])
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn release_entries() -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("train_X.bin", vec![7u8; 3 * IMAGE_BYTES]),
            ("train_y.bin", vec![1, 5, 10]),
            ("test_X.bin", vec![9u8; IMAGE_BYTES]),
            ("test_y.bin", vec![2]),
            ("unlabeled_X.bin", vec![0u8; 16]),
            (CLASS_NAMES, b"airplane\nbird\n".to_vec()),
        ]
    }

    fn part_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".part")
            })
            .count()
    }

    #[test]
    fn extracts_needed_entries_into_place() {
        let dir = tempfile::tempdir().unwrap();
        extract(&tar_archive(&release_entries())[..], dir.path()).unwrap();

        assert!(is_extracted(dir.path()));
        assert!(!dir.path().join("unlabeled_X.bin").exists());
        assert_eq!(part_files(dir.path()), 0);

        let train = Stl10Dataset::load(dir.path(), Split::Train).unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(train.get(2).unwrap().label, 9);
    }

    #[test]
    fn interrupted_extraction_is_not_mistaken_for_a_cache() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tar_archive(&release_entries());

        // One 512-byte header, then only a third of the first entry's image data.
        let cut = 512 + IMAGE_BYTES;
        assert!(extract(&archive[..cut], dir.path()).is_err());
        assert!(!dir.path().join("train_X.bin").exists());
        assert!(!is_extracted(dir.path()));

        extract(&archive[..], dir.path()).unwrap();
        assert!(is_extracted(dir.path()));
        assert_eq!(
            fs::metadata(dir.path().join("train_X.bin")).unwrap().len(),
            3 * IMAGE_BYTES as u64
        );
        assert_eq!(part_files(dir.path()), 0);
    }

    #[test]
    fn leftover_part_files_do_not_count_as_cached() {
        let dir = tempfile::tempdir().unwrap();
        for name in EXTRACTED {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert!(is_extracted(dir.path()));

        fs::rename(
            dir.path().join("train_X.bin"),
            dir.path().join("train_X.bin.part"),
        )
        .unwrap();
        assert!(!is_extracted(dir.path()));
    }
}
