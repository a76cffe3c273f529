use anyhow::{Context, Result};
use burn::backend::NdArray;
use clap::Parser;
use cyclegan_burn::data::{build_dataloaders, DataConfig, Split};
use cyclegan_burn::utils::{side_by_side, tensor_to_image};
use std::path::PathBuf;

type Backend = NdArray<f32>;

#[derive(Parser, Debug)]
#[command(about = "Preview transformed source/target pairs")]
struct Args {
    #[arg(long)]
    root_dir: PathBuf,
    #[arg(long, default_value = "train")]
    split: Split,
    #[arg(long, default_value_t = 4)]
    count: usize,
    #[arg(long, default_value_t = 576)]
    resize_h: usize,
    #[arg(long, default_value_t = 1024)]
    resize_w: usize,
    #[arg(long, default_value_t = false)]
    fixed_pair: bool,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long)]
    save_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let device = Default::default();

    let config = DataConfig::new(args.root_dir.to_string_lossy().into_owned())
        .with_resize_h(args.resize_h)
        .with_resize_w(args.resize_w)
        .with_batch_size(args.count.max(1))
        .with_fixed_pair(args.fixed_pair)
        .with_seed(args.seed);

    let dataloaders = build_dataloaders::<Backend>(&[args.split], &config, &device)?;
    let batch = dataloaders[&args.split]
        .iter()
        .next()
        .context("dataset produced no batches")?;

    std::fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;

    let pairs = batch.source.dims()[0];
    for idx in 0..pairs {
        let source = tensor_to_image(batch.source.clone().slice([idx..idx + 1]).squeeze::<3>(0))?;
        let target = tensor_to_image(batch.target.clone().slice([idx..idx + 1]).squeeze::<3>(0))?;
        let sheet = side_by_side(&[source, target])?;
        let path = args.save_dir.join(format!("pair_{idx:02}.png"));
        sheet
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
    }

    println!(
        "wrote {} {} pairs to {}",
        pairs,
        args.split.as_str(),
        args.save_dir.display()
    );
    Ok(())
}
