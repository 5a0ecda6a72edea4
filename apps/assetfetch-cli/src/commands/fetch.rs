use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use assetfetch_core::{
    AssetId, Collaborators, Completion, DecodedImage, FetchCoordinator, FetchRequest,
    StaticOrigin,
};
use clap::Args;
use tokio::time::Instant;
use tracing::warn;

use super::effective_config;
use crate::decoder::ImageCrateDecoder;
use crate::disk_cache::DiskCache;
use crate::transport::ReqwestTransport;

/// `<uuid>`, `<uuid>=<locator>` or a bare locator (fetched under a fresh id).
#[derive(Clone, Debug, PartialEq)]
pub struct AssetArg {
    pub id: AssetId,
    pub locator: String,
}

impl FromStr for AssetArg {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if let Some((id, locator)) = input.split_once('=') {
            if let Ok(id) = id.parse::<AssetId>() {
                return Ok(Self {
                    id,
                    locator: locator.to_string(),
                });
            }
        }
        if let Ok(id) = input.parse::<AssetId>() {
            return Ok(Self {
                id,
                locator: String::new(),
            });
        }
        if input.contains("://") {
            return Ok(Self {
                id: AssetId::random(),
                locator: input.to_string(),
            });
        }
        Err(format!("`{input}` is neither an asset id nor a locator"))
    }
}

#[derive(Args, Clone)]
pub struct FetchArgs {
    /// Assets to fetch
    #[arg(required = true)]
    pub assets: Vec<AssetArg>,
    /// Base URL of the asset service; ids are fetched as `<origin>/?texture_id=<id>`
    #[arg(long, env = "ASSETFETCH_ORIGIN")]
    pub origin: Option<String>,
    /// Directory of the on-disk asset cache
    #[arg(long, default_value = ".assetfetch-cache")]
    pub cache_dir: PathBuf,
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Discard level to fetch (0 = full resolution)
    #[arg(long, default_value_t = 0)]
    pub discard: u8,
    /// Write decoded images as PNG into this directory
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Give up on unfinished assets after this many seconds
    #[arg(long, default_value_t = 60)]
    pub wait_secs: u64,
    /// Print coordinator statistics (JSON) when done
    #[arg(long)]
    pub stats: bool,
}

pub async fn cmd_fetch(args: FetchArgs) -> Result<()> {
    let config = effective_config(args.config.as_deref())?;
    let collaborators = Collaborators {
        cache: Arc::new(DiskCache::open(&args.cache_dir).await?),
        http: Arc::new(ReqwestTransport::new()?),
        decoder: Arc::new(ImageCrateDecoder),
        packets: None,
        origins: Arc::new(StaticOrigin {
            http_origin: args.origin.clone(),
            packet_host: None,
        }),
    };
    let tick = config.tick();
    let coordinator = FetchCoordinator::new(config, collaborators);
    for asset in &args.assets {
        let request = FetchRequest::new(asset.id, asset.locator.clone()).with_discard(args.discard);
        coordinator
            .create_or_update_request(request)
            .with_context(|| format!("requesting {}", asset.id))?;
    }

    let total = args.assets.len();
    let mut pending: Vec<&AssetArg> = args.assets.iter().collect();
    let mut failed = 0usize;
    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    while !pending.is_empty() && Instant::now() < deadline {
        pending.retain(|asset| match coordinator.poll_completion(asset.id, None) {
            Completion::Ready(image) => {
                report(asset, &image, args.out.as_deref());
                false
            }
            Completion::Failed | Completion::Unknown => {
                println!("{}\tfailed", asset.id);
                failed += 1;
                false
            }
            Completion::Pending | Completion::Partial(_) => true,
        });
        tokio::time::sleep(tick).await;
    }
    for asset in &pending {
        println!("{}\ttimed out", asset.id);
        coordinator.cancel(asset.id);
    }
    failed += pending.len();

    if args.stats {
        println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);
    }
    coordinator.shutdown().await;
    if failed > 0 {
        bail!("{failed} of {total} assets not fetched");
    }
    Ok(())
}

fn report(asset: &AssetArg, image: &DecodedImage, out: Option<&Path>) {
    let raw = &image.raw;
    println!(
        "{}\tready\t{}x{}x{}\tdiscard {}",
        asset.id, raw.width, raw.height, raw.components, image.discard
    );
    let Some(dir) = out else {
        return;
    };
    if let Err(err) = save_png(dir, asset.id, image) {
        warn!(asset = %asset.id, error = %err, "failed to save decoded image");
    }
}

fn save_png(dir: &Path, id: AssetId, image: &DecodedImage) -> Result<()> {
    let raw = &image.raw;
    let color = match raw.components {
        1 => image::ExtendedColorType::L8,
        2 => image::ExtendedColorType::La8,
        3 => image::ExtendedColorType::Rgb8,
        4 => image::ExtendedColorType::Rgba8,
        n => bail!("cannot save a {n}-component image"),
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{id}.png"));
    image::save_buffer(&path, &raw.pixels, raw.width, raw.height, color)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_asset_arguments() {
        let id = "6e2c4a4e-0f3b-4b5e-9a47-6f5cf1f1a001";
        let bare: AssetArg = id.parse().expect("id");
        assert_eq!(bare.id.to_string(), id);
        assert!(bare.locator.is_empty());

        let pinned: AssetArg = format!("{id}=http://cdn.test/a.png").parse().expect("pair");
        assert_eq!(pinned.id.to_string(), id);
        assert_eq!(pinned.locator, "http://cdn.test/a.png");

        let url: AssetArg = "https://cdn.test/b.png?x=1".parse().expect("url");
        assert_eq!(url.locator, "https://cdn.test/b.png?x=1");

        assert!("not-an-asset".parse::<AssetArg>().is_err());
    }
}
