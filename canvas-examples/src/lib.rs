//! Helpers shared by the canvas-diffusion examples.

use anyhow::Result;
use candle::utils::{cuda_is_available, metal_is_available};
use candle::Device;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

/// Picks the accelerator unless `cpu` is set.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!("Running on CPU, to run on GPU(metal), build this example with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Installs a `fmt` subscriber at info level (debug when `verbose`), plus
/// the Chrome trace layer when `chrome` is set.
///
/// Returns a guard that must be kept alive for the duration of tracing.
pub fn setup_tracing(chrome: bool, verbose: bool) -> Option<tracing_chrome::FlushGuard> {
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    let filter = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(fmt).init();
        None
    }
}

/// Resolves a local path, or downloads `file` from the hub repository `repo`.
pub fn hub_or_local(local: Option<&str>, repo: &str, file: &str) -> Result<std::path::PathBuf> {
    match local {
        Some(path) => Ok(std::path::PathBuf::from(path)),
        None => {
            let api = hf_hub::api::sync::Api::new()?;
            Ok(api.model(repo.to_string()).get(file)?)
        }
    }
}
