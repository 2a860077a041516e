use std::fs::File;
use std::path::{Path, PathBuf};
use reqwest::blocking::Client;
use crate::{ConversionConfig, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Existing,
    Downloaded { bytes: u64 },
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|x| x.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Fetches `url` into `dest`, replacing any existing file.
///
/// The body is streamed into a sibling `.part` file that is renamed over
/// `dest` once complete, so an interrupted transfer never masquerades as a
/// checkpoint.
pub fn download_checkpoint(url: &str, dest: &Path) -> Result<u64, Error> {
    let download_error = |source| Error::Download { url: url.to_string(), source };
    let client = Client::builder()
        .timeout(None)
        .build()
        .map_err(download_error)?;
    let mut response = client.get(url)
        .send()
        .and_then(|x| x.error_for_status())
        .map_err(download_error)?;

    let part = partial_path(dest);
    let mut file = File::create(&part).map_err(Error::io(&part))?;
    let bytes = match response.copy_to(&mut file) {
        Ok(bytes) => bytes,
        Err(err) => {
            drop(file);
            let _ = std::fs::remove_file(&part);
            return Err(download_error(err));
        }
    };
    file.sync_all().map_err(Error::io(&part))?;
    drop(file);
    std::fs::rename(&part, dest).map_err(Error::io(dest))?;
    Ok(bytes)
}

/// Makes sure the configured checkpoint is on disk, fetching it when it is
/// missing or when a fresh copy was requested.
pub fn ensure_checkpoint(config: &ConversionConfig) -> Result<Acquisition, Error> {
    let path = &config.checkpoint_path;
    if !config.force_download && path.exists() {
        log::info!("Model checkpoint {} already exists.", path.display());
        return Ok(Acquisition::Existing);
    }
    log::info!("Downloading model from {}...", config.model_url);
    let bytes = download_checkpoint(&config.model_url, path)?;
    log::info!("Model saved to {}", path.display());
    log::debug!("downloaded {bytes} bytes");
    Ok(Acquisition::Downloaded { bytes })
}
