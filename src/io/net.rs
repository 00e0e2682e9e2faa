use std::io::Write;
use std::path::Path;

use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use tracing::info;

use crate::error::Result;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("demix/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
});

pub fn http_client() -> &'static Client {
    &CLIENT
}

/// Download `url` to `dest`, staging through a temp file in the same
/// directory so a failed transfer never leaves a partial file behind.
pub fn download(client: &Client, url: &str, dest: &Path) -> Result<()> {
    info!(url, dest = %dest.display(), "downloading");
    let mut response = client.get(url).send()?.error_for_status()?;

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut staging = tempfile::NamedTempFile::new_in(dir)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut response, &mut buf)?;
        if n == 0 {
            break;
        }
        staging.write_all(&buf[..n])?;
    }
    staging.flush()?;
    staging
        .persist(dest)
        .map_err(|e| crate::error::Error::Io(e.error))?;
    Ok(())
}
