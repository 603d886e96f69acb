//! Runs inside the injected init container: rebuilds the CA bundle from
//! `CA_CERTS_DATA_<i>`, lets `update-ca-certificates` produce a trust store and
//! copies it into the shared volume.

#![warn(clippy::dbg_macro, clippy::todo)]

use std::path::{Path, PathBuf};

use cert_injection_webhook::{
    certs::{self, CA_CERTS_ENV_PREFIX},
    mutation::SETUP_CA_CERTS_WORKING_DIR,
    Error,
};
use log::{error, info};
use tokio::{fs, process::Command};

struct TempDir(PathBuf);

impl TempDir {
    async fn new(name: &str) -> Result<Self, Error> {
        let path = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        fs::create_dir_all(&path).await?;
        Ok(TempDir(path))
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

async fn write_certs(dir: &Path, certs: &[String]) -> Result<(), Error> {
    for (i, cert) in certs.iter().enumerate() {
        fs::write(dir.join(format!("cert_injection_webhook_{i}.crt")), cert).await?;
    }
    Ok(())
}

/// Copies `src` into `dest`, following symlinks and keeping file modes.
async fn copy_dir(src: &Path, dest: &Path) -> Result<(), Error> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((src, dest)) = pending.pop() {
        fs::create_dir_all(&dest).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dest.join(entry.file_name());
            if fs::metadata(entry.path()).await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

async fn setup() -> Result<(), Error> {
    let local = TempDir::new("local").await?;
    let etc_certs = TempDir::new("certs").await?;

    info!("Parsing certificate(s)...");
    let (bundle, fragments) = certs::parse(CA_CERTS_ENV_PREFIX, std::env::vars())?;
    let certs = certs::split(&bundle);

    info!(
        "Populate {} certificate(s) from {fragments} fragment(s)...",
        certs.len()
    );
    write_certs(&local.0, &certs).await?;

    info!("Update CA certificates...");
    let output = Command::new("update-ca-certificates")
        .arg("--etccertsdir")
        .arg(&etc_certs.0)
        .arg("--localcertsdir")
        .arg(&local.0)
        .output()
        .await?;
    info!("{}", String::from_utf8_lossy(&output.stdout));
    if !output.status.success() {
        return Err(Error::CertError(format!(
            "update-ca-certificates failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    info!("Copying CA certificates...");
    copy_dir(&etc_certs.0, Path::new(SETUP_CA_CERTS_WORKING_DIR)).await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    match setup().await {
        Ok(()) => info!("Finished setting up CA certificates"),
        Err(e) => {
            error!("failed to set up CA certificates: {e}");
            std::process::exit(1);
        }
    }
}
