//! Resolution of a working git executable.
//!
//! Order: system PATH, then a previously downloaded portable copy under
//! `<data>/bin/git/`, then (Windows only) an automatic download of the
//! latest MinGit release. On other platforms a missing git is an error and
//! git-backed features stay disabled for the session.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::info;

/// Relative path of the git binary inside a portable MinGit tree.
fn portable_git_relpath() -> &'static str {
    if cfg!(target_os = "windows") {
        "cmd/git.exe"
    } else {
        "bin/git"
    }
}

/// Search the PATH environment for a git executable.
fn find_in_path() -> Option<PathBuf> {
    let exe_name = if cfg!(target_os = "windows") {
        "git.exe"
    } else {
        "git"
    };
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exe_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Make sure a working git executable is available and return its path.
pub async fn ensure_git(portable_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = find_in_path() {
        log_git_version(&path).await;
        return Ok(path);
    }

    let local = portable_dir.join(portable_git_relpath());
    if local.is_file() {
        let abs = crate::config::absolutize(&local);
        info!("Using local portable git: {}", abs.display());
        log_git_version(&abs).await;
        return Ok(abs);
    }

    if !cfg!(target_os = "windows") {
        bail!(
            "git not found in PATH; install it via your package manager (e.g. apt install git, brew install git)"
        );
    }

    info!("git not found, downloading portable MinGit for Windows...");
    download_mingit(portable_dir)
        .await
        .context("failed to download portable git")?;

    let abs = crate::config::absolutize(&local);
    if !abs.is_file() {
        bail!(
            "extraction succeeded but git binary not found at {}",
            abs.display()
        );
    }
    info!("Portable git ready: {}", abs.display());
    log_git_version(&abs).await;
    Ok(abs)
}

async fn log_git_version(exe: &Path) {
    if let Ok(out) = tokio::process::Command::new(exe)
        .arg("--version")
        .output()
        .await
        && out.status.success()
    {
        info!("git: {}", String::from_utf8_lossy(&out.stdout).trim());
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
    size: u64,
}

/// Pick the MinGit zip for the given architecture suffix, skipping the
/// busybox variant.
fn pick_mingit_asset<'a>(assets: &'a [Asset], arch_suffix: &str) -> Option<&'a Asset> {
    assets.iter().find(|a| {
        a.name.starts_with("MinGit-")
            && a.name.ends_with(&format!("{}.zip", arch_suffix))
            && !a.name.contains("busybox")
    })
}

fn arch_suffix() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("64-bit"),
        "x86" => Ok("32-bit"),
        arch => Err(anyhow!(
            "unsupported architecture {}; install git manually from https://git-scm.com/",
            arch
        )),
    }
}

/// Fetch the latest MinGit distribution and extract it into `dest`.
async fn download_mingit(dest: &Path) -> Result<()> {
    let suffix = arch_suffix()?;

    info!("Querying latest MinGit release...");
    let client = reqwest::Client::new();
    let release: Release = client
        .get("https://api.github.com/repos/git-for-windows/git/releases/latest")
        .header("User-Agent", "odoo-manager")
        .send()
        .await
        .context("failed to query git releases")?
        .error_for_status()
        .context("release query rejected; install git manually from https://git-scm.com/")?
        .json()
        .await
        .context("failed to parse release info")?;

    let asset = pick_mingit_asset(&release.assets, suffix)
        .with_context(|| {
            format!(
                "could not find MinGit {} asset in release {}; install git manually from https://git-scm.com/",
                suffix, release.tag_name
            )
        })?
        .clone();

    info!(
        "Downloading {} ({:.1} MB)...",
        asset.name,
        asset.size as f64 / (1024.0 * 1024.0)
    );

    let bytes = client
        .get(&asset.browser_download_url)
        .header("User-Agent", "odoo-manager")
        .send()
        .await
        .context("download failed")?
        .error_for_status()
        .context("download rejected")?
        .bytes()
        .await
        .context("download interrupted")?;

    info!(
        "Download complete ({:.1} MB), extracting to {}...",
        bytes.len() as f64 / (1024.0 * 1024.0),
        dest.display()
    );

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip(&bytes, &dest))
        .await
        .context("extraction task panicked")??;

    info!("MinGit installation complete");
    Ok(())
}

/// Extract a zip archive into `dest`, skipping any entry that would escape
/// the destination directory.
fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).context("create git dir")?;

    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).context("open zip archive")?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;

        // enclosed_name rejects absolute paths and .. traversal (zip-slip).
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out).context("write zip entry")?;
    }

    Ok(())
}
