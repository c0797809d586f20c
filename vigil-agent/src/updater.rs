use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::transport::{UpdateSource, VersionInfo};

#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { version: String },
    UpToDate,
}

/// Name of the installed agent artifact.
pub const ARTIFACT_NAME: &str = if cfg!(windows) {
    "vigil-agent.exe"
} else {
    "vigil-agent"
};

const REQUIREMENTS_NAME: &str = "requirements.txt";

/// Downloads and installs a newer agent build.
///
/// Everything is staged in a temporary directory first; the running
/// installation is only touched after every download has succeeded, so a
/// partial download can never produce a partial install.
pub struct Updater {
    source: Arc<dyn UpdateSource>,
    install_dir: PathBuf,
    running_version: Version,
}

impl Updater {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        install_dir: Option<PathBuf>,
        running_version: &str,
    ) -> AgentResult<Self> {
        let install_dir = match install_dir {
            Some(dir) => dir,
            None => default_install_dir()?,
        };
        Ok(Self {
            source,
            install_dir,
            running_version: parse_version(running_version)?,
        })
    }

    /// Query the controller and apply an update if one is advertised. When
    /// the advertised version is not strictly newer this performs no
    /// filesystem writes at all.
    pub async fn check_and_apply(&self) -> AgentResult<UpdateOutcome> {
        let info = self.source.fetch_version().await.map_err(|e| match e {
            AgentError::UpdateError(m) => AgentError::UpdateError(m),
            other => AgentError::UpdateError(other.to_string()),
        })?;

        let advertised = parse_version(&info.version)?;
        if advertised <= self.running_version {
            info!(
                "No update available (running {}, advertised {})",
                self.running_version, advertised
            );
            return Ok(UpdateOutcome::UpToDate);
        }

        info!(
            "New version available: {} (current: {})",
            advertised, self.running_version
        );
        self.download_and_install(&info).await?;
        Ok(UpdateOutcome::Applied {
            version: info.version,
        })
    }

    async fn download_and_install(&self, info: &VersionInfo) -> AgentResult<()> {
        let staging = tempfile::Builder::new()
            .prefix("vigil-update-")
            .tempdir()
            .map_err(|e| AgentError::UpdateError(format!("staging dir: {}", e)))?;

        let mut staged: Vec<(PathBuf, &'static str)> = Vec::new();

        info!("Downloading agent artifact from {}", info.download_url);
        let artifact = self.source.download(&info.download_url).await?;
        if let Some(expected) = &info.sha256 {
            verify_checksum(&artifact, expected)?;
        }
        let artifact_path = staging.path().join(ARTIFACT_NAME);
        tokio::fs::write(&artifact_path, &artifact)
            .await
            .map_err(|e| AgentError::UpdateError(format!("staging artifact: {}", e)))?;
        staged.push((artifact_path, ARTIFACT_NAME));

        if let Some(req_url) = &info.requirements_url {
            info!("Downloading dependency manifest from {}", req_url);
            let manifest = self.source.download(req_url).await?;
            let manifest_path = staging.path().join(REQUIREMENTS_NAME);
            tokio::fs::write(&manifest_path, &manifest)
                .await
                .map_err(|e| AgentError::UpdateError(format!("staging manifest: {}", e)))?;
            staged.push((manifest_path, REQUIREMENTS_NAME));
        }

        // Every download succeeded; now and only now touch the install dir.
        install_files(&staged, &self.install_dir)?;
        info!(
            "Update to v{} staged into {:?}; restart required for it to take effect",
            info.version, self.install_dir
        );
        Ok(())
    }
}

/// Copy staged files into the install directory. The artifact never gets
/// written over directly: overwriting an executing binary fails with ETXTBSY
/// on Linux, so a sibling copy is renamed into place instead (rename replaces
/// a busy binary). On platforms that lock the running image even against
/// rename, the old binary is moved aside first.
fn install_files(staged: &[(PathBuf, &'static str)], target_dir: &Path) -> AgentResult<()> {
    std::fs::create_dir_all(target_dir)
        .map_err(|e| AgentError::UpdateError(format!("install dir: {}", e)))?;

    for (src, name) in staged {
        let dst = target_dir.join(name);

        if *name != ARTIFACT_NAME {
            std::fs::copy(src, &dst)
                .map_err(|e| AgentError::UpdateError(format!("installing {}: {}", name, e)))?;
            continue;
        }

        let incoming = dst.with_extension("new");
        std::fs::copy(src, &incoming)
            .map_err(|e| AgentError::UpdateError(format!("staging {}: {}", name, e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&incoming, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| AgentError::UpdateError(format!("chmod {}: {}", name, e)))?;
        }

        if must_rename_running_artifact() && dst.exists() {
            let backup = dst.with_extension("old");
            if backup.exists() {
                let _ = std::fs::remove_file(&backup);
            }
            if let Err(e) = std::fs::rename(&dst, &backup) {
                // Try the swap anyway; the lock is not always strict.
                warn!("Could not rename running artifact aside: {}", e);
            }
        }

        std::fs::rename(&incoming, &dst)
            .map_err(|e| AgentError::UpdateError(format!("installing {}: {}", name, e)))?;
    }
    Ok(())
}

/// Windows locks the image of a running executable; the rename-aside step is
/// required there and a no-op everywhere else.
fn must_rename_running_artifact() -> bool {
    cfg!(windows)
}

fn default_install_dir() -> AgentResult<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| AgentError::UpdateError("executable has no parent directory".to_string()))
}

/// Lenient semantic-version parse: two-component versions like "1.41" (the
/// historic agent versioning scheme) are padded to "1.41.0".
pub fn parse_version(s: &str) -> AgentResult<Version> {
    let s = s.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(s) {
        return Ok(v);
    }
    let dots = s.chars().filter(|&c| c == '.').count();
    let padded = match dots {
        0 => format!("{}.0.0", s),
        1 => format!("{}.0", s),
        _ => s.to_string(),
    };
    Version::parse(&padded)
        .map_err(|e| AgentError::UpdateError(format!("invalid version '{}': {}", s, e)))
}

fn verify_checksum(bytes: &[u8], expected: &str) -> AgentResult<()> {
    let digest = Sha256::digest(bytes);
    let actual: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(AgentError::UpdateError(format!(
            "artifact checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubSource {
        info: VersionInfo,
        artifact: Vec<u8>,
        downloads: AtomicU64,
    }

    #[async_trait]
    impl UpdateSource for StubSource {
        async fn fetch_version(&self) -> AgentResult<VersionInfo> {
            Ok(self.info.clone())
        }

        async fn download(&self, _path: &str) -> AgentResult<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.artifact.clone())
        }
    }

    fn stub_updater(
        advertised: &str,
        artifact: &[u8],
        install_dir: &Path,
    ) -> (Updater, Arc<StubSource>) {
        let digest = Sha256::digest(artifact);
        let sha256: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let source = Arc::new(StubSource {
            info: VersionInfo {
                version: advertised.to_string(),
                download_url: "/api/agent/download".to_string(),
                requirements_url: None,
                sha256: Some(sha256),
            },
            artifact: artifact.to_vec(),
            downloads: AtomicU64::new(0),
        });
        let updater = Updater::new(
            source.clone(),
            Some(install_dir.to_path_buf()),
            "1.41.0",
        )
        .unwrap();
        (updater, source)
    }

    #[test]
    fn test_parse_version_pads_short_forms() {
        assert_eq!(parse_version("1.41").unwrap(), Version::new(1, 41, 0));
        assert_eq!(parse_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("v1.50.0").unwrap(), Version::new(1, 50, 0));
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        assert!(parse_version("not-a-version").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn test_strictly_greater_comparison() {
        let running = parse_version("1.41").unwrap();
        // Equal or older advertised versions never trigger an update.
        assert!(parse_version("1.41.0").unwrap() <= running);
        assert!(parse_version("1.40").unwrap() <= running);
        assert!(parse_version("1.41.1").unwrap() > running);
        assert!(parse_version("1.42").unwrap() > running);
    }

    #[test]
    fn test_checksum_verification() {
        // sha256("hello")
        let expected = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(verify_checksum(b"hello", expected).is_ok());
        assert!(verify_checksum(b"hello", &expected.to_uppercase()).is_ok());
        assert!(verify_checksum(b"tampered", expected).is_err());
    }

    #[test]
    fn test_install_copies_staged_files() {
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let src = staging.path().join(ARTIFACT_NAME);
        std::fs::write(&src, b"#!/bin/true new build").unwrap();

        install_files(&[(src, ARTIFACT_NAME)], target.path()).unwrap();

        let installed = target.path().join(ARTIFACT_NAME);
        assert_eq!(std::fs::read(&installed).unwrap(), b"#!/bin/true new build");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
            assert_eq!(mode & 0o755, 0o755);
        }
    }

    #[tokio::test]
    async fn test_check_and_apply_not_newer_touches_nothing() {
        let target = tempfile::tempdir().unwrap();
        for advertised in ["1.41.0", "1.41", "1.40.9"] {
            let (updater, source) = stub_updater(advertised, b"new build", target.path());
            let outcome = updater.check_and_apply().await.unwrap();
            assert_eq!(outcome, UpdateOutcome::UpToDate);
            assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
            assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
        }
    }

    #[tokio::test]
    async fn test_check_and_apply_installs_newer_build() {
        let target = tempfile::tempdir().unwrap();
        let (updater, source) = stub_updater("1.50.0", b"new build", target.path());

        let outcome = updater.check_and_apply().await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                version: "1.50.0".to_string()
            }
        );
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read(target.path().join(ARTIFACT_NAME)).unwrap(),
            b"new build"
        );
    }

    #[tokio::test]
    async fn test_check_and_apply_rejects_checksum_mismatch() {
        let target = tempfile::tempdir().unwrap();
        let (_, source) = stub_updater("1.50.0", b"new build", target.path());
        let source = Arc::new(StubSource {
            info: VersionInfo {
                sha256: Some("deadbeef".to_string()),
                ..source.info.clone()
            },
            artifact: b"new build".to_vec(),
            downloads: AtomicU64::new(0),
        });
        let updater =
            Updater::new(source, Some(target.path().to_path_buf()), "1.41.0").unwrap();

        let err = updater.check_and_apply().await.unwrap_err();
        assert!(matches!(err, AgentError::UpdateError(_)));
        // Nothing reached the install dir.
        assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_install_overwrites_existing_artifact() {
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        std::fs::write(target.path().join(ARTIFACT_NAME), b"old build").unwrap();
        let src = staging.path().join(ARTIFACT_NAME);
        std::fs::write(&src, b"new build").unwrap();

        install_files(&[(src, ARTIFACT_NAME)], target.path()).unwrap();
        assert_eq!(
            std::fs::read(target.path().join(ARTIFACT_NAME)).unwrap(),
            b"new build"
        );
    }

    // Linux refuses writes to an executing binary (ETXTBSY) but allows the
    // rename swap; the install must succeed while the old build is running.
    #[cfg(unix)]
    #[test]
    fn test_install_replaces_running_artifact() {
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let sleep_bin = ["/bin/sleep", "/usr/bin/sleep"]
            .into_iter()
            .find(|p| Path::new(p).is_file())
            .unwrap();
        let installed = target.path().join(ARTIFACT_NAME);
        std::fs::copy(sleep_bin, &installed).unwrap();
        let mut child = std::process::Command::new(&installed)
            .arg("30")
            .spawn()
            .unwrap();

        let src = staging.path().join(ARTIFACT_NAME);
        std::fs::write(&src, b"new build").unwrap();
        install_files(&[(src, ARTIFACT_NAME)], target.path()).unwrap();

        assert_eq!(std::fs::read(&installed).unwrap(), b"new build");
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
