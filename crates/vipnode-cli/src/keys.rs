//! Node key files: one hex-encoded secp256k1 secret per file, the same
//! format as a geth or parity `nodekey`. Pointing a key path at the node's
//! own key file makes the pool identity the node's enode ID.

use anyhow::Context;
use std::path::Path;
use tracing::info;
use vipnode_pool::Signer;

/// SECURITY: Restrict file permissions to owner-only (0600) on Unix.
#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

/// Load the key at `path`, generating and saving a new one if it is missing.
pub fn load_or_create(path: &Path) -> anyhow::Result<Signer> {
    if path.exists() {
        let secret = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        let signer = Signer::from_hex(&secret)
            .with_context(|| format!("parsing key file {}", path.display()))?;
        return Ok(signer);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let signer = Signer::generate();
    std::fs::write(path, signer.to_hex())
        .with_context(|| format!("writing key file {}", path.display()))?;
    restrict_file_permissions(path);
    info!(path = %path.display(), node_id = %signer.node_id(), "Generated node key");
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_reload_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host.key");
        let created = load_or_create(&path).unwrap();
        let loaded = load_or_create(&path).unwrap();
        assert_eq!(created.node_id(), loaded.node_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_corrupt_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
