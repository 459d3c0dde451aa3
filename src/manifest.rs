//! Types for the two JSON documents consumed from an extracted image: the
//! legacy-tarball manifest and the image config. Field names mirror the
//! `docker save` / OCI legacy-tarball layout byte-for-byte, since these are
//! parsed straight off what the registry client (or a previously-pulled
//! image on disk) hands us.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

pub type Manifest = Vec<ManifestEntry>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigDetails {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "config", default)]
    pub config: ImageConfigDetails,
}

/// First 12 hex characters of a digest string, tolerating an optional
/// `sha256:` (or other algorithm) prefix.
pub fn first12(digest: &str) -> String {
    let hex = digest.split(':').next_back().unwrap_or(digest);
    hex.chars().take(12).collect()
}

/// Validates the "exactly one record, at least one layer" invariant and
/// returns the sole entry.
pub fn single_entry(manifest: &Manifest) -> Result<&ManifestEntry, String> {
    if manifest.is_empty() || manifest[0].layers.is_empty() {
        return Err("could not find any layers".to_string());
    }
    if manifest.len() > 1 {
        return Err("more than one manifest record is not supported".to_string());
    }
    Ok(&manifest[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first12_strips_algorithm_prefix() {
        assert_eq!(
            first12("sha256:abcdef0123456789ffff"),
            "abcdef012345"
        );
    }

    #[test]
    fn first12_tolerates_bare_hex() {
        assert_eq!(first12("abcdef0123456789ffff"), "abcdef012345");
    }

    #[test]
    fn single_entry_rejects_empty_manifest() {
        let manifest: Manifest = vec![];
        assert!(single_entry(&manifest).is_err());
    }

    #[test]
    fn single_entry_rejects_multiple_records() {
        let entry = ManifestEntry {
            config: "cfg.json".into(),
            repo_tags: vec![],
            layers: vec!["layer1/layer.tar".into()],
        };
        let manifest: Manifest = vec![entry.clone(), entry];
        assert!(single_entry(&manifest).is_err());
    }

    #[test]
    fn single_entry_rejects_zero_layers() {
        let manifest: Manifest = vec![ManifestEntry {
            config: "cfg.json".into(),
            repo_tags: vec![],
            layers: vec![],
        }];
        assert!(single_entry(&manifest).is_err());
    }
}
