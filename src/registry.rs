//! The registry client: the one concrete implementation of the "pull -> tarball
//! plus JSON manifest and config" contract the rest of the system treats as
//! out of scope. Talks to `index.docker.io` over the Docker Registry HTTP API
//! v2 via `dkregistry`, then folds the fetched manifest/config/layer blobs
//! into a `docker save`-shaped legacy tarball on disk so the image acquirer
//! can extract it exactly as if it had loaded an offline tar.
use std::fs;
use std::io::{Read, Write};

use dkregistry::v2::{
    manifest::{Manifest as RegistryManifest, ManifestSchema2},
    Client,
};
use flate2::read::GzDecoder;
use log::info;
use tar::{Builder, Header};

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest;
use crate::paths;

const REGISTRY_HOST: &str = "index.docker.io";

/// Splits `name[:tag]` into `(name, tag)`, defaulting the tag to `latest`.
/// `name` is kept exactly as the caller typed it - this is the literal
/// string stored in the image index and shown back by `ps`/`images`, not a
/// registry-internal repo path.
pub fn parse_image_name(src: &str) -> RuntimeResult<(String, String)> {
    let parts: Vec<&str> = src.split(':').collect();
    match parts.len() {
        1 => Ok((parts[0].to_string(), "latest".to_string())),
        2 => Ok((parts[0].to_string(), parts[1].to_string())),
        _ => Err(RuntimeError::Precondition(format!(
            "too many colons in image reference: {}",
            src
        ))),
    }
}

/// Docker Hub requires bare names (no `/`) to be addressed under the
/// `library/` namespace at the wire level. This qualification is local to
/// the HTTP calls below; the caller's `name` is never rewritten.
fn docker_hub_repo_name(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    }
}

/// Pulls `name:tag`, assembles `<tmp>/<image_hash>/package.tar`, and returns
/// `(image_hash, tarball_path)`.
pub async fn pull(name: &str, tag: &str) -> RuntimeResult<(String, String)> {
    info!("downloading metadata for {}:{}", name, tag);
    let repo = docker_hub_repo_name(name);

    let client = Client::configure()
        .registry(REGISTRY_HOST)
        .insecure_registry(false)
        .username(None)
        .password(None)
        .build()
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    let login_scope = format!("repository:{}:pull", repo);
    let dclient = client
        .authenticate(&[&login_scope])
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    let fetched = dclient
        .get_manifest(&repo, tag)
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    let s2: ManifestSchema2 = match fetched {
        RegistryManifest::S2(m) => m,
        _ => return Err(RuntimeError::Registry("image manifest type invalid".to_string())),
    };

    let config_digest = s2.manifest_spec.config().digest.clone();
    let config_hex = digest_hex(&config_digest);
    let image_hash = manifest::first12(&config_hex);
    info!("image hash: {}", image_hash);

    let layer_digests = s2.get_layers();

    let tmp_dir = format!("{}/{}", paths::TMP_PATH, image_hash);
    fs::create_dir_all(&tmp_dir)?;
    let tarball_path = format!("{}/package.tar", tmp_dir);

    let config_blob = dclient
        .get_blob(&repo, &config_digest)
        .await
        .map_err(|e| RuntimeError::Registry(e.to_string()))?;

    let mut layer_entries = Vec::new();
    for digest in &layer_digests {
        info!("pulling layer: {}", digest_hex(digest));
        let blob = dclient
            .get_blob(&repo, digest)
            .await
            .map_err(|e| RuntimeError::Registry(e.to_string()))?;
        layer_entries.push((digest_hex(digest), blob));
        info!("pull complete layer: {}", digest_hex(digest));
    }

    write_legacy_tarball(&tarball_path, name, tag, &config_hex, &config_blob, &layer_entries)?;

    Ok((image_hash, tarball_path))
}

fn digest_hex(digest: &str) -> String {
    digest.rsplit(':').next().unwrap_or(digest).to_string()
}

fn write_legacy_tarball(
    tarball_path: &str,
    name: &str,
    tag: &str,
    config_hex: &str,
    config_blob: &[u8],
    layers: &[(String, Vec<u8>)],
) -> RuntimeResult<()> {
    let file = fs::File::create(tarball_path)?;
    let mut builder = Builder::new(file);

    let layer_paths: Vec<String> = layers
        .iter()
        .map(|(hex, _)| format!("{}/layer.tar", hex))
        .collect();
    let entry = manifest::ManifestEntry {
        config: format!("{}.json", config_hex),
        repo_tags: vec![format!("{}:{}", name, tag)],
        layers: layer_paths,
    };
    let manifest_json = serde_json::to_vec(&vec![entry])?;
    append_bytes(&mut builder, "manifest.json", &manifest_json)?;
    append_bytes(&mut builder, &format!("{}.json", config_hex), config_blob)?;

    for (hex, gz_blob) in layers {
        let mut decoder = GzDecoder::new(&gz_blob[..]);
        let mut layer_tar = Vec::new();
        // Layers come back as gzip-compressed tars; if the registry ever
        // serves an uncompressed layer, treat the blob as already being the
        // inner tar rather than failing the whole pull.
        if decoder.read_to_end(&mut layer_tar).is_err() {
            layer_tar = gz_blob.clone();
        }
        append_bytes(&mut builder, &format!("{}/layer.tar", hex), &layer_tar)?;
    }

    builder.finish()?;
    Ok(())
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> RuntimeResult<()> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_name_defaults_tag_and_keeps_name_unqualified() {
        assert_eq!(
            parse_image_name("alpine").unwrap(),
            ("alpine".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn parse_image_name_keeps_explicit_tag() {
        assert_eq!(
            parse_image_name("ubuntu:20.04").unwrap(),
            ("ubuntu".to_string(), "20.04".to_string())
        );
    }

    #[test]
    fn parse_image_name_keeps_custom_namespace() {
        assert_eq!(
            parse_image_name("myorg/myimage:v1").unwrap(),
            ("myorg/myimage".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn parse_image_name_rejects_too_many_colons() {
        assert!(parse_image_name("a:b:c").is_err());
    }

    #[test]
    fn digest_hex_strips_prefix() {
        assert_eq!(digest_hex("sha256:aabbcc"), "aabbcc");
    }

    #[test]
    fn docker_hub_repo_name_qualifies_bare_names_only() {
        assert_eq!(docker_hub_repo_name("alpine"), "library/alpine");
        assert_eq!(docker_hub_repo_name("myorg/myimage"), "myorg/myimage");
    }
}
