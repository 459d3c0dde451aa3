//! The image index: a single JSON document mapping `name -> tag -> hash`.
//! Reads and writes are whole-file; there is no locking, so concurrent
//! invocations racing on `images.json` can corrupt it. That is a documented
//! limitation, not a bug to fix here.
use std::collections::BTreeMap;
use std::fs;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;
use crate::paths;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImageIndex(BTreeMap<String, BTreeMap<String, String>>);

impl ImageIndex {
    pub fn load() -> RuntimeResult<Self> {
        let path = paths::images_index_path();
        if !std::path::Path::new(&path).exists() {
            fs::write(&path, b"{}")?;
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        let map = serde_json::from_str(&data).unwrap_or_default();
        Ok(Self(map))
    }

    fn save(&self) -> RuntimeResult<()> {
        let data = serde_json::to_string(&self.0)?;
        fs::write(paths::images_index_path(), data)?;
        Ok(())
    }

    pub fn resolve_by_tag(&self, name: &str, tag: &str) -> Option<String> {
        self.0.get(name)?.get(tag).cloned()
    }

    pub fn resolve_by_hash(&self, hash: &str) -> Option<(String, String)> {
        for (name, tags) in &self.0 {
            for (tag, h) in tags {
                if h == hash {
                    return Some((name.clone(), tag.clone()));
                }
            }
        }
        None
    }

    pub fn list(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for (name, tags) in &self.0 {
            for (tag, hash) in tags {
                out.push((name.clone(), tag.clone(), hash.clone()));
            }
        }
        out
    }

    pub fn put(&mut self, name: &str, tag: &str, hash: &str) -> RuntimeResult<()> {
        self.0
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), hash.to_string());
        self.save()
    }

    pub fn remove_by_hash(&mut self, hash: &str) -> RuntimeResult<()> {
        let mut empty_names = Vec::new();
        for (name, tags) in self.0.iter_mut() {
            tags.retain(|_, h| h != hash);
            if tags.is_empty() {
                empty_names.push(name.clone());
            }
        }
        for name in empty_names {
            self.0.remove(&name);
        }
        debug!("removed all index entries for image hash {}", hash);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let mut idx = ImageIndex::default();
        idx.0.entry("alpine".into()).or_default();
        idx.0
            .get_mut("alpine")
            .unwrap()
            .insert("latest".into(), "abc123".into());
        let once = format!("{:?}", idx.0);

        idx.0
            .get_mut("alpine")
            .unwrap()
            .insert("latest".into(), "abc123".into());
        let twice = format!("{:?}", idx.0);

        assert_eq!(once, twice);
    }

    #[test]
    fn remove_by_hash_drops_empty_names() {
        let mut idx = ImageIndex::default();
        idx.0
            .entry("alpine".into())
            .or_default()
            .insert("latest".into(), "abc123".into());

        let mut empty_names = Vec::new();
        for (name, tags) in idx.0.iter_mut() {
            tags.retain(|_, h| h != "abc123");
            if tags.is_empty() {
                empty_names.push(name.clone());
            }
        }
        for name in empty_names {
            idx.0.remove(&name);
        }

        assert!(idx.0.is_empty());
        assert!(idx.resolve_by_hash("abc123").is_none());
    }

    #[test]
    fn resolve_by_hash_finds_alias() {
        let mut idx = ImageIndex::default();
        idx.0
            .entry("ubuntu".into())
            .or_default()
            .insert("latest".into(), "deadbeefcafe".into());
        idx.0
            .get_mut("ubuntu")
            .unwrap()
            .insert("20.04".into(), "deadbeefcafe".into());

        let (name, _tag) = idx.resolve_by_hash("deadbeefcafe").unwrap();
        assert_eq!(name, "ubuntu");
    }
}
