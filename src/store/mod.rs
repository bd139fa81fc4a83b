pub mod upload;

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

use crate::digest::Digest;
use crate::oci::{Descriptor, Manifest};

/// A manifest as stored: the exact uploaded bytes plus the metadata the
/// registry needs to serve and index it. Bytes are never re-serialized, so
/// the digest stays stable.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub digest: Digest,
    pub media_type: String,
    pub bytes: Bytes,
    subject: Option<Digest>,
}

#[derive(Default)]
pub struct Repository {
    blobs: HashMap<Digest, Bytes>,
    manifests: HashMap<Digest, StoredManifest>,
    tags: BTreeMap<String, Digest>,
    referrers: HashMap<Digest, BTreeMap<Digest, Descriptor>>,
}

/// All repositories, keyed by name. Callers hold this behind a process-wide
/// RwLock; digests are computed before entering any critical section.
#[derive(Default)]
pub struct RegistryStore {
    repositories: HashMap<String, Repository>,
}

impl RegistryStore {
    pub fn repository_exists(&self, name: &str) -> bool {
        self.repositories.contains_key(name)
    }

    fn repo_mut(&mut self, name: &str) -> &mut Repository {
        self.repositories.entry(name.to_string()).or_default()
    }

    /// Stores a blob whose digest the caller has already verified against
    /// the payload bytes.
    pub fn put_blob(&mut self, repository: &str, digest: Digest, data: Bytes) {
        self.repo_mut(repository).blobs.insert(digest, data);
    }

    pub fn get_blob(&self, repository: &str, digest: &Digest) -> Option<Bytes> {
        self.repositories
            .get(repository)?
            .blobs
            .get(digest)
            .cloned()
    }

    pub fn delete_blob(&mut self, repository: &str, digest: &Digest) -> bool {
        self.repositories
            .get_mut(repository)
            .is_some_and(|repo| repo.blobs.remove(digest).is_some())
    }

    /// Cross-repository mount. With a source repository, links the blob
    /// into the target when the source holds it. Without one, only an
    /// enabled auto-discovery scan across all repositories can satisfy the
    /// mount; otherwise the caller degrades to a plain upload session.
    pub fn mount_blob(
        &mut self,
        target: &str,
        digest: &Digest,
        source: Option<&str>,
        auto_discover: bool,
    ) -> bool {
        let data = match source {
            Some(source) => self.get_blob(source, digest),
            None if auto_discover => self
                .repositories
                .values()
                .find_map(|repo| repo.blobs.get(digest).cloned()),
            None => None,
        };
        match data {
            Some(data) => {
                self.put_blob(target, digest.clone(), data);
                true
            }
            None => false,
        }
    }

    /// Stores manifest bytes verbatim, points the tag (if any) at the new
    /// digest, and upserts the referrers entry when the manifest declares a
    /// subject. The referrer upsert happens in the same critical section as
    /// the manifest write, so referrer reads never observe a half-applied
    /// update.
    pub fn put_manifest(
        &mut self,
        repository: &str,
        digest: Digest,
        media_type: String,
        bytes: Bytes,
        parsed: &Manifest,
        tag: Option<&str>,
    ) {
        let subject = parsed.subject.as_ref().map(|s| s.digest.clone());
        let descriptor = Descriptor {
            media_type: media_type.clone(),
            digest: digest.clone(),
            size: bytes.len() as u64,
            artifact_type: parsed.effective_artifact_type(),
            annotations: parsed.annotations.clone(),
        };

        let repo = self.repo_mut(repository);
        repo.manifests.insert(
            digest.clone(),
            StoredManifest {
                digest: digest.clone(),
                media_type,
                bytes,
                subject: subject.clone(),
            },
        );
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        if let Some(subject_digest) = subject {
            repo.referrers
                .entry(subject_digest)
                .or_default()
                .insert(digest, descriptor);
        }
    }

    /// Resolves a tag through the tag map or a digest-form reference
    /// directly against content-addressed storage.
    pub fn get_manifest(&self, repository: &str, reference: &str) -> Option<StoredManifest> {
        let repo = self.repositories.get(repository)?;
        let digest = match Digest::parse(reference) {
            Ok(digest) => digest,
            Err(_) => repo.tags.get(reference)?.clone(),
        };
        repo.manifests.get(&digest).cloned()
    }

    /// Removes only the tag pointer; content stays reachable by digest and
    /// by any other tags.
    pub fn delete_tag(&mut self, repository: &str, tag: &str) -> bool {
        self.repositories
            .get_mut(repository)
            .is_some_and(|repo| repo.tags.remove(tag).is_some())
    }

    /// Removes the manifest content, every tag pointing at it, and its
    /// referrers entry (where it is the referrer). Entries naming this
    /// digest as their subject survive as dangling subjects.
    pub fn delete_manifest(&mut self, repository: &str, digest: &Digest) -> bool {
        let Some(repo) = self.repositories.get_mut(repository) else {
            return false;
        };
        let Some(removed) = repo.manifests.remove(digest) else {
            return false;
        };
        repo.tags.retain(|_, target| target != digest);
        if let Some(subject) = removed.subject {
            if let Some(entries) = repo.referrers.get_mut(&subject) {
                entries.remove(digest);
                if entries.is_empty() {
                    repo.referrers.remove(&subject);
                }
            }
        }
        true
    }

    /// Every known referrer of `subject`, optionally filtered by artifact
    /// type. Unknown repositories and never-pushed subjects yield an empty
    /// list, never an error.
    pub fn list_referrers(
        &self,
        repository: &str,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Vec<Descriptor> {
        let Some(repo) = self.repositories.get(repository) else {
            return Vec::new();
        };
        let Some(entries) = repo.referrers.get(subject) else {
            return Vec::new();
        };
        entries
            .values()
            .filter(|descriptor| match artifact_type {
                Some(filter) => descriptor.artifact_type.as_deref() == Some(filter),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Tags in byte order with `n`-capped pagination; `last` is an
    /// exclusive cursor. `None` when the repository itself is unknown.
    pub fn list_tags(
        &self,
        repository: &str,
        n: Option<usize>,
        last: Option<&str>,
    ) -> Option<Vec<String>> {
        let repo = self.repositories.get(repository)?;
        let tags = repo
            .tags
            .keys()
            .filter(|tag| last.is_none_or(|last| tag.as_str() > last))
            .take(n.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Some(tags)
    }
}
