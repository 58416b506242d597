use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, SynthError};
use crate::synth::{Artifact, ArtifactManifest};

pub const MANIFEST_FILE: &str = "manifest.json";
const LOCK_FILE: &str = ".stack-synth.lock";

/// Per-resource comparison between the stored manifest and a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl StackDiff {
    pub fn between(previous: Option<&ArtifactManifest>, current: &ArtifactManifest) -> Self {
        let mut diff = StackDiff::default();
        for (id, mapping) in &current.resources {
            match previous.and_then(|manifest| manifest.resources.get(id)) {
                None => diff.added.push(id.clone()),
                Some(old) if old == mapping => diff.unchanged.push(id.clone()),
                Some(_) => diff.changed.push(id.clone()),
            }
        }
        if let Some(previous) = previous {
            diff.removed = previous
                .resources
                .keys()
                .filter(|id| !current.resources.contains_key(*id))
                .cloned()
                .collect();
        }
        diff
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty())
    }
}

impl fmt::Display for StackDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} changed, {} removed, {} unchanged",
            self.added.len(),
            self.changed.len(),
            self.removed.len(),
            self.unchanged.len()
        )?;
        for (marker, ids) in [("+", &self.added), ("~", &self.changed), ("-", &self.removed)] {
            for id in ids {
                write!(f, "\n  {marker} {id}")?;
            }
        }
        Ok(())
    }
}

/// Result of persisting one artifact.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub dir: PathBuf,
    pub template_path: PathBuf,
    pub version: u64,
    pub diff: StackDiff,
}

/// Output directory holding one subdirectory per stack.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn stack_dir(&self, stack_name: &str) -> Result<PathBuf> {
        let valid = !stack_name.is_empty()
            && stack_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SynthError::Config(format!(
                "stack name '{stack_name}' cannot be used as a directory name"
            )));
        }
        Ok(self.root.join(stack_name))
    }

    /// Manifest from the previous run, read under a shared lock.
    pub fn load_manifest(&self, stack_name: &str) -> Result<Option<ArtifactManifest>> {
        let path = self.stack_dir(stack_name)?.join(MANIFEST_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        file.lock_shared()?;
        let manifest = serde_json::from_reader(&file)?;
        Ok(Some(manifest))
    }

    /// Write the template and manifest for `artifact`, diffing against the
    /// previous manifest. The version only moves when the document changed.
    pub fn store(&self, artifact: &Artifact) -> Result<StoredArtifact> {
        let stack_name = &artifact.manifest.stack_name;
        let dir = self.stack_dir(stack_name)?;
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.lock()?;

        let previous = self.load_manifest(stack_name)?;
        let diff = StackDiff::between(previous.as_ref(), &artifact.manifest);

        let mut manifest = artifact.manifest.clone();
        manifest.version = match &previous {
            Some(old) if old.digest == manifest.digest => old.version,
            Some(old) => old.version + 1,
            None => 1,
        };

        let template_name = manifest.format.template_file_name();
        if let Some(old) = &previous
            && old.format != manifest.format
        {
            let stale = dir.join(old.format.template_file_name());
            if stale.exists() {
                debug!(path = %stale.display(), "removing template from previous format");
                fs::remove_file(stale)?;
            }
        }

        let template_path = dir.join(template_name);
        write_atomic(&template_path, artifact.document.as_bytes())?;
        let mut manifest_text = serde_json::to_string_pretty(&manifest)?;
        manifest_text.push('\n');
        write_atomic(&dir.join(MANIFEST_FILE), manifest_text.as_bytes())?;

        info!(
            stack = %stack_name,
            version = manifest.version,
            changed = diff.has_changes(),
            "stored artifact in {}",
            dir.display()
        );
        Ok(StoredArtifact {
            dir,
            template_path,
            version: manifest.version,
            diff,
        })
    }
}

/// Write to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SynthError::Other(format!("invalid output path {}", path.display())))?;
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = File::create(&temp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(())
}
