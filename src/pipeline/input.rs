use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::artifact::{self, Artifact};
use crate::error::SystemicFailure;
use crate::normalize::coerce::canonical_url;
use crate::records::{ModelEntry, ModelLink};
use crate::sites::{name_from_url, PageShape};
use crate::stages::StageSpec;

/// Seeds a stage consumes.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// Link discovery starts from the first listing page.
    Listing,
    Links(Vec<ModelLink>),
    Models(Vec<ModelEntry>),
}

impl StageInput {
    pub fn len(&self) -> usize {
        match self {
            StageInput::Listing => 1,
            StageInput::Links(links) => links.len(),
            StageInput::Models(models) => models.iter().map(|m| m.variation_urls.len()).sum(),
        }
    }
}

fn incompatible(stage: &StageSpec, message: String) -> SystemicFailure {
    SystemicFailure::IncompatibleInput {
        stage: stage.name.to_string(),
        message,
    }
}

/// Input for `stage` from an explicit artifact, or the newest upstream one in `dir`.
pub fn resolve(
    stage: &StageSpec,
    explicit: Option<&Path>,
    dir: &Path,
) -> Result<StageInput, SystemicFailure> {
    let Some(upstream) = stage.upstream else {
        return Ok(StageInput::Listing);
    };
    let path: PathBuf = match explicit {
        Some(p) => p.to_path_buf(),
        None => artifact::latest(dir, upstream).ok_or_else(|| {
            incompatible(
                stage,
                format!("no {} artifact in {:?}; run that stage first", upstream, dir),
            )
        })?,
    };
    info!(stage = stage.name, input = ?path, "using upstream artifact");
    from_artifact(stage, &path)
}

pub fn from_artifact(stage: &StageSpec, path: &Path) -> Result<StageInput, SystemicFailure> {
    let found = artifact::stage_of(path).map_err(|e| incompatible(stage, format!("{:#}", e)))?;
    if Some(found.as_str()) != stage.upstream {
        return Err(incompatible(
            stage,
            format!(
                "{:?} comes from stage {}, expected {}",
                path,
                found,
                stage.upstream.unwrap_or("none")
            ),
        ));
    }

    match stage.shape {
        PageShape::Detail => {
            let a: Artifact<ModelLink> =
                artifact::read(path).map_err(|e| incompatible(stage, format!("{:#}", e)))?;
            Ok(StageInput::Links(a.records))
        }
        PageShape::Variation => {
            let a: Artifact<ModelEntry> =
                artifact::read(path).map_err(|e| incompatible(stage, format!("{:#}", e)))?;
            Ok(StageInput::Models(a.records))
        }
        PageShape::Listing => Ok(StageInput::Listing),
    }
}

/// Detail-page URLs, one per line; blank lines and `#` comments are skipped.
pub fn from_url_file(stage: &StageSpec, path: &Path) -> Result<StageInput, SystemicFailure> {
    if stage.shape != PageShape::Detail {
        return Err(incompatible(stage, "--urls only feeds metadata stages".into()));
    }
    let raw = fs::read_to_string(path).map_err(|source| SystemicFailure::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = stage.site.rules(PageShape::Detail);

    let mut links = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match canonical_url(line) {
            Ok(url) if rules.is_some_and(|r| r.matches_url(&url)) => links.push(ModelLink {
                name: name_from_url(&url).unwrap_or_else(|| url.clone()),
                url,
            }),
            Ok(url) => warn!(%url, stage = stage.name, "not a detail page URL, skipped"),
            Err(e) => warn!(line, "{}", e),
        }
    }
    Ok(StageInput::Links(links))
}
