//! One JSON document per stage run, published atomically under
//! `<output_dir>/<stage>_<YYYYmmdd_HHMMSS>.json`.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RejectionReason, SystemicFailure};
use crate::records::Keyed;
use crate::sites::Site;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub total: usize,
    pub fetched: usize,
    pub extracted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub shape_mismatch: usize,
    pub render_fallbacks: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub url: String,
    pub invariant: String,
    pub field: String,
    pub message: String,
}

impl Rejection {
    pub fn new(url: &str, reason: &RejectionReason) -> Self {
        Rejection {
            url: url.to_string(),
            invariant: reason.invariant().to_string(),
            field: reason.field().to_string(),
            message: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact<R> {
    pub stage: String,
    pub site: Site,
    pub generated_at: DateTime<Utc>,
    /// Set when the stage was cancelled before its queue drained.
    pub partial: bool,
    pub counts: Counts,
    pub rejections: Vec<Rejection>,
    pub records: Vec<R>,
}

#[derive(Deserialize)]
struct Header {
    stage: String,
}

pub fn file_name(stage: &str, generated_at: DateTime<Utc>) -> String {
    format!("{}_{}.json", stage, generated_at.format("%Y%m%d_%H%M%S"))
}

/// Sort records by natural key and rejections by URL, then publish.
/// Never replaces an existing file.
pub fn write<R: Serialize + Keyed>(
    dir: &Path,
    artifact: &mut Artifact<R>,
) -> Result<PathBuf, SystemicFailure> {
    artifact.records.sort_by(|a, b| a.key().cmp(b.key()));
    artifact.rejections.sort_by(|a, b| {
        (&a.url, &a.invariant, &a.field, &a.message).cmp(&(&b.url, &b.invariant, &b.field, &b.message))
    });

    let io = |path: &Path, source| SystemicFailure::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(|e| io(dir, e))?;

    let name = file_name(&artifact.stage, artifact.generated_at);
    let target = dir.join(&name);
    if target.exists() {
        return Err(SystemicFailure::ArtifactCollision(target));
    }
    let tmp = dir.join(format!(".{}.{}.tmp", name, std::process::id()));

    let written = write_tmp(&tmp, artifact).and_then(|_| fs::hard_link(&tmp, &target));
    let _ = fs::remove_file(&tmp);
    match written {
        Ok(()) => Ok(target),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(SystemicFailure::ArtifactCollision(target)),
        Err(e) => Err(io(&target, e)),
    }
}

fn write_tmp<R: Serialize>(tmp: &Path, artifact: &Artifact<R>) -> std::io::Result<()> {
    let file = File::create(tmp)?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, artifact)?;
    out.write_all(b"\n")?;
    out.flush()?;
    out.get_ref().sync_all()
}

pub fn read<R: DeserializeOwned>(path: &Path) -> Result<Artifact<R>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse artifact {:?}", path))
}

/// Stage name recorded in an artifact, without decoding its records.
pub fn stage_of(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let header: Header =
        serde_json::from_str(&raw).with_context(|| format!("{:?} is not an artifact", path))?;
    Ok(header.stage)
}

/// Newest artifact of `stage` in `dir`; timestamps in the name sort lexically.
pub fn latest(dir: &Path, stage: &str) -> Option<PathBuf> {
    let prefix = format!("{}_", stage);
    fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
        })
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::ser::Error as _;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        url: String,
    }

    impl Keyed for Row {
        fn key(&self) -> &str {
            &self.url
        }
    }

    /// Serializes as garbage halfway through the document.
    struct Exploding;

    impl Serialize for Exploding {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("disk full"))
        }
    }

    impl Keyed for Exploding {
        fn key(&self) -> &str {
            "z"
        }
    }

    fn artifact<R>(records: Vec<R>) -> Artifact<R> {
        Artifact {
            stage: "kaggle_links".into(),
            site: Site::Kaggle,
            generated_at: Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap(),
            partial: false,
            counts: Counts::default(),
            rejections: Vec::new(),
            records,
        }
    }

    fn rows(urls: &[&str]) -> Vec<Row> {
        urls.iter().map(|u| Row { url: u.to_string() }).collect()
    }

    #[test]
    fn records_are_sorted_and_named_by_stage_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = artifact(rows(&["https://b.test", "https://a.test"]));
        let path = write(dir.path(), &mut a).unwrap();
        assert_eq!(path.file_name().unwrap(), "kaggle_links_20261018_093000.json");

        let back: Artifact<Row> = read(&path).unwrap();
        assert_eq!(back.records, rows(&["https://a.test", "https://b.test"]));
        assert_eq!(stage_of(&path).unwrap(), "kaggle_links");
    }

    #[test]
    fn same_input_gives_identical_bytes() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        let p1 = write(one.path(), &mut artifact(rows(&["https://b.test", "https://a.test"]))).unwrap();
        let p2 = write(two.path(), &mut artifact(rows(&["https://a.test", "https://b.test"]))).unwrap();
        assert_eq!(fs::read(p1).unwrap(), fs::read(p2).unwrap());
    }

    fn rejection(url: &str, invariant: &str) -> Rejection {
        Rejection {
            url: url.into(),
            invariant: invariant.into(),
            field: "source_url".into(),
            message: format!("{} failed", invariant),
        }
    }

    #[test]
    fn rejection_order_does_not_change_the_bytes() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        let mut a = artifact(rows(&["https://a.test"]));
        a.rejections = vec![
            rejection("https://z.test", "unique_key"),
            rejection("https://c.test", "source_url_well_formed"),
            rejection("https://c.test", "unique_key"),
        ];
        let mut b = artifact(rows(&["https://a.test"]));
        b.rejections = vec![
            rejection("https://c.test", "unique_key"),
            rejection("https://z.test", "unique_key"),
            rejection("https://c.test", "source_url_well_formed"),
        ];
        let p1 = write(one.path(), &mut a).unwrap();
        let p2 = write(two.path(), &mut b).unwrap();
        assert_eq!(fs::read(&p1).unwrap(), fs::read(&p2).unwrap());

        let back: Artifact<Row> = read(&p1).unwrap();
        let urls: Vec<_> = back.rejections.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://c.test", "https://c.test", "https://z.test"]);
        assert_eq!(back.rejections[0].invariant, "source_url_well_formed");
    }

    #[test]
    fn collision_is_fatal_and_keeps_the_first_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &mut artifact(rows(&["https://a.test"]))).unwrap();
        let before = fs::read(&path).unwrap();
        let err = write(dir.path(), &mut artifact(rows(&["https://other.test"]))).unwrap_err();
        assert!(matches!(err, SystemicFailure::ArtifactCollision(_)));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = artifact(vec![Exploding]);
        assert!(write(dir.path(), &mut a).is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(latest(dir.path(), "kaggle_links").is_none());
    }

    #[test]
    fn latest_picks_newest_of_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "kaggle_links_20260101_000000.json",
            "kaggle_links_20261018_120000.json",
            "kaggle_metadata_20271231_000000.json",
        ] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        let newest = latest(dir.path(), "kaggle_links").unwrap();
        assert!(newest.ends_with("kaggle_links_20261018_120000.json"));
    }
}
