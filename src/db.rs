//! SQLite loader for stage artifacts. Natural keys are the primary keys;
//! a re-emitted key replaces the earlier row.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::artifact::{self, Artifact};
use crate::records::{ModelEntry, VariationInfo};

pub const DEFAULT_DB_PATH: &str = "data/model_hub.sqlite";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS models (
            source_url           TEXT PRIMARY KEY,
            site                 TEXT NOT NULL CHECK(site IN ('kaggle','nvidia')),
            organization_or_name TEXT NOT NULL,
            scraped_at           TEXT NOT NULL,
            downloads            INTEGER CHECK(downloads IS NULL OR downloads >= 0),
            usability            TEXT,
            short_description    TEXT,
            model_card           TEXT,
            example_usage        TEXT,
            loaded_at            TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_models_site ON models(site);

        CREATE TABLE IF NOT EXISTS tags (
            name TEXT PRIMARY KEY CHECK(name = lower(name) AND length(trim(name)) > 0)
        );

        CREATE TABLE IF NOT EXISTS model_tags (
            model_url TEXT NOT NULL REFERENCES models(source_url) ON DELETE CASCADE,
            tag       TEXT NOT NULL REFERENCES tags(name),
            PRIMARY KEY (model_url, tag)
        );
        CREATE INDEX IF NOT EXISTS idx_model_tags_tag ON model_tags(tag);

        -- collaborators/authors are JSON arrays
        CREATE TABLE IF NOT EXISTS model_metadata (
            model_url     TEXT PRIMARY KEY REFERENCES models(source_url) ON DELETE CASCADE,
            collaborators TEXT NOT NULL DEFAULT '[]',
            authors       TEXT NOT NULL DEFAULT '[]',
            provenance    TEXT
        );

        CREATE TABLE IF NOT EXISTS variation_info (
            source_url        TEXT PRIMARY KEY,
            model_url         TEXT NOT NULL REFERENCES models(source_url) ON DELETE CASCADE,
            framework         TEXT,
            variation_name    TEXT NOT NULL,
            variation_version TEXT,
            license           TEXT,
            downloads         INTEGER CHECK(downloads IS NULL OR downloads >= 0),
            model_card        TEXT,
            is_finetunable    BOOLEAN,
            example_usage     TEXT,
            scraped_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_variation_model ON variation_info(model_url);
        ",
    )?;
    Ok(())
}

fn downloads(n: Option<u64>) -> Option<i64> {
    n.and_then(|d| i64::try_from(d).ok())
}

/// Upserts models with their metadata and tags. Returns rows written.
pub fn load_models(conn: &Connection, entries: &[ModelEntry]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut m_stmt = tx.prepare(
            "INSERT INTO models
             (source_url, site, organization_or_name, scraped_at, downloads, usability,
              short_description, model_card, example_usage)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(source_url) DO UPDATE SET
               site = excluded.site,
               organization_or_name = excluded.organization_or_name,
               scraped_at = excluded.scraped_at,
               downloads = excluded.downloads,
               usability = excluded.usability,
               short_description = excluded.short_description,
               model_card = excluded.model_card,
               example_usage = excluded.example_usage,
               loaded_at = datetime('now')",
        )?;
        let mut meta_stmt = tx.prepare(
            "INSERT OR REPLACE INTO model_metadata (model_url, collaborators, authors, provenance)
             VALUES (?1,?2,?3,?4)",
        )?;
        let mut clear_tags = tx.prepare("DELETE FROM model_tags WHERE model_url = ?1")?;
        let mut tag_stmt = tx.prepare("INSERT OR IGNORE INTO tags (name) VALUES (?1)")?;
        let mut link_stmt =
            tx.prepare("INSERT OR IGNORE INTO model_tags (model_url, tag) VALUES (?1, ?2)")?;

        for e in entries {
            let m = &e.model;
            m_stmt.execute(params![
                m.source_url,
                m.site.as_str(),
                m.organization_or_name,
                m.scraped_at.to_rfc3339(),
                downloads(m.downloads),
                m.usability,
                m.short_description,
                m.model_card,
                m.example_usage,
            ])?;
            meta_stmt.execute(params![
                m.source_url,
                serde_json::to_string(&e.metadata.collaborators)?,
                serde_json::to_string(&e.metadata.authors)?,
                e.metadata.provenance,
            ])?;
            clear_tags.execute(params![m.source_url])?;
            for tag in &e.tags {
                tag_stmt.execute(params![tag])?;
                link_stmt.execute(params![m.source_url, tag])?;
            }
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

/// Upserts variations whose parent model is loaded; others are skipped.
/// Returns (loaded, skipped).
pub fn load_variations(conn: &Connection, variations: &[VariationInfo]) -> Result<(usize, usize)> {
    let tx = conn.unchecked_transaction()?;
    let mut loaded = 0;
    let mut skipped = 0;
    {
        let mut parent = tx.prepare("SELECT 1 FROM models WHERE source_url = ?1")?;
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO variation_info
             (source_url, model_url, framework, variation_name, variation_version, license,
              downloads, model_card, is_finetunable, example_usage, scraped_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        )?;
        for v in variations {
            let known: Option<i64> = parent
                .query_row(params![v.model_url], |r| r.get(0))
                .optional()?;
            if known.is_none() {
                warn!(url = %v.source_url, parent = %v.model_url, "parent model not loaded, skipping variation");
                skipped += 1;
                continue;
            }
            stmt.execute(params![
                v.source_url,
                v.model_url,
                v.framework,
                v.variation_name,
                v.variation_version,
                v.license,
                downloads(v.downloads),
                v.model_card,
                v.is_finetunable,
                v.example_usage,
                v.scraped_at.to_rfc3339(),
            ])?;
            loaded += 1;
        }
    }
    tx.commit()?;
    Ok((loaded, skipped))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub models: usize,
    pub variations: usize,
    pub skipped: usize,
}

/// Loads one metadata or variations artifact.
pub fn load_artifact(conn: &Connection, path: &Path) -> Result<LoadSummary> {
    let stage = artifact::stage_of(path)?;
    if stage.ends_with("_metadata") {
        let a: Artifact<ModelEntry> = artifact::read(path)?;
        if a.partial {
            warn!(?path, "loading a partial artifact");
        }
        let models = load_models(conn, &a.records)?;
        Ok(LoadSummary {
            models,
            ..Default::default()
        })
    } else if stage.ends_with("_variations") {
        let a: Artifact<VariationInfo> = artifact::read(path)?;
        if a.partial {
            warn!(?path, "loading a partial artifact");
        }
        let (variations, skipped) = load_variations(conn, &a.records)?;
        Ok(LoadSummary {
            variations,
            skipped,
            ..Default::default()
        })
    } else {
        bail!("{:?} is a {} artifact; only metadata and variations artifacts carry rows", path, stage)
    }
}

#[derive(Debug)]
pub struct Stats {
    pub models: usize,
    pub tags: usize,
    pub model_tags: usize,
    pub metadata: usize,
    pub variations: usize,
    pub by_site: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |table: &str| -> Result<usize> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?)
    };
    let mut stmt = conn.prepare("SELECT site, COUNT(*) FROM models GROUP BY site ORDER BY site")?;
    let by_site: Vec<(String, usize)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Stats {
        models: count("models")?,
        tags: count("tags")?,
        model_tags: count("model_tags")?,
        metadata: count("model_metadata")?,
        variations: count("variation_info")?,
        by_site,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{MetadataFields, ModelRecord};
    use crate::sites::Site;
    use chrono::Utc;

    const GEMMA: &str = "https://www.kaggle.com/models/google/gemma";

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn entry(url: &str, tags: &[&str], downloads: Option<u64>) -> ModelEntry {
        ModelEntry {
            model: ModelRecord {
                source_url: url.into(),
                site: Site::Kaggle,
                organization_or_name: "Gemma".into(),
                scraped_at: Utc::now(),
                downloads,
                usability: None,
                short_description: Some("Open models".into()),
                model_card: None,
                example_usage: None,
                quality_flags: Vec::new(),
            },
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: MetadataFields {
                collaborators: vec!["Google".into()],
                authors: Vec::new(),
                provenance: None,
            },
            variation_urls: Vec::new(),
        }
    }

    fn variation(url: &str, parent: &str) -> VariationInfo {
        VariationInfo {
            source_url: url.into(),
            model_url: parent.into(),
            framework: Some("transformers".into()),
            scraped_at: Utc::now(),
            variation_name: "2b".into(),
            variation_version: None,
            license: Some("Gemma".into()),
            downloads: None,
            model_card: None,
            is_finetunable: None,
            example_usage: None,
            quality_flags: Vec::new(),
        }
    }

    #[test]
    fn reload_replaces_rows_and_keeps_variations() {
        let conn = memory();
        load_models(&conn, &[entry(GEMMA, &["nlp", "text"], Some(10))]).unwrap();
        let (loaded, skipped) =
            load_variations(&conn, &[variation(&format!("{}/transformers/2b", GEMMA), GEMMA)])
                .unwrap();
        assert_eq!((loaded, skipped), (1, 0));

        load_models(&conn, &[entry(GEMMA, &["nlp"], Some(20))]).unwrap();
        let downloads: i64 = conn
            .query_row("SELECT downloads FROM models WHERE source_url = ?1", [GEMMA], |r| r.get(0))
            .unwrap();
        assert_eq!(downloads, 20);

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.models, 1);
        assert_eq!(s.model_tags, 1);
        assert_eq!(s.tags, 2);
        assert_eq!(s.metadata, 1);
        assert_eq!(s.variations, 1);
        assert_eq!(s.by_site, vec![("kaggle".to_string(), 1)]);
    }

    #[test]
    fn orphan_variations_are_skipped() {
        let conn = memory();
        let (loaded, skipped) = load_variations(
            &conn,
            &[variation("https://www.kaggle.com/models/x/y/jax/z", "https://www.kaggle.com/models/x/y")],
        )
        .unwrap();
        assert_eq!((loaded, skipped), (0, 1));
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let conn = memory();
        let err = conn.execute(
            "INSERT INTO model_tags (model_url, tag) VALUES (?1, ?2)",
            params!["https://nowhere.test/m", "nlp"],
        );
        assert!(err.is_err());
    }

    #[test]
    fn links_artifacts_are_not_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Artifact {
            stage: "kaggle_links".into(),
            site: Site::Kaggle,
            generated_at: Utc::now(),
            partial: false,
            counts: Default::default(),
            rejections: Vec::new(),
            records: Vec::<crate::records::ModelLink>::new(),
        };
        let path = artifact::write(dir.path(), &mut a).unwrap();
        assert!(load_artifact(&memory(), &path).is_err());
    }
}
