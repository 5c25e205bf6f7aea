//! Stage orchestration: a bounded queue of fetch tasks per stage, one
//! completion handler feeding extract → gate → normalize → validate, and an
//! artifact at the end.

pub mod input;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifact::{self, Artifact, Counts, Rejection};
use crate::config::RunConfig;
use crate::error::{FetchError, RejectionReason, SystemicFailure};
use crate::extract;
use crate::fetch::{Fetcher, Page};
use crate::gate;
use crate::normalize::{self, Validator};
use crate::partial::PartialRecord;
use crate::records::{Keyed, ModelEntry, ModelLink, Record, VariationInfo};
use crate::sites::{PageShape, ShapeRules};
use crate::stages::StageSpec;
pub use input::StageInput;

const REJECTION_SAMPLES: usize = 5;

#[derive(Debug, Clone)]
struct Seed {
    key: String,
    fetch_url: String,
    parent: Option<String>,
    page: usize,
}

#[derive(Debug, Clone)]
struct Task {
    seed: Seed,
    render: bool,
}

#[derive(Debug)]
enum Collected {
    Links(Vec<ModelLink>),
    Models(Vec<ModelEntry>),
    Variations(Vec<VariationInfo>),
}

/// What a finished stage reports back for the run summary.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: &'static str,
    pub counts: Counts,
    pub records: usize,
    pub partial: bool,
    pub path: PathBuf,
    pub rejection_samples: Vec<Rejection>,
}

pub struct Orchestrator {
    config: RunConfig,
    fetcher: Arc<dyn Fetcher>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, fetcher: Arc<dyn Fetcher>, cancel: watch::Receiver<bool>) -> Self {
        Orchestrator {
            config,
            fetcher,
            cancel,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs one stage to completion (or cancellation) and writes its artifact.
    pub async fn run_stage(
        &self,
        stage: &'static StageSpec,
        input: StageInput,
    ) -> Result<StageReport, SystemicFailure> {
        let rules = stage.site.rules(stage.shape).ok_or_else(|| SystemicFailure::IncompatibleInput {
            stage: stage.name.to_string(),
            message: format!("{} has no {} pages", stage.site, stage.shape),
        })?;
        let mut run = StageRun::new(stage, rules, &self.config, input)?;
        info!(stage = stage.name, seeds = run.queue.len(), "stage started");

        let mut cancel = self.cancel.clone();
        let mut watching = true;
        let mut cancelled = *cancel.borrow();
        let mut in_flight: JoinSet<(Task, Result<Page, FetchError>)> = JoinSet::new();

        loop {
            while !cancelled && in_flight.len() < self.config.concurrency {
                let Some(task) = run.queue.pop_front() else {
                    break;
                };
                let fetcher = Arc::clone(&self.fetcher);
                in_flight.spawn(async move {
                    let result = fetcher.fetch(&task.seed.fetch_url, task.render).await;
                    (task, result)
                });
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok((task, result))) => {
                        if let Err(e) = run.on_fetched(task, result) {
                            in_flight.shutdown().await;
                            run.pb.abandon();
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(stage = stage.name, "fetch task died: {}", e);
                        run.counts.failed += 1;
                        run.pb.inc(1);
                    }
                    None => {}
                },
                changed = cancel.changed(), if watching => match changed {
                    Ok(()) => cancelled = *cancel.borrow(),
                    Err(_) => watching = false,
                },
            }

            if cancelled {
                warn!(stage = stage.name, in_flight = in_flight.len(), "cancelled, abandoning in-flight fetches");
                in_flight.shutdown().await;
                run.settle_all();
                break;
            }
        }

        run.finish(cancelled)
    }
}

/// Mutable state of one stage. Only the completion handler touches it.
struct StageRun<'a> {
    stage: &'static StageSpec,
    rules: &'static ShapeRules,
    config: &'a RunConfig,
    queue: VecDeque<Task>,
    /// Static partials waiting on their rendered re-fetch.
    pending: HashMap<String, (Seed, PartialRecord)>,
    validator: Validator,
    counts: Counts,
    rejections: Vec<Rejection>,
    collected: Collected,
    pb: ProgressBar,
}

impl<'a> StageRun<'a> {
    fn new(
        stage: &'static StageSpec,
        rules: &'static ShapeRules,
        config: &'a RunConfig,
        input: StageInput,
    ) -> Result<Self, SystemicFailure> {
        let incompatible = |message: &str| SystemicFailure::IncompatibleInput {
            stage: stage.name.to_string(),
            message: message.to_string(),
        };
        let cap = config.max_pages.unwrap_or(usize::MAX);
        let site = stage.site;

        let (seeds, validator, collected) = match (stage.shape, input) {
            (PageShape::Listing, StageInput::Listing) => {
                let url = site.listing_url(1);
                let seed = Seed {
                    key: url.clone(),
                    fetch_url: url,
                    parent: None,
                    page: 1,
                };
                (vec![seed], Validator::new(), Collected::Links(Vec::new()))
            }
            (PageShape::Detail, StageInput::Links(links)) => {
                let seeds = links
                    .into_iter()
                    .take(cap)
                    .map(|l| Seed {
                        fetch_url: site.detail_fetch_url(&l.url),
                        key: l.url,
                        parent: None,
                        page: 0,
                    })
                    .collect();
                (seeds, Validator::new(), Collected::Models(Vec::new()))
            }
            (PageShape::Variation, StageInput::Models(models)) => {
                let parents: Vec<String> = models.iter().map(|m| m.model.source_url.clone()).collect();
                let seeds = models
                    .into_iter()
                    .flat_map(|m| {
                        let parent = m.model.source_url;
                        m.variation_urls.into_iter().map(move |url| Seed {
                            key: url.clone(),
                            fetch_url: url,
                            parent: Some(parent.clone()),
                            page: 0,
                        })
                    })
                    .take(cap)
                    .collect();
                (seeds, Validator::with_parents(parents), Collected::Variations(Vec::new()))
            }
            (_, StageInput::Listing) => return Err(incompatible("stage needs an upstream artifact")),
            (_, StageInput::Links(_)) => return Err(incompatible("expected model links")),
            (_, StageInput::Models(_)) => return Err(incompatible("expected model entries")),
        };

        let queue: VecDeque<Task> = seeds
            .into_iter()
            .map(|seed: Seed| Task { seed, render: false })
            .collect();

        let pb = ProgressBar::new(queue.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(stage.name);

        Ok(StageRun {
            stage,
            rules,
            config,
            counts: Counts {
                total: queue.len(),
                ..Counts::default()
            },
            queue,
            pending: HashMap::new(),
            validator,
            rejections: Vec::new(),
            collected,
            pb,
        })
    }

    fn on_fetched(&mut self, task: Task, result: Result<Page, FetchError>) -> Result<(), SystemicFailure> {
        let page = match result {
            Ok(page) => page,
            Err(e) if e.is_systemic() => {
                return Err(SystemicFailure::CapabilityUnavailable {
                    stage: self.stage.name.to_string(),
                    message: e.to_string(),
                })
            }
            Err(FetchError::Duplicate(url)) => {
                debug!(%url, "duplicate fetch suppressed");
                self.counts.duplicates += 1;
                if task.render {
                    self.settle_pending(&task.seed);
                } else {
                    self.pb.inc(1);
                }
                return Ok(());
            }
            Err(e) => {
                warn!(stage = self.stage.name, render = task.render, "{}", e);
                if task.render {
                    self.settle_pending(&task.seed);
                } else {
                    self.counts.failed += 1;
                    self.pb.inc(1);
                }
                return Ok(());
            }
        };
        if !task.render {
            self.counts.fetched += 1;
        }

        let extraction = match extract::extract(&page, self.stage.site, self.stage.shape) {
            Ok(ex) => ex,
            Err(mismatch) => {
                warn!(stage = self.stage.name, "{}", mismatch);
                if task.render {
                    self.settle_pending(&task.seed);
                } else {
                    self.counts.shape_mismatch += 1;
                    self.pb.inc(1);
                }
                return Ok(());
            }
        };

        if task.render {
            match self.pending.remove(&task.seed.key) {
                Some((_, static_pass)) => self.finish_page(&task.seed, gate::merge(static_pass, extraction.record)),
                None => self.finish_page(&task.seed, extraction.record),
            }
        } else if self.config.render_fallback && gate::needs_fallback(&extraction.record, self.rules) {
            debug!(url = %task.seed.key, missing = ?extraction.missing, "render fallback");
            self.counts.render_fallbacks += 1;
            self.pending
                .insert(task.seed.key.clone(), (task.seed.clone(), extraction.record));
            self.queue.push_front(Task {
                seed: task.seed,
                render: true,
            });
        } else {
            self.finish_page(&task.seed, extraction.record);
        }
        Ok(())
    }

    /// Rendered pass failed; emit what the static pass found.
    fn settle_pending(&mut self, seed: &Seed) {
        if let Some((_, static_pass)) = self.pending.remove(&seed.key) {
            self.finish_page(seed, static_pass);
        }
    }

    /// On cancellation, pages still waiting on a rendered pass keep their static result.
    fn settle_all(&mut self) {
        let waiting: Vec<(Seed, PartialRecord)> = self.pending.drain().map(|(_, v)| v).collect();
        for (seed, static_pass) in waiting {
            self.finish_page(&seed, static_pass);
        }
    }

    fn finish_page(&mut self, seed: &Seed, mut partial: PartialRecord) {
        self.pb.inc(1);
        partial.url = seed.key.clone();
        partial.parent = seed.parent.clone();
        self.counts.extracted += 1;

        match normalize::normalize(&partial) {
            Ok(record) => self.accept(seed, record),
            Err(reason) => self.reject(&seed.key, reason),
        }
    }

    fn accept(&mut self, seed: &Seed, record: Record) {
        let admitted = match (record, &mut self.collected) {
            (Record::Links(page), Collected::Links(out)) => {
                for (href, reason) in page.rejected {
                    self.rejections.push(Rejection::new(&href, &reason));
                    self.counts.rejected += 1;
                    warn!(url = %href, field = reason.field(), invariant = reason.invariant(), "rejected: {}", reason);
                }
                let mut fresh = 0;
                for link in page.links {
                    if self.validator.first_seen(&link.url) {
                        fresh += 1;
                        out.push(link);
                    } else {
                        self.counts.duplicates += 1;
                    }
                }
                debug!(page = seed.page, fresh, "listing page");
                if page.has_next && fresh > 0 && seed.page < self.config.max_listing_pages {
                    let url = self.stage.site.listing_url(seed.page + 1);
                    self.queue.push_back(Task {
                        seed: Seed {
                            key: url.clone(),
                            fetch_url: url,
                            parent: None,
                            page: seed.page + 1,
                        },
                        render: false,
                    });
                    self.counts.total += 1;
                    self.pb.inc_length(1);
                }
                Ok(())
            }
            (Record::Model(entry), Collected::Models(out)) => {
                self.validator.admit(&entry).map(|_| out.push(entry))
            }
            (Record::Variation(v), Collected::Variations(out)) => {
                self.validator.admit_variation(&v).map(|_| out.push(v))
            }
            (record, _) => {
                warn!(stage = self.stage.name, "unexpected record {:?}", record);
                Ok(())
            }
        };
        if let Err(reason) = admitted {
            self.reject(&seed.key, reason);
        }
    }

    fn reject(&mut self, url: &str, reason: RejectionReason) {
        warn!(url, field = reason.field(), invariant = reason.invariant(), "rejected: {}", reason);
        self.counts.rejected += 1;
        self.rejections.push(Rejection::new(url, &reason));
    }

    fn finish(mut self, cancelled: bool) -> Result<StageReport, SystemicFailure> {
        // A render task that died leaves its static pass here.
        self.settle_all();
        self.pb.finish_and_clear();
        let attempted = self.counts.total - self.queue.len();

        if !cancelled && attempted > 0 && self.counts.extracted == 0 {
            return Err(SystemicFailure::NothingExtracted {
                stage: self.stage.name.to_string(),
                attempted,
            });
        }

        let collected = std::mem::replace(&mut self.collected, Collected::Links(Vec::new()));
        let (path, records) = match collected {
            Collected::Links(links) => self.publish(links, cancelled)?,
            Collected::Models(models) => self.publish(models, cancelled)?,
            Collected::Variations(vars) => self.publish(vars, cancelled)?,
        };

        info!(
            stage = self.stage.name,
            fetched = self.counts.fetched,
            extracted = self.counts.extracted,
            rejected = self.counts.rejected,
            path = ?path,
            "stage finished"
        );

        let rejection_samples = self.rejections.iter().take(REJECTION_SAMPLES).cloned().collect();
        Ok(StageReport {
            stage: self.stage.name,
            counts: self.counts,
            records,
            partial: cancelled,
            path,
            rejection_samples,
        })
    }

    fn publish<R: Serialize + Keyed>(
        &self,
        records: Vec<R>,
        partial: bool,
    ) -> Result<(PathBuf, usize), SystemicFailure> {
        let mut a = Artifact {
            stage: self.stage.name.to_string(),
            site: self.stage.site,
            generated_at: Utc::now(),
            partial,
            counts: self.counts.clone(),
            rejections: self.rejections.clone(),
            records,
        };
        let path = artifact::write(&self.config.output_dir, &mut a)?;
        Ok((path, a.records.len()))
    }
}
