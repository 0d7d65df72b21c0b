//! The serial write actor.
//!
//! One thread owns the backend's write transaction and is the only
//! mutator of the roots, stowage, refcount, and zero-set tables. Each
//! cycle it drains the commit queue, validates read assumptions in
//! arrival order (earlier accepted commits are visible to later
//! validations), folds the survivors into one batched write, migrates
//! buffered stowage, maintains refcounts by scanning hash mentions,
//! runs bounded incremental GC, and advances the reader-frame
//! interlock before making the cycle durable.
//!
//! Failure here is fatal: once a write cannot be applied, the refcount
//! and zero-set invariants cannot be maintained, so the process logs
//! and exits.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cask_hash::{scan_deps, Hash, ShortHash, SHORT_LEN};
use tracing::{debug, error, info};

use crate::config::DbConfig;
use crate::db::Shared;
use crate::error::EngineResult;
use crate::frame::FrameLatch;
use crate::key::Key;
use crate::refcount::{checked_apply, RefCounts};

/// A commit submitted by a transaction: its read assumptions, its
/// buffered writes, and the channel its verdict is delivered on.
pub(crate) struct CommitRequest {
    pub reads: HashMap<Key, Vec<u8>>,
    pub writes: HashMap<Key, Vec<u8>>,
    pub reply: oneshot::Sender<bool>,
}

/// Message on the writer's queue.
pub(crate) enum WriterMsg {
    Commit(CommitRequest),
    /// Run a cycle without a commit: stowage arrived, GC has leftover
    /// work, or the database is shutting down.
    Wake,
}

pub(crate) struct Writer {
    shared: Arc<Shared>,
    refcounts: RefCounts,
    config: DbConfig,
    rx: flume::Receiver<WriterMsg>,
    /// Clone of the queue's sender, used to re-signal when a GC cycle
    /// stops at its cap with work remaining.
    wake: flume::Sender<WriterMsg>,
    kill: Arc<AtomicBool>,
    /// The frame that was current before the last commit. Readers
    /// still inside it pin the prior map generation; the next commit
    /// waits for them.
    prev_frame: Arc<FrameLatch>,
    /// Short hashes mentioned by root values overwritten in the last
    /// cycle. Readers may have picked those mentions up from the old
    /// frame without yet registering ephemerons, so they are exempt
    /// from GC for one cycle.
    hold: HashSet<ShortHash>,
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    config: DbConfig,
    rx: flume::Receiver<WriterMsg>,
    wake: flume::Sender<WriterMsg>,
    kill: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cask-writer".to_string())
        .spawn(move || {
            let refcounts = RefCounts::new(&shared.backend);
            let writer = Writer {
                shared,
                refcounts,
                config,
                rx,
                wake,
                kill,
                prev_frame: Arc::new(FrameLatch::new()),
                hold: HashSet::new(),
            };
            writer.run();
        })
}

impl Writer {
    fn run(mut self) {
        info!("writer started");
        loop {
            let mut shutting_down = self.kill.load(Ordering::Acquire);
            let mut batch = Vec::new();
            if !shutting_down {
                match self.rx.recv() {
                    Ok(WriterMsg::Commit(req)) => batch.push(req),
                    Ok(WriterMsg::Wake) | Err(_) => {}
                }
            }
            while let Ok(msg) = self.rx.try_recv() {
                if let WriterMsg::Commit(req) = msg {
                    batch.push(req);
                }
            }
            shutting_down = shutting_down || self.kill.load(Ordering::Acquire);

            let outcome = catch_unwind(AssertUnwindSafe(|| self.cycle(batch)));
            let more_gc = match outcome {
                Ok(Ok(more_gc)) => more_gc,
                Ok(Err(e)) => {
                    error!(component = "writer", error = %e, "write cycle failed; invariants cannot be maintained");
                    std::process::exit(1);
                }
                Err(_) => {
                    error!(component = "writer", "write cycle panicked; invariants cannot be maintained");
                    std::process::exit(1);
                }
            };

            if shutting_down {
                break;
            }
            if more_gc {
                let _ = self.wake.send(WriterMsg::Wake);
            }
        }
        info!("writer stopped");
    }

    /// One batching cycle. Returns whether GC stopped at its cap and
    /// wants another cycle.
    fn cycle(&mut self, batch: Vec<CommitRequest>) -> EngineResult<bool> {
        // Sample the stow buffer before the ephemeron table. `stow`
        // registers its ephemeron before inserting the buffer entry,
        // so a sampled entry with a live owner is always covered by
        // the (later) ephemeron sample.
        let stow_sample = self.shared.stow_buf.snapshot();
        let eph_sample = self.shared.eph.snapshot();

        let roots = self.shared.backend.roots();
        let stowage = self.shared.backend.stowage();
        let mut wtxn = self.shared.backend.write_txn()?;

        // Validate commits in arrival order. A read assumption is
        // checked against writes already accepted this cycle, then the
        // backend; absence reads as the empty value. Rejected commits
        // learn their fate immediately.
        let mut accepted: HashMap<Key, Vec<u8>> = HashMap::new();
        let mut replies = Vec::new();
        let mut rejected = 0usize;
        for req in batch {
            let mut ok = true;
            for (key, assumed) in &req.reads {
                let matches = match accepted.get(key) {
                    Some(value) => value == assumed,
                    None => {
                        let current = roots.get(&wtxn, key.as_bytes())?.unwrap_or(&[]);
                        current == assumed.as_slice()
                    }
                };
                if !matches {
                    ok = false;
                    break;
                }
            }
            if ok {
                accepted.extend(req.writes);
                replies.push(req.reply);
            } else {
                rejected += 1;
                let _ = req.reply.send(false);
            }
        }

        // Refcount deltas: +1 per mention in the batched writes, -1
        // per mention in the root values they overwrite (read in place
        // from the map). Overwrite mentions also become the next
        // cycle's hold set.
        let mut delta: HashMap<ShortHash, i64> = HashMap::new();
        let mut mentioned: HashSet<ShortHash> = HashSet::new();
        let mut overwrite_mentions: HashSet<ShortHash> = HashSet::new();
        for (key, value) in &accepted {
            for dep in scan_deps(value) {
                let s = dep.short();
                *delta.entry(s).or_insert(0) += 1;
                mentioned.insert(s);
            }
            if let Some(old) = roots.get(&wtxn, key.as_bytes())? {
                for dep in scan_deps(old) {
                    let s = dep.short();
                    *delta.entry(s).or_insert(0) -= 1;
                    overwrite_mentions.insert(s);
                }
            }
        }

        // Split the buffered stowage into entries already persisted
        // and genuinely new ones.
        let mut candidates: Vec<(Hash, Vec<u8>)> = Vec::new();
        let mut already_persisted: Vec<Hash> = Vec::new();
        for (h, blob) in stow_sample {
            if stowage.get(&wtxn, h.short().as_bytes())?.is_none() {
                candidates.push((h, blob));
            } else {
                already_persisted.push(h);
            }
        }

        // A new resource is persisted only if something can still
        // reach it: a live ephemeron, or a mention in this cycle's
        // writes — including mentions inside other kept new resources,
        // hence the fixpoint. The rest never became reachable and are
        // dropped without touching the backend. Kept resources
        // contribute a zero delta for their own key (they start
        // unreferenced unless mentioned) and +1 per mention in their
        // blob.
        let mut fresh: Vec<(Hash, Vec<u8>)> = Vec::new();
        loop {
            let (keep, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|(h, _)| {
                let s = h.short();
                eph_sample.contains(&s) || mentioned.contains(&s)
            });
            candidates = rest;
            if keep.is_empty() {
                break;
            }
            for (h, blob) in keep {
                delta.entry(h.short()).or_insert(0);
                for dep in scan_deps(&blob) {
                    let s = dep.short();
                    *delta.entry(s).or_insert(0) += 1;
                    mentioned.insert(s);
                }
                fresh.push((h, blob));
            }
        }
        let dropped: Vec<Hash> = candidates.into_iter().map(|(h, _)| h).collect();

        // Every short hash this cycle touches is off-limits to GC.
        let protected: HashSet<ShortHash> = delta.keys().copied().collect();

        // Incremental GC, effort proportional to the write. Seeds come
        // from the zero-set; collecting a resource decrefs its
        // mentions, and any mention that reaches zero cascades into
        // the candidate set, up to the cap.
        let quota = self.config.gc_quota_base + 2 * delta.len();
        let cascade_cap = self.config.gc_quota_factor * quota;
        let hold = &self.hold;
        let excluded =
            |s: &ShortHash| protected.contains(s) || eph_sample.contains(s) || hold.contains(s);

        let mut frontier = self.refcounts.take(&wtxn, quota, |s| !excluded(s))?;
        let mut collected: HashSet<ShortHash> = HashSet::new();
        let mut base: HashMap<ShortHash, u64> = HashMap::new();
        while !frontier.is_empty() && collected.len() < cascade_cap {
            let mut next = Vec::new();
            'cascade: for s in frontier {
                if !collected.insert(s) {
                    continue;
                }
                if let Some(stored) = stowage.get(&wtxn, s.as_bytes())? {
                    // Stored form is hash suffix ∥ blob.
                    for dep in scan_deps(&stored[SHORT_LEN..]) {
                        let ds = dep.short();
                        *delta.entry(ds).or_insert(0) -= 1;
                        if !base.contains_key(&ds) {
                            let count = self.refcounts.get(&wtxn, &ds)?;
                            base.insert(ds, count);
                        }
                        let resulting = base[&ds] as i64 + delta[&ds];
                        if resulting == 0 && !excluded(&ds) && !collected.contains(&ds) {
                            next.push(ds);
                        }
                    }
                }
                if collected.len() >= cascade_cap {
                    break 'cascade;
                }
            }
            frontier = next;
        }
        let gc_capped = collected.len() >= cascade_cap;

        // Read the persisted count of every surviving touched row
        // before any row is rewritten.
        for s in delta.keys() {
            if !base.contains_key(s) && !collected.contains(s) {
                let count = self.refcounts.get(&wtxn, s)?;
                base.insert(*s, count);
            }
        }

        // Apply. Order matters: collected resources leave all three
        // tables first, surviving refcount rows are rewritten next,
        // new resources are inserted (never overwriting), and the
        // batched root updates land last (empty value = delete).
        for s in &collected {
            stowage.delete(&mut wtxn, s.as_bytes())?;
            self.refcounts.purge(&mut wtxn, s)?;
            delta.remove(s);
        }
        for (s, d) in &delta {
            let current = base.get(s).copied().unwrap_or(0);
            let next = checked_apply(current, *d, s);
            self.refcounts.set(&mut wtxn, s, next)?;
        }
        for (h, blob) in &fresh {
            let mut value = Vec::with_capacity(SHORT_LEN + blob.len());
            value.extend_from_slice(h.suffix());
            value.extend_from_slice(blob);
            stowage.put_no_overwrite(&mut wtxn, h.short().as_bytes(), &value)?;
        }
        for (key, value) in &accepted {
            if value.is_empty() {
                roots.delete(&mut wtxn, key.as_bytes())?;
            } else {
                roots.put(&mut wtxn, key.as_bytes(), value)?;
            }
        }

        // Interlock: readers still in the frame before last must be
        // gone before the backend recycles their pages. Commit swaps
        // map generations; new readers then enter a fresh frame.
        self.prev_frame.wait_idle();
        wtxn.commit().map_err(cask_backend::BackendError::from)?;
        let retired = self.shared.frames.advance(Arc::new(FrameLatch::new()));
        self.prev_frame = retired;
        self.hold = overwrite_mentions;

        self.shared.backend.sync()?;

        // Only now, with the cycle durable, do committers learn they
        // succeeded.
        let accepted_count = replies.len();
        for reply in replies {
            let _ = reply.send(true);
        }

        // Prune the buffer. Entries now in the stowage table are
        // served from there; dropped entries are removed only if no
        // live transaction re-acquired them meanwhile.
        let persisted: Vec<Hash> = fresh.iter().map(|(h, _)| *h).collect();
        self.shared.stow_buf.remove(&persisted);
        self.shared.stow_buf.remove(&already_persisted);
        self.shared
            .stow_buf
            .remove_unless(&dropped, |h| self.shared.eph.contains(&h.short()));

        debug!(
            accepted = accepted_count,
            rejected,
            stowed = persisted.len(),
            collected = collected.len(),
            gc_capped,
            "write cycle"
        );
        Ok(gc_capped)
    }
}
