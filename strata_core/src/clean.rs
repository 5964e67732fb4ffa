//! The clean orchestrator: removes filestore records found invalid by
//! verification, subject to pin protection and conflict detection.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::filestore::{Filestore, Snapshot};
use crate::key::Key;
use crate::multi::MultiBlockstore;
use crate::pin::Pinner;
use crate::store::{BlockStore, stream_send};
use crate::verify::{self, Kind, VerifyParams};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Buffer size for the progress line channel.
const LINE_BUF: usize = 16;

/// Link hops validated when clean runs a deep verification.
const CLEAN_LEVEL: u32 = 6;

/// Environment variable injecting a delay (milliseconds) before the delete
/// phase. Test-only: widens the race window between snapshot and removal.
const CLEAN_RM_DELAY_ENV: &str = "STRATA_CLEAN_RM_DELAY";

/// A lazy sequence of human-readable progress lines.
pub struct LineStream {
    rx: Receiver<String>,
}

impl LineStream {
    fn new(rx: Receiver<String>) -> Self {
        Self { rx }
    }
}

impl Iterator for LineStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx.recv().ok()
    }
}

/// Expand kind arguments into the requested set.
///
/// Accepts the five kind names plus the group aliases `invalid` (changed,
/// no-file, error) and `full` (invalid plus incomplete and orphan).
pub fn parse_kinds<S: AsRef<str>>(args: &[S]) -> Result<HashSet<Kind>> {
    let mut kinds = HashSet::new();
    let mut queue: Vec<String> = args.iter().map(|s| s.as_ref().to_string()).collect();
    while let Some(arg) = queue.pop() {
        match arg.as_str() {
            "invalid" => {
                queue.extend(["changed", "no-file", "error"].map(String::from));
            }
            "full" => {
                queue.extend(["invalid", "incomplete", "orphan"].map(String::from));
            }
            other => {
                kinds.insert(other.parse::<Kind>()?);
            }
        }
    }
    Ok(kinds)
}

/// The verification stage a clean run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    /// Per-record scan only.
    Basic,
    /// Full recursive verification.
    Full { skip_orphans: bool, level: u32 },
    /// Full verification plus a second orphan-aware pass.
    PostOrphan,
}

/// Minimal verification stage covering the requested kinds.
///
/// A total lookup over the power set of kind groups; the only illegal
/// input is requesting nothing at all.
fn stage_for(kinds: &HashSet<Kind>) -> Result<Stage> {
    let file = kinds.contains(&Kind::Changed)
        || kinds.contains(&Kind::NoFile)
        || kinds.contains(&Kind::Error);
    let incomplete = kinds.contains(&Kind::Incomplete);
    let orphan = kinds.contains(&Kind::Orphan);

    match (file, incomplete, orphan) {
        (false, false, false) => Err(Error::invalid_arg("no kinds requested")),
        (true, false, false) => Ok(Stage::Basic),
        // Orphan status must not be assigned when orphans are not being
        // removed.
        (false, true, false) => Ok(Stage::Full {
            skip_orphans: true,
            level: 1,
        }),
        (true, true, false) | (true, false, true) | (false, false, true) => Ok(Stage::Full {
            skip_orphans: false,
            level: CLEAN_LEVEL,
        }),
        (_, true, true) => Ok(Stage::PostOrphan),
    }
}

/// Run the minimal covering verification and remove every record whose
/// status matches a requested kind.
///
/// Verification scans a snapshot taken up front. Removal happens under the
/// store's exclusion lock: each candidate is re-checked against the live
/// pin set, then deleted through the filestore's optimistic update. In
/// shared mode (`exclusive` false) the record's current value is compared
/// against the snapshot first; a concurrent change refuses the removal and
/// reports `value changed`. Removal problems are reported per line, never
/// as pipeline failures. `quiet` suppresses non-error lines.
pub fn clean<S: AsRef<str>>(
    store: &Arc<MultiBlockstore>,
    pinner: Arc<dyn Pinner>,
    fs: &Arc<Filestore>,
    exclusive: bool,
    quiet: bool,
    kinds: &[S],
    cancel: &CancelToken,
) -> Result<LineStream> {
    let kinds = parse_kinds(kinds)?;
    let stage = stage_for(&kinds)?;
    let incomplete_when: Vec<Kind> = [Kind::Changed, Kind::NoFile, Kind::Error]
        .into_iter()
        .filter(|k| kinds.contains(k))
        .collect();

    let snapshot = Arc::new(fs.snapshot()?);
    debug!("starting clean operation");

    let (tx, rx) = bounded(LINE_BUF);
    let out = Output {
        tx,
        cancel: cancel.clone(),
        quiet,
    };
    let store = store.clone();
    let fs = fs.clone();
    let cancel = cancel.clone();
    thread::spawn(move || {
        let incomplete_when_str = incomplete_when
            .iter()
            .map(Kind::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let companion = store.clone() as Arc<dyn BlockStore>;
        let stream = match &stage {
            Stage::Basic => {
                if !out.progress(format!("performing verify --basic --level={}", CLEAN_LEVEL)) {
                    return;
                }
                verify::verify_basic(
                    snapshot.clone(),
                    &VerifyParams {
                        level: CLEAN_LEVEL,
                        verbose: 1,
                        skip_orphans: false,
                        incomplete_when: incomplete_when.clone(),
                        no_obj_info: true,
                    },
                    &cancel,
                )
            }
            Stage::Full {
                skip_orphans: true,
                level,
            } => {
                if !out.progress(format!("performing verify --skip-orphans --level={}", level)) {
                    return;
                }
                verify::verify_full(
                    snapshot.clone(),
                    companion,
                    &VerifyParams {
                        level: *level,
                        verbose: 6,
                        skip_orphans: true,
                        incomplete_when: incomplete_when.clone(),
                        no_obj_info: true,
                    },
                    &cancel,
                )
            }
            Stage::Full {
                skip_orphans: false,
                level,
            } => {
                if !out.progress(format!(
                    "performing verify --level={} --incomplete-when={}",
                    level, incomplete_when_str
                )) {
                    return;
                }
                verify::verify_full(
                    snapshot.clone(),
                    companion,
                    &VerifyParams {
                        level: *level,
                        verbose: 6,
                        skip_orphans: false,
                        incomplete_when: incomplete_when.clone(),
                        no_obj_info: true,
                    },
                    &cancel,
                )
            }
            Stage::PostOrphan => {
                if !out.progress(format!(
                    "performing verify-post-orphan --level={} --incomplete-when={}",
                    CLEAN_LEVEL, incomplete_when_str
                )) {
                    return;
                }
                verify::verify_post_orphan(
                    snapshot.clone(),
                    companion,
                    CLEAN_LEVEL,
                    incomplete_when.clone(),
                    &cancel,
                )
            }
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                out.error(format!("clean failed: {}", err));
                return;
            }
        };

        let mut to_del = Vec::new();
        for res in stream {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(key) = res.key {
                if kinds.iter().any(|k| k.matches(res.status)) {
                    to_del.push(key);
                }
            }
        }

        debug_clean_rm_delay();

        let snap = if exclusive { None } else { Some(&*snapshot) };
        rm_blocks(&store, pinner.as_ref(), &fs, snap, to_del, &out, &cancel);
    });

    Ok(LineStream::new(rx))
}

/// Remove candidate keys from the record database.
///
/// Holds the store's exclusion lock for the pin-check-and-delete phase,
/// serializing clean against GC and against itself.
fn rm_blocks(
    store: &Arc<MultiBlockstore>,
    pinner: &dyn Pinner,
    fs: &Arc<Filestore>,
    snap: Option<&Snapshot>,
    keys: Vec<Key>,
    out: &Output,
    cancel: &CancelToken,
) {
    if snap.is_some() {
        debug!("removing invalid blocks after clean, shared mode");
    } else {
        debug!("removing invalid blocks after clean, exclusive mode");
    }

    let _guard = store.gc_lock();

    let still_okay = check_pins(pinner, keys, out);

    for key in still_okay {
        if cancel.is_cancelled() {
            return;
        }
        let expected = match snap {
            Some(snap) => match snap.get_raw(&key) {
                Some(raw) => Some(raw),
                None => {
                    if !out.error(format!("cannot remove {}: not found in snapshot", key)) {
                        return;
                    }
                    continue;
                }
            },
            None => None,
        };
        let line_ok = match fs.update(&key, expected, None) {
            Ok(()) => out.progress(format!("removed {}", key)),
            Err(Error::Conflict { .. }) => {
                out.error(format!("cannot remove {}: value changed", key))
            }
            Err(err) => out.error(format!("cannot remove {}: {}", key, err)),
        };
        if !line_ok {
            return;
        }
    }
}

/// Drop candidates the live pin set still protects, reporting each one.
fn check_pins(pinner: &dyn Pinner, keys: Vec<Key>, out: &Output) -> Vec<Key> {
    let mut still_okay = Vec::new();
    for key in keys {
        match pinner.is_pinned(&key) {
            Ok(None) => still_okay.push(key),
            Ok(Some(reason)) => {
                if !out.error(format!("cannot remove {}: pinned: {}", key, reason)) {
                    return still_okay;
                }
            }
            Err(err) => {
                if !out.error(format!("cannot remove {}: pin check failed: {}", key, err)) {
                    return still_okay;
                }
            }
        }
    }
    still_okay
}

struct Output {
    tx: Sender<String>,
    cancel: CancelToken,
    quiet: bool,
}

impl Output {
    /// Ordinary progress, suppressed in quiet mode.
    fn progress(&self, line: String) -> bool {
        if self.quiet {
            return true;
        }
        stream_send(&self.tx, &self.cancel, line)
    }

    /// Problem lines are always reported.
    fn error(&self, line: String) -> bool {
        stream_send(&self.tx, &self.cancel, line)
    }
}

/// Test hook: sleep before the delete phase to widen the race window
/// between snapshot capture and removal. Not a production interface.
fn debug_clean_rm_delay() {
    let delay_str = match std::env::var(CLEAN_RM_DELAY_ENV) {
        Ok(s) => s,
        Err(_) => return,
    };
    match delay_str.parse::<u64>() {
        Ok(millis) => thread::sleep(Duration::from_millis(millis)),
        Err(_) => warn!(value = %delay_str, "invalid value for {}", CLEAN_RM_DELAY_ENV),
    }
}
