//! The verification engine: classifies filestore records against the real
//! filesystem state and the DAG structure they belong to.

use crate::cancel::CancelToken;
use crate::dataobj::{DataObj, FileState};
use crate::error::{Error, Result};
use crate::filestore::{Filestore, Snapshot};
use crate::key::Key;
use crate::node::DagNode;
use crate::store::{BlockStore, stream_send};
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

/// Buffer size for listing/verification result channels.
const LIST_BUF: usize = 128;

/// Validate link hops without bound.
pub const LEVEL_UNLIMITED: u32 = u32::MAX;

/// Per-key verification outcome.
///
/// Codes group by tens digit: 0x success, 1x block-level error, 2x
/// non-block (intermediate node) error, 3x database-level error, 9x
/// unchecked or fully verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// No verification attempted (plain listing output).
    Default,
    /// Record checked out.
    Ok,
    /// Found key, but not in the filestore.
    Found,
    /// Backing file grew past the recorded range, range content intact.
    Appended,
    /// Record's root is unreachable from any known root.
    Orphan,
    /// Generic error checking the backing file.
    FileError,
    /// Backing file no longer exists.
    FileMissing,
    /// Backing file no longer matches the record.
    FileChanged,
    /// An intermediate node with invalid or unresolvable children.
    Incomplete,
    /// Database failure unrelated to the record itself.
    DbError,
    /// Key not found in the database nor the companion store.
    KeyNotFound,
    /// Stored bytes failed to decode.
    Corrupt,
    /// Not verified.
    Unchecked,
    /// Fully verified, descendants included.
    Complete,
}

/// Status family, the tens digit of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    /// 0x: success.
    Success,
    /// 1x: block-level error.
    Block,
    /// 2x: non-block (intermediate node) error.
    Node,
    /// 3x: database-level error.
    Database,
    /// 9x: unchecked or complete.
    Unchecked,
}

impl Status {
    /// Numeric status code.
    pub fn code(&self) -> u8 {
        match self {
            Status::Default => 0,
            Status::Ok => 1,
            Status::Found => 2,
            Status::Appended => 3,
            Status::Orphan => 4,
            Status::FileError => 10,
            Status::FileMissing => 11,
            Status::FileChanged => 12,
            Status::Incomplete => 20,
            Status::DbError => 30,
            Status::KeyNotFound => 31,
            Status::Corrupt => 32,
            Status::Unchecked => 90,
            Status::Complete => 91,
        }
    }

    /// The family this status belongs to.
    pub fn family(&self) -> StatusFamily {
        match self.code() / 10 {
            0 => StatusFamily::Success,
            1 => StatusFamily::Block,
            2 => StatusFamily::Node,
            3 => StatusFamily::Database,
            _ => StatusFamily::Unchecked,
        }
    }

    /// Fixed-width label prefixed to listing lines.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Default => "",
            Status::Ok => "ok       ",
            Status::Found => "found    ",
            Status::Appended => "appended ",
            Status::Orphan => "orphan   ",
            Status::FileError => "error    ",
            Status::FileMissing => "no-file  ",
            Status::FileChanged => "changed  ",
            Status::Incomplete => "incomplete ",
            Status::DbError => "ERROR    ",
            Status::KeyNotFound => "missing  ",
            Status::Corrupt => "ERROR    ",
            Status::Unchecked => "         ",
            Status::Complete => "complete ",
        }
    }

    /// True for block, node, and database level problems.
    pub fn is_error(&self) -> bool {
        (10..90).contains(&self.code())
    }

    /// True for failures of the database itself.
    pub fn is_internal_error(&self) -> bool {
        matches!(self, Status::DbError | Status::Corrupt)
    }

    /// Everything except ok, unchecked, and complete is worth reporting.
    pub fn of_interest(&self) -> bool {
        !matches!(self, Status::Ok | Status::Unchecked | Status::Complete)
    }
}

/// A removable problem category, the vocabulary shared by
/// `incomplete_when` and clean's kind selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// Backing file changed.
    Changed,
    /// Backing file missing.
    NoFile,
    /// Generic block-level error.
    Error,
    /// Intermediate node with invalid children.
    Incomplete,
    /// Record unreachable from any root.
    Orphan,
}

impl Kind {
    /// Name used in CLI arguments and progress lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Changed => "changed",
            Kind::NoFile => "no-file",
            Kind::Error => "error",
            Kind::Incomplete => "incomplete",
            Kind::Orphan => "orphan",
        }
    }

    /// The status this kind selects.
    pub fn matches(&self, status: Status) -> bool {
        match self {
            Kind::Changed => status == Status::FileChanged,
            Kind::NoFile => status == Status::FileMissing,
            Kind::Error => status == Status::FileError,
            Kind::Incomplete => status == Status::Incomplete,
            Kind::Orphan => status == Status::Orphan,
        }
    }
}

impl std::str::FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "changed" => Ok(Kind::Changed),
            "no-file" => Ok(Kind::NoFile),
            "error" => Ok(Kind::Error),
            "incomplete" => Ok(Kind::Incomplete),
            "orphan" => Ok(Kind::Orphan),
            _ => Err(Error::invalid_arg(format!("invalid kind: {}", s))),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan result: key, optional record, status.
///
/// Transient, never persisted. Consumed by the CLI streaming layer or by
/// clean's removal decision.
#[derive(Debug, Clone)]
pub struct ListRes {
    /// The scanned key. `None` renders as a bare newline and is used as a
    /// pass separator.
    pub key: Option<Key>,
    /// The record, when available and requested.
    pub data_obj: Option<DataObj>,
    /// Verification outcome.
    pub status: Status,
}

impl ListRes {
    /// A result carrying nothing; formats as a bare newline.
    pub fn empty() -> Self {
        Self {
            key: None,
            data_obj: None,
            status: Status::Default,
        }
    }

    /// Human-readable status, `"unchecked"` when blank.
    pub fn status_str(&self) -> String {
        let label = self.status.label().trim_end();
        if label.is_empty() {
            "unchecked".to_string()
        } else {
            label.to_string()
        }
    }

    /// Listing line: `<status label><key hex> <metadata summary>\n`.
    ///
    /// A result with no record renders as `<label><key>\n`; an empty key
    /// renders as a bare newline. This exact textual form is what the CLI
    /// streams.
    pub fn format(&self) -> String {
        let key = match &self.key {
            Some(key) => key,
            None => return "\n".to_string(),
        };
        match &self.data_obj {
            None => format!("{}{}\n", self.status.label(), key.to_hex()),
            Some(obj) => format!("{}{} {}\n", self.status.label(), key.to_hex(), obj.format()),
        }
    }
}

/// Verification configuration.
#[derive(Debug, Clone)]
pub struct VerifyParams {
    /// How many link hops to validate recursively ([`LEVEL_UNLIMITED`] for
    /// no bound).
    pub level: u32,
    /// Output verbosity: interesting results always stream, `ok` from 7,
    /// unchecked and complete from 9.
    pub verbose: u32,
    /// Do not flag records whose root is unreachable.
    pub skip_orphans: bool,
    /// Child conditions that mark the containing node incomplete.
    pub incomplete_when: Vec<Kind>,
    /// Suppress the metadata echo in output.
    pub no_obj_info: bool,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            level: 1,
            verbose: 0,
            skip_orphans: false,
            incomplete_when: vec![Kind::Changed, Kind::NoFile],
            no_obj_info: false,
        }
    }
}

/// A lazy, finite, non-restartable sequence of scan results.
pub struct ListStream {
    rx: Receiver<ListRes>,
}

impl ListStream {
    fn new(rx: Receiver<ListRes>) -> Self {
        Self { rx }
    }
}

impl Iterator for ListStream {
    type Item = ListRes;

    fn next(&mut self) -> Option<ListRes> {
        self.rx.recv().ok()
    }
}

/// Stream every record key, without decoding values.
pub fn list_keys(fs: &Arc<Filestore>, cancel: &CancelToken) -> Result<ListStream> {
    let keys = fs.keys(cancel)?;
    let (tx, rx) = bounded(LIST_BUF);
    let cancel = cancel.clone();
    thread::spawn(move || {
        for key in keys {
            let res = ListRes {
                key: Some(key),
                data_obj: None,
                status: Status::Default,
            };
            if !stream_send(&tx, &cancel, res) {
                return;
            }
        }
    });
    Ok(ListStream::new(rx))
}

/// Stream decoded records passing the filter.
pub fn list<F>(fs: &Arc<Filestore>, filter: F, cancel: &CancelToken) -> Result<ListStream>
where
    F: Fn(&ListRes) -> bool + Send + 'static,
{
    let keys = fs.keys(cancel)?;
    let fs = fs.clone();
    let (tx, rx) = bounded(LIST_BUF);
    let cancel = cancel.clone();
    thread::spawn(move || {
        for key in keys {
            let data_obj = match fs.get_raw(&key) {
                Ok(raw) => DataObj::decode(&raw).ok(),
                Err(_) => None,
            };
            let res = ListRes {
                key: Some(key),
                data_obj,
                status: Status::Default,
            };
            if filter(&res) && !stream_send(&tx, &cancel, res) {
                return;
            }
        }
    });
    Ok(ListStream::new(rx))
}

/// Stream every record.
pub fn list_all(fs: &Arc<Filestore>, cancel: &CancelToken) -> Result<ListStream> {
    list(fs, |_| true, cancel)
}

/// Stream whole-file records only.
pub fn list_whole_file(fs: &Arc<Filestore>, cancel: &CancelToken) -> Result<ListStream> {
    list(
        fs,
        |res| res.data_obj.as_ref().is_some_and(DataObj::whole_file),
        cancel,
    )
}

/// Stream records for the given keys; absent keys are skipped.
pub fn list_by_key(fs: &Arc<Filestore>, keys: Vec<Key>, cancel: &CancelToken) -> Result<ListStream> {
    let fs = fs.clone();
    let (tx, rx) = bounded(LIST_BUF);
    let cancel = cancel.clone();
    thread::spawn(move || {
        for key in keys {
            if let Ok(obj) = fs.get(&key) {
                let res = ListRes {
                    key: Some(key),
                    data_obj: Some(obj),
                    status: Status::Default,
                };
                if !stream_send(&tx, &cancel, res) {
                    return;
                }
            }
        }
    });
    Ok(ListStream::new(rx))
}

/// Classify one raw record against the filesystem.
fn classify_record(key: &Key, raw: &[u8]) -> (Option<DataObj>, Status) {
    let obj = match DataObj::decode(raw) {
        Ok(obj) => obj,
        Err(_) => return (None, Status::Corrupt),
    };
    let status = classify_obj(key, &obj);
    (Some(obj), status)
}

fn classify_obj(key: &Key, obj: &DataObj) -> Status {
    if obj.file_path.is_empty() {
        // Purely inline record, nothing on disk to diverge from.
        return Status::Ok;
    }
    match obj.verify_backing(key) {
        Ok(FileState::Intact) => Status::Ok,
        Ok(FileState::Appended) => Status::Appended,
        Err(Error::FileMissing { .. }) => Status::FileMissing,
        Err(err) if err.is_invalid_block() => Status::FileChanged,
        Err(_) => Status::FileError,
    }
}

fn should_emit(status: Status, verbose: u32) -> bool {
    if status.of_interest() {
        return true;
    }
    match status {
        Status::Ok => verbose >= 7,
        _ => verbose >= 9,
    }
}

/// Basic verification: classify every record in the scan source on its own,
/// with no link traversal.
///
/// Per-key failures never abort the scan; every key gets an independent
/// status.
pub fn verify_basic(
    snapshot: Arc<Snapshot>,
    params: &VerifyParams,
    cancel: &CancelToken,
) -> Result<ListStream> {
    let params = params.clone();
    let cancel = cancel.clone();
    let (tx, rx) = bounded(LIST_BUF);
    thread::spawn(move || {
        for (key, raw) in snapshot.iter() {
            if cancel.is_cancelled() {
                return;
            }
            let (obj, status) = classify_record(key, raw);
            if !should_emit(status, params.verbose) {
                continue;
            }
            let res = ListRes {
                key: Some(*key),
                data_obj: if params.no_obj_info { None } else { obj },
                status,
            };
            if !stream_send(&tx, &cancel, res) {
                return;
            }
        }
    });
    Ok(ListStream::new(rx))
}

/// Full verification: walk every root record's DAG up to `params.level`
/// hops, cross-referencing the companion block store for keys with no
/// record, then classify the remainder (orphans, unless `skip_orphans`).
pub fn verify_full(
    snapshot: Arc<Snapshot>,
    companion: Arc<dyn BlockStore>,
    params: &VerifyParams,
    cancel: &CancelToken,
) -> Result<ListStream> {
    let (tx, rx) = bounded(LIST_BUF);
    let mut verifier = FullVerifier::new(
        snapshot,
        companion,
        params.clone(),
        cancel.clone(),
        Some(tx),
        HashSet::new(),
    );
    thread::spawn(move || verifier.run());
    Ok(ListStream::new(rx))
}

/// Full verification run twice: the first pass determines orphans, the
/// second re-verifies the remainder excluding them.
///
/// Orphan status can only be known after a complete pass, so combinations
/// that remove both incomplete and orphan records need this staging. The
/// passes are separated by an empty result in the output, followed by one
/// orphan line per orphan.
pub fn verify_post_orphan(
    snapshot: Arc<Snapshot>,
    companion: Arc<dyn BlockStore>,
    level: u32,
    incomplete_when: Vec<Kind>,
    cancel: &CancelToken,
) -> Result<ListStream> {
    let (tx, rx) = bounded(LIST_BUF);
    let cancel = cancel.clone();
    thread::spawn(move || {
        let pass1 = VerifyParams {
            level,
            verbose: 0,
            skip_orphans: false,
            incomplete_when: incomplete_when.clone(),
            no_obj_info: true,
        };
        let mut first = FullVerifier::new(
            snapshot.clone(),
            companion.clone(),
            pass1,
            cancel.clone(),
            None,
            HashSet::new(),
        );
        first.run();

        let mut orphans: Vec<Key> = first
            .statuses
            .iter()
            .filter(|(_, status)| **status == Status::Orphan)
            .map(|(key, _)| *key)
            .collect();
        orphans.sort();

        let pass2 = VerifyParams {
            level,
            verbose: 6,
            skip_orphans: false,
            incomplete_when,
            no_obj_info: true,
        };
        let mut second = FullVerifier::new(
            snapshot.clone(),
            companion,
            pass2,
            cancel.clone(),
            Some(tx.clone()),
            orphans.iter().copied().collect(),
        );
        second.run();

        if !stream_send(&tx, &cancel, ListRes::empty()) {
            return;
        }
        for key in orphans {
            let res = ListRes {
                key: Some(key),
                data_obj: None,
                status: Status::Orphan,
            };
            if !stream_send(&tx, &cancel, res) {
                return;
            }
        }
    });
    Ok(ListStream::new(rx))
}

struct FullVerifier {
    snap: Arc<Snapshot>,
    companion: Arc<dyn BlockStore>,
    params: VerifyParams,
    cancel: CancelToken,
    tx: Option<Sender<ListRes>>,
    statuses: HashMap<Key, Status>,
    exclude: HashSet<Key>,
    stopped: bool,
}

impl FullVerifier {
    fn new(
        snap: Arc<Snapshot>,
        companion: Arc<dyn BlockStore>,
        params: VerifyParams,
        cancel: CancelToken,
        tx: Option<Sender<ListRes>>,
        exclude: HashSet<Key>,
    ) -> Self {
        Self {
            snap,
            companion,
            params,
            cancel,
            tx,
            statuses: HashMap::new(),
            exclude,
            stopped: false,
        }
    }

    fn run(&mut self) {
        let snap = self.snap.clone();

        // Walk every root's DAG first.
        for (key, raw) in snap.iter() {
            if self.done() {
                return;
            }
            if self.exclude.contains(key) {
                continue;
            }
            if let Ok(obj) = DataObj::decode_light(raw) {
                if obj.file_root() {
                    self.verify_node(key, self.params.level);
                }
            }
        }

        // Records never reached from any root.
        for (key, raw) in snap.iter() {
            if self.done() {
                return;
            }
            if self.exclude.contains(key) || self.statuses.contains_key(key) {
                continue;
            }
            let (obj, status) = if self.params.skip_orphans {
                classify_record(key, raw)
            } else {
                match DataObj::decode(raw) {
                    Ok(obj) => (Some(obj), Status::Orphan),
                    Err(_) => (None, Status::Corrupt),
                }
            };
            self.statuses.insert(*key, status);
            self.emit(key, obj, status);
        }
    }

    fn done(&self) -> bool {
        self.stopped || self.cancel.is_cancelled()
    }

    /// Verify one key, descending up to `remaining` further hops.
    ///
    /// A key already verified is not re-descended; shared substructure and
    /// cycles terminate here.
    fn verify_node(&mut self, key: &Key, remaining: u32) -> Status {
        if let Some(status) = self.statuses.get(key) {
            return *status;
        }

        let (node, obj, fetch_status) = self.get_node(key);
        let status = if fetch_status.is_internal_error() || fetch_status == Status::KeyNotFound {
            fetch_status
        } else {
            match &node {
                Some(node) => self.verify_children(key, obj.as_ref(), node, remaining, fetch_status),
                None => match &obj {
                    Some(obj) => classify_obj(key, obj),
                    // A leaf resolved from the companion store.
                    None => fetch_status,
                },
            }
        };

        self.statuses.insert(*key, status);
        self.emit(key, obj, status);
        status
    }

    fn verify_children(
        &mut self,
        key: &Key,
        obj: Option<&DataObj>,
        node: &DagNode,
        remaining: u32,
        fetch_status: Status,
    ) -> Status {
        let mut incomplete = false;
        for child in &node.links {
            if self.done() {
                break;
            }
            let child_status = if remaining == 0 {
                // Beyond the requested level; record the visit so the
                // orphan sweep does not flag reachable children.
                match self.statuses.get(child) {
                    Some(status) => *status,
                    None => {
                        self.statuses.insert(*child, Status::Unchecked);
                        self.emit(child, None, Status::Unchecked);
                        Status::Unchecked
                    }
                }
            } else {
                let next = if remaining == LEVEL_UNLIMITED {
                    remaining
                } else {
                    remaining - 1
                };
                self.verify_node(child, next)
            };
            if child_makes_incomplete(child_status, &self.params.incomplete_when) {
                incomplete = true;
            }
        }

        // The node's own backing check takes precedence over aggregates.
        let self_status = match obj {
            Some(obj) => classify_obj(key, obj),
            None => fetch_status,
        };
        if self_status.is_error() {
            return self_status;
        }
        if incomplete {
            return Status::Incomplete;
        }
        match self_status {
            Status::Ok => Status::Complete,
            other => other,
        }
    }

    /// Resolve a key to a node, its record, or a companion-store block.
    fn get_node(&self, key: &Key) -> (Option<DagNode>, Option<DataObj>, Status) {
        if !self.exclude.contains(key) {
            if let Some(raw) = self.snap.get_raw(key) {
                let obj = match DataObj::decode(raw) {
                    Ok(obj) => obj,
                    Err(_) => return (None, None, Status::Corrupt),
                };
                if obj.no_block_data() {
                    // Leaf record: content lives in the file range, no node
                    // bytes to decode here.
                    return (None, Some(obj), Status::Unchecked);
                }
                let bytes = obj.alt_data.as_deref().or(obj.data.as_deref());
                return match bytes.map(DagNode::maybe_decode) {
                    Some(Ok(Some(node))) => (Some(node), Some(obj), Status::Ok),
                    Some(Ok(None)) | None => (None, Some(obj), Status::Ok),
                    Some(Err(_)) => (None, Some(obj), Status::Corrupt),
                };
            }
        }

        match self.companion.get(key) {
            Ok(block) => match DagNode::maybe_decode(block.data()) {
                Ok(Some(node)) => (Some(node), None, Status::Found),
                Ok(None) => (None, None, Status::Found),
                Err(_) => (None, None, Status::Corrupt),
            },
            Err(err) if err.is_not_found() => (None, None, Status::KeyNotFound),
            Err(_) => (None, None, Status::DbError),
        }
    }

    fn emit(&mut self, key: &Key, obj: Option<DataObj>, status: Status) {
        if !should_emit(status, self.params.verbose) {
            return;
        }
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return, // collect-only pass
        };
        let res = ListRes {
            key: Some(*key),
            data_obj: if self.params.no_obj_info { None } else { obj },
            status,
        };
        if !stream_send(tx, &self.cancel, res) {
            self.stopped = true;
        }
    }
}

/// Whether a child with this status marks its parent incomplete.
///
/// Unresolvable and internally broken children always do; block-level
/// conditions only when listed in `incomplete_when`.
fn child_makes_incomplete(status: Status, when: &[Kind]) -> bool {
    match status {
        Status::Incomplete | Status::KeyNotFound | Status::Corrupt | Status::DbError => true,
        Status::FileChanged => when.contains(&Kind::Changed),
        Status::FileMissing => when.contains(&Kind::NoFile),
        Status::FileError => when.contains(&Kind::Error),
        _ => false,
    }
}
