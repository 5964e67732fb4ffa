use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{
    Block, BlockStore, CancelToken, DagNode, DataObj, DiskBlockstore, FileBacking, FilePinner,
    Filestore, FilestoreAwareStore, FilestoreBlockstore, Key, ListRes, Mount, MultiBlockstore,
    PinKind, Pinner, Status, StoreLinkService, VerifyParams, clean_path, mod_time_of,
};
use tracing_subscriber::EnvFilter;

/// Strata - a layered content-addressed block store
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered content-addressed block store with file-backed records", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (defaults to STRATA_ROOT env var or ./strata-store)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init,

    /// Add a file to the filestore as file-backed records
    Add {
        /// Files to add
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Do not pin the resulting roots
        #[arg(long)]
        no_pin: bool,
    },

    /// List filestore records
    Ls {
        /// List only whole-file records
        #[arg(long)]
        whole_file: bool,

        /// List keys only
        #[arg(short, long)]
        keys: bool,

        /// Emit one JSON object per record
        #[arg(long)]
        json: bool,
    },

    /// Verify filestore records against the filesystem
    Verify {
        /// Per-record scan only, no link traversal
        #[arg(long)]
        basic: bool,

        /// Run full verification twice to classify orphans exactly
        #[arg(long)]
        post_orphan: bool,

        /// Link hops to validate recursively
        #[arg(long, default_value_t = 1)]
        level: u32,

        /// Output verbosity (0-9)
        #[arg(long, default_value_t = 6)]
        verbose: u32,

        /// Do not flag records whose root is unreachable
        #[arg(long)]
        skip_orphans: bool,

        /// Child conditions marking a node incomplete (changed, no-file, error)
        #[arg(long, value_delimiter = ',', default_values_t = ["changed".to_string(), "no-file".to_string()])]
        incomplete_when: Vec<String>,
    },

    /// Remove records found invalid by verification
    Clean {
        /// What to remove: changed, no-file, error, incomplete, orphan,
        /// invalid, full
        #[arg(required = true)]
        kinds: Vec<String>,

        /// Report problems only
        #[arg(short, long)]
        quiet: bool,

        /// No concurrent writers: skip the snapshot conflict check
        #[arg(long)]
        exclusive: bool,
    },

    /// Garbage collect unreferenced blocks from the cache mount
    Gc {
        /// Print each deleted key
        #[arg(short, long)]
        verbose: bool,
    },

    /// Report which mounts hold a key
    Locate {
        /// Key to look up
        key: String,
    },

    /// Manage pins
    #[command(subcommand)]
    Pin(PinCommands),
}

#[derive(Subcommand)]
enum PinCommands {
    /// Add a pin
    Add {
        /// Key to pin
        key: String,

        /// Pin collection: recursive, direct, or internal
        #[arg(long, default_value = "recursive")]
        kind: String,
    },

    /// List pins
    List,

    /// Remove a pin
    Rm {
        /// Key to unpin
        key: String,

        /// Pin collection: recursive, direct, or internal
        #[arg(long, default_value = "recursive")]
        kind: String,
    },
}

/// An opened store: union blockstore, record database, pins.
struct Node {
    store: Arc<MultiBlockstore>,
    records: Arc<Filestore>,
    pins: Arc<FilePinner>,
}

impl Node {
    fn links(&self) -> StoreLinkService {
        StoreLinkService::new(self.store.clone() as Arc<dyn BlockStore>)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Determine store root: CLI arg > STRATA_ROOT env var > ./strata-store default
    let root = cli
        .root
        .or_else(|| std::env::var("STRATA_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./strata-store"));

    match cli.command {
        Commands::Init => cmd_init(&root),
        Commands::Add { paths, no_pin } => cmd_add(&root, paths, no_pin),
        Commands::Ls {
            whole_file,
            keys,
            json,
        } => cmd_ls(&root, whole_file, keys, json),
        Commands::Verify {
            basic,
            post_orphan,
            level,
            verbose,
            skip_orphans,
            incomplete_when,
        } => cmd_verify(
            &root,
            basic,
            post_orphan,
            level,
            verbose,
            skip_orphans,
            incomplete_when,
        ),
        Commands::Clean {
            kinds,
            quiet,
            exclusive,
        } => cmd_clean(&root, kinds, quiet, exclusive),
        Commands::Gc { verbose } => cmd_gc(&root, verbose),
        Commands::Locate { key } => cmd_locate(&root, &key),
        Commands::Pin(pin_cmd) => match pin_cmd {
            PinCommands::Add { key, kind } => cmd_pin_add(&root, &key, &kind),
            PinCommands::List => cmd_pin_list(&root),
            PinCommands::Rm { key, kind } => cmd_pin_rm(&root, &key, &kind),
        },
    }
}

fn open_node(root: &Path) -> Result<Node> {
    if !root.exists() {
        anyhow::bail!(
            "No store at {} (run 'strata init' first)",
            root.display()
        );
    }

    let cache = Arc::new(
        DiskBlockstore::open(root.join("cache"))
            .with_context(|| format!("Failed to open cache mount at {}", root.display()))?,
    );
    let records = Arc::new(
        Filestore::open(root.join("filestore"))
            .with_context(|| format!("Failed to open filestore at {}", root.display()))?,
    );
    let store = Arc::new(MultiBlockstore::new(vec![
        Mount::new("cache", cache as Arc<dyn BlockStore>),
        Mount::new(
            "filestore",
            Arc::new(FilestoreBlockstore::new(records.clone())) as Arc<dyn BlockStore>,
        ),
    ])?);

    let links = Arc::new(StoreLinkService::new(store.clone() as Arc<dyn BlockStore>));
    let pins = Arc::new(FilePinner::open(root.join("pins"))?.with_link_service(links));

    Ok(Node {
        store,
        records,
        pins,
    })
}

fn cmd_init(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("cache"))?;
    fs::create_dir_all(root.join("filestore"))?;
    fs::create_dir_all(root.join("pins"))?;

    println!("Initialized strata store at {}", root.display());
    Ok(())
}

fn cmd_add(root: &Path, paths: Vec<PathBuf>, no_pin: bool) -> Result<()> {
    let node = open_node(root)?;

    for path in paths {
        let root_key = add_file(&node, &path)
            .with_context(|| format!("Failed to add file: {}", path.display()))?;

        if !no_pin {
            node.pins.add(PinKind::Recursive, &root_key)?;
        }
        println!("{} {}", root_key, path.display());
    }

    Ok(())
}

/// Ingest one file: a leaf record covering the whole content plus a root
/// node linking it. The file's bytes stay where they are.
fn add_file(node: &Node, path: &Path) -> Result<Key> {
    let data = fs::read(path)?;
    let meta = fs::metadata(path)?;
    let mod_time = mod_time_of(&meta)?;
    let size = data.len() as u64;

    let path_str = path.to_str().context("path is not valid utf-8")?;
    let abs = if path.is_absolute() {
        path_str.to_string()
    } else {
        format!("{}/{}", std::env::current_dir()?.display(), path_str)
    };
    let file_path = clean_path(&abs).into_owned();

    let aware = FilestoreAwareStore::new(
        node.store.clone() as Arc<dyn BlockStore>,
        node.records.clone(),
    );

    let leaf = Block::new(data).with_backing(FileBacking {
        file_path: file_path.clone(),
        offset: 0,
        size,
        mod_time,
        whole_file: false,
        alt_data: None,
    });
    let leaf_key = *leaf.key();

    let root = Block::new(DagNode::new(vec![leaf_key], Vec::new()).encode()).with_backing(
        FileBacking {
            file_path,
            offset: 0,
            size,
            mod_time,
            whole_file: true,
            alt_data: None,
        },
    );
    let root_key = *root.key();

    aware.put_many(vec![leaf, root])?;

    Ok(root_key)
}

/// JSON form of one listing line.
#[derive(Serialize)]
struct RecordInfo {
    key: Key,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    what: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mod_time: Option<String>,
}

impl RecordInfo {
    fn from_res(res: &ListRes, key: Key) -> Self {
        let obj = res.data_obj.as_ref();
        Self {
            key,
            status: res.status,
            what: obj.map(DataObj::what),
            file_path: obj.map(|o| o.file_path.clone()),
            offset: obj.map(|o| o.offset),
            size: obj.map(|o| o.size),
            mod_time: obj.map(|o| {
                chrono::DateTime::from_timestamp_nanos(o.mod_time)
                    .to_rfc3339()
            }),
        }
    }
}

fn print_stream(stream: impl Iterator<Item = ListRes>, json: bool) -> Result<()> {
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for res in stream {
        if json {
            let Some(key) = res.key else { continue };
            let info = RecordInfo::from_res(&res, key);
            writeln!(out, "{}", serde_json::to_string(&info)?)?;
        } else {
            write!(out, "{}", res.format())?;
        }
    }
    Ok(())
}

fn cmd_ls(root: &Path, whole_file: bool, keys: bool, json: bool) -> Result<()> {
    let node = open_node(root)?;
    let cancel = CancelToken::new();

    let stream = if keys {
        strata_core::list_keys(&node.records, &cancel)?
    } else if whole_file {
        strata_core::list_whole_file(&node.records, &cancel)?
    } else {
        strata_core::list_all(&node.records, &cancel)?
    };

    print_stream(stream, json)
}

fn cmd_verify(
    root: &Path,
    basic: bool,
    post_orphan: bool,
    level: u32,
    verbose: u32,
    skip_orphans: bool,
    incomplete_when: Vec<String>,
) -> Result<()> {
    let node = open_node(root)?;
    let cancel = CancelToken::new();

    let incomplete_when = incomplete_when
        .iter()
        .map(|s| s.parse())
        .collect::<strata_core::Result<Vec<_>>>()
        .context("Invalid --incomplete-when value")?;

    let snapshot = Arc::new(node.records.snapshot()?);
    let params = VerifyParams {
        level,
        verbose,
        skip_orphans,
        incomplete_when,
        no_obj_info: false,
    };

    let stream = if basic {
        strata_core::verify_basic(snapshot, &params, &cancel)?
    } else if post_orphan {
        strata_core::verify_post_orphan(
            snapshot,
            node.store.clone() as Arc<dyn BlockStore>,
            params.level,
            params.incomplete_when,
            &cancel,
        )?
    } else {
        strata_core::verify_full(
            snapshot,
            node.store.clone() as Arc<dyn BlockStore>,
            &params,
            &cancel,
        )?
    };

    print_stream(stream, false)
}

fn cmd_clean(root: &Path, kinds: Vec<String>, quiet: bool, exclusive: bool) -> Result<()> {
    let node = open_node(root)?;
    let cancel = CancelToken::new();

    let lines = strata_core::clean(
        &node.store,
        node.pins.clone() as Arc<dyn Pinner>,
        &node.records,
        exclusive,
        quiet,
        &kinds,
        &cancel,
    )
    .with_context(|| "Failed to start clean")?;

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_gc(root: &Path, verbose: bool) -> Result<()> {
    let node = open_node(root)?;
    let cancel = CancelToken::new();
    let links = node.links();

    let deleted = strata_core::gc(&cancel, &node.store, &links, node.pins.as_ref(), &[])
        .with_context(|| "Failed to run garbage collection")?;

    let mut count = 0usize;
    for key in deleted {
        count += 1;
        if verbose {
            println!("removed {}", key);
        }
    }
    println!("Deleted {} blocks", count);
    Ok(())
}

fn cmd_locate(root: &Path, key_str: &str) -> Result<()> {
    let node = open_node(root)?;
    let key = Key::from_hex(key_str).with_context(|| format!("Invalid key: {}", key_str))?;

    for info in node.store.locate(&key) {
        let state = if info.present {
            "found".to_string()
        } else {
            match info.error {
                Some(err) => format!("error: {}", err),
                None => "not found".to_string(),
            }
        };
        println!("{}: {}", info.mount, state);
    }
    Ok(())
}

fn parse_pin_kind(kind: &str) -> Result<PinKind> {
    match kind {
        "recursive" => Ok(PinKind::Recursive),
        "direct" => Ok(PinKind::Direct),
        "internal" => Ok(PinKind::Internal),
        _ => anyhow::bail!("Invalid pin kind: {} (expected recursive, direct, or internal)", kind),
    }
}

fn cmd_pin_add(root: &Path, key_str: &str, kind: &str) -> Result<()> {
    let node = open_node(root)?;
    let key = Key::from_hex(key_str).with_context(|| format!("Invalid key: {}", key_str))?;
    let kind = parse_pin_kind(kind)?;

    node.pins.add(kind, &key)?;
    println!("pinned {} ({})", key, kind.as_str());
    Ok(())
}

fn cmd_pin_list(root: &Path) -> Result<()> {
    let node = open_node(root)?;

    for kind in [PinKind::Recursive, PinKind::Direct, PinKind::Internal] {
        for key in node.pins.list(kind)? {
            println!("{} {}", key, kind.as_str());
        }
    }
    Ok(())
}

fn cmd_pin_rm(root: &Path, key_str: &str, kind: &str) -> Result<()> {
    let node = open_node(root)?;
    let key = Key::from_hex(key_str).with_context(|| format!("Invalid key: {}", key_str))?;
    let kind = parse_pin_kind(kind)?;

    node.pins.remove(kind, &key)?;
    println!("unpinned {} ({})", key, kind.as_str());
    Ok(())
}
