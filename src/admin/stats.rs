use std::path::Path;

use serde::Serialize;

use crate::primitives::block::BlockStatsSnapshot;
use crate::storage::StorageMode;
use crate::store::{StoreConnection, JOURNAL_FILE, PARAMS_FILE};
use crate::types::TxnMode;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{file_len, open_location};
use crate::admin::Result;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub location: String,
    pub params: ParamsSection,
    pub indexes: Vec<IndexSection>,
    pub objects: ObjectSection,
    pub dictionary: DictionarySection,
    pub journal: JournalSection,
    pub filesystem: FilesystemStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamsSection {
    pub block_size: usize,
    pub mode: StorageMode,
    pub read_cache_blocks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSection {
    pub name: String,
    pub records: u64,
    pub height: u32,
    pub block_limit: u64,
    pub generation: u64,
    pub order: usize,
    pub file_bytes: u64,
    pub io: BlockStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSection {
    pub length: u64,
    pub position: u64,
    pub physical_length: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DictionarySection {
    pub allocated_terms: u64,
    pub triples: u64,
    pub quads: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalSection {
    pub path: String,
    pub size_bytes: u64,
    pub needs_recovery: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    pub dir: String,
    pub total_bytes: u64,
}

pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let conn = open_location(path, opts)?;
    let report = collect(&conn, path, opts);
    conn.close()?;
    report
}

fn collect(conn: &StoreConnection, dir: &Path, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let storage = conn.storage();
    let txn = conn.begin(TxnMode::Read)?;

    let mut indexes = Vec::with_capacity(storage.trees().len());
    let mut total_bytes = file_len(&dir.join(PARAMS_FILE));
    for tree in storage.trees() {
        let root = tree.committed_root();
        let file_bytes = file_len(&dir.join(format!("{}.dat", tree.label())));
        total_bytes += file_bytes + file_len(&dir.join(format!("{}.bpt", tree.label())));
        indexes.push(IndexSection {
            name: tree.label().to_string(),
            records: tree.size(&txn)?,
            height: tree.height(&txn)?,
            block_limit: root.limit,
            generation: root.generation,
            order: tree.params().order(),
            file_bytes,
            io: tree.block_store().stats(),
        });
    }

    let objects = storage.objects();
    let physical_length = objects.file().physical_length()?;
    let object_section = ObjectSection {
        length: objects.length(&txn)?,
        position: objects.position(&txn)?,
        physical_length,
    };
    total_bytes += physical_length;

    let dictionary = DictionarySection {
        allocated_terms: storage.nodes().dictionary_size(&txn)?,
        triples: storage.triples().tuple_table().size(&txn)?,
        quads: storage.quads().tuple_table().size(&txn)?,
    };
    txn.end()?;

    let journal_path = dir.join(JOURNAL_FILE);
    let journal_bytes = file_len(&journal_path);
    total_bytes += journal_bytes;

    let block_size = storage
        .trees()
        .first()
        .map(|tree| tree.params().block_size())
        .unwrap_or_default();
    Ok(StatsReport {
        location: conn.location().to_string(),
        params: ParamsSection {
            block_size,
            mode: opts.mode,
            read_cache_blocks: opts.read_cache_blocks,
        },
        indexes,
        objects: object_section,
        dictionary,
        journal: JournalSection {
            path: journal_path.display().to_string(),
            size_bytes: journal_bytes,
            needs_recovery: conn.coordinator().needs_recovery(),
        },
        filesystem: FilesystemStats {
            dir: dir.display().to_string(),
            total_bytes,
        },
    })
}
