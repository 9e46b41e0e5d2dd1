#![forbid(unsafe_code)]

use std::fs;
use std::sync::Arc;

use tracing::info;

use super::location::{self, Location, JOURNAL_FILE};
use crate::primitives::block::{BlockStore, FileBlockStore, MappedBlockStore, MemBlockStore};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::journal::Journal;
use crate::storage::btree::{BPlusTree, TreeOptions, TreeParams};
use crate::storage::nodes::{forward_params, reverse_params, NodeTable, NodeTableOptions};
use crate::storage::object::TransObjectFile;
use crate::storage::tuple::{
    tuple_params, NodeTupleTable, TupleIndex, TupleTable, QUAD_INDEXES, TRIPLE_INDEXES,
};
use crate::storage::{IndexParams, StorageMode, StoreOptions};
use crate::txn::{Coordinator, CoordinatorBuilder, CoordinatorOptions};
use crate::types::{ComponentId, Result, StoreError};

/// Base id from which every dataset component id is derived.
pub const DATASET_COMPONENT_BASE: ComponentId = ComponentId::from_bytes([
    0x71, 0x75, 0x61, 0x72, 0x72, 0x79, 0x2d, 0x64, 0x61, 0x74, 0x61, 0x73, 0x65, 0x74, 0x00, 0x00,
]);

const OBJECTS_DISC: u16 = 1;
const NODE2ID_DISC: u16 = 2;
const ID2NODE_DISC: u16 = 3;
const NODES_DISC: u16 = 4;
const TRIPLE_DISC: u16 = 10;
const QUAD_DISC: u16 = 20;

const OBJECTS_FILE: &str = "nodes.obj";
const OBJECTS_STATE_FILE: &str = "nodes.obj.state";

/// Opens the files of one location, in memory or on disk.
struct Files<'a> {
    location: &'a Location,
    params: IndexParams,
}

impl Files<'_> {
    fn io(&self, name: &str) -> Result<Arc<dyn FileIo>> {
        Ok(match self.location.file(name) {
            Some(path) => Arc::new(StdFileIo::open(path)?),
            None => Arc::new(MemFileIo::new()),
        })
    }

    fn block_store(&self, name: &str) -> Result<Arc<dyn BlockStore>> {
        let block_size = self.params.block_size;
        let Some(path) = self.location.file(&format!("{name}.dat")) else {
            return Ok(Arc::new(MemBlockStore::new(block_size)?));
        };
        Ok(match self.params.mode {
            StorageMode::Mapped => Arc::new(MappedBlockStore::open(path, block_size)?),
            StorageMode::File | StorageMode::Memory => Arc::new(FileBlockStore::open(
                path,
                block_size,
                self.params.read_cache_blocks,
            )?),
        })
    }

    fn tree(&self, discriminator: u16, name: &str, params: TreeParams) -> Result<Arc<BPlusTree>> {
        let options = TreeOptions::new(
            ComponentId::derive(DATASET_COMPONENT_BASE, discriminator),
            name,
            params,
        )
        .write_cache_blocks(self.params.write_cache_blocks);
        Ok(Arc::new(BPlusTree::open(
            options,
            self.block_store(name)?,
            self.io(&format!("{name}.bpt"))?,
        )?))
    }
}

/// Every storage component of one dataset: the node table and the triple
/// and quad tables that reference it.
pub struct DatasetStorage {
    objects: Arc<TransObjectFile>,
    nodes: Arc<NodeTable>,
    triples: NodeTupleTable,
    quads: NodeTupleTable,
    trees: Vec<Arc<BPlusTree>>,
}

impl DatasetStorage {
    /// Opens the components at `location` and the coordinator that drives
    /// them, replaying the journal.
    pub fn open(location: &Location, options: &StoreOptions) -> Result<(Self, Coordinator)> {
        let mut params = options.params;
        if let Some(dir) = location.path() {
            if params.mode == StorageMode::Memory {
                return Err(StoreError::Invalid("a directory location cannot use memory mode"));
            }
            fs::create_dir_all(dir)?;
            params = location::settle_params(dir, params)?;
        } else {
            params.mode = StorageMode::Memory;
        }
        let files = Files { location, params };
        let block_size = params.block_size;

        let objects = Arc::new(TransObjectFile::open(
            ComponentId::derive(DATASET_COMPONENT_BASE, OBJECTS_DISC),
            OBJECTS_FILE,
            files.io(OBJECTS_FILE)?,
            files.io(OBJECTS_STATE_FILE)?,
        )?);
        let forward = files.tree(NODE2ID_DISC, "node2id", forward_params(block_size)?)?;
        let reverse = files.tree(ID2NODE_DISC, "id2node", reverse_params(block_size)?)?;
        let nodes = Arc::new(NodeTable::new(
            ComponentId::derive(DATASET_COMPONENT_BASE, NODES_DISC),
            Arc::clone(&objects),
            Arc::clone(&forward),
            Arc::clone(&reverse),
            NodeTableOptions::default().cache_size(options.node_cache_size),
        )?);

        let mut trees = vec![forward, reverse];
        let mut triple_indexes = Vec::new();
        for (i, name) in TRIPLE_INDEXES.iter().enumerate() {
            let tree = files.tree(TRIPLE_DISC + i as u16, name, tuple_params(block_size, 3)?)?;
            triple_indexes.push(TupleIndex::new(name, Arc::clone(&tree))?);
            trees.push(tree);
        }
        let mut quad_indexes = Vec::new();
        for (i, name) in QUAD_INDEXES.iter().enumerate() {
            let tree = files.tree(QUAD_DISC + i as u16, name, tuple_params(block_size, 4)?)?;
            quad_indexes.push(TupleIndex::new(name, Arc::clone(&tree))?);
            trees.push(tree);
        }

        let journal = Journal::open(files.io(JOURNAL_FILE)?)?;
        let mut builder = CoordinatorBuilder::new(journal)
            .options(
                CoordinatorOptions::default()
                    .journal_checkpoint_interval(options.journal_checkpoint_interval)
                    .read_only(params.mode == StorageMode::Mapped),
            )
            .component(Arc::clone(&objects));
        for tree in &trees {
            builder = builder.component(Arc::clone(tree));
        }
        let coordinator = builder.component(Arc::clone(&nodes)).open()?;

        let storage = Self {
            triples: NodeTupleTable::new(Arc::clone(&nodes), TupleTable::new(3, triple_indexes)?),
            quads: NodeTupleTable::new(Arc::clone(&nodes), TupleTable::new(4, quad_indexes)?),
            objects,
            nodes,
            trees,
        };
        info!(
            location = %location,
            block_size,
            mode = ?params.mode,
            "dataset.open"
        );
        Ok((storage, coordinator))
    }

    /// Term dictionary.
    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    /// Triples (`S P O`).
    pub fn triples(&self) -> &NodeTupleTable {
        &self.triples
    }

    /// Quads (`G S P O`).
    pub fn quads(&self) -> &NodeTupleTable {
        &self.quads
    }

    /// Object file of the node table.
    pub fn objects(&self) -> &Arc<TransObjectFile> {
        &self.objects
    }

    /// Every index: `node2id`, `id2node`, then the triple and quad indexes.
    pub fn trees(&self) -> &[Arc<BPlusTree>] {
        &self.trees
    }

    /// Flushes every file and closes the block stores.
    pub fn close(&self) -> Result<()> {
        self.objects.close()?;
        for tree in &self.trees {
            tree.close()?;
        }
        Ok(())
    }
}
