//! Block storage engine.
//!
//! `BlockStore` is the seam between the transfer protocol and the bytes on
//! disk. `FsBlockStore` is the in-tree engine:
//!
//!   <root>/current/<pool>/current/finalized/blk_<id>
//!   <root>/current/<pool>/current/finalized/blk_<id>_<gs>.meta
//!   <root>/current/<pool>/current/rbw/...
//!   <root>/current/<pool>/tmp/...
//!
//! A replica lives in exactly one of the three directories. The in-memory
//! index is rebuilt from `finalized` and `rbw` on open; `tmp` is discarded.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use basalt_core::checksum::ChecksumSpec;
use basalt_core::message::BlockIdentity;
use basalt_core::wire::METADATA_HEADER_LEN;

/// Readable and seekable stream over replica bytes.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Finalized,
    /// Replica being written.
    Rbw,
    /// Replica being copied in; invisible to readers until finalized.
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// `num_bytes` is the on-disk length.
    pub block: BlockIdentity,
    pub state: ReplicaState,
}

pub trait BlockStore: Send + Sync {
    fn create_temporary(
        &self,
        block: &BlockIdentity,
        checksum: ChecksumSpec,
    ) -> io::Result<Box<dyn ReplicaWriter>>;

    fn create_rbw(
        &self,
        block: &BlockIdentity,
        checksum: ChecksumSpec,
    ) -> io::Result<Box<dyn ReplicaWriter>>;

    /// Reopen a finalized or rbw replica for appending under `new_gs`.
    fn append(&self, block: &BlockIdentity, new_gs: u64) -> io::Result<Box<dyn ReplicaWriter>>;

    /// Bump a replica to `new_gs` and finalize it, provided its length is
    /// `expected_len`.
    fn recover_close(
        &self,
        block: &BlockIdentity,
        new_gs: u64,
        expected_len: u64,
    ) -> io::Result<BlockIdentity>;

    /// Move a replica into the finalized set. Returns its final identity.
    fn finalize_block(&self, block: &BlockIdentity) -> io::Result<BlockIdentity>;

    fn convert_temporary_to_rbw(&self, block: &BlockIdentity) -> io::Result<BlockIdentity>;

    /// Block data positioned at `offset`.
    fn block_input(&self, block: &BlockIdentity, offset: u64) -> io::Result<Box<dyn ReadSeek>>;

    /// Metadata stream positioned at its header.
    fn metadata_input(&self, block: &BlockIdentity) -> io::Result<Box<dyn ReadSeek>>;

    fn replica(&self, pool_id: &str, block_id: u64) -> Option<ReplicaInfo>;

    /// Remove a finalized replica. Returns false when none existed.
    fn delete_finalized(&self, block: &BlockIdentity) -> io::Result<bool>;

    /// Root directory of this store.
    fn data_root(&self) -> &Path;
}

/// Open data + checksum streams of one replica under construction.
pub trait ReplicaWriter: Send {
    fn block(&self) -> &BlockIdentity;

    fn checksum(&self) -> ChecksumSpec;

    fn bytes_on_disk(&self) -> u64;

    /// Bytes of the trailing incomplete checksum unit already on disk.
    /// Their checksum has been dropped from the metadata stream and must be
    /// rewritten once the unit completes.
    fn last_partial_unit(&mut self) -> io::Result<Vec<u8>>;

    fn write_data(&mut self, data: &[u8]) -> io::Result<()>;

    fn write_checksums(&mut self, sums: &[u8]) -> io::Result<()>;

    /// Record the final length and the checksum of the last unit.
    fn set_last_checksum_and_len(&mut self, len: u64, last_checksum: &[u8]) -> io::Result<()>;

    /// Flush both streams to disk.
    fn close(self: Box<Self>) -> io::Result<()>;
}

// ── Filesystem engine ─────────────────────────────────────────────────────────

type ReplicaKey = (String, u64);

pub struct FsBlockStore {
    root: PathBuf,
    index: DashMap<ReplicaKey, ReplicaInfo>,
}

impl FsBlockStore {
    /// Open (or create) a store rooted at `root` and index its replicas.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let current = root.join("current");
        fs::create_dir_all(&current)
            .with_context(|| format!("failed to create store root: {}", current.display()))?;

        let store = Self {
            root,
            index: DashMap::new(),
        };

        for entry in fs::read_dir(&current)
            .with_context(|| format!("failed to list {}", current.display()))?
            .flatten()
        {
            let pool = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || pool == STAGING_DIR {
                continue;
            }
            let tmp = store.state_dir(&pool, ReplicaState::Temporary);
            if tmp.exists() {
                fs::remove_dir_all(&tmp)
                    .with_context(|| format!("failed to clear {}", tmp.display()))?;
            }
            for state in [ReplicaState::Finalized, ReplicaState::Rbw] {
                store
                    .scan_dir(&pool, state)
                    .with_context(|| format!("failed to index pool {pool}"))?;
            }
        }

        tracing::info!(
            root = %store.root.display(),
            replicas = store.index.len(),
            "block store opened"
        );
        Ok(store)
    }

    fn scan_dir(&self, pool: &str, state: ReplicaState) -> io::Result<()> {
        let dir = self.state_dir(pool, state);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((block_id, gs)) = parse_meta_name(&name) else {
                continue;
            };
            let data = dir.join(data_name(block_id));
            let Ok(meta) = fs::metadata(&data) else {
                tracing::warn!(path = %data.display(), "metadata without block file, skipping");
                continue;
            };
            let block = BlockIdentity::new(pool, block_id, gs, meta.len());
            self.index
                .insert((pool.to_string(), block_id), ReplicaInfo { block, state });
        }
        Ok(())
    }

    fn state_dir(&self, pool: &str, state: ReplicaState) -> PathBuf {
        let pool_dir = self.root.join("current").join(pool);
        match state {
            ReplicaState::Finalized => pool_dir.join("current").join("finalized"),
            ReplicaState::Rbw => pool_dir.join("current").join("rbw"),
            ReplicaState::Temporary => pool_dir.join("tmp"),
        }
    }

    fn data_path(&self, block: &BlockIdentity, state: ReplicaState) -> PathBuf {
        self.state_dir(&block.pool_id, state).join(block.block_name())
    }

    fn meta_path(&self, block: &BlockIdentity, state: ReplicaState) -> PathBuf {
        self.state_dir(&block.pool_id, state).join(block.meta_name())
    }

    fn existing(&self, block: &BlockIdentity) -> io::Result<ReplicaInfo> {
        self.replica(&block.pool_id, block.block_id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("replica not found: {block}"))
        })
    }

    fn open_writer(
        &self,
        block: &BlockIdentity,
        checksum: ChecksumSpec,
        state: ReplicaState,
    ) -> io::Result<Box<dyn ReplicaWriter>> {
        fs::create_dir_all(self.state_dir(&block.pool_id, state))?;
        let data_path = self.data_path(block, state);
        let data = File::create(&data_path)?;
        let mut meta = File::create(self.meta_path(block, state))?;
        meta.write_all(&checksum.header_bytes())?;

        let mut info = block.clone();
        info.num_bytes = 0;
        self.index.insert(
            (block.pool_id.clone(), block.block_id),
            ReplicaInfo { block: info.clone(), state },
        );
        Ok(Box::new(FsReplicaWriter {
            block: info,
            checksum,
            data,
            meta,
            data_path,
            bytes_on_disk: 0,
            last_checksum: Vec::new(),
        }))
    }

    /// Move data + meta of `info` into `to`, renaming meta to `new_gs`.
    fn relocate(&self, info: &ReplicaInfo, to: ReplicaState, new_gs: u64) -> io::Result<BlockIdentity> {
        let mut moved = info.block.clone();
        moved.generation_stamp = new_gs;
        fs::create_dir_all(self.state_dir(&moved.pool_id, to))?;

        let from_data = self.data_path(&info.block, info.state);
        let from_meta = self.meta_path(&info.block, info.state);
        let to_data = self.data_path(&moved, to);
        let to_meta = self.meta_path(&moved, to);
        if from_data != to_data {
            fs::rename(&from_data, &to_data)?;
        }
        if from_meta != to_meta {
            fs::rename(&from_meta, &to_meta)?;
        }

        moved.num_bytes = fs::metadata(&to_data)?.len();
        self.index.insert(
            (moved.pool_id.clone(), moved.block_id),
            ReplicaInfo {
                block: moved.clone(),
                state: to,
            },
        );
        Ok(moved)
    }
}

impl BlockStore for FsBlockStore {
    fn create_temporary(
        &self,
        block: &BlockIdentity,
        checksum: ChecksumSpec,
    ) -> io::Result<Box<dyn ReplicaWriter>> {
        if let Some(existing) = self.replica(&block.pool_id, block.block_id) {
            if existing.state != ReplicaState::Temporary {
                return Err(already_exists(block, existing.state));
            }
            let _ = fs::remove_file(self.data_path(&existing.block, existing.state));
            let _ = fs::remove_file(self.meta_path(&existing.block, existing.state));
        }
        self.open_writer(block, checksum, ReplicaState::Temporary)
    }

    fn create_rbw(
        &self,
        block: &BlockIdentity,
        checksum: ChecksumSpec,
    ) -> io::Result<Box<dyn ReplicaWriter>> {
        // The index slot is claimed before any file is created.
        let key = (block.pool_id.clone(), block.block_id);
        match self.index.entry(key.clone()) {
            Entry::Occupied(existing) => return Err(already_exists(block, existing.get().state)),
            Entry::Vacant(slot) => {
                let mut info = block.clone();
                info.num_bytes = 0;
                slot.insert(ReplicaInfo {
                    block: info,
                    state: ReplicaState::Rbw,
                });
            }
        }
        self.open_writer(block, checksum, ReplicaState::Rbw).map_err(|e| {
            self.index.remove(&key);
            e
        })
    }

    fn append(&self, block: &BlockIdentity, new_gs: u64) -> io::Result<Box<dyn ReplicaWriter>> {
        let existing = self.existing(block)?;
        if existing.state == ReplicaState::Temporary {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot append to temporary replica {block}"),
            ));
        }
        if existing.block.generation_stamp != block.generation_stamp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "generation stamp mismatch for {block}: replica has {}",
                    existing.block.generation_stamp
                ),
            ));
        }

        let moved = self.relocate(&existing, ReplicaState::Rbw, new_gs)?;
        let data_path = self.data_path(&moved, ReplicaState::Rbw);
        let meta_path = self.meta_path(&moved, ReplicaState::Rbw);

        let mut meta = OpenOptions::new().read(true).write(true).open(&meta_path)?;
        let mut header = [0u8; METADATA_HEADER_LEN];
        meta.read_exact(&mut header)?;
        let checksum = ChecksumSpec::from_header_bytes(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        // Drop the checksum of a trailing partial unit; it is recomputed
        // once the unit is completed by appended data.
        let full_units = moved.num_bytes / checksum.bytes_per_checksum as u64;
        let keep = METADATA_HEADER_LEN as u64 + full_units * checksum.checksum_size() as u64;
        meta.set_len(keep)?;
        meta.seek(SeekFrom::End(0))?;

        let data = OpenOptions::new().append(true).open(&data_path)?;
        tracing::debug!(block = %moved, bytes = moved.num_bytes, "replica reopened for append");
        Ok(Box::new(FsReplicaWriter {
            block: moved.clone(),
            checksum,
            data,
            meta,
            data_path,
            bytes_on_disk: moved.num_bytes,
            last_checksum: Vec::new(),
        }))
    }

    fn recover_close(
        &self,
        block: &BlockIdentity,
        new_gs: u64,
        expected_len: u64,
    ) -> io::Result<BlockIdentity> {
        let existing = self.existing(block)?;
        if existing.block.num_bytes != expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "replica {block} has {} bytes, recovery expects {expected_len}",
                    existing.block.num_bytes
                ),
            ));
        }
        let closed = self.relocate(&existing, ReplicaState::Finalized, new_gs)?;
        tracing::info!(block = %closed, "replica recovered and closed");
        Ok(closed)
    }

    fn finalize_block(&self, block: &BlockIdentity) -> io::Result<BlockIdentity> {
        let existing = self.existing(block)?;
        if existing.state == ReplicaState::Finalized {
            return Ok(existing.block);
        }
        let gs = existing.block.generation_stamp;
        self.relocate(&existing, ReplicaState::Finalized, gs)
    }

    fn convert_temporary_to_rbw(&self, block: &BlockIdentity) -> io::Result<BlockIdentity> {
        let existing = self.existing(block)?;
        if existing.state != ReplicaState::Temporary {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("replica {block} is not temporary"),
            ));
        }
        let gs = existing.block.generation_stamp;
        self.relocate(&existing, ReplicaState::Rbw, gs)
    }

    fn block_input(&self, block: &BlockIdentity, offset: u64) -> io::Result<Box<dyn ReadSeek>> {
        let existing = self.existing(block)?;
        if existing.block.generation_stamp < block.generation_stamp {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "replica generation stamp {} is older than requested {block}",
                    existing.block.generation_stamp
                ),
            ));
        }
        let mut file = File::open(self.data_path(&existing.block, existing.state))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file))
    }

    fn metadata_input(&self, block: &BlockIdentity) -> io::Result<Box<dyn ReadSeek>> {
        let existing = self.existing(block)?;
        let file = File::open(self.meta_path(&existing.block, existing.state))?;
        Ok(Box::new(file))
    }

    fn replica(&self, pool_id: &str, block_id: u64) -> Option<ReplicaInfo> {
        let mut info = self
            .index
            .get(&(pool_id.to_string(), block_id))
            .map(|r| r.value().clone())?;
        if info.state != ReplicaState::Finalized {
            if let Ok(meta) = fs::metadata(self.data_path(&info.block, info.state)) {
                info.block.num_bytes = meta.len();
            }
        }
        Some(info)
    }

    fn delete_finalized(&self, block: &BlockIdentity) -> io::Result<bool> {
        let key = (block.pool_id.clone(), block.block_id);
        let Some(existing) = self.index.get(&key).map(|r| r.value().clone()) else {
            return Ok(false);
        };
        if existing.state != ReplicaState::Finalized {
            return Ok(false);
        }
        fs::remove_file(self.data_path(&existing.block, existing.state))?;
        fs::remove_file(self.meta_path(&existing.block, existing.state))?;
        self.index.remove(&key);
        tracing::debug!(block = %existing.block, "finalized replica deleted");
        Ok(true)
    }

    fn data_root(&self) -> &Path {
        &self.root
    }
}

/// Directory under `<root>/current` that holds delta-sync staging areas.
pub const STAGING_DIR: &str = "rsync_tmp";

fn data_name(block_id: u64) -> String {
    format!("blk_{block_id}")
}

/// `blk_<id>_<gs>.meta` → (id, gs).
fn parse_meta_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_prefix("blk_")?.strip_suffix(".meta")?;
    let (id, gs) = stem.split_once('_')?;
    Some((id.parse().ok()?, gs.parse().ok()?))
}

fn already_exists(block: &BlockIdentity, state: ReplicaState) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("block {block} already exists in state {state:?} and thus cannot be created"),
    )
}

// ── Replica writer ────────────────────────────────────────────────────────────

struct FsReplicaWriter {
    block: BlockIdentity,
    checksum: ChecksumSpec,
    data: File,
    meta: File,
    data_path: PathBuf,
    bytes_on_disk: u64,
    last_checksum: Vec<u8>,
}

impl ReplicaWriter for FsReplicaWriter {
    fn block(&self) -> &BlockIdentity {
        &self.block
    }

    fn checksum(&self) -> ChecksumSpec {
        self.checksum
    }

    fn bytes_on_disk(&self) -> u64 {
        self.bytes_on_disk
    }

    fn last_partial_unit(&mut self) -> io::Result<Vec<u8>> {
        let partial = self.bytes_on_disk % self.checksum.bytes_per_checksum as u64;
        if partial == 0 {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(self.bytes_on_disk - partial))?;
        let mut buf = vec![0u8; partial as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.data.write_all(data)?;
        self.bytes_on_disk += data.len() as u64;
        Ok(())
    }

    fn write_checksums(&mut self, sums: &[u8]) -> io::Result<()> {
        self.meta.write_all(sums)
    }

    fn set_last_checksum_and_len(&mut self, len: u64, last_checksum: &[u8]) -> io::Result<()> {
        if len != self.bytes_on_disk {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "replica {} length {len} disagrees with {} bytes written",
                    self.block, self.bytes_on_disk
                ),
            ));
        }
        self.block.num_bytes = len;
        self.last_checksum = last_checksum.to_vec();
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.data.sync_all()?;
        self.meta.sync_all()?;
        tracing::trace!(
            block = %self.block,
            bytes = self.bytes_on_disk,
            last_checksum = hex::encode(&self.last_checksum),
            "replica streams closed"
        );
        Ok(())
    }
}
