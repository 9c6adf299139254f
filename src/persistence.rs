use crate::materialize::ClusterSummary;
use crate::model::{DeviceId, Identifier, IdentifierKind, IdentityLink, MergeLogEntry};
use crate::store::{GraphStats, GraphStore, MergeRequest};
use anyhow::{anyhow, bail, Result};
use lru::LruCache;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

const CF_LINKS: &str = "links";
const CF_LINK_HISTORY: &str = "link_history";
const CF_CANONICAL_INDEX: &str = "canonical_index";
const CF_MERGE_LOG: &str = "merge_log";
const CF_SUMMARIES: &str = "summaries";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_NEXT_MERGE_ID: &[u8] = b"next_merge_id";
const KEY_NEXT_HISTORY_SEQ: &[u8] = b"next_history_seq";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// RocksDB-backed identity graph.
///
/// Only one process may hold the database open; RocksDB's lock file turns a
/// second concurrent run into an open error.
pub struct PersistentGraphStore {
    db: DB,
    cache: Mutex<LruCache<Identifier, IdentityLink>>,
    next_merge_id: u64,
    next_history_seq: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: crate::config::DEFAULT_LINK_CACHE_CAPACITY,
        }
    }
}

impl PersistentGraphStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;

        let next_merge_id = load_metadata::<u64>(&db, KEY_NEXT_MERGE_ID)?.unwrap_or(1);
        let next_history_seq = load_metadata::<u64>(&db, KEY_NEXT_HISTORY_SEQ)?.unwrap_or(0);
        let capacity = NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            next_merge_id,
            next_history_seq,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    fn read_link(&self, identifier: &Identifier) -> Result<Option<IdentityLink>> {
        let links_cf = self.cf(CF_LINKS)?;
        match self.db.get_cf(links_cf, encode_identifier(identifier))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn cache_put(&self, link: &IdentityLink) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(link.identifier(), link.clone());
        }
    }

    /// Stage an archived copy of `row` in `batch`.
    fn archive_into(&mut self, batch: &mut WriteBatch, mut row: IdentityLink, at: i64) -> Result<()> {
        let history_cf = self.cf(CF_LINK_HISTORY)?;
        row.is_active = false;
        row.updated_at = at;
        let mut key = encode_identifier(&row.identifier());
        key.extend_from_slice(&self.next_history_seq.to_be_bytes());
        batch.put_cf(history_cf, key, bincode::serialize(&row)?);
        self.next_history_seq += 1;
        Ok(())
    }

    fn stage_metadata(&self, batch: &mut WriteBatch) -> Result<()> {
        let metadata_cf = self.cf(CF_METADATA)?;
        batch.put_cf(metadata_cf, KEY_NEXT_MERGE_ID, bincode::serialize(&self.next_merge_id)?);
        batch.put_cf(
            metadata_cf,
            KEY_NEXT_HISTORY_SEQ,
            bincode::serialize(&self.next_history_seq)?,
        );
        Ok(())
    }

    /// Identifiers indexed under a canonical id.
    fn canonical_members(&self, canonical: &DeviceId) -> Result<Vec<Identifier>> {
        let index_cf = self.cf(CF_CANONICAL_INDEX)?;
        let prefix = encode_canonical_prefix(canonical);
        let mut members = Vec::new();
        for entry in self
            .db
            .iterator_cf(index_cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (identifier, _) = decode_identifier(&key[prefix.len()..])
                .ok_or_else(|| anyhow!("corrupt canonical index key"))?;
            members.push(identifier);
        }
        Ok(members)
    }

    fn count_entries(&self, name: &str) -> Result<usize> {
        let cf = self.cf(name)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

impl GraphStore for PersistentGraphStore {
    fn get_link(&self, identifier: &Identifier) -> Result<Option<IdentityLink>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(link) = cache.get(identifier) {
                return Ok(Some(link.clone()));
            }
        }
        let link = self.read_link(identifier)?;
        if let Some(link) = &link {
            self.cache_put(link);
        }
        Ok(link)
    }

    fn upsert_link(&mut self, link: IdentityLink) -> Result<()> {
        let identifier = link.identifier();
        let identifier_key = encode_identifier(&identifier);
        let mut batch = WriteBatch::default();

        if let Some(previous) = self.read_link(&identifier)? {
            if previous.canonical_id != link.canonical_id {
                let index_cf = self.cf(CF_CANONICAL_INDEX)?;
                batch.delete_cf(index_cf, canonical_index_key(&previous.canonical_id, &identifier));
                self.archive_into(&mut batch, previous, link.updated_at)?;
            }
        }

        let links_cf = self.cf(CF_LINKS)?;
        let index_cf = self.cf(CF_CANONICAL_INDEX)?;
        batch.put_cf(links_cf, &identifier_key, bincode::serialize(&link)?);
        batch.put_cf(index_cf, canonical_index_key(&link.canonical_id, &identifier), []);
        self.stage_metadata(&mut batch)?;
        self.db.write(batch)?;

        self.cache_put(&link);
        Ok(())
    }

    fn links_for_canonical(&self, canonical: &DeviceId) -> Result<Vec<IdentityLink>> {
        let mut links = Vec::new();
        for identifier in self.canonical_members(canonical)? {
            if let Some(link) = self.get_link(&identifier)? {
                links.push(link);
            }
        }
        links.sort_by(|a, b| a.identifier().cmp(&b.identifier()));
        Ok(links)
    }

    fn transactional_merge(&mut self, request: &MergeRequest) -> Result<Option<MergeLogEntry>> {
        if request.loser == request.winner {
            bail!("cannot merge {} into itself", request.loser);
        }
        let mut moved = Vec::new();
        for identifier in self.canonical_members(&request.loser)? {
            if let Some(link) = self.read_link(&identifier)? {
                moved.push(link);
            }
        }
        if moved.is_empty() {
            return Ok(None);
        }

        let mut batch = WriteBatch::default();
        let mut updated = Vec::with_capacity(moved.len());
        for previous in moved {
            let identifier = previous.identifier();
            let mut link = previous.clone();
            link.canonical_id = request.winner.clone();
            link.updated_at = request.merge_time;

            let links_cf = self.cf(CF_LINKS)?;
            let index_cf = self.cf(CF_CANONICAL_INDEX)?;
            batch.put_cf(links_cf, encode_identifier(&identifier), bincode::serialize(&link)?);
            batch.delete_cf(index_cf, canonical_index_key(&request.loser, &identifier));
            batch.put_cf(index_cf, canonical_index_key(&request.winner, &identifier), []);
            self.archive_into(&mut batch, previous, request.merge_time)?;
            updated.push(link);
        }

        let entry = MergeLogEntry {
            merge_id: self.next_merge_id,
            source_canonical_id: request.loser.clone(),
            target_canonical_id: request.winner.clone(),
            reason: request.reason,
            confidence: request.confidence,
            identifiers_moved: updated.len() as u64,
            triggered_by: request.triggered_by.clone(),
            merge_time: request.merge_time,
        };
        let merge_log_cf = self.cf(CF_MERGE_LOG)?;
        batch.put_cf(merge_log_cf, entry.merge_id.to_be_bytes(), bincode::serialize(&entry)?);
        self.next_merge_id += 1;
        self.stage_metadata(&mut batch)?;
        self.db.write(batch)?;

        for link in &updated {
            self.cache_put(link);
        }
        Ok(Some(entry))
    }

    fn device_memberships(&self) -> Result<Vec<(DeviceId, DeviceId)>> {
        let links_cf = self.cf(CF_LINKS)?;
        let prefix = [IdentifierKind::DeviceId.tag()];
        let mut memberships = Vec::new();
        for entry in self
            .db
            .iterator_cf(links_cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let link: IdentityLink = bincode::deserialize(&value)?;
            memberships.push((DeviceId::new(link.linked_id), link.canonical_id));
        }
        memberships.sort();
        Ok(memberships)
    }

    fn canonical_ids(&self) -> Result<Vec<DeviceId>> {
        let index_cf = self.cf(CF_CANONICAL_INDEX)?;
        let mut ids: Vec<DeviceId> = Vec::new();
        for entry in self.db.iterator_cf(index_cf, IteratorMode::Start) {
            let (key, _) = entry?;
            let (canonical, _) =
                decode_string(&key).ok_or_else(|| anyhow!("corrupt canonical index key"))?;
            ids.push(DeviceId::new(canonical));
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn link_history(&self, identifier: &Identifier) -> Result<Vec<IdentityLink>> {
        let history_cf = self.cf(CF_LINK_HISTORY)?;
        let prefix = encode_identifier(identifier);
        let mut rows = Vec::new();
        for entry in self
            .db
            .iterator_cf(history_cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn merge_log(&self) -> Result<Vec<MergeLogEntry>> {
        let merge_log_cf = self.cf(CF_MERGE_LOG)?;
        let mut entries = Vec::new();
        for entry in self.db.iterator_cf(merge_log_cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    fn put_summary(&mut self, summary: &ClusterSummary) -> Result<()> {
        let summaries_cf = self.cf(CF_SUMMARIES)?;
        self.db.put_cf(
            summaries_cf,
            summary.canonical_id.as_str().as_bytes(),
            bincode::serialize(summary)?,
        )?;
        Ok(())
    }

    fn get_summary(&self, canonical: &DeviceId) -> Result<Option<ClusterSummary>> {
        let summaries_cf = self.cf(CF_SUMMARIES)?;
        match self.db.get_cf(summaries_cf, canonical.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_summary(&mut self, canonical: &DeviceId) -> Result<()> {
        let summaries_cf = self.cf(CF_SUMMARIES)?;
        self.db.delete_cf(summaries_cf, canonical.as_str().as_bytes())?;
        Ok(())
    }

    fn stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            active_links: self.count_entries(CF_LINKS)?,
            active_identities: self.canonical_ids()?.len(),
            archived_links: self.count_entries(CF_LINK_HISTORY)?,
            merges: self.count_entries(CF_MERGE_LOG)?,
            summaries: self.count_entries(CF_SUMMARIES)?,
        })
    }

    fn flush(&self) -> Result<()> {
        PersistentGraphStore::flush(self)
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        PersistentGraphStore::checkpoint(self, path)
    }
}

impl Drop for PersistentGraphStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_LINKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_LINK_HISTORY, Options::default()),
        ColumnFamilyDescriptor::new(CF_CANONICAL_INDEX, Options::default()),
        ColumnFamilyDescriptor::new(CF_MERGE_LOG, Options::default()),
        ColumnFamilyDescriptor::new(CF_SUMMARIES, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

/// Length-prefixed string: `len (u32 be) ++ bytes`.
fn encode_string(value: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn decode_string(bytes: &[u8]) -> Option<(String, usize)> {
    let len = u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let raw = bytes.get(4..4 + len)?;
    Some((String::from_utf8(raw.to_vec()).ok()?, 4 + len))
}

/// `kind tag ++ length-prefixed value`. Prefix-free, so history rows and
/// index entries can be range-scanned per identifier.
fn encode_identifier(identifier: &Identifier) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 4 + identifier.value.len());
    key.push(identifier.kind.tag());
    encode_string(&identifier.value, &mut key);
    key
}

fn decode_identifier(bytes: &[u8]) -> Option<(Identifier, usize)> {
    let kind = IdentifierKind::from_tag(*bytes.first()?)?;
    let (value, used) = decode_string(&bytes[1..])?;
    Some((Identifier::new(value, kind), 1 + used))
}

fn encode_canonical_prefix(canonical: &DeviceId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + canonical.as_str().len());
    encode_string(canonical.as_str(), &mut prefix);
    prefix
}

fn canonical_index_key(canonical: &DeviceId, identifier: &Identifier) -> Vec<u8> {
    let mut key = encode_canonical_prefix(canonical);
    key.extend_from_slice(&encode_identifier(identifier));
    key
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}
