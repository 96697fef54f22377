//! Persistent session state: auth keys, the DC table, and the user's id.
//!
//! The [`StoreLayout`] trait abstracts over where this lives so callers can
//! swap in their own database. Two built-ins are provided: a compact binary
//! file and an in-memory store for tests and throwaway bots.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::datacenter::{DataCenter, DcOptions, DcType};

/// Everything persisted for one `(dc_id, test)` pair.
#[derive(Clone)]
pub struct StoredKey {
    pub auth_key: [u8; 256],
    pub server_salt: i64,
    pub time_offset: i32,
}

/// An abstraction over where and how session state is persisted.
///
/// Implementations must serialize mutations per key; both built-ins guard
/// everything with a single lock since writes are rare.
pub trait StoreLayout: Send + Sync {
    fn auth_key(&self, dc_id: i32, test: bool) -> io::Result<Option<StoredKey>>;
    fn save_auth_key(&self, dc_id: i32, test: bool, key: &StoredKey) -> io::Result<()>;
    fn delete_auth_key(&self, dc_id: i32, test: bool) -> io::Result<()>;
    fn dc_options(&self) -> io::Result<Option<DcOptions>>;
    fn update_dc_options(&self, options: &DcOptions) -> io::Result<()>;
    fn self_id(&self) -> io::Result<Option<i64>>;
    fn on_authorization(&self, self_id: i64) -> io::Result<()>;
}

#[derive(Clone, Default)]
struct StoreData {
    keys: HashMap<(i32, bool), StoredKey>,
    dc_options: Option<DcOptions>,
    self_id: Option<i64>,
}

// ─── MemoryStore ─────────────────────────────────────────────────────────────

/// An ephemeral store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreLayout for MemoryStore {
    fn auth_key(&self, dc_id: i32, test: bool) -> io::Result<Option<StoredKey>> {
        Ok(self.data.lock().unwrap().keys.get(&(dc_id, test)).cloned())
    }

    fn save_auth_key(&self, dc_id: i32, test: bool, key: &StoredKey) -> io::Result<()> {
        self.data.lock().unwrap().keys.insert((dc_id, test), key.clone());
        Ok(())
    }

    fn delete_auth_key(&self, dc_id: i32, test: bool) -> io::Result<()> {
        self.data.lock().unwrap().keys.remove(&(dc_id, test));
        Ok(())
    }

    fn dc_options(&self) -> io::Result<Option<DcOptions>> {
        Ok(self.data.lock().unwrap().dc_options.clone())
    }

    fn update_dc_options(&self, options: &DcOptions) -> io::Result<()> {
        self.data.lock().unwrap().dc_options = Some(options.clone());
        Ok(())
    }

    fn self_id(&self) -> io::Result<Option<i64>> {
        Ok(self.data.lock().unwrap().self_id)
    }

    fn on_authorization(&self, self_id: i64) -> io::Result<()> {
        self.data.lock().unwrap().self_id = Some(self_id);
        Ok(())
    }
}

// ─── FileStore ───────────────────────────────────────────────────────────────

/// Binary-file store. The whole state is rewritten on each mutation; the
/// format is a private implementation detail.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<StoreData>,
}

impl FileStore {
    /// Open (or create on first save) the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            decode(&std::fs::read(&path)?)?
        } else {
            StoreData::default()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreData)) -> io::Result<()> {
        let mut data = self.cache.lock().unwrap();
        f(&mut data);
        std::fs::write(&self.path, encode(&data))
    }
}

impl StoreLayout for FileStore {
    fn auth_key(&self, dc_id: i32, test: bool) -> io::Result<Option<StoredKey>> {
        Ok(self.cache.lock().unwrap().keys.get(&(dc_id, test)).cloned())
    }

    fn save_auth_key(&self, dc_id: i32, test: bool, key: &StoredKey) -> io::Result<()> {
        self.mutate(|d| {
            d.keys.insert((dc_id, test), key.clone());
        })
    }

    fn delete_auth_key(&self, dc_id: i32, test: bool) -> io::Result<()> {
        self.mutate(|d| {
            d.keys.remove(&(dc_id, test));
        })
    }

    fn dc_options(&self) -> io::Result<Option<DcOptions>> {
        Ok(self.cache.lock().unwrap().dc_options.clone())
    }

    fn update_dc_options(&self, options: &DcOptions) -> io::Result<()> {
        self.mutate(|d| d.dc_options = Some(options.clone()))
    }

    fn self_id(&self) -> io::Result<Option<i64>> {
        Ok(self.cache.lock().unwrap().self_id)
    }

    fn on_authorization(&self, self_id: i64) -> io::Result<()> {
        self.mutate(|d| d.self_id = Some(self_id))
    }
}

// ─── Binary format ───────────────────────────────────────────────────────────

const MAGIC: &[u8; 4] = b"TGN1";

fn encode(data: &StoreData) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(MAGIC);

    b.push(data.keys.len() as u8);
    for ((dc_id, test), key) in &data.keys {
        b.extend_from_slice(&dc_id.to_le_bytes());
        b.push(u8::from(*test));
        b.extend_from_slice(&key.auth_key);
        b.extend_from_slice(&key.server_salt.to_le_bytes());
        b.extend_from_slice(&key.time_offset.to_le_bytes());
    }

    let dcs: Vec<&DataCenter> = data.dc_options.iter().flat_map(|o| o.iter()).collect();
    b.push(dcs.len() as u8);
    for dc in dcs {
        b.extend_from_slice(&dc.id.to_le_bytes());
        b.push(match dc.kind {
            DcType::Regular => 0,
            DcType::Media => 1,
            DcType::Cdn => 2,
        });
        b.push(u8::from(dc.test));
        let addr = dc.addr.as_bytes();
        b.push(addr.len() as u8);
        b.extend_from_slice(addr);
    }

    match data.self_id {
        Some(id) => {
            b.push(1);
            b.extend_from_slice(&id.to_le_bytes());
        }
        None => b.push(0),
    }
    b
}

fn decode(buf: &[u8]) -> io::Result<StoreData> {
    fn bad() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, "truncated or corrupt store")
    }

    let mut pos = 0usize;
    macro_rules! take {
        ($n:expr) => {{
            let n: usize = $n;
            if pos + n > buf.len() {
                return Err(bad());
            }
            let s = &buf[pos..pos + n];
            pos += n;
            s
        }};
    }

    if take!(4) != MAGIC {
        return Err(bad());
    }

    let mut data = StoreData::default();

    let key_count = take!(1)[0] as usize;
    for _ in 0..key_count {
        let dc_id = i32::from_le_bytes(take!(4).try_into().unwrap());
        let test = take!(1)[0] == 1;
        let mut auth_key = [0u8; 256];
        auth_key.copy_from_slice(take!(256));
        let server_salt = i64::from_le_bytes(take!(8).try_into().unwrap());
        let time_offset = i32::from_le_bytes(take!(4).try_into().unwrap());
        data.keys.insert((dc_id, test), StoredKey { auth_key, server_salt, time_offset });
    }

    let dc_count = take!(1)[0] as usize;
    let mut dcs = Vec::with_capacity(dc_count);
    for _ in 0..dc_count {
        let id = i32::from_le_bytes(take!(4).try_into().unwrap());
        let kind = match take!(1)[0] {
            0 => DcType::Regular,
            1 => DcType::Media,
            2 => DcType::Cdn,
            _ => return Err(bad()),
        };
        let test = take!(1)[0] == 1;
        let len = take!(1)[0] as usize;
        let addr = String::from_utf8(take!(len).to_vec()).map_err(|_| bad())?;
        dcs.push(DataCenter { id, kind, addr, test });
    }
    if !dcs.is_empty() {
        data.dc_options = Some(DcOptions::new(dcs));
    }

    if take!(1)[0] == 1 {
        data.self_id = Some(i64::from_le_bytes(take!(8).try_into().unwrap()));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> StoredKey {
        StoredKey { auth_key: [0xab; 256], server_salt: -77, time_offset: 12 }
    }

    #[test]
    fn memory_store_contract() {
        let store = MemoryStore::new();
        assert!(store.auth_key(2, false).unwrap().is_none());
        store.save_auth_key(2, false, &sample_key()).unwrap();
        let loaded = store.auth_key(2, false).unwrap().unwrap();
        assert_eq!(loaded.auth_key, [0xab; 256]);
        assert_eq!(loaded.server_salt, -77);
        // Keys are scoped to (dc, test).
        assert!(store.auth_key(2, true).unwrap().is_none());
        store.delete_auth_key(2, false).unwrap();
        assert!(store.auth_key(2, false).unwrap().is_none());
    }

    #[test]
    fn file_store_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("tgnet-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.bin");

        {
            let store = FileStore::new(&path).unwrap();
            store.save_auth_key(4, false, &sample_key()).unwrap();
            store.update_dc_options(&DcOptions::bootstrap()).unwrap();
            store.on_authorization(777).unwrap();
        }

        let store = FileStore::new(&path).unwrap();
        assert_eq!(store.auth_key(4, false).unwrap().unwrap().time_offset, 12);
        assert_eq!(store.dc_options().unwrap().unwrap(), DcOptions::bootstrap());
        assert_eq!(store.self_id().unwrap(), Some(777));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn corrupt_files_are_rejected() {
        assert!(decode(b"nope").is_err());
        assert!(decode(&[]).is_err());
        let mut truncated = encode(&StoreData {
            keys: HashMap::from([((1, false), sample_key())]),
            dc_options: None,
            self_id: None,
        });
        truncated.truncate(truncated.len() - 10);
        assert!(decode(&truncated).is_err());
    }
}
