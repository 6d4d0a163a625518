//! Station locks on KSSKs, kept in an external store with store-managed expiry.
//!
//! A lock lives under `<namespace><kssk>`. Its value is either a json blob
//! `{"mac", "stationId", "createdAt"}` or a hash with the same fields.
//! Both are read, blobs are written.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{error::Error, mac::MacAddress};

/// A lock as listed.
/// Fields which could not be decoded from the store are `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    /// The locked unit.
    pub kssk: String,

    /// The board which holds the lock.
    pub mac: Option<String>,

    /// The station which holds the lock.
    pub station_id: Option<String>,

    /// When the lock was taken.
    pub created_at: Option<DateTime<Utc>>,

    /// Seconds until the store expires the lock. Zero means any moment now.
    pub ttl_seconds: i64,
}

impl Lock {
    /// An example lock.
    pub fn example() -> Self {
        Self {
            kssk: "830569527900".into(),
            mac: Some("AA:BB:CC:DD:EE:FF".into()),
            station_id: Some("station-1".into()),
            created_at: Some(Utc::now()),
            ttl_seconds: 900,
        }
    }
}

/// A value as found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// A plain string value.
    Blob(String),

    /// A hash.
    Fields(HashMap<String, String>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockPayload<'a> {
    mac: &'a str,
    station_id: &'a str,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPayload {
    mac: Option<String>,
    #[serde(alias = "station_id")]
    station_id: Option<String>,
    #[serde(alias = "created_at")]
    created_at: Option<serde_json::Value>,
}

fn parse_created_at(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(millis) => Utc.timestamp_millis_opt(millis.as_i64()?).single(),
        serde_json::Value::String(text) => match text.parse::<i64>() {
            Ok(millis) => Utc.timestamp_millis_opt(millis).single(),
            Err(_) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|at| at.with_timezone(&Utc)),
        },
        _ => None,
    }
}

impl StoredValue {
    fn decode(&self) -> Option<StoredPayload> {
        let payload = match self {
            StoredValue::Blob(blob) => serde_json::from_str::<StoredPayload>(blob).ok()?,
            StoredValue::Fields(fields) => {
                let get = |names: &[&str]| names.iter().find_map(|name| fields.get(*name).cloned());

                StoredPayload {
                    mac: get(&["mac"]),
                    station_id: get(&["stationId", "station_id"]),
                    created_at: get(&["createdAt", "created_at"]).map(serde_json::Value::String),
                }
            }
        };

        (payload.mac.is_some() || payload.station_id.is_some()).then_some(payload)
    }

    fn owner(&self) -> Option<String> {
        self.decode().and_then(|payload| payload.station_id)
    }

    fn into_lock(self, kssk: &str, ttl_seconds: i64) -> Lock {
        let payload = self.decode().unwrap_or_else(|| {
            warn!(%kssk, "Lock value could not be decoded");
            StoredPayload::default()
        });

        Lock {
            kssk: kssk.to_string(),
            mac: payload.mac,
            station_id: payload.station_id,
            created_at: payload.created_at.as_ref().and_then(parse_created_at),
            ttl_seconds,
        }
    }
}

/// What a lock store must do.
///
/// Every write must be a single atomic operation in the store.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Set the key if it does not exist, expiring after `ttl`.
    /// Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error>;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, Error>;

    /// Delete the key if `force`, or if the stored owner is `station_id`.
    /// Returns whether something was deleted.
    async fn delete_if_owner(
        &self,
        key: &str,
        station_id: Option<&str>,
        force: bool,
    ) -> Result<bool, Error>;

    /// All live keys starting with the prefix.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Remaining seconds to live.
    /// Like redis: `-2` if the key does not exist, `-1` if it has no expiry.
    async fn ttl(&self, key: &str) -> Result<i64, Error>;
}

const RELEASE_SCRIPT: &str = r#"
local kind = redis.call('TYPE', KEYS[1])['ok']
if kind == 'none' then return 0 end
if ARGV[2] == '1' then return redis.call('DEL', KEYS[1]) end
local owner = false
if kind == 'string' then
  local ok, decoded = pcall(cjson.decode, redis.call('GET', KEYS[1]))
  if ok and type(decoded) == 'table' then
    owner = decoded['stationId'] or decoded['station_id']
  end
elseif kind == 'hash' then
  owner = redis.call('HGET', KEYS[1], 'stationId') or redis.call('HGET', KEYS[1], 'station_id')
end
if owner == ARGV[1] then return redis.call('DEL', KEYS[1]) end
return 0
"#;

/// Locks in redis.
#[derive(Clone)]
pub struct RedisLockStore {
    connection: ConnectionManager,
    release: Arc<redis::Script>,
}

impl Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Connect to redis at the url, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(%url, "Connected to lock store");

        Ok(Self {
            connection,
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let mut connection = self.connection.clone();

        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut connection)
            .await?;

        Ok(set.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, Error> {
        let mut connection = self.connection.clone();

        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut connection).await?;

        let value = match kind.as_str() {
            "none" => None,
            "hash" => {
                let fields: HashMap<String, String> = redis::cmd("HGETALL")
                    .arg(key)
                    .query_async(&mut connection)
                    .await?;
                Some(StoredValue::Fields(fields))
            }
            "string" => {
                let blob: Option<String> =
                    redis::cmd("GET").arg(key).query_async(&mut connection).await?;
                blob.map(StoredValue::Blob)
            }
            other => {
                warn!(%key, %other, "Unexpected type for a lock key");
                Some(StoredValue::Blob(String::new()))
            }
        };

        Ok(value)
    }

    async fn delete_if_owner(
        &self,
        key: &str,
        station_id: Option<&str>,
        force: bool,
    ) -> Result<bool, Error> {
        let mut connection = self.connection.clone();

        let deleted: i64 = self
            .release
            .key(key)
            .arg(station_id.unwrap_or_default())
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut connection)
            .await?;

        Ok(deleted > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut connection = self.connection.clone();
        let pattern = format!("{prefix}*");

        let mut keys = vec![];
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut connection)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();

        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<i64, Error> {
        let mut connection = self.connection.clone();

        Ok(redis::cmd("TTL").arg(key).query_async(&mut connection).await?)
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: StoredValue,
    expires: Option<Instant>,
}

impl MemoryEntry {
    fn alive(&self, now: Instant) -> bool {
        self.expires.map_or(true, |expires| now < expires)
    }
}

/// Locks in process memory.
/// Same semantics as [`RedisLockStore`], but only for a single process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLockStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryLockStore {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        entries.retain(|_, entry| entry.alive(now));

        entries
    }

    /// Put a value in as is, overwriting.
    pub fn insert(&self, key: &str, value: StoredValue, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries()
            .insert(key.to_string(), MemoryEntry { value, expires });
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let mut entries = self.entries();

        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: StoredValue::Blob(value.to_string()),
                expires: Some(Instant::now() + ttl),
            },
        );

        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, Error> {
        Ok(self.entries().get(key).map(|entry| entry.value.clone()))
    }

    async fn delete_if_owner(
        &self,
        key: &str,
        station_id: Option<&str>,
        force: bool,
    ) -> Result<bool, Error> {
        let mut entries = self.entries();

        let Some(entry) = entries.get(key) else {
            return Ok(false);
        };

        let owned = matches!(
            (entry.value.owner(), station_id),
            (Some(owner), Some(station_id)) if owner == station_id
        );

        if force || owned {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut keys = self
            .entries()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();

        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<i64, Error> {
        let now = Instant::now();

        Ok(match self.entries().get(key) {
            None => -2,
            Some(MemoryEntry { expires: None, .. }) => -1,
            // Rounded like redis does.
            Some(MemoryEntry {
                expires: Some(expires),
                ..
            }) => ((expires.saturating_duration_since(now).as_millis() + 500) / 1000) as i64,
        })
    }
}

/// How a release is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Only if held by this station.
    Owner(String),

    /// Regardless of who holds it.
    Force,
}

/// Takes, releases and lists locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    namespace: String,
    default_ttl: Duration,
}

impl Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// A manager keeping locks under the namespace in the store.
    pub fn new(store: Arc<dyn LockStore>, namespace: &str, default_ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            default_ttl,
        }
    }

    fn key(&self, kssk: &str) -> String {
        format!("{}{kssk}", self.namespace)
    }

    fn valid_kssk(kssk: &str) -> Result<&str, Error> {
        let kssk = kssk.trim();

        if kssk.is_empty() || kssk.contains(char::is_whitespace) || kssk.contains('*') {
            Err(Error::InvalidInput(format!("`{kssk}` is not a KSSK")))
        } else {
            Ok(kssk)
        }
    }

    /// Take the lock on the KSSK for a station.
    ///
    /// Fails with [`Error::LockHeld`] naming the current holder if someone has it.
    pub async fn acquire(
        &self,
        kssk: &str,
        mac: &str,
        station_id: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<Lock, Error> {
        let kssk = Self::valid_kssk(kssk)?;
        let mac = MacAddress::parse(mac)?;
        let station_id = station_id.trim();
        if station_id.is_empty() {
            return Err(Error::InvalidInput("A station id is needed".into()));
        }

        let ttl = ttl_seconds.map_or(self.default_ttl, Duration::from_secs);
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidInput("A lock needs a TTL of at least one second".into()));
        }

        let created_at = Utc::now();
        let payload = serde_json::to_string(&LockPayload {
            mac: mac.as_str(),
            station_id,
            created_at,
        })
        .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let key = self.key(kssk);

        // The holder may expire between a lost set and reading who holds it,
        // in which case we get one more go.
        for _ in 0..2 {
            if self.store.set_if_absent(&key, &payload, ttl).await? {
                info!(%kssk, %station_id, %mac, ?ttl, "Lock acquired");

                return Ok(Lock {
                    kssk: kssk.to_string(),
                    mac: Some(mac.to_string()),
                    station_id: Some(station_id.to_string()),
                    created_at: Some(created_at),
                    ttl_seconds: ttl.as_secs() as i64,
                });
            }

            if let Some(holder) = self.get(kssk).await? {
                debug!(%kssk, ?holder.station_id, "Lock is held");
                return Err(Error::LockHeld(holder));
            }
        }

        Err(Error::LockHeld(Lock {
            kssk: kssk.to_string(),
            mac: None,
            station_id: None,
            created_at: None,
            ttl_seconds: 0,
        }))
    }

    /// Release the lock on the KSSK.
    /// Returns whether a lock was released.
    pub async fn release(&self, kssk: &str, mode: ReleaseMode) -> Result<bool, Error> {
        let kssk = Self::valid_kssk(kssk)?;
        let key = self.key(kssk);

        let released = match &mode {
            ReleaseMode::Owner(station_id) => {
                self.store
                    .delete_if_owner(&key, Some(station_id), false)
                    .await?
            }
            ReleaseMode::Force => {
                warn!(%kssk, "Force releasing lock without checking the owner");
                self.store.delete_if_owner(&key, None, true).await?
            }
        };

        debug!(%kssk, ?mode, %released, "Release");

        Ok(released)
    }

    /// Look up a single lock.
    pub async fn get(&self, kssk: &str) -> Result<Option<Lock>, Error> {
        let kssk = Self::valid_kssk(kssk)?;
        self.read(&self.key(kssk)).await
    }

    async fn read(&self, key: &str) -> Result<Option<Lock>, Error> {
        let ttl = self.store.ttl(key).await?;
        if ttl == -2 {
            return Ok(None);
        }

        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };

        let kssk = key.strip_prefix(&self.namespace).unwrap_or(key);

        Ok(Some(value.into_lock(kssk, ttl.max(0))))
    }

    /// All live locks, by KSSK, optionally only those held by a station.
    ///
    /// Locks whose value can not be decoded are listed with empty fields,
    /// and are dropped by a station filter.
    pub async fn list(&self, station_id: Option<&str>) -> Result<Vec<Lock>, Error> {
        let keys = self.store.keys(&self.namespace).await?;

        let mut locks = vec![];
        for key in keys {
            // Gone between listing and reading means expired.
            if let Some(lock) = self.read(&key).await? {
                locks.push(lock);
            }
        }

        if let Some(station_id) = station_id {
            locks.retain(|lock| lock.station_id.as_deref() == Some(station_id));
        }
        locks.sort_by(|a, b| a.kssk.cmp(&b.kssk));

        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NAMESPACE: &str = "kssk:lock:";
    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn manager() -> (LockManager, MemoryLockStore) {
        let store = MemoryLockStore::default();
        let manager = LockManager::new(Arc::new(store.clone()), NAMESPACE, Duration::from_secs(900));

        (manager, store)
    }

    #[tokio::test]
    async fn exactly_one_wins() {
        let (manager, _) = manager();

        let (a, b) = tokio::join!(
            manager.acquire("X", MAC, "station-a", Some(60)),
            manager.acquire("X", MAC, "station-b", Some(60)),
        );

        let (winner, loser) = match (a, b) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            other => panic!("Expected exactly one winner, got {other:?}"),
        };

        let Error::LockHeld(holder) = loser else {
            panic!("Expected lock held, got {loser:?}");
        };
        assert_eq!(holder.station_id, winner.station_id);
        assert_eq!(holder.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_by_ttl() {
        let (manager, _) = manager();

        manager.acquire("X", MAC, "station-a", Some(1)).await.unwrap();
        assert_eq!(manager.list(None).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(1100)).await;

        assert!(manager.list(None).await.unwrap().is_empty());
        manager.acquire("X", MAC, "station-b", Some(1)).await.unwrap();
    }

    #[tokio::test]
    async fn release_checks_the_owner() {
        let (manager, _) = manager();
        manager.acquire("X", MAC, "station-a", None).await.unwrap();

        assert!(!manager
            .release("X", ReleaseMode::Owner("station-b".into()))
            .await
            .unwrap());
        assert_eq!(manager.list(None).await.unwrap().len(), 1);

        assert!(manager
            .release("X", ReleaseMode::Owner("station-a".into()))
            .await
            .unwrap());
        assert!(manager.list(None).await.unwrap().is_empty());

        assert!(!manager
            .release("X", ReleaseMode::Owner("station-a".into()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn force_release() {
        let (manager, _) = manager();
        manager.acquire("X", MAC, "station-a", None).await.unwrap();

        assert!(manager.release("X", ReleaseMode::Force).await.unwrap());
        manager.acquire("X", MAC, "station-b", None).await.unwrap();
    }

    #[tokio::test]
    async fn lists_both_encodings_and_undecodable_rows() {
        let (manager, store) = manager();
        manager.acquire("B", MAC, "station-a", Some(60)).await.unwrap();

        store.insert(
            "kssk:lock:A",
            StoredValue::Fields(HashMap::from([
                ("mac".to_string(), "11:22:33:44:55:66".to_string()),
                ("stationId".to_string(), "station-b".to_string()),
                ("createdAt".to_string(), "1700000000000".to_string()),
            ])),
            Some(Duration::from_secs(30)),
        );
        store.insert(
            "kssk:lock:C",
            StoredValue::Blob("garbage".into()),
            Some(Duration::from_secs(30)),
        );
        store.insert(
            "other:D",
            StoredValue::Blob("{}".into()),
            Some(Duration::from_secs(30)),
        );

        let locks = manager.list(None).await.unwrap();
        let kssks = locks.iter().map(|lock| lock.kssk.as_str()).collect::<Vec<_>>();
        assert_eq!(kssks, vec!["A", "B", "C"]);

        assert_eq!(locks[0].station_id.as_deref(), Some("station-b"));
        assert_eq!(
            locks[0].created_at,
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
        assert_eq!(locks[0].ttl_seconds, 30);

        assert_eq!(locks[1].mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(locks[1].created_at.is_some());

        assert_eq!(locks[2].mac, None);
        assert_eq!(locks[2].station_id, None);
        assert_eq!(locks[2].created_at, None);

        let filtered = manager.list(Some("station-a")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].kssk, "B");
    }

    #[tokio::test]
    async fn hash_owner_can_release() {
        let (manager, store) = manager();
        store.insert(
            "kssk:lock:A",
            StoredValue::Fields(HashMap::from([(
                "stationId".to_string(),
                "station-b".to_string(),
            )])),
            None,
        );

        assert_eq!(manager.list(None).await.unwrap()[0].ttl_seconds, 0);
        assert!(manager
            .release("A", ReleaseMode::Owner("station-b".into()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn bad_input() {
        let (manager, _) = manager();

        let err = manager
            .acquire("X", "not a mac", "station-a", None)
            .await
            .unwrap_err();
        assert_eq!(err.condition(), "invalid-mac");

        let err = manager.acquire("", MAC, "station-a", None).await.unwrap_err();
        assert_eq!(err.condition(), "invalid-input");
        let err = manager.acquire("X", MAC, " ", None).await.unwrap_err();
        assert_eq!(err.condition(), "invalid-input");
        assert!(manager.acquire("X", MAC, "station-a", Some(0)).await.is_err());
    }

    #[test]
    fn created_at_encodings() {
        let rfc = serde_json::json!("2024-01-02T03:04:05Z");
        let millis = serde_json::json!(1_704_164_645_000i64);

        assert_eq!(parse_created_at(&rfc), parse_created_at(&millis));
        assert_eq!(parse_created_at(&serde_json::json!(true)), None);
    }
}
