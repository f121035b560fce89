//! Append-only persistence for requests, ledger entries and audit records.
//!
//! Records are never deleted. Updates are checked against the stored
//! version: a request may only move forward through its state machine and
//! keeps its identity fields; a ledger entry may only leave `Pending` once.
//! Anything else is rejected with [`StoreError::IllegalTransition`].

use crate::errors::StoreError;
use crate::types::{
    Address, AuditRecord, EntryKind, EntryStatus, Fulfillment, RandomnessRequest, RequestId, RequestState,
    SequenceNumber, TreasuryEntry,
};
use dashmap::DashMap;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub trait SettlementStore: Send + Sync {
    fn insert_request(&self, request: &RandomnessRequest) -> Result<(), StoreError>;
    fn get_request(&self, id: &RequestId) -> Result<Option<RandomnessRequest>, StoreError>;
    fn update_request(&self, request: &RandomnessRequest) -> Result<(), StoreError>;
    fn request_by_sequence(&self, sequence: SequenceNumber) -> Result<Option<RequestId>, StoreError>;
    fn list_requests(&self) -> Result<Vec<RandomnessRequest>, StoreError>;
    /// Next per-requester nonce for request id derivation.
    fn next_nonce(&self, requester: &Address) -> Result<u64, StoreError>;

    fn insert_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError>;
    fn get_entry(&self, id: &str) -> Result<Option<TreasuryEntry>, StoreError>;
    fn update_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError>;
    fn list_entries(&self) -> Result<Vec<TreasuryEntry>, StoreError>;

    fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
    fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError>;

    /// Requests whose payout credit still has to be recorded.
    fn add_pending_credit(&self, id: &RequestId) -> Result<(), StoreError>;
    fn remove_pending_credit(&self, id: &RequestId) -> Result<(), StoreError>;
    fn pending_credits(&self) -> Result<Vec<RequestId>, StoreError>;

    /// Fulfillments that arrived before their sequence number was known.
    fn park_fulfillment(&self, fulfillment: &Fulfillment) -> Result<(), StoreError>;
    fn take_parked(&self, sequence: SequenceNumber) -> Result<Option<Fulfillment>, StoreError>;
    fn parked_fulfillments(&self) -> Result<Vec<Fulfillment>, StoreError>;

    fn fulfillment_cursor(&self) -> Result<u64, StoreError>;
    fn set_fulfillment_cursor(&self, cursor: u64) -> Result<(), StoreError>;

    fn requests_in_state(&self, state: RequestState) -> Result<Vec<RandomnessRequest>, StoreError> {
        Ok(self
            .list_requests()?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    fn entries_for(&self, account: &Address) -> Result<Vec<TreasuryEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .list_entries()?
            .into_iter()
            .filter(|e| &e.account == account)
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    fn pending_entries(&self) -> Result<Vec<TreasuryEntry>, StoreError> {
        Ok(self
            .list_entries()?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .collect())
    }

    /// The non-failed entry of `kind` settling `reference`, if any.
    fn entry_for_reference(&self, reference: &RequestId, kind: EntryKind) -> Result<Option<TreasuryEntry>, StoreError> {
        Ok(self
            .list_entries()?
            .into_iter()
            .find(|e| e.kind == kind && e.reference.as_ref() == Some(reference) && e.status != EntryStatus::Failed))
    }
}

/// Check that `next` is a legal successor of `current`.
pub fn check_request_update(current: &RandomnessRequest, next: &RandomnessRequest) -> Result<(), StoreError> {
    let illegal = |what: &str| Err(StoreError::IllegalTransition(format!("request {}: {}", current.id, what)));

    if current.requester != next.requester
        || current.game_category != next.game_category
        || current.game_variant != next.game_variant
        || current.stake != next.stake
        || current.handle != next.handle
        || current.created_at != next.created_at
    {
        return illegal("identity fields are immutable");
    }
    if current.commitment != next.commitment {
        return illegal("commitment is immutable");
    }
    if current.state.is_terminal() && current != next {
        return illegal("terminal requests are immutable");
    }
    if current.state != next.state && !current.state.can_advance_to(next.state) {
        return illegal(&format!("{} -> {}", current.state, next.state));
    }
    if current.sequence_number.is_some() && current.sequence_number != next.sequence_number {
        return illegal("sequence number already assigned");
    }
    if !next.is_consistent() {
        return illegal("random value must be present exactly when fulfilled");
    }
    Ok(())
}

/// Check that `next` is a legal successor of ledger entry `current`.
pub fn check_entry_update(current: &TreasuryEntry, next: &TreasuryEntry) -> Result<(), StoreError> {
    let illegal = |what: &str| Err(StoreError::IllegalTransition(format!("entry {}: {}", current.id, what)));

    if current.kind != next.kind
        || current.account != next.account
        || current.amount != next.amount
        || current.reference != next.reference
        || current.timestamp != next.timestamp
    {
        return illegal("identity fields are immutable");
    }
    if current.status != EntryStatus::Pending {
        return illegal(&format!("{} entries are immutable", current.status.label()));
    }
    if current.tx_ref.is_some() && current.tx_ref != next.tx_ref {
        return illegal("transaction reference already set");
    }
    Ok(())
}

/// In-memory store backed by `DashMap`.
#[derive(Default)]
pub struct MemoryStore {
    requests: DashMap<RequestId, RandomnessRequest>,
    sequences: DashMap<SequenceNumber, RequestId>,
    nonces: DashMap<Address, u64>,
    entries: DashMap<String, TreasuryEntry>,
    audit: Mutex<Vec<AuditRecord>>,
    pending_credits: DashMap<RequestId, ()>,
    parked: DashMap<SequenceNumber, Fulfillment>,
    cursor: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettlementStore for MemoryStore {
    fn insert_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        match self.requests.entry(request.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(request.id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if let Some(sequence) = request.sequence_number {
                    self.sequences.insert(sequence, request.id.clone());
                }
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    fn get_request(&self, id: &RequestId) -> Result<Option<RandomnessRequest>, StoreError> {
        Ok(self.requests.get(id).map(|r| r.clone()))
    }

    fn update_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        let mut current = self
            .requests
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::ReadFailed(format!("request {} not stored", request.id)))?;
        check_request_update(&current, request)?;
        if let Some(sequence) = request.sequence_number {
            self.sequences.insert(sequence, request.id.clone());
        }
        *current = request.clone();
        Ok(())
    }

    fn request_by_sequence(&self, sequence: SequenceNumber) -> Result<Option<RequestId>, StoreError> {
        Ok(self.sequences.get(&sequence).map(|id| id.clone()))
    }

    fn list_requests(&self) -> Result<Vec<RandomnessRequest>, StoreError> {
        let mut requests: Vec<_> = self.requests.iter().map(|r| r.value().clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    fn next_nonce(&self, requester: &Address) -> Result<u64, StoreError> {
        let mut nonce = self.nonces.entry(requester.clone()).or_insert(0);
        *nonce += 1;
        Ok(*nonce)
    }

    fn insert_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        match self.entries.entry(entry.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(entry.id.clone())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(())
            }
        }
    }

    fn get_entry(&self, id: &str) -> Result<Option<TreasuryEntry>, StoreError> {
        Ok(self.entries.get(id).map(|e| e.clone()))
    }

    fn update_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        let mut current = self
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| StoreError::ReadFailed(format!("entry {} not stored", entry.id)))?;
        check_entry_update(&current, entry)?;
        *current = entry.clone();
        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<TreasuryEntry>, StoreError> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.audit
            .lock()
            .map_err(|_| StoreError::WriteFailed("audit log lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self
            .audit
            .lock()
            .map_err(|_| StoreError::ReadFailed("audit log lock poisoned".to_string()))?
            .clone())
    }

    fn add_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.pending_credits.insert(id.clone(), ());
        Ok(())
    }

    fn remove_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.pending_credits.remove(id);
        Ok(())
    }

    fn pending_credits(&self) -> Result<Vec<RequestId>, StoreError> {
        Ok(self.pending_credits.iter().map(|e| e.key().clone()).collect())
    }

    fn park_fulfillment(&self, fulfillment: &Fulfillment) -> Result<(), StoreError> {
        self.parked.insert(fulfillment.sequence_number, fulfillment.clone());
        Ok(())
    }

    fn take_parked(&self, sequence: SequenceNumber) -> Result<Option<Fulfillment>, StoreError> {
        Ok(self.parked.remove(&sequence).map(|(_, f)| f))
    }

    fn parked_fulfillments(&self) -> Result<Vec<Fulfillment>, StoreError> {
        Ok(self.parked.iter().map(|f| f.value().clone()).collect())
    }

    fn fulfillment_cursor(&self) -> Result<u64, StoreError> {
        Ok(self.cursor.load(Ordering::SeqCst))
    }

    fn set_fulfillment_cursor(&self, cursor: u64) -> Result<(), StoreError> {
        self.cursor.fetch_max(cursor, Ordering::SeqCst);
        Ok(())
    }
}

const REQUEST_PREFIX: &str = "request:";
const SEQUENCE_PREFIX: &[u8] = b"sequence:";
const NONCE_PREFIX: &str = "nonce:";
const ENTRY_PREFIX: &str = "entry:";
const AUDIT_PREFIX: &[u8] = b"audit:";
const CREDIT_PREFIX: &str = "credit:";
const PARKED_PREFIX: &[u8] = b"parked:";
const CURSOR_KEY: &[u8] = b"meta:fulfillment_cursor";

fn request_key(id: &RequestId) -> Vec<u8> {
    format!("{}{}", REQUEST_PREFIX, id).into_bytes()
}

fn sequence_key(sequence: SequenceNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEQUENCE_PREFIX.len() + 8);
    key.extend_from_slice(SEQUENCE_PREFIX);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn entry_key(id: &str) -> Vec<u8> {
    format!("{}{}", ENTRY_PREFIX, id).into_bytes()
}

fn audit_key(record: &AuditRecord) -> Vec<u8> {
    // prefix | at(be) | id keeps records in time order
    let mut key = Vec::with_capacity(AUDIT_PREFIX.len() + 8 + record.id.len());
    key.extend_from_slice(AUDIT_PREFIX);
    key.extend_from_slice(&record.at.to_be_bytes());
    key.extend_from_slice(record.id.as_bytes());
    key
}

fn parked_key(sequence: SequenceNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(PARKED_PREFIX.len() + 8);
    key.extend_from_slice(PARKED_PREFIX);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn encode<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::WriteFailed(format!("Failed to encode {}: {}", what, e)))
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::CorruptedData(format!("Failed to decode {}: {}", what, e)))
}

/// RocksDB-backed store. JSON values under prefix keys.
pub struct RocksStore {
    db: Arc<DB>,
    /// Serializes read-check-write cycles.
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(|e| StoreError::ReadFailed(format!("Failed to open database: {}", e)))?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get(key).map_err(|e| StoreError::ReadFailed(e.to_string()))
    }

    fn get_json<T: DeserializeOwned>(&self, what: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode(what, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put(key, value).map_err(|e| StoreError::WriteFailed(e.to_string()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.db.write(batch).map_err(|e| StoreError::WriteFailed(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StoreError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn scan_json<T: DeserializeOwned>(&self, what: &str, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(_, value)| decode(what, &value))
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::WriteFailed("store write lock poisoned".to_string()))
    }
}

impl SettlementStore for RocksStore {
    fn insert_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let key = request_key(&request.id);
        if self.get_raw(&key)?.is_some() {
            return Err(StoreError::Duplicate(request.id.to_string()));
        }
        let mut batch = WriteBatch::default();
        batch.put(&key, encode("request", request)?);
        if let Some(sequence) = request.sequence_number {
            batch.put(sequence_key(sequence), request.id.as_str().as_bytes());
        }
        self.write(batch)
    }

    fn get_request(&self, id: &RequestId) -> Result<Option<RandomnessRequest>, StoreError> {
        self.get_json("request", &request_key(id))
    }

    fn update_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let current: RandomnessRequest = self
            .get_request(&request.id)?
            .ok_or_else(|| StoreError::ReadFailed(format!("request {} not stored", request.id)))?;
        check_request_update(&current, request)?;
        let mut batch = WriteBatch::default();
        batch.put(request_key(&request.id), encode("request", request)?);
        if let Some(sequence) = request.sequence_number {
            batch.put(sequence_key(sequence), request.id.as_str().as_bytes());
        }
        self.write(batch)
    }

    fn request_by_sequence(&self, sequence: SequenceNumber) -> Result<Option<RequestId>, StoreError> {
        match self.get_raw(&sequence_key(sequence))? {
            Some(bytes) => {
                let raw = String::from_utf8(bytes)
                    .map_err(|e| StoreError::CorruptedData(format!("sequence index {}: {}", sequence, e)))?;
                raw.parse()
                    .map(Some)
                    .map_err(|e| StoreError::CorruptedData(format!("sequence index {}: {}", sequence, e)))
            }
            None => Ok(None),
        }
    }

    fn list_requests(&self) -> Result<Vec<RandomnessRequest>, StoreError> {
        let mut requests: Vec<RandomnessRequest> = self.scan_json("request", REQUEST_PREFIX.as_bytes())?;
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    fn next_nonce(&self, requester: &Address) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        let key = format!("{}{}", NONCE_PREFIX, requester).into_bytes();
        let current = match self.get_raw(&key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::CorruptedData(format!("nonce for {}", requester)))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let next = current + 1;
        self.put(&key, &next.to_be_bytes())?;
        Ok(next)
    }

    fn insert_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let key = entry_key(&entry.id);
        if self.get_raw(&key)?.is_some() {
            return Err(StoreError::Duplicate(entry.id.clone()));
        }
        self.put(&key, &encode("entry", entry)?)
    }

    fn get_entry(&self, id: &str) -> Result<Option<TreasuryEntry>, StoreError> {
        self.get_json("entry", &entry_key(id))
    }

    fn update_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let current: TreasuryEntry = self
            .get_entry(&entry.id)?
            .ok_or_else(|| StoreError::ReadFailed(format!("entry {} not stored", entry.id)))?;
        check_entry_update(&current, entry)?;
        self.put(&entry_key(&entry.id), &encode("entry", entry)?)
    }

    fn list_entries(&self) -> Result<Vec<TreasuryEntry>, StoreError> {
        let mut entries: Vec<TreasuryEntry> = self.scan_json("entry", ENTRY_PREFIX.as_bytes())?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.put(&audit_key(record), &encode("audit record", record)?)
    }

    fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        self.scan_json("audit record", AUDIT_PREFIX)
    }

    fn add_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.put(format!("{}{}", CREDIT_PREFIX, id).as_bytes(), &[])
    }

    fn remove_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.db
            .delete(format!("{}{}", CREDIT_PREFIX, id).as_bytes())
            .map_err(|e| StoreError::WriteFailed(e.to_string()))
    }

    fn pending_credits(&self) -> Result<Vec<RequestId>, StoreError> {
        self.scan_prefix(CREDIT_PREFIX.as_bytes())?
            .into_iter()
            .map(|(key, _)| {
                let raw = std::str::from_utf8(&key[CREDIT_PREFIX.len()..])
                    .map_err(|e| StoreError::CorruptedData(format!("credit key: {}", e)))?;
                raw.parse()
                    .map_err(|e: String| StoreError::CorruptedData(format!("credit key: {}", e)))
            })
            .collect()
    }

    fn park_fulfillment(&self, fulfillment: &Fulfillment) -> Result<(), StoreError> {
        self.put(&parked_key(fulfillment.sequence_number), &encode("fulfillment", fulfillment)?)
    }

    fn take_parked(&self, sequence: SequenceNumber) -> Result<Option<Fulfillment>, StoreError> {
        let _guard = self.lock()?;
        let key = parked_key(sequence);
        let parked = self.get_json("fulfillment", &key)?;
        if parked.is_some() {
            self.db.delete(&key).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        }
        Ok(parked)
    }

    fn parked_fulfillments(&self) -> Result<Vec<Fulfillment>, StoreError> {
        self.scan_json("fulfillment", PARKED_PREFIX)
    }

    fn fulfillment_cursor(&self) -> Result<u64, StoreError> {
        match self.get_raw(CURSOR_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::CorruptedData("fulfillment cursor".to_string()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn set_fulfillment_cursor(&self, cursor: u64) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if cursor > self.fulfillment_cursor()? {
            self.put(CURSOR_KEY, &cursor.to_be_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(seed: u8) -> RandomnessRequest {
        RandomnessRequest::new(
            RequestId::from_digest(&[seed; 32]),
            Address::new("0x00000000000000000000000000000000000000d1"),
            "dice",
            "classic",
            10,
            [seed; 32],
            1,
            seed as u64,
        )
    }

    fn exercise(store: &dyn SettlementStore) {
        let mut req = request(1);
        store.insert_request(&req).unwrap();
        assert!(matches!(store.insert_request(&req), Err(StoreError::Duplicate(_))));

        // Created -> Fulfilled skips a state.
        let mut skipped = req.clone();
        skipped.state = RequestState::Fulfilled;
        skipped.random_value = Some([0u8; 32]);
        assert!(matches!(store.update_request(&skipped), Err(StoreError::IllegalTransition(_))));

        req.state = RequestState::AwaitingFulfillment;
        req.sequence_number = Some(7);
        store.update_request(&req).unwrap();
        assert_eq!(store.request_by_sequence(7).unwrap(), Some(req.id.clone()));

        let mut resequenced = req.clone();
        resequenced.sequence_number = Some(8);
        assert!(store.update_request(&resequenced).is_err());

        let mut recommitted = req.clone();
        recommitted.commitment = [0xee; 32];
        assert!(store.update_request(&recommitted).is_err());

        req.state = RequestState::Expired;
        store.update_request(&req).unwrap();
        let mut revived = req.clone();
        revived.state = RequestState::AwaitingFulfillment;
        assert!(store.update_request(&revived).is_err());

        let account = Address::new("0x00000000000000000000000000000000000000d1");
        let mut entry = TreasuryEntry::new(EntryKind::Deposit, account.clone(), 5, EntryStatus::Pending);
        store.insert_entry(&entry).unwrap();
        entry.status = EntryStatus::Confirmed;
        store.update_entry(&entry).unwrap();
        let mut rewritten = entry.clone();
        rewritten.status = EntryStatus::Failed;
        assert!(matches!(store.update_entry(&rewritten), Err(StoreError::IllegalTransition(_))));
        assert_eq!(store.entries_for(&account).unwrap().len(), 1);

        assert_eq!(store.next_nonce(&account).unwrap(), 1);
        assert_eq!(store.next_nonce(&account).unwrap(), 2);

        store.add_pending_credit(&req.id).unwrap();
        assert_eq!(store.pending_credits().unwrap(), vec![req.id.clone()]);
        store.remove_pending_credit(&req.id).unwrap();
        assert!(store.pending_credits().unwrap().is_empty());

        let parked = Fulfillment {
            sequence_number: 42,
            revealed_seed: [1u8; 32],
            provider_random: [2u8; 32],
            tx_ref: None,
        };
        store.park_fulfillment(&parked).unwrap();
        assert_eq!(store.parked_fulfillments().unwrap().len(), 1);
        assert_eq!(store.take_parked(42).unwrap(), Some(parked));
        assert_eq!(store.take_parked(42).unwrap(), None);

        store.set_fulfillment_cursor(9).unwrap();
        store.set_fulfillment_cursor(3).unwrap();
        assert_eq!(store.fulfillment_cursor().unwrap(), 9);
    }

    #[test]
    fn test_memory_store_rules() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_rocks_store_rules() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_rocks_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let req = request(3);
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.insert_request(&req).unwrap();
            store
                .append_audit(&AuditRecord::new(crate::types::AuditSeverity::Critical, "req", "detail"))
                .unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_request(&req.id).unwrap(), Some(req));
        assert_eq!(store.audit_records().unwrap().len(), 1);
    }
}
