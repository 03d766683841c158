//! Request, response and event types of the key-value store

use serde::{Deserialize, Serialize};

/// Global store revision. Strictly increasing across all mutating transactions.
pub type Revision = i64;

/// Identifier of a store-side TTL lease. `0` means "no lease".
pub type LeaseId = i64;

pub const NO_LEASE: LeaseId = 0;

/// A key-value entry as stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision at which the key was last created after being absent
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Number of modifications since creation
    pub version: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Store revision when the request was applied
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortTarget {
    Key,
    Version,
    Create,
    Mod,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascend,
    Descend,
}

/// Range read options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    pub sort: Option<(SortTarget, SortOrder)>,
    /// Maximum number of entries returned, 0 for no limit
    pub limit: usize,
    /// Read the view at this revision, 0 for the latest
    pub revision: Revision,
    /// Skip entries created after this revision, 0 for no filter
    pub max_create_revision: Revision,
    /// Return only the count
    pub count_only: bool,
}

impl GetOptions {
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Default::default()
        }
    }

    /// The entry under a prefix with the smallest create revision.
    pub fn first_create() -> Self {
        Self {
            prefix: true,
            sort: Some((SortTarget::Create, SortOrder::Ascend)),
            limit: 1,
            ..Default::default()
        }
    }

    /// The entry under a prefix with the largest create revision.
    pub fn last_create() -> Self {
        Self {
            prefix: true,
            sort: Some((SortTarget::Create, SortOrder::Descend)),
            limit: 1,
            ..Default::default()
        }
    }

    pub fn with_max_create_revision(mut self, revision: Revision) -> Self {
        self.max_create_revision = revision;
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_count_only(mut self) -> Self {
        self.count_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Attach the key to this lease, `NO_LEASE` for none
    pub lease: LeaseId,
}

impl PutOptions {
    pub fn with_lease(lease: LeaseId) -> Self {
        Self { lease }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub prefix: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// Number of matching entries before `limit` was applied
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: usize,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareResult {
    fn holds<T: Ord>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareResult::Equal => actual == expected,
            CompareResult::NotEqual => actual != expected,
            CompareResult::Greater => actual > expected,
            CompareResult::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(Vec<u8>),
}

/// A single condition of a transaction, evaluated against the current state of `key`.
/// An absent key has zero revisions, zero version and an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<Vec<u8>>, result: CompareResult, rev: Revision) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::CreateRevision(rev),
        }
    }

    pub fn mod_revision(key: impl Into<Vec<u8>>, result: CompareResult, rev: Revision) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::ModRevision(rev),
        }
    }

    pub fn version(key: impl Into<Vec<u8>>, result: CompareResult, version: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<Vec<u8>>, result: CompareResult, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// Evaluate against the current entry for the key, if any.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::CreateRevision(rev) => {
                let actual = current.map(|kv| kv.create_revision).unwrap_or(0);
                self.result.holds(&actual, rev)
            }
            CompareTarget::ModRevision(rev) => {
                let actual = current.map(|kv| kv.mod_revision).unwrap_or(0);
                self.result.holds(&actual, rev)
            }
            CompareTarget::Version(version) => {
                let actual = current.map(|kv| kv.version).unwrap_or(0);
                self.result.holds(&actual, version)
            }
            CompareTarget::Value(value) => {
                let actual: &[u8] = current.map(|kv| kv.value.as_slice()).unwrap_or(&[]);
                self.result.holds(&actual, &value.as_slice())
            }
        }
    }
}

/// An operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Get {
        key: Vec<u8>,
        options: GetOptions,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        options: PutOptions,
    },
    Delete {
        key: Vec<u8>,
        options: DeleteOptions,
    },
}

impl Op {
    pub fn get(key: impl Into<Vec<u8>>, options: GetOptions) -> Self {
        Op::Get {
            key: key.into(),
            options,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Op::Delete {
            key: key.into(),
            options: DeleteOptions::default(),
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Op::Get { .. })
    }
}

/// Atomic compare-then-branch transaction. The success branch runs when every
/// comparison holds, the failure branch otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: impl IntoIterator<Item = Compare>) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Get(GetResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
}

impl OpResponse {
    pub fn as_get(&self) -> Option<&GetResponse> {
        match self {
            OpResponse::Get(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&DeleteResponse> {
        match self {
            OpResponse::Delete(resp) => Some(resp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether the success branch was taken
    pub succeeded: bool,
    /// One response per operation of the branch that ran, in order
    pub responses: Vec<OpResponse>,
}

impl TxnResponse {
    /// Entries returned by the get operation at `index` of the executed branch.
    pub fn kvs(&self, index: usize) -> &[KeyValue] {
        self.responses
            .get(index)
            .and_then(OpResponse::as_get)
            .map(|resp| resp.kvs.as_slice())
            .unwrap_or(&[])
    }
}

// ============================================================================
// Leases
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// Granted TTL in seconds
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimeToLiveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// Remaining seconds before expiry
    pub ttl: i64,
    pub granted_ttl: i64,
}

// ============================================================================
// Watches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// Entry after the change. For deletes only `key` and `mod_revision` (the
    /// deletion revision) are meaningful.
    pub kv: KeyValue,
}

impl WatchEvent {
    /// A put that brought the key from absent to present.
    pub fn is_create(&self) -> bool {
        self.event_type == EventType::Put && self.kv.version == 1
    }

    pub fn is_delete(&self) -> bool {
        self.event_type == EventType::Delete
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub prefix: bool,
    /// First revision to deliver, 0 for the next revision
    pub start_revision: Revision,
}

impl WatchOptions {
    pub fn key_from(start_revision: Revision) -> Self {
        Self {
            prefix: false,
            start_revision,
        }
    }

    pub fn prefix_from(start_revision: Revision) -> Self {
        Self {
            prefix: true,
            start_revision,
        }
    }
}

/// Events committed at a single revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub events: Vec<WatchEvent>,
}

/// Returns true when `key` falls in the range described by `target` and `prefix`.
pub fn key_matches(key: &[u8], target: &[u8], prefix: bool) -> bool {
    if prefix {
        key.starts_with(target)
    } else {
        key == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(create: Revision, modified: Revision, version: i64, value: &str) -> KeyValue {
        KeyValue {
            key: b"k".to_vec(),
            value: value.as_bytes().to_vec(),
            create_revision: create,
            mod_revision: modified,
            version,
            lease: NO_LEASE,
        }
    }

    #[test]
    fn test_compare_absent_key() {
        let cmp = Compare::create_revision("k", CompareResult::Equal, 0);
        assert!(cmp.evaluate(None));

        let cmp = Compare::value("k", CompareResult::Equal, "");
        assert!(cmp.evaluate(None));

        let cmp = Compare::version("k", CompareResult::Greater, 0);
        assert!(!cmp.evaluate(None));
    }

    #[test]
    fn test_compare_present_key() {
        let entry = kv(5, 9, 3, "v");

        assert!(!Compare::create_revision("k", CompareResult::Equal, 0).evaluate(Some(&entry)));
        assert!(Compare::create_revision("k", CompareResult::Equal, 5).evaluate(Some(&entry)));
        assert!(Compare::mod_revision("k", CompareResult::Less, 10).evaluate(Some(&entry)));
        assert!(Compare::mod_revision("k", CompareResult::NotEqual, 5).evaluate(Some(&entry)));
        assert!(Compare::version("k", CompareResult::Greater, 2).evaluate(Some(&entry)));
        assert!(Compare::value("k", CompareResult::Greater, "a").evaluate(Some(&entry)));
    }

    #[test]
    fn test_txn_builder() {
        let txn = Txn::new()
            .when([Compare::create_revision("a", CompareResult::Equal, 0)])
            .and_then([Op::put("a", "1", PutOptions::default())])
            .or_else([Op::get("a", GetOptions::default())]);

        assert_eq!(txn.compare.len(), 1);
        assert!(txn.success[0].is_mutation());
        assert!(!txn.failure[0].is_mutation());
    }

    #[test]
    fn test_txn_response_kvs_out_of_range() {
        let resp = TxnResponse {
            succeeded: true,
            responses: vec![OpResponse::Put(PutResponse::default())],
            ..Default::default()
        };
        assert!(resp.kvs(0).is_empty());
        assert!(resp.kvs(3).is_empty());
    }

    #[test]
    fn test_event_kinds() {
        let create = WatchEvent {
            event_type: EventType::Put,
            kv: kv(4, 4, 1, "x"),
        };
        let update = WatchEvent {
            event_type: EventType::Put,
            kv: kv(4, 6, 2, "y"),
        };
        assert!(create.is_create());
        assert!(!update.is_create());
        assert!(!update.is_delete());
    }

    #[test]
    fn test_key_matches() {
        assert!(key_matches(b"/lock/1", b"/lock/", true));
        assert!(!key_matches(b"/lock2/1", b"/lock/", true));
        assert!(key_matches(b"/lock/1", b"/lock/1", false));
        assert!(!key_matches(b"/lock/10", b"/lock/1", false));
    }
}
