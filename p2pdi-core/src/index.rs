//! Document index (which peer holds which documents) and the local document store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::protocol::PeerId;

pub type DocumentId = String;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid index payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("fetch payload must hold exactly one document, found {0}")]
    EntryCount(usize),
    #[error("fetch payload holds {found:?}, requested {requested:?}")]
    WrongDocument { requested: String, found: String },
}

/// Mapping peer → documents known to be held by that peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentIndex {
    entries: BTreeMap<PeerId, BTreeSet<DocumentId>>,
}

impl DocumentIndex {
    /// Index seeded with `owner` → `documents`.
    pub fn new(owner: &PeerId, documents: impl IntoIterator<Item = DocumentId>) -> Self {
        let mut index = Self::default();
        index.entry_mut(owner).extend(documents);
        index
    }

    /// Get-or-create the entry for `peer`.
    pub fn entry_mut(&mut self, peer: &PeerId) -> &mut BTreeSet<DocumentId> {
        self.entries.entry(peer.clone()).or_default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&BTreeSet<DocumentId>> {
        self.entries.get(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &BTreeSet<DocumentId>)> {
        self.entries.iter()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    /// Union of every entry.
    pub fn flatten(&self) -> BTreeSet<DocumentId> {
        self.entries.values().flatten().cloned().collect()
    }

    /// Union `other` into this index, entry by entry. Entries keyed by `skip`
    /// are ignored: a peer's own holdings are never learned second-hand.
    /// Returns how many (peer, document) pairs were new.
    pub fn merge(&mut self, other: &DocumentIndex, skip: &PeerId) -> usize {
        let mut added = 0;
        for (peer, docs) in other.entries.iter().filter(|(p, _)| *p != skip) {
            let entry = self.entry_mut(peer);
            for doc in docs {
                if entry.insert(doc.clone()) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Drop everything recorded for `peer`.
    pub fn forget(&mut self, peer: &PeerId) -> Option<BTreeSet<DocumentId>> {
        self.entries.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_payload(&self) -> Result<String, IndexError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, IndexError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Goal documents not present anywhere in `index`.
pub fn remaining(goal: &BTreeSet<DocumentId>, index: &DocumentIndex) -> BTreeSet<DocumentId> {
    let known = index.flatten();
    goal.difference(&known).cloned().collect()
}

/// Document id → content. Filled as fetches succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentStore {
    documents: BTreeMap<DocumentId, String>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: DocumentId, content: String) -> Option<String> {
        self.documents.insert(id, content)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.documents.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn ids(&self) -> BTreeSet<DocumentId> {
        self.documents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// GetRFC payload: a single-entry `{id: content}` object.
pub fn encode_document(id: &str, content: &str) -> Result<String, IndexError> {
    let mut one = BTreeMap::new();
    one.insert(id, content);
    Ok(serde_json::to_string(&one)?)
}

/// Parse a GetRFC payload and check it carries exactly the requested document.
pub fn decode_document(requested: &str, payload: &str) -> Result<String, IndexError> {
    let mut map: BTreeMap<String, String> = serde_json::from_str(payload)?;
    if map.len() != 1 {
        return Err(IndexError::EntryCount(map.len()));
    }
    match map.remove(requested) {
        Some(content) => Ok(content),
        None => Err(IndexError::WrongDocument {
            requested: requested.to_string(),
            found: map.into_keys().next().unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> BTreeSet<DocumentId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn seeded_with_owner() {
        let me = PeerId::new("127.0.0.1", 1);
        let index = DocumentIndex::new(&me, ids(&["8451", "8464"]));
        assert_eq!(index.get(&me).unwrap(), &ids(&["8451", "8464"]));
        let empty = DocumentIndex::new(&me, Vec::new());
        assert!(empty.get(&me).unwrap().is_empty());
    }

    #[test]
    fn merge_skips_own_entry() {
        let me = PeerId::new("127.0.0.1", 1);
        let other = PeerId::new("127.0.0.1", 2);
        let third = PeerId::new("127.0.0.1", 3);
        let mut local = DocumentIndex::new(&me, ids(&["a"]));
        let mut remote = DocumentIndex::new(&other, ids(&["b", "c"]));
        remote.entry_mut(&third).insert("d".to_string());
        remote.entry_mut(&me).insert("zzz".to_string());

        assert_eq!(local.merge(&remote, &me), 3);
        assert_eq!(local.get(&me).unwrap(), &ids(&["a"]));
        assert_eq!(local.get(&third).unwrap(), &ids(&["d"]));
        assert_eq!(local.merge(&remote, &me), 0);
        assert_eq!(local.flatten(), ids(&["a", "b", "c", "d"]));
    }

    #[test]
    fn remaining_is_goal_minus_known() {
        let me = PeerId::new("h", 1);
        let mut index = DocumentIndex::new(&me, ids(&["a"]));
        index.entry_mut(&PeerId::new("h", 2)).insert("b".to_string());
        let goal = ids(&["a", "b", "c"]);
        assert_eq!(remaining(&goal, &index), ids(&["c"]));
        index.forget(&PeerId::new("h", 2));
        assert_eq!(remaining(&goal, &index), ids(&["b", "c"]));
    }

    #[test]
    fn index_payload_roundtrip() {
        let me = PeerId::new("127.0.0.1", 65431);
        let index = DocumentIndex::new(&me, ids(&["8451"]));
        let payload = index.to_payload().unwrap();
        assert_eq!(payload, r#"{"127.0.0.1:65431":["8451"]}"#);
        assert_eq!(DocumentIndex::from_payload(&payload).unwrap(), index);
        assert!(DocumentIndex::from_payload("not json").is_err());
    }

    #[test]
    fn document_payload_checks_id() {
        let payload = encode_document("8451", "body<with> text").unwrap();
        assert_eq!(decode_document("8451", &payload).unwrap(), "body<with> text");
        assert!(matches!(
            decode_document("8464", &payload),
            Err(IndexError::WrongDocument { .. })
        ));
        assert!(matches!(
            decode_document("8451", "{}"),
            Err(IndexError::EntryCount(0))
        ));
    }
}
