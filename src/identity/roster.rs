use alloc::{boxed::Box, collections::BTreeMap, format, vec::Vec};

use crate::errors::{LocalError, Rejection};
use crate::session::SessionParameters;

use super::PeerId;

/// Long-term public keys of all known participants, indexed by identifier.
///
/// Built once at session construction and read-only afterwards.
#[derive_where::derive_where(Debug, Clone)]
pub struct KeyDirectory<SP: SessionParameters> {
    keys: BTreeMap<PeerId, SP::Verifier>,
}

impl<SP: SessionParameters> KeyDirectory<SP> {
    /// Creates a directory from the given map.
    pub fn new(keys: BTreeMap<PeerId, SP::Verifier>) -> Self {
        Self { keys }
    }

    /// Looks up the long-term key of `id`, rejecting unknown participants.
    pub fn key_of(&self, id: &PeerId) -> Result<&SP::Verifier, Rejection> {
        self.keys
            .get(id)
            .ok_or_else(|| Rejection::new(format!("no long-term key known for {id:?}")))
    }

    /// Returns `true` if the directory knows `id`.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.keys.contains_key(id)
    }
}

/// One entry of a per-epoch roster.
#[derive_where::derive_where(Debug, Clone)]
pub struct RosterEntry<SP: SessionParameters> {
    /// The participant identifier.
    pub id: PeerId,
    /// The participant's long-term public key.
    pub public_key: SP::Verifier,
    /// The ephemeral key the participant generated for this epoch.
    pub round_key: SP::Verifier,
    /// Opaque extra round material (e.g. a key-exchange public component).
    pub exchange: Box<[u8]>,
}

/// An immutable per-epoch participant roster.
///
/// Entry order is fixed at construction and is what rounds index by;
/// equality of rosters is not order-sensitive, positional lookups are.
#[derive_where::derive_where(Debug, Clone)]
pub struct Roster<SP: SessionParameters> {
    entries: Vec<RosterEntry<SP>>,
    index: BTreeMap<PeerId, usize>,
}

impl<SP: SessionParameters> Roster<SP> {
    /// Creates a roster; duplicate identifiers are a construction error.
    pub fn new(entries: Vec<RosterEntry<SP>>) -> Result<Self, LocalError> {
        let mut index = BTreeMap::new();
        for (position, entry) in entries.iter().enumerate() {
            if index.insert(entry.id, position).is_some() {
                return Err(LocalError::new(format!("duplicate roster entry for {:?}", entry.id)));
            }
        }
        Ok(Self { entries, index })
    }

    /// The number of participants in the roster.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for an empty roster.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry at `position`.
    pub fn get(&self, position: usize) -> Option<&RosterEntry<SP>> {
        self.entries.get(position)
    }

    /// Returns the position of `id`, if present.
    pub fn position(&self, id: &PeerId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns the entry of `id`, if present.
    pub fn by_id(&self, id: &PeerId) -> Option<&RosterEntry<SP>> {
        self.position(id).and_then(|position| self.entries.get(position))
    }

    /// Returns `true` if `id` is part of the roster.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterates over the entries in roster order.
    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry<SP>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec, vec::Vec};

    use rand_core::SeedableRng;
    use signature::Keypair;

    use super::{Roster, RosterEntry};
    use crate::dev::{TestSessionParams, TestSigner};
    use crate::identity::PeerId;

    fn entry(id: PeerId, key: u64) -> RosterEntry<TestSessionParams> {
        RosterEntry {
            id,
            public_key: TestSigner::new(key).verifying_key(),
            round_key: TestSigner::new(key + 1000).verifying_key(),
            exchange: Box::from(*b"exchange"),
        }
    }

    #[test]
    fn positional_and_id_indexing_agree() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(4);
        let ids: Vec<PeerId> = (0..3).map(|_| PeerId::random(&mut rng)).collect();
        let entries = ids
            .iter()
            .enumerate()
            .map(|(index, id)| entry(*id, index as u64))
            .collect();
        let roster = Roster::new(entries).unwrap();

        assert_eq!(roster.len(), 3);
        for (position, id) in ids.iter().enumerate() {
            assert_eq!(roster.position(id), Some(position));
            assert_eq!(roster.get(position).map(|entry| entry.id), Some(*id));
            assert!(roster.contains(id));
        }
        assert!(!roster.contains(&PeerId::random(&mut rng)));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(5);
        let id = PeerId::random(&mut rng);
        let entries = vec![entry(id, 1), entry(id, 2)];
        assert!(Roster::<TestSessionParams>::new(entries).is_err());
    }
}
