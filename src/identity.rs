//! Participant identifiers, long-term key directories, and per-epoch rosters.

mod peer_id;
mod roster;
mod round_id;

pub use peer_id::{PeerId, ID_SIZE};
pub use roster::{KeyDirectory, Roster, RosterEntry};
pub use round_id::RoundId;
