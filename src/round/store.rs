//! Persistence Store
//!
//! Participant records and closed rounds. Calls are synchronous; the
//! driver runs them on the blocking pool so the tick loop never waits on
//! disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::round::events::ClosedRound;
use crate::round::state::Participant;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Lock poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Persistence for participants and round history.
pub trait RoundStore: Send + Sync + 'static {
    /// Every stored participant.
    fn load_participants(&self) -> Result<Vec<Participant>, StoreError>;
    /// Replace the stored participant set.
    fn save_participants(&self, participants: &[Participant]) -> Result<(), StoreError>;
    /// Persist a closed round.
    fn save_round(&self, closed: &ClosedRound) -> Result<(), StoreError>;
    /// Load a closed round.
    fn load_round(&self, round_number: u64) -> Result<Option<ClosedRound>, StoreError>;
    /// Highest stored round number (0 when empty).
    fn last_round_number(&self) -> Result<u64, StoreError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    participants: Mutex<Vec<Participant>>,
    rounds: Mutex<BTreeMap<u64, ClosedRound>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoundStore for MemoryStore {
    fn load_participants(&self) -> Result<Vec<Participant>, StoreError> {
        Ok(self.participants.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn save_participants(&self, participants: &[Participant]) -> Result<(), StoreError> {
        *self.participants.lock().map_err(|_| StoreError::Poisoned)? = participants.to_vec();
        Ok(())
    }

    fn save_round(&self, closed: &ClosedRound) -> Result<(), StoreError> {
        self.rounds
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(closed.round.number, closed.clone());
        Ok(())
    }

    fn load_round(&self, round_number: u64) -> Result<Option<ClosedRound>, StoreError> {
        Ok(self
            .rounds
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(&round_number)
            .cloned())
    }

    fn last_round_number(&self) -> Result<u64, StoreError> {
        Ok(self
            .rounds
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }
}

// =============================================================================
// JSON FILE STORE
// =============================================================================

const PARTICIPANTS_FILE: &str = "participants.json";
const ROUNDS_DIR: &str = "rounds";

/// Directory of JSON files: `participants.json` and `rounds/<n>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(ROUNDS_DIR))?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn round_path(&self, round_number: u64) -> PathBuf {
        self.dir.join(ROUNDS_DIR).join(format!("{}.json", round_number))
    }
}

/// Write via a temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl RoundStore for JsonFileStore {
    fn load_participants(&self) -> Result<Vec<Participant>, StoreError> {
        let path = self.dir.join(PARTICIPANTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_participants(&self, participants: &[Participant]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(participants)?;
        write_atomic(&self.dir.join(PARTICIPANTS_FILE), &bytes)
    }

    fn save_round(&self, closed: &ClosedRound) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(closed)?;
        write_atomic(&self.round_path(closed.round.number), &bytes)
    }

    fn load_round(&self, round_number: u64) -> Result<Option<ClosedRound>, StoreError> {
        let path = self.round_path(round_number);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn last_round_number(&self) -> Result<u64, StoreError> {
        let mut last = 0;
        for entry in fs::read_dir(self.dir.join(ROUNDS_DIR))? {
            let name = entry?.file_name();
            let number = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(number) = number {
                last = last.max(number);
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::rating::{RatingEngine, RoundResult};
    use crate::round::state::{Competitor, ParticipantId, ParticipantMode, Round};
    use chrono::Utc;

    fn closed(number: u64) -> ClosedRound {
        let mut round = Round::open(
            number,
            (Competitor::new(0, "Emberfang"), Competitor::new(1, "Tidewhisker")),
            30,
            Utc::now(),
        );
        round.actual_outcome = Some(61.5);
        let result: RoundResult = RatingEngine::default().rate(number, 61.5, &[], |_| 1000.0);
        ClosedRound { round, result }
    }

    fn participant(n: u8) -> Participant {
        let mut p = Participant::new(ParticipantId::new([n; 16]), format!("p{}", n), 1012.5);
        p.current_mode = ParticipantMode::Playing;
        p.games_played = 3;
        p
    }

    fn exercise(store: &dyn RoundStore) {
        assert_eq!(store.last_round_number().unwrap(), 0);
        assert!(store.load_participants().unwrap().is_empty());
        assert!(store.load_round(1).unwrap().is_none());

        for n in [3, 1, 12] {
            store.save_round(&closed(n)).unwrap();
        }
        assert_eq!(store.last_round_number().unwrap(), 12);

        let loaded = store.load_round(3).unwrap().unwrap();
        assert_eq!(loaded.round.number, 3);
        assert_eq!(loaded.round.actual_outcome, Some(61.5));

        store.save_participants(&[participant(1), participant(2)]).unwrap();
        let people = store.load_participants().unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].rating, 1012.5);
        assert_eq!(people[1].current_mode, ParticipantMode::Playing);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("arena")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.save_round(&closed(41)).unwrap();
            store.save_participants(&[participant(7)]).unwrap();
        }

        let store = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(store.last_round_number().unwrap(), 41);
        assert_eq!(store.load_participants().unwrap()[0].games_played, 3);
    }

    #[test]
    fn test_json_file_store_ignores_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(ROUNDS_DIR).join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join(ROUNDS_DIR).join("9.json.tmp"), b"x").unwrap();
        assert_eq!(store.last_round_number().unwrap(), 0);
    }
}
