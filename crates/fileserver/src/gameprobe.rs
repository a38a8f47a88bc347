//! Lazy inspection of a directory's contents to recognise a hosted game and
//! its registration key, for STATGAME/LSGAME/STATREG/LSREG. Both probes are
//! best-effort: any failure to read or parse a file simply means "no
//! information", never a wire error.

const MAX_SLOTS: u32 = 11;

const DEFAULT_RACE_NAMES: [&str; MAX_SLOTS as usize] = [
    "The Solar Federation",
    "The Lizard Alliance",
    "The Empire of the Birds",
    "The Fascist Empire",
    "The Privateer Bands",
    "The Cyborg",
    "The Crystal Confederation",
    "The Evil Empire",
    "The Robotic Imperium",
    "The Rebel Confederation",
    "The Missing Colonies",
];

const COMMON_GAME_FILES: &[&str] =
    &["beamspec.dat", "engspec.dat", "hullspec.dat", "pconfig.src", "planet.nm", "torpspec.dat", "truehull.dat"];

const REGISTRATION_FILE: &str = "fizz.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub file_name: String,
    pub is_registered: bool,
    pub label1: String,
    pub label2: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    /// `(slot number, race name)` for every slot with a present result file.
    pub slots: Vec<(u32, String)>,
    pub missing_files: Vec<String>,
    pub host_version: String,
}

/// One directory entry as seen by the probe: just enough to decide which
/// files are present without touching the backend more than once.
pub trait ProbeSource {
    fn read(&self, name: &str) -> Option<Vec<u8>>;
    fn exists(&self, name: &str) -> bool {
        self.read(name).is_some()
    }
}

/// Parses the registration key file. Returns `None` on anything short of a
/// clean, fully-formed record -- a missing file, a bad magic, or a length
/// byte that overruns the buffer are all treated the same way.
///
/// Wire layout (little-endian, all lengths in bytes):
/// `b"FIZZ" | registered: u8 | label1_len: u8 | label1 | label2_len: u8 | label2 | key_len: u8 | key`
pub fn probe_registration(source: &dyn ProbeSource) -> Option<KeyInfo> {
    let bytes = source.read(REGISTRATION_FILE)?;
    parse_fizz(&bytes)
}

fn parse_fizz(bytes: &[u8]) -> Option<KeyInfo> {
    let mut cursor = bytes.strip_prefix(b"FIZZ")?;

    let is_registered = *cursor.first()? != 0;
    cursor = &cursor[1..];

    let (label1, rest) = read_pascal_string(cursor)?;
    cursor = rest;
    let (label2, rest) = read_pascal_string(cursor)?;
    cursor = rest;
    let (key_id, _rest) = read_pascal_string(cursor)?;

    Some(KeyInfo { file_name: REGISTRATION_FILE.to_string(), is_registered, label1, label2, key_id })
}

fn read_pascal_string(bytes: &[u8]) -> Option<(String, &[u8])> {
    let len = *bytes.first()? as usize;
    let body = bytes.get(1..1 + len)?;
    let rest = &bytes[1 + len..];
    Some((String::from_utf8_lossy(body).into_owned(), rest))
}

/// Scans for a hosted game by looking for per-slot result files
/// (`playerN.rst`), then fills in race names and the set of missing
/// well-known support files.
pub fn probe_game(source: &dyn ProbeSource) -> Option<GameInfo> {
    let present_slots: Vec<u32> = (1..=MAX_SLOTS).filter(|slot| source.exists(&format!("player{slot}.rst"))).collect();
    if present_slots.is_empty() {
        return None;
    }

    let mut missing_files = Vec::new();
    for name in COMMON_GAME_FILES {
        if !source.exists(name) {
            missing_files.push((*name).to_string());
        }
    }
    for &slot in &present_slots {
        let name = format!("xyplan{slot}.dat");
        if !source.exists(&name) {
            missing_files.push(name);
        }
    }

    let race_names = match source.read("race.nm") {
        Some(bytes) => parse_race_names(&bytes),
        None => {
            missing_files.push("race.nm".to_string());
            DEFAULT_RACE_NAMES.iter().map(|s| s.to_string()).collect()
        }
    };

    let slots = present_slots
        .into_iter()
        .map(|slot| {
            let name = race_names.get((slot - 1) as usize).cloned().unwrap_or_else(|| format!("Player {slot}"));
            (slot, name)
        })
        .collect();

    let host_version = match source.read("gen.dat") {
        Some(bytes) => String::from_utf8_lossy(&bytes).lines().next().unwrap_or("unknown").trim().to_string(),
        None => {
            missing_files.push("gen.dat".to_string());
            "unknown".to_string()
        }
    };

    Some(GameInfo { slots, missing_files, host_version })
}

/// `race.nm` is a fixed-width name list, one name per line, padded with
/// trailing spaces -- the format VGA Planets race files use.
fn parse_race_names(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes).lines().map(|line| line.trim_end().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MapSource(BTreeMap<&'static str, Vec<u8>>);

    impl ProbeSource for MapSource {
        fn read(&self, name: &str) -> Option<Vec<u8>> {
            self.0.get(name).cloned()
        }
    }

    fn fizz(registered: bool, label1: &str, label2: &str, key_id: &str) -> Vec<u8> {
        let mut out = b"FIZZ".to_vec();
        out.push(registered as u8);
        for s in [label1, label2, key_id] {
            out.push(s.len() as u8);
            out.extend_from_slice(s.as_bytes());
        }
        out
    }

    #[test]
    fn missing_registration_file_yields_no_key_info() {
        let source = MapSource(BTreeMap::new());
        assert!(probe_registration(&source).is_none());
    }

    #[test]
    fn well_formed_registration_file_parses() {
        let mut files = BTreeMap::new();
        files.insert("fizz.bin", fizz(true, "Registered To", "Jane Doe", "ABC123"));
        let source = MapSource(files);
        let key = probe_registration(&source).unwrap();
        assert!(key.is_registered);
        assert_eq!(key.label1, "Registered To");
        assert_eq!(key.key_id, "ABC123");
    }

    #[test]
    fn truncated_registration_file_is_swallowed() {
        let mut files = BTreeMap::new();
        files.insert("fizz.bin", b"FIZZ\x01\x05hi".to_vec());
        let source = MapSource(files);
        assert!(probe_registration(&source).is_none());
    }

    #[test]
    fn no_result_files_means_no_game() {
        let source = MapSource(BTreeMap::new());
        assert!(probe_game(&source).is_none());
    }

    #[test]
    fn result_files_without_support_data_report_everything_missing() {
        let mut files = BTreeMap::new();
        files.insert("player1.rst", vec![]);
        files.insert("player3.rst", vec![]);
        let source = MapSource(files);
        let info = probe_game(&source).unwrap();
        assert_eq!(info.slots, vec![(1, "The Solar Federation".to_string()), (3, "The Empire of the Birds".to_string())]);
        assert!(info.missing_files.contains(&"pconfig.src".to_string()));
        assert!(info.missing_files.contains(&"xyplan1.dat".to_string()));
        assert!(info.missing_files.contains(&"race.nm".to_string()));
        assert_eq!(info.host_version, "unknown");
    }

    #[test]
    fn present_support_files_are_not_reported_missing() {
        let mut files = BTreeMap::new();
        files.insert("player1.rst", vec![]);
        files.insert("pconfig.src", b"gamename=Test".to_vec());
        files.insert("gen.dat", b"3.22.036\nrest ignored".to_vec());
        let source = MapSource(files);
        let info = probe_game(&source).unwrap();
        assert!(!info.missing_files.contains(&"pconfig.src".to_string()));
        assert_eq!(info.host_version, "3.22.036");
    }
}
