//! Path helpers for call recordings
//!
//! Recordings are stored in: <data_dir>/recordings/<timestamp>_<session-id>.wav

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Recordings directory under the application data directory
pub fn recordings_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("recordings")
}

/// Generate the WAV path for a session, creating the directory if needed
///
/// Format: `<YYYYMMDD_HHMMSS>_<uuid>.wav`
pub fn generate_recording_path(
    dir: &Path,
    session_id: Uuid,
    started_at: DateTime<Utc>,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let filename = format!("{}_{}.wav", started_at.format("%Y%m%d_%H%M%S"), session_id);
    Ok(dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn recording_path_has_timestamp_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let rec_dir = recordings_dir(dir.path());
        let id = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();

        let path = generate_recording_path(&rec_dir, id, at).unwrap();

        assert!(rec_dir.is_dir());
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("20250314_092653_{}.wav", id)
        );
    }
}
