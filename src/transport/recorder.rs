//! Records the raw traffic between the client and TWS.
//!
//! Recording is enabled by pointing `IBKR_HISTORY_RECORDING_DIR` at a directory.
//! Each client session gets its own sub directory named after the start minute,
//! and every message is written to a numbered file, e.g.
//!
//! ```text
//! /tmp/ibkr/2023-09-23-00-00-0/0001-request.msg
//! /tmp/ibkr/2023-09-23-00-00-0/0002-response.msg
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::messages::{RequestMessage, ResponseMessage};

pub(crate) const RECORDING_DIR_VAR: &str = "IBKR_HISTORY_RECORDING_DIR";

static RECORDING_SEQ: AtomicUsize = AtomicUsize::new(0);
static RECORDER_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Debug, Default)]
pub(crate) struct MessageRecorder {
    recording_dir: Option<PathBuf>,
}

impl MessageRecorder {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        match env::var(RECORDING_DIR_VAR) {
            Ok(dir) if !dir.is_empty() => match Self::create_session_dir(Path::new(&dir)) {
                Ok(recording_dir) => MessageRecorder {
                    recording_dir: Some(recording_dir),
                },
                Err(err) => {
                    warn!("message recording disabled, could not prepare {dir}: {err}");
                    Self::disabled()
                }
            },
            _ => Self::disabled(),
        }
    }

    fn create_session_dir(root: &Path) -> Result<PathBuf, crate::Error> {
        let format = format_description!("[year]-[month]-[day]-[hour]-[minute]");
        let started = OffsetDateTime::now_utc().format(&format)?;
        let instance_id = RECORDER_ID.fetch_add(1, Ordering::SeqCst);

        let recording_dir = root.join(format!("{started}-{instance_id}"));
        fs::create_dir_all(&recording_dir)?;

        Ok(recording_dir)
    }

    pub fn is_enabled(&self) -> bool {
        self.recording_dir.is_some()
    }

    pub fn record_request(&self, message: &RequestMessage) {
        self.record("request", &message.encode());
    }

    pub fn record_response(&self, message: &ResponseMessage) {
        self.record("response", &message.encode());
    }

    fn record(&self, direction: &str, encoded: &str) {
        let Some(dir) = &self.recording_dir else {
            return;
        };

        let record_id = RECORDING_SEQ.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("{record_id:04}-{direction}.msg"));

        if let Err(err) = fs::write(&path, encoded.replace('\0', "|")) {
            warn!("could not record {direction} to {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::messages::OutgoingMessages;

    fn recorded_files(recorder: &MessageRecorder) -> Vec<PathBuf> {
        let dir = recorder.recording_dir.as_ref().unwrap();
        let mut files = fs::read_dir(dir)
            .unwrap()
            .map(|res| res.map(|e| e.path()))
            .collect::<Result<Vec<_>, std::io::Error>>()
            .unwrap();
        files.sort();
        files
    }

    #[test]
    #[serial]
    fn test_recorder_disabled_with_empty_var() {
        temp_env::with_var(RECORDING_DIR_VAR, Some(""), || {
            let recorder = MessageRecorder::from_env();
            assert!(!recorder.is_enabled());

            // no-op, must not panic
            recorder.record_request(&RequestMessage::new());
        });
    }

    #[test]
    #[serial]
    fn test_recorder_disabled_without_var() {
        temp_env::with_var_unset(RECORDING_DIR_VAR, || {
            assert!(!MessageRecorder::from_env().is_enabled());
        });
    }

    #[test]
    #[serial]
    fn test_records_request_and_response() {
        let temp_dir = TempDir::new().unwrap();
        let temp_path = temp_dir.path().to_str().unwrap();

        temp_env::with_var(RECORDING_DIR_VAR, Some(temp_path), || {
            let recorder = MessageRecorder::from_env();
            assert!(recorder.is_enabled());
            assert!(recorder.recording_dir.as_ref().unwrap().starts_with(temp_path));

            let mut request = RequestMessage::new();
            request.push_field(&OutgoingMessages::CancelHistoricalData);
            request.push_field(&1);
            request.push_field(&9000);
            recorder.record_request(&request);

            let response = ResponseMessage::from_simple("88|9000|1695427200|");
            recorder.record_response(&response);

            let files = recorded_files(&recorder);
            assert_eq!(files.len(), 2);

            assert!(files[0].to_str().unwrap().ends_with("-request.msg"));
            assert_eq!(fs::read_to_string(&files[0]).unwrap(), "25|1|9000|");

            assert!(files[1].to_str().unwrap().ends_with("-response.msg"));
            assert_eq!(fs::read_to_string(&files[1]).unwrap(), "88|9000|1695427200|");
        });
    }
}
