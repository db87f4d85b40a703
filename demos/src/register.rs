//! A single versioned value register: `WRITE <value>`, `READ`, `CAS <expected> <new>`.
//!
//! `CAS` returns `b"OK"` on success and `b"FAILED"` on a stale expected value
//! rather than surfacing the mismatch as an error.

use raft::raft_types::LogIndex;
use raft::state_machine::StateMachine;

#[derive(Default)]
pub struct RegisterStateMachine {
    value: String,
    version: u64,
}

impl RegisterStateMachine {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl StateMachine for RegisterStateMachine {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let cmd = std::str::from_utf8(command)?;
        if let Some(value) = cmd.strip_prefix("WRITE ") {
            self.value = value.to_string();
            self.version += 1;
            return Ok(b"OK".to_vec());
        }
        if cmd == "READ" {
            return Ok(self.value.clone().into_bytes());
        }
        if let Some(rest) = cmd.strip_prefix("CAS ") {
            let mut parts = rest.splitn(2, ' ');
            let (expected, new) = match (parts.next(), parts.next()) {
                (Some(expected), Some(new)) => (expected, new),
                _ => anyhow::bail!("CAS requires an expected and a new value"),
            };
            if self.value == expected {
                self.value = new.to_string();
                self.version += 1;
                return Ok(b"OK".to_vec());
            }
            return Ok(b"FAILED".to_vec());
        }
        anyhow::bail!("unknown register command: {cmd}")
    }

    fn get_state(&self) -> Vec<u8> {
        format!("{}:{}", self.version, self.value).into_bytes()
    }

    fn restore_from_snapshot(&mut self, state: &[u8]) {
        let s = String::from_utf8_lossy(state);
        if let Some((version, value)) = s.split_once(':') {
            if let Ok(version) = version.parse() {
                self.version = version;
                self.value = value.to_string();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_round_trips_and_bumps_the_version() {
        let mut sm = RegisterStateMachine::default();
        assert_eq!(sm.apply(1, b"WRITE hello").unwrap(), b"OK");
        assert_eq!(sm.apply(2, b"READ").unwrap(), b"hello");
        assert_eq!(sm.version(), 1);
    }

    #[test]
    fn cas_succeeds_only_against_the_current_value() {
        let mut sm = RegisterStateMachine::default();
        sm.apply(1, b"WRITE a").unwrap();
        assert_eq!(sm.apply(2, b"CAS wrong b").unwrap(), b"FAILED");
        assert_eq!(sm.value(), "a");
        assert_eq!(sm.apply(3, b"CAS a b").unwrap(), b"OK");
        assert_eq!(sm.value(), "b");
    }

    #[test]
    fn snapshot_round_trips_value_and_version() {
        let mut sm = RegisterStateMachine::default();
        sm.apply(1, b"WRITE x").unwrap();
        sm.apply(2, b"WRITE y").unwrap();
        let snapshot = sm.get_state();

        let mut restored = RegisterStateMachine::default();
        restored.restore_from_snapshot(&snapshot);
        assert_eq!(restored.value(), "y");
        assert_eq!(restored.version(), 2);
    }
}
