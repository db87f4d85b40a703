//! An atomic counter state machine: `INC`, `DEC`, `RESET`, `GET`.
//!
//! Commands are plain ASCII strings rather than a binary struct.

use raft::raft_types::LogIndex;
use raft::state_machine::StateMachine;

pub struct CounterStateMachine {
    value: i64,
}

impl Default for CounterStateMachine {
    fn default() -> Self {
        Self { value: 0 }
    }
}

impl CounterStateMachine {
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl StateMachine for CounterStateMachine {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let cmd = std::str::from_utf8(command)?;
        match cmd {
            "INC" => self.value += 1,
            "DEC" => self.value -= 1,
            "RESET" => self.value = 0,
            "GET" => {}
            other => anyhow::bail!("unknown counter command: {other}"),
        }
        Ok(self.value.to_string().into_bytes())
    }

    fn get_state(&self) -> Vec<u8> {
        self.value.to_le_bytes().to_vec()
    }

    fn restore_from_snapshot(&mut self, state: &[u8]) {
        if let Ok(bytes) = state.try_into() {
            self.value = i64::from_le_bytes(bytes);
        }
    }
}
