use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Hybrid logical clock reading used for `first_seen`, `last_seen` and checkpoint times.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hlc(pub i64);

// Upper bits hold wall-clock micros, the low 12 bits a tie-break counter.
const HLC_COUNTER_BITS: u32 = 12;
const HLC_COUNTER_MASK: u64 = (1u64 << HLC_COUNTER_BITS) - 1;

static LAST_ISSUED: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

impl Hlc {
    /// Strictly increasing within the process, even when the wall clock steps back.
    pub fn now() -> Self {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut guard = LAST_ISSUED.lock().unwrap_or_else(PoisonError::into_inner);
        let last = *guard;
        let last_physical = last >> HLC_COUNTER_BITS;
        let last_counter = last & HLC_COUNTER_MASK;
        let (next_physical, next_counter) = if physical > last_physical {
            (physical, 0)
        } else if last_counter < HLC_COUNTER_MASK {
            (last_physical, last_counter + 1)
        } else {
            (last_physical + 1, 0)
        };
        let next = (next_physical << HLC_COUNTER_BITS) | next_counter;
        *guard = next;
        Hlc(next as i64)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Self {
        Hlc(value)
    }

    pub fn physical_micros(self) -> i64 {
        self.0 >> HLC_COUNTER_BITS
    }
}
