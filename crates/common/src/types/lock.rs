use serde::{Deserialize, Serialize};

use crate::ids::ProcessId;

/// The value written into a create-if-absent lock key: the holder's process
/// id plus a nonce, so the holder can later delete only its own lock
/// (spec.md §3 "Lock").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockValue {
    pub holder: ProcessId,
    pub nonce: u64,
}

impl LockValue {
    pub fn new(holder: ProcessId, nonce: u64) -> Self {
        Self { holder, nonce }
    }

    /// Encode as `holder⊕nonce` for storage as a plain string value.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.holder.as_str(), self.nonce)
    }

    /// Parse a previously-encoded value. Returns `None` if malformed.
    pub fn decode(raw: &str) -> Option<Self> {
        let (holder, nonce) = raw.rsplit_once(':')?;
        let nonce = nonce.parse().ok()?;
        Some(Self {
            holder: ProcessId::new(holder),
            nonce,
        })
    }
}

/// Priority classes for the in-process waiting queue on contended issue
/// locks (spec.md §5). Ordinal order matters: lower value sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum WaitPriority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl WaitPriority {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    /// Map a task's 0-100 urgency (spec.md §3 "Task") onto the four wait
    /// priority classes used when a checkout contends on an issue already
    /// held by another process (spec.md §5 "Shared-resource policy").
    pub fn from_task_priority(priority: u8) -> Self {
        match priority {
            75..=100 => Self::Urgent,
            50..=74 => Self::High,
            25..=49 => Self::Normal,
            _ => Self::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_value_roundtrips_through_encode_decode() {
        let value = LockValue::new(ProcessId::new("worker-1"), 42);
        let encoded = value.encode();
        let decoded = LockValue::decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn lock_value_decode_rejects_malformed_input() {
        assert!(LockValue::decode("no-colon-here").is_none());
        assert!(LockValue::decode("worker-1:not-a-number").is_none());
    }

    #[test]
    fn from_task_priority_buckets_correctly() {
        assert_eq!(WaitPriority::from_task_priority(100), WaitPriority::Urgent);
        assert_eq!(WaitPriority::from_task_priority(60), WaitPriority::High);
        assert_eq!(WaitPriority::from_task_priority(30), WaitPriority::Normal);
        assert_eq!(WaitPriority::from_task_priority(0), WaitPriority::Low);
    }

    #[test]
    fn wait_priority_orders_urgent_before_low() {
        let mut priorities = vec![
            WaitPriority::Low,
            WaitPriority::Urgent,
            WaitPriority::Normal,
            WaitPriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                WaitPriority::Urgent,
                WaitPriority::High,
                WaitPriority::Normal,
                WaitPriority::Low
            ]
        );
    }
}
