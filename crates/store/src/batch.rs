/// A single write operation eligible for inclusion in an atomic batch.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Set { key: String, value: String },
    SetEx { key: String, value: String, ttl_seconds: u64 },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

/// A precondition checked (under `WATCH`) immediately before a batch is
/// queued. If any precondition fails, the whole batch is abandoned and
/// `StoreError::TransactionConflict` is returned (spec.md §4.1).
#[derive(Clone, Debug)]
pub enum Precondition {
    /// The key must not exist.
    Absent,
    /// The key's string value must equal exactly this.
    Equals(String),
}

/// A sequence of store writes applied as one all-or-nothing unit.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub(crate) preconditions: Vec<(String, Precondition)>,
    pub(crate) ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_absent(mut self, key: impl Into<String>) -> Self {
        self.preconditions.push((key.into(), Precondition::Absent));
        self
    }

    pub fn expect_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.preconditions
            .push((key.into(), Precondition::Equals(value.into())));
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn setex(mut self, key: impl Into<String>, value: impl Into<String>, ttl_seconds: u64) -> Self {
        self.ops.push(BatchOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl_seconds,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_ops_and_preconditions_in_order() {
        let batch = Batch::new()
            .expect_absent("lock:issue:42")
            .set("issue:status:42", "processing")
            .sadd("issues:processing", "42");

        assert_eq!(batch.preconditions.len(), 1);
        assert_eq!(batch.ops.len(), 2);
        assert!(!batch.is_empty());
    }
}
