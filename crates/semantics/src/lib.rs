//! The semantics descriptor attached to every batch.
//!
//! Four orthogonal axes describe how a batch of operations must behave.
//! Servers honour only the axes relevant to the component handling an
//! operation: the db engine sizes transactions from the atomicity axis, and
//! storage safety promotes object writes into write-plus-sync.

/// How many operations share one failure domain.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Atomicity {
    #[default]
    None,
    Operation,
    Batch,
}

/// What must have happened before an operation is acknowledged.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum Safety {
    #[default]
    None,
    /// The backend has accepted the operation into its in-memory state.
    Network,
    /// The backend has durably persisted the operation (fsync-equivalent).
    Storage,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Consistency {
    #[default]
    Immediate,
    Eventual,
    Session,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Concurrency {
    None,
    #[default]
    Overlapping,
    NonOverlapping,
}

/// Immutable once attached to a batch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Semantics {
    atomicity: Atomicity,
    safety: Safety,
    consistency: Consistency,
    concurrency: Concurrency,
}

impl Semantics {
    pub fn new(
        atomicity: Atomicity,
        safety: Safety,
        consistency: Consistency,
        concurrency: Concurrency,
    ) -> Self {
        Self {
            atomicity,
            safety,
            consistency,
            concurrency,
        }
    }

    /// POSIX-like template: per-operation atomicity and network safety.
    pub fn posix_like() -> Self {
        Self::default()
            .with_atomicity(Atomicity::Operation)
            .with_safety(Safety::Network)
    }

    pub fn with_atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    pub fn with_safety(mut self, safety: Safety) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    pub fn safety(&self) -> Safety {
        self.safety
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Whether an acknowledgement must be produced at all. Callers at
    /// `Safety::None` may receive no reply.
    pub fn wants_reply(&self) -> bool {
        self.safety >= Safety::Network
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn templates() {
        let s = Semantics::default();
        assert_eq!(s.atomicity(), Atomicity::None);
        assert_eq!(s.safety(), Safety::None);
        assert!(!s.wants_reply());

        let s = Semantics::posix_like();
        assert_eq!(s.atomicity(), Atomicity::Operation);
        assert_eq!(s.safety(), Safety::Network);
        assert!(s.wants_reply());
    }

    #[test]
    fn safety_ordering() {
        assert!(Safety::Storage > Safety::Network);
        assert!(Safety::Network > Safety::None);
    }
}
