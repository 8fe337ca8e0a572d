use serde::{Deserialize, Serialize};

/// Per compute unit memory system counters.
///
/// Index `i` of each vector belongs to the compute unit registered with id `i`.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySystem {
    pub retries: Vec<u64>,
    pub max_outstanding: Vec<u64>,
}

fn write_counters(f: &mut std::fmt::Formatter<'_>, counters: &[u64]) -> std::fmt::Result {
    write!(f, "[")?;
    for count in counters {
        write!(f, "{count} ")?;
    }
    writeln!(f, "]")
}

impl std::fmt::Display for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Memory System:")?;
        // spelling is relied upon by tools parsing the report
        write!(f, "Retires: ")?;
        write_counters(f, &self.retries)?;
        write!(f, "Max outstanding: ")?;
        write_counters(f, &self.max_outstanding)
    }
}
