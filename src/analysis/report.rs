use std::time::SystemTime;

/// Accumulated read activity for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReport {
    pub name: String,
    /// Largest value size observed.
    pub size: u64,
    pub get_hits: u64,
    /// Sum of all value sizes served.
    pub total_traffic: u64,
    /// Whether the key has been served with more than one size.
    pub variable_size: bool,
}

impl KeyReport {
    /// Report for the first hit on a key.
    pub fn first_hit(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            get_hits: 1,
            total_traffic: size,
            variable_size: false,
        }
    }

    /// Folds another hit into the report.
    pub fn record_hit(&mut self, size: u64) {
        if size != self.size {
            self.variable_size = true;
        }
        if size > self.size {
            self.size = size;
        }
        self.get_hits += 1;
        self.total_traffic = self.total_traffic.saturating_add(size);
    }
}

/// Point-in-time view of key activity across all shards, busiest first.
#[derive(Debug, Clone)]
pub struct Report {
    pub timestamp: SystemTime,
    pub keys: Vec<KeyReport>,
}

impl Report {
    /// Sorts `keys` by descending total traffic.
    pub fn new(timestamp: SystemTime, mut keys: Vec<KeyReport>) -> Self {
        keys.sort_unstable_by(|a, b| b.total_traffic.cmp(&a.total_traffic));
        Self { timestamp, keys }
    }

    /// The `n` busiest keys.
    pub fn top(&self, n: usize) -> &[KeyReport] {
        &self.keys[..n.min(self.keys.len())]
    }

    pub fn total_traffic(&self) -> u64 {
        self.keys.iter().map(|k| k.total_traffic).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
