//! Packing of logical transfers into bounded RPC batches.

/// A group of items sent in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    items: Vec<T>,
    total_bytes: u64,
}

impl<T> Batch<T> {
    fn new() -> Self {
        Batch {
            items: vec![],
            total_bytes: 0,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Greedily pack `items`, in order, into batches of at most `max_count`
/// items and `max_bytes` bytes as measured by `size_of`.
///
/// An item larger than `max_bytes` is never dropped; it is placed in a batch
/// of its own.
pub fn plan_batches<T>(
    items: impl IntoIterator<Item = T>,
    size_of: impl Fn(&T) -> u64,
    max_count: usize,
    max_bytes: u64,
) -> Vec<Batch<T>> {
    let max_count = max_count.max(1);
    let mut batches = vec![];
    let mut current = Batch::new();
    for item in items {
        let size = size_of(&item);
        let full = current.len() + 1 > max_count || current.total_bytes + size > max_bytes;
        if !current.is_empty() && full {
            batches.push(std::mem::replace(&mut current, Batch::new()));
        }
        current.total_bytes += size;
        current.items.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
