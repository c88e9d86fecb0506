use std::path::Path;

pub const DEFAULT_PREFIX: &str = "DSCF";
pub const DEFAULT_START_INDEX: u32 = 1;

/// `{prefix}{counter:04}.JPG`. Counters past 9999 widen the number instead
/// of truncating it.
pub fn next_name(prefix: &str, counter: u32) -> String {
    format!("{prefix}{counter:04}.JPG")
}

/// Hands out consecutive names. Only advanced by the caller on success.
#[derive(Debug, Clone)]
pub struct NameSequencer {
    prefix: String,
    /// `None` once the counter has run past `u32::MAX`.
    counter: Option<u32>,
}

impl NameSequencer {
    pub fn new(prefix: Option<&str>, start: Option<u32>) -> Self {
        Self {
            prefix: prefix
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_PREFIX)
                .to_string(),
            counter: Some(start.unwrap_or(DEFAULT_START_INDEX)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn current(&self) -> Option<u32> {
        self.counter
    }

    /// Name for the current counter, then advance it. Returns `None` when
    /// the counter is exhausted; a name is never handed out twice.
    pub fn take(&mut self) -> Option<String> {
        let n = self.counter?;
        self.counter = n.checked_add(1);
        Some(next_name(&self.prefix, n))
    }
}

impl Default for NameSequencer {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Smallest counter >= `start` such that the `count` consecutive names from
/// it are all absent from `dir`. Files past a gap are never reused.
pub fn first_free_index(dir: &Path, prefix: &str, start: u32, count: usize) -> u32 {
    let count = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    let mut index = start;
    'search: loop {
        for offset in 0..count {
            let Some(n) = index.checked_add(offset) else {
                return index;
            };
            if dir.join(next_name(prefix, n)).exists() {
                match n.checked_add(1) {
                    Some(next) => {
                        index = next;
                        continue 'search;
                    }
                    None => return index,
                }
            }
        }
        return index;
    }
}
