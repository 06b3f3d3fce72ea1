// Handle tables
//
// Opaque integer references to values that only live until the next stop.

use std::collections::HashMap;

pub const START_HANDLE: i64 = 1000;

#[derive(Debug)]
pub struct Handles<T> {
    next: i64,
    values: HashMap<i64, T>,
}

impl<T> Default for Handles<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handles<T> {
    pub fn new() -> Self {
        Self {
            next: START_HANDLE,
            values: HashMap::new(),
        }
    }

    pub fn create(&mut self, value: T) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.values.insert(handle, value);
        handle
    }

    pub fn try_get(&self, handle: i64) -> Option<&T> {
        self.values.get(&handle)
    }

    /// Stored value, or `default` when the handle is unknown or stale
    pub fn get_or<'a>(&'a self, handle: i64, default: &'a T) -> &'a T {
        self.values.get(&handle).unwrap_or(default)
    }

    pub fn reset(&mut self) {
        self.next = START_HANDLE;
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handles_start_at_base() {
        let mut handles = Handles::new();
        assert_eq!(handles.create("a"), 1000);
        assert_eq!(handles.create("b"), 1001);
        assert_eq!(handles.try_get(1001), Some(&"b"));
    }

    #[test]
    fn test_reset_invalidates_old_handles() {
        let mut handles = Handles::new();
        let old = handles.create(String::from("frame"));
        handles.create(String::from("other"));
        handles.reset();

        let fallback = String::from("none");
        assert_eq!(handles.get_or(old + 1, &fallback), "none");
        assert!(handles.is_empty());

        // Allocation restarts, so the same number now means something new
        assert_eq!(handles.create(String::from("new")), old);
        assert_eq!(handles.get_or(old, &fallback), "new");
    }
}
