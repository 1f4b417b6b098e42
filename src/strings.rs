//! String interning shared between the capture and the correlator.
//!
//! The correlator only ever stores handles. It reads a string behind a
//! handle in exactly one place (DXVK group ids) and interns exactly one
//! literal (the command buffer label).

use std::collections::HashMap;

use crate::types::StringHandle;

/// Read access to the intern table plus the intern-or-return-handle callback.
pub trait StringTable {
    /// Returns the string registered under `handle`, if any.
    fn resolve(&self, handle: StringHandle) -> Option<&str>;

    /// Returns the handle for `value`, registering it first if it is new.
    fn get_or_create(&mut self, value: &str) -> StringHandle;
}

/// In-memory intern table. Handles start at 1.
#[derive(Debug)]
pub struct InternedStrings {
    handle_to_string: HashMap<StringHandle, String>,
    string_to_handle: HashMap<String, StringHandle>,
    next_handle: StringHandle,
}

impl InternedStrings {
    pub fn new() -> Self {
        Self {
            handle_to_string: HashMap::new(),
            string_to_handle: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Register a string under a handle chosen by the producer.
    ///
    /// Handles created later by [`StringTable::get_or_create`] never collide
    /// with handles registered here.
    pub fn insert(&mut self, handle: StringHandle, value: String) {
        self.string_to_handle.entry(value.clone()).or_insert(handle);
        self.handle_to_string.insert(handle, value);
        self.next_handle = self.next_handle.max(handle.saturating_add(1));
    }

    pub fn len(&self) -> usize {
        self.handle_to_string.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle_to_string.is_empty()
    }

    /// All entries, sorted by handle.
    pub fn entries(&self) -> Vec<(StringHandle, &str)> {
        let mut entries: Vec<_> = self
            .handle_to_string
            .iter()
            .map(|(handle, value)| (*handle, value.as_str()))
            .collect();
        entries.sort_unstable_by_key(|(handle, _)| *handle);
        entries
    }
}

impl Default for InternedStrings {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable for InternedStrings {
    fn resolve(&self, handle: StringHandle) -> Option<&str> {
        self.handle_to_string.get(&handle).map(String::as_str)
    }

    fn get_or_create(&mut self, value: &str) -> StringHandle {
        if let Some(handle) = self.string_to_handle.get(value) {
            return *handle;
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.string_to_handle.insert(value.to_string(), handle);
        self.handle_to_string.insert(handle, value.to_string());
        handle
    }
}
