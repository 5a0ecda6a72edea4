use std::collections::BTreeMap;

/// How [`HttpHeaders::add`] treats a header that is already present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderOp {
    /// The header must not exist yet.
    New,
    /// Overwrite an existing value, otherwise add.
    ReplaceIfExists,
    /// Leave an existing value alone.
    KeepExisting,
}

/// Request headers, one value per case-insensitive name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: BTreeMap<String, (String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(key: &str, value: impl Into<String>) -> Self {
        let mut headers = Self::new();
        headers.add(key, value, HeaderOp::New);
        headers
    }

    /// Returns true if a header with this name already existed.
    pub fn add(&mut self, key: &str, value: impl Into<String>, op: HeaderOp) -> bool {
        let lookup = key.to_ascii_lowercase();
        match self.entries.get_mut(&lookup) {
            Some(existing) => {
                debug_assert!(op != HeaderOp::New, "header {key} added twice");
                if op == HeaderOp::ReplaceIfExists {
                    *existing = (key.to_string(), value.into());
                }
                true
            }
            None => {
                self.entries.insert(lookup, (key.to_string(), value.into()));
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Headers with their original spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_follow_existing_header() {
        let mut h = HttpHeaders::with("Accept", "image/x-j2c");
        assert!(h.add("accept", "*/*", HeaderOp::KeepExisting));
        assert_eq!(h.get("ACCEPT"), Some("image/x-j2c"));
        assert!(h.add("Accept", "*/*", HeaderOp::ReplaceIfExists));
        assert_eq!(h.get("accept"), Some("*/*"));
        assert!(!h.add("Range", "bytes=0-599", HeaderOp::KeepExisting));
        let names: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Accept", "Range"]);
    }
}
