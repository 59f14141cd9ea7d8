//! Outbound header bag.
//!
//! Insertion-ordered, case-insensitive on names, one entry per name. A name
//! that receives several values keeps them in a single comma-joined entry.

#[derive(Clone, Debug, Default)]
pub(crate) struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Overwrites any previous value.
    pub(crate) fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((name.to_owned(), value)),
        }
    }

    /// Appends to an existing value with `", "`.
    pub(crate) fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => {
                let current = &mut self.entries[i].1;
                current.push_str(", ");
                current.push_str(&value);
            }
            None => self.entries.push((name.to_owned(), value)),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
