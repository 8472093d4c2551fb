use anyhow::{bail, Result};

pub const MAX_HEADERS: usize = 16;

/// Ordered RTSP header list. Lookup is case-insensitive, emission keeps
/// insertion order. Messages carry at most [`MAX_HEADERS`] entries; going
/// over is an error, never a silent drop.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.entries.len() >= MAX_HEADERS {
            bail!("too many headers");
        }
        self.entries.push((name.into(), value.into()));

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(x, _)| x.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
