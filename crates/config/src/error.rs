use figment::providers::{Format, Toml};
use std::collections::BTreeSet;

/// The config could not be extracted.
///
/// Displays every distinct problem on its own line, naming the setting and whether it came
/// from the config file.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("failed to extract forksim config:\n{}", render(.0))]
pub struct ExtractConfigError(#[source] figment::Error);

impl ExtractConfigError {
    pub fn new(error: figment::Error) -> Self {
        Self(error)
    }

    pub fn inner(&self) -> &figment::Error {
        &self.0
    }
}

fn render(error: &figment::Error) -> String {
    let mut seen = BTreeSet::new();
    let mut lines = Vec::new();
    for err in error.clone() {
        let in_file = err.metadata.as_ref().is_some_and(|meta| meta.name.contains(Toml::NAME));
        let mut line = if in_file { format!("forksim.toml: {err}") } else { err.to_string() };
        if !err.path.is_empty() {
            line += &format!(" (setting `{}`)", err.path.join("."));
        }
        if seen.insert(line.clone()) {
            lines.push(line);
        }
    }
    lines.join("\n")
}
