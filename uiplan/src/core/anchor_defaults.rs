//! Anchor-id prefix to default region table.
//!
//! When an anchor cannot be matched (no matcher, or no hit) and the action
//! gives no explicit fallback, the engine clicks the center of the region
//! mapped from the anchor's id prefix. The longest matching prefix wins; an
//! id matching no prefix has no default and the action fails.

use std::collections::BTreeMap;

pub fn builtin_defaults() -> BTreeMap<String, String> {
    [
        ("serum.", "plugin.window"),
        ("macos.open_dialog.", "os.file_dialog"),
        ("ableton.", "browser.search"),
    ]
    .into_iter()
    .map(|(prefix, region)| (prefix.to_string(), region.to_string()))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorDefaults {
    entries: Vec<(String, String)>,
}

impl AnchorDefaults {
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        let mut entries: Vec<(String, String)> = table
            .iter()
            .map(|(prefix, region)| (prefix.clone(), region.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    pub fn resolve(&self, anchor_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| anchor_id.starts_with(prefix.as_str()))
            .map(|(_, region)| region.as_str())
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, region)| region.as_str())
    }
}

impl Default for AnchorDefaults {
    fn default() -> Self {
        Self::new(&builtin_defaults())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_prefixes_resolve() {
        let defaults = AnchorDefaults::default();
        assert_eq!(defaults.resolve("serum.preset_menu"), Some("plugin.window"));
        assert_eq!(
            defaults.resolve("macos.open_dialog.open_button"),
            Some("os.file_dialog")
        );
        assert_eq!(
            defaults.resolve("ableton.device_header.plugin_window_button"),
            Some("browser.search")
        );
    }

    /// Unknown prefixes have no default; callers must fail rather than guess.
    #[test]
    fn unknown_prefix_has_no_default() {
        assert_eq!(AnchorDefaults::default().resolve("macos.dialog.cancel_button"), None);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = builtin_defaults();
        table.insert(
            "ableton.device_header.".to_string(),
            "device.chain.controls".to_string(),
        );
        let defaults = AnchorDefaults::new(&table);
        assert_eq!(
            defaults.resolve("ableton.device_header.plugin_window_button"),
            Some("device.chain.controls")
        );
        assert_eq!(defaults.resolve("ableton.browser.item"), Some("browser.search"));
    }
}
