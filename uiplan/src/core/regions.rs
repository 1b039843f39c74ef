//! Named screen regions (`regions.v1`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Rect;

/// Region table keyed by region id. Rectangles are screen space, top-left origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Regions {
    pub schema_version: u32,
    pub regions: BTreeMap<String, Rect>,
}

impl Regions {
    pub fn get(&self, id: &str) -> Option<Rect> {
        self.regions.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.regions.contains_key(id)
    }
}

impl FromIterator<(String, Rect)> for Regions {
    fn from_iter<T: IntoIterator<Item = (String, Rect)>>(iter: T) -> Self {
        Self {
            schema_version: 1,
            regions: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_region_table() {
        let raw = r#"{"schema_version": 1, "regions": {"browser.search": {"x": 10, "y": 20, "w": 300, "h": 24}}}"#;
        let regions: Regions = serde_json::from_str(raw).expect("parse");
        assert_eq!(regions.get("browser.search"), Some(Rect::new(10, 20, 300, 24)));
        assert_eq!(regions.get("missing"), None);
    }
}
