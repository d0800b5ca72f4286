use std::collections::HashMap;

/// Maps raw values to names, keeping misses visible as `unknown:<raw>`.
#[derive(Debug, Clone)]
pub struct StaticMap {
    mapping: HashMap<String, String>,
}

impl StaticMap {
    pub fn new(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }

    pub fn decode(&self, input: &[u8]) -> String {
        let key = String::from_utf8_lossy(input);
        match self.mapping.get(key.as_ref()) {
            Some(value) => value.clone(),
            None => format!("unknown:{key}"),
        }
    }
}
