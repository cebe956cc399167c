//! JSON module methods
//!
//! Parsing and serialization go through `serde_json`; the interpreter
//! converts between `serde_json::Value` and runtime values, since only
//! it can touch the heap.

/// JSON module: parse and stringify backed by serde_json
pub struct JsonLib;

impl JsonLib {
    /// JSON.parse(text) - Err carries the parser's message
    pub fn parse(text: &str) -> Result<serde_json::Value, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    /// JSON.stringify(value)
    pub fn stringify(value: &serde_json::Value) -> String {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        let value = JsonLib::parse(r#"{"a": 1, "b": [true, null]}"#).expect("parses");
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"][0], true);
    }

    #[test]
    fn test_parse_error() {
        assert!(JsonLib::parse("{not json").is_err());
    }

    #[test]
    fn test_stringify_round_trip() {
        let value = JsonLib::parse(r#"[1,"two",3.5]"#).expect("parses");
        assert_eq!(JsonLib::stringify(&value), r#"[1,"two",3.5]"#);
    }
}
