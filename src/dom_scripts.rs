//! Page-side helper scripts.
//!
//! The scripts live in `scripts/*.js` so editors can highlight them, and are
//! bundled as strings at compile time. Each one is a function expression that
//! the runtime invokes with a single JSON-encoded argument.

/// Selector probe: resolves CSS, `xpath=` and `text=` selectors to the first
/// visible, enabled element and tags it with `data-renewal-handle`.
pub const PROBE_SCRIPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/probe.js"));

/// Visible text of the page or of a tagged element.
pub const VISIBLE_TEXT_SCRIPT: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/visible_text.js"));

/// Attribute the probe writes onto matched elements.
pub const HANDLE_ATTRIBUTE: &str = "data-renewal-handle";

/// Build an invocation of `script` with `argument` serialised as JSON.
pub fn invoke(script: &str, argument: Option<&str>) -> String {
    let encoded = match argument {
        Some(value) => serde_json::Value::String(value.to_string()).to_string(),
        None => "null".to_string(),
    };
    format!("{}({})", script.trim().trim_end_matches(';'), encoded)
}

/// CSS selector addressing an element previously tagged by the probe.
pub fn handle_selector(token: &str) -> String {
    format!("[{HANDLE_ATTRIBUTE}=\"{token}\"]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_scripts_are_function_expressions() {
        for script in [PROBE_SCRIPT, VISIBLE_TEXT_SCRIPT] {
            assert!(script.contains("(function ("));
        }
        assert!(PROBE_SCRIPT.contains(HANDLE_ATTRIBUTE));
    }

    #[test]
    fn invoke_json_encodes_the_argument() {
        let call = invoke("(function (s) { return s; })", Some("text=/Pay \"now\"/i"));
        assert_eq!(call, r#"(function (s) { return s; })("text=/Pay \"now\"/i")"#);

        let call = invoke("(function (s) { return s; })", None);
        assert!(call.ends_with("(null)"));
    }

    #[test]
    fn handle_selector_targets_the_probe_attribute() {
        assert_eq!(handle_selector("h3"), "[data-renewal-handle=\"h3\"]");
    }
}
