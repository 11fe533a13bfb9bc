use anyhow::Result;
use serde_json::{Value as JsonValue, json};

use crate::CLI_SCHEMA_VERSION;

pub(crate) fn envelope_ok(value: JsonValue) -> JsonValue {
    json!({
        "schema": CLI_SCHEMA_VERSION,
        "ok": true,
        "result": value
    })
}

pub(crate) fn envelope_error(message: &str) -> JsonValue {
    json!({
        "schema": CLI_SCHEMA_VERSION,
        "ok": false,
        "error": message
    })
}

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string(&envelope_ok(value))?);
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!("{}", serde_json::to_string(&envelope_error(message))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{envelope_error, envelope_ok};

    #[test]
    fn envelopes_carry_schema_and_status() {
        let ok = envelope_ok(json!({"stored": 3}));
        assert_eq!(ok["schema"], "mailsync.cli.v1");
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["result"]["stored"], 3);

        let err = envelope_error("account 9 not found");
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "account 9 not found");
        assert!(err.get("result").is_none());
    }
}
