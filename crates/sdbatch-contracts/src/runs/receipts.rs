use std::path::Path;

use anyhow::Context;
use serde_json::{json, Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Request and response keys that carry base64 image data.
const IMAGE_KEYS: &[&str] = &["images", "init_images", "image", "input_image", "mask"];
const OMITTED: &str = "<omitted>";

/// Builds the JSON receipt for one dispatched query. Image payloads are
/// replaced by `<omitted>` so receipts stay small.
pub fn build_receipt(
    index: usize,
    endpoint: &str,
    request: &Value,
    response: &Map<String, Value>,
    warnings: &[String],
) -> Value {
    let mut request = request.clone();
    omit_images(&mut request);
    let mut response = Value::Object(response.clone());
    omit_images(&mut response);
    json!({
        "schema_version": RECEIPT_SCHEMA_VERSION,
        "index": index,
        "endpoint": endpoint,
        "request": request,
        "response": response,
        "warnings": warnings,
    })
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed to write receipt {}", path.display()))
}

fn omit_images(value: &mut Value) {
    match value {
        Value::Array(rows) => rows.iter_mut().for_each(omit_images),
        Value::Object(map) => {
            for (key, row) in map.iter_mut() {
                let is_image = IMAGE_KEYS
                    .iter()
                    .any(|candidate| key.eq_ignore_ascii_case(candidate));
                if is_image && !row.is_null() {
                    *row = Value::String(OMITTED.to_string());
                } else {
                    omit_images(row);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{build_receipt, write_receipt, RECEIPT_SCHEMA_VERSION};

    #[test]
    fn receipt_omits_image_payloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipts").join("query-0001.json");

        let request = json!({
            "prompt": "cat",
            "init_images": ["aGVsbG8="],
            "alwayson_scripts": {
                "controlnet": {"args": [{"image": "aGVsbG8=", "model": "canny"}]}
            }
        });
        let mut response = Map::new();
        response.insert("images".to_string(), json!(["aGVsbG8="]));
        response.insert("info".to_string(), json!({"seed": 42}));

        let payload = build_receipt(1, "txt2img", &request, &response, &["note".to_string()]);
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["prompt"], json!("cat"));
        assert_eq!(parsed["request"]["init_images"], json!("<omitted>"));
        assert_eq!(
            parsed["request"]["alwayson_scripts"]["controlnet"]["args"][0]["image"],
            json!("<omitted>")
        );
        assert_eq!(
            parsed["request"]["alwayson_scripts"]["controlnet"]["args"][0]["model"],
            json!("canny")
        );
        assert_eq!(parsed["response"]["images"], json!("<omitted>"));
        assert_eq!(parsed["response"]["info"]["seed"], json!(42));
        assert_eq!(parsed["warnings"], json!(["note"]));
        Ok(())
    }
}
