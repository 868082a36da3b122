//! Coding Analysis
//!
//! Walks structured documents to full depth, collects embedded
//! controlled-vocabulary codings, and classifies each against the
//! terminology service. Physical quantities are excluded so a unit code is
//! never mistaken for a terminology code. `finalize_unresolved` makes
//! unresolved items visible on the emitted resource without leaving
//! half-applied edits behind.

use crate::error::EngineError;
use crate::pointer;
use crate::terminology::{CodingKey, TerminologyClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Fixed extension URL recording unresolved codings on emitted resources.
pub const UNRESOLVED_EXTENSION_URL: &str =
    "https://chartsmith.dev/fhir/StructureDefinition/unresolved-coding";

/// Keys the refine loop stages on a coding while proposing candidates;
/// stripped again before a resource is emitted.
const STAGED_PROPOSAL_KEYS: [&str; 2] = ["proposed", "potentials"];

/// Resolution status of one embedded coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingStatus {
    Ok,
    Recoding,
    Recoded,
    Unresolved,
}

/// Why a coding needs recoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingReason {
    NotFound,
    DisplayMismatch,
}

/// One coding found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCoding {
    pub pointer: String,
    pub system: String,
    pub code: String,
    pub display: Option<String>,
}

/// Per-pointer classification result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingReportItem {
    pub pointer: String,
    pub status: CodingStatus,
    pub reason: Option<CodingReason>,
    pub system: String,
    pub code: String,
    pub display: Option<String>,
    /// Canonical display reported by the terminology service, when known.
    pub canonical_display: Option<String>,
}

impl CodingReportItem {
    pub fn needs_work(&self) -> bool {
        matches!(self.status, CodingStatus::Recoding | CodingStatus::Unresolved)
    }
}

/// Collect every embedded coding in a document, excluding physical
/// quantities.
pub fn extract_codings(resource: &Value) -> Vec<ExtractedCoding> {
    let mut out = Vec::new();
    walk(resource, String::new(), &mut out);
    out
}

fn walk(value: &Value, ptr: String, out: &mut Vec<ExtractedCoding>) {
    match value {
        Value::Object(map) => {
            if let Some(coding) = as_coding(map) {
                if !is_quantity(&ptr, map) {
                    out.push(ExtractedCoding {
                        pointer: ptr.clone(),
                        system: coding.0,
                        code: coding.1,
                        display: coding.2,
                    });
                }
            }
            for (key, child) in map {
                walk(child, pointer::join(&ptr, key), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk(child, format!("{}/{}", ptr, index), out);
            }
        }
        _ => {}
    }
}

fn as_coding(map: &serde_json::Map<String, Value>) -> Option<(String, String, Option<String>)> {
    let system = map.get("system")?.as_str()?;
    let code = map.get("code")?.as_str()?;
    let display = map.get("display").and_then(Value::as_str).map(str::to_string);
    Some((system.to_string(), code.to_string(), display))
}

/// Physical-quantity heuristic: the containing segment names a quantity
/// (ends with "Quantity", or low/high in a range) and the object carries a
/// numeric value.
fn is_quantity(ptr: &str, map: &serde_json::Map<String, Value>) -> bool {
    let segment = ptr.rsplit('/').next().unwrap_or("");
    let quantity_name =
        segment.ends_with("Quantity") || segment == "low" || segment == "high";
    quantity_name && map.get("value").map_or(false, Value::is_number)
}

/// Classify every coding in one resource against the terminology service.
pub async fn analyze(
    resource: &Value,
    terminology: &dyn TerminologyClient,
) -> Result<Vec<CodingReportItem>, EngineError> {
    let mut reports = analyze_all(std::slice::from_ref(resource), terminology).await?;
    Ok(reports.pop().unwrap_or_default())
}

/// Classify a list of resource documents with one batched existence check.
pub async fn analyze_all(
    resources: &[Value],
    terminology: &dyn TerminologyClient,
) -> Result<Vec<Vec<CodingReportItem>>, EngineError> {
    let extracted: Vec<Vec<ExtractedCoding>> =
        resources.iter().map(extract_codings).collect();

    let mut unique: Vec<CodingKey> = Vec::new();
    let mut index: HashMap<CodingKey, usize> = HashMap::new();
    for coding in extracted.iter().flatten() {
        let key = CodingKey {
            system: coding.system.clone(),
            code: coding.code.clone(),
        };
        if !index.contains_key(&key) {
            index.insert(key.clone(), unique.len());
            unique.push(key);
        }
    }

    let results = terminology.lookup(&unique).await?;

    let mut reports = Vec::with_capacity(extracted.len());
    for codings in extracted {
        let mut report = Vec::with_capacity(codings.len());
        for coding in codings {
            let key = CodingKey {
                system: coding.system.clone(),
                code: coding.code.clone(),
            };
            let lookup = &results[index[&key]];
            let (status, reason, canonical) = if !lookup.exists {
                (CodingStatus::Recoding, Some(CodingReason::NotFound), None)
            } else if display_matches(coding.display.as_deref(), lookup.display.as_deref()) {
                (CodingStatus::Ok, None, lookup.display.clone())
            } else {
                (
                    CodingStatus::Recoding,
                    Some(CodingReason::DisplayMismatch),
                    lookup.display.clone(),
                )
            };
            report.push(CodingReportItem {
                pointer: coding.pointer,
                status,
                reason,
                system: coding.system,
                code: coding.code,
                display: coding.display,
                canonical_display: canonical,
            });
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Case- and whitespace-insensitive display comparison. A coding with no
/// display matches only when the service knows no canonical display either.
fn display_matches(observed: Option<&str>, canonical: Option<&str>) -> bool {
    match (observed, canonical) {
        (_, None) => true,
        (Some(observed), Some(canonical)) => normalize(observed) == normalize(canonical),
        (None, Some(_)) => false,
    }
}

fn normalize(display: &str) -> String {
    display
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Audit payload attached for one still-unresolved pointer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnresolvedAnnotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub potentials: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Mark still-unresolved pointers on a clone of the resource.
///
/// For each annotation: staged proposal fields are stripped from the
/// element and a fixed-URL extension records the proposal, candidate
/// displays and attempt summary. Returns the annotated clone.
pub fn finalize_unresolved(
    resource: &Value,
    annotations: &[(String, UnresolvedAnnotation)],
) -> Result<Value, EngineError> {
    let mut clone = resource.clone();
    for (ptr, annotation) in annotations {
        let element = match pointer::get(&clone, ptr) {
            Some(Value::Object(_)) => pointer::get(&clone, ptr).cloned(),
            _ => None,
        };
        let Some(Value::Object(mut map)) = element else {
            continue;
        };
        for staged in STAGED_PROPOSAL_KEYS {
            map.remove(staged);
        }
        let payload = serde_json::to_string(annotation)
            .map_err(|e| EngineError::Pointer(format!("annotation serialization: {}", e)))?;
        let extensions = map
            .entry("extension".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = extensions {
            items.push(serde_json::json!({
                "url": UNRESOLVED_EXTENSION_URL,
                "valueString": payload,
            }));
        }
        pointer::set(&mut clone, ptr, Value::Object(map))?;
    }
    Ok(clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminology::testing::MockTerminologyClient;
    use serde_json::json;

    fn observation() -> Value {
        json!({
            "resourceType": "Observation",
            "code": {
                "coding": [
                    {"system": "http://loinc.org", "code": "8867-4", "display": "Heart rate"}
                ]
            },
            "valueQuantity": {
                "value": 74,
                "system": "http://unitsofmeasure.org",
                "code": "/min"
            },
            "referenceRange": [{
                "low": {"value": 60, "system": "http://unitsofmeasure.org", "code": "/min"},
                "high": {"value": 100, "system": "http://unitsofmeasure.org", "code": "/min"}
            }],
            "interpretation": {"system": "http://snomed.info/sct", "code": "17621005"}
        })
    }

    #[test]
    fn extraction_collects_coding_arrays_and_bare_triples() {
        let codings = extract_codings(&observation());
        let pointers: Vec<&str> = codings.iter().map(|c| c.pointer.as_str()).collect();
        assert_eq!(pointers, vec!["/code/coding/0", "/interpretation"]);
    }

    #[test]
    fn quantities_are_excluded() {
        let codings = extract_codings(&observation());
        assert!(codings.iter().all(|c| !c.pointer.contains("Quantity")));
        assert!(codings.iter().all(|c| !c.pointer.contains("low")));
        assert!(codings.iter().all(|c| !c.pointer.contains("high")));
    }

    #[tokio::test]
    async fn classification_reports_not_found_and_display_mismatch() {
        let terminology = MockTerminologyClient::new()
            .with_code("http://loinc.org", "8867-4", "Heart rate");

        let report = analyze(&observation(), &terminology).await.unwrap();
        assert_eq!(report.len(), 2);

        let ok = &report[0];
        assert_eq!(ok.status, CodingStatus::Ok);

        let missing = &report[1];
        assert_eq!(missing.status, CodingStatus::Recoding);
        assert_eq!(missing.reason, Some(CodingReason::NotFound));
    }

    #[tokio::test]
    async fn display_comparison_ignores_case_and_whitespace() {
        let terminology = MockTerminologyClient::new()
            .with_code("http://loinc.org", "8867-4", "Heart  RATE")
            .with_code("http://snomed.info/sct", "17621005", "Normal");

        let report = analyze(&observation(), &terminology).await.unwrap();
        assert_eq!(report[0].status, CodingStatus::Ok);
        // No display on the document side but a canonical one exists.
        assert_eq!(report[1].reason, Some(CodingReason::DisplayMismatch));
    }

    #[test]
    fn finalize_attaches_extension_and_strips_staged_proposals() {
        let resource = json!({
            "interpretation": {
                "system": "http://snomed.info/sct",
                "code": "17621005",
                "proposed": {"code": "xyz"},
                "potentials": ["Normal", "Within range"]
            }
        });
        let annotation = UnresolvedAnnotation {
            proposed: Some(json!({"code": "xyz"})),
            potentials: vec!["Normal".to_string()],
            queries: Some(vec!["normal interpretation".to_string()]),
            attempts: Some("2 searches, 1 rejected update".to_string()),
            failure: Some("not_found".to_string()),
            note: None,
        };

        let finalized = finalize_unresolved(
            &resource,
            &[("/interpretation".to_string(), annotation)],
        )
        .unwrap();

        let element = finalized.get("interpretation").unwrap();
        assert!(element.get("proposed").is_none());
        assert!(element.get("potentials").is_none());
        let extension = element.get("extension").unwrap();
        assert_eq!(extension[0]["url"], UNRESOLVED_EXTENSION_URL);
        let payload: Value =
            serde_json::from_str(extension[0]["valueString"].as_str().unwrap()).unwrap();
        assert_eq!(payload["failure"], "not_found");

        // Source untouched.
        assert!(resource["interpretation"].get("proposed").is_some());
    }
}
