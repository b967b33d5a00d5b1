use serde::Serialize;
use serde_json::Value;

/// Raw HTTP facts kept next to every normalized gateway response.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub status: u16,
    pub raw_body: Option<String>,
}

/// Uniform `{ data | error, debugInfo }` shape every gateway response is folded into.
///
/// Building an envelope never fails: a body that is not JSON degrades to an
/// error envelope that still carries the raw text.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEnvelope {
    pub data: Option<Value>,
    pub error: Option<String>,
    pub debug_info: DebugInfo,
}

impl GatewayEnvelope {
    pub fn from_body(status: u16, body: &str) -> Self {
        let success = (200..300).contains(&status);

        if body.trim().is_empty() {
            return Self {
                data: success.then(|| serde_json::json!({ "success": true })),
                error: (!success).then(|| format!("HTTP {status}")),
                debug_info: DebugInfo { status, raw_body: None },
            };
        }

        match serde_json::from_str::<Value>(body) {
            Ok(value) if success => Self {
                data: Some(value),
                error: None,
                debug_info: DebugInfo { status, raw_body: None },
            },
            Ok(value) => Self {
                error: Some(error_message(&value).unwrap_or_else(|| format!("HTTP {status}"))),
                data: None,
                debug_info: DebugInfo {
                    status,
                    raw_body: Some(body.to_string()),
                },
            },
            Err(_) => Self {
                data: None,
                error: Some("Invalid JSON".to_string()),
                debug_info: DebugInfo {
                    status,
                    raw_body: Some(body.to_string()),
                },
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.debug_info.status)
    }

    pub fn status(&self) -> u16 {
        self.debug_info.status
    }

    /// One-line description suitable for a user-facing error banner.
    pub fn summary(&self) -> String {
        match &self.error {
            Some(message) => format!("HTTP {}: {}", self.debug_info.status, message),
            None => format!("HTTP {}", self.debug_info.status),
        }
    }
}

// Evolution reports failures as `{ response: { message: [..] } }`, older builds as `message` or `error`.
fn error_message(value: &Value) -> Option<String> {
    let candidates = [
        value.pointer("/response/message"),
        value.get("message"),
        value.get("error"),
    ];
    candidates.into_iter().flatten().find_map(|candidate| match candidate {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(|item| item.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    })
}
