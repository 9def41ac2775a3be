//! Decoding of platform result documents.
//!
//! The platform reports failures two ways at once: an HRESULT and a JSON
//! result document `{Error, ErrorMessage, ErrorEvents[]}`. Both are decoded
//! here into the shared taxonomy. When the two disagree the HRESULT wins and
//! the discrepancy is logged.

use hcslite_shared::errors::{HcsliteError, OpContext};
use serde::Deserialize;

// Well-known result codes of the compute service.
pub const HCS_E_OPERATION_PENDING: u32 = 0xC037_0103;
pub const HCS_E_INVALID_STATE: u32 = 0xC037_0105;
pub const HCS_E_UNKNOWN_MESSAGE: u32 = 0xC037_010B;
pub const HCS_E_INVALID_JSON: u32 = 0xC037_010D;
pub const HCS_E_SYSTEM_NOT_FOUND: u32 = 0xC037_010E;
pub const HCS_E_SYSTEM_ALREADY_STOPPED: u32 = 0xC037_0110;
pub const HCS_E_UNEXPECTED_EXIT: u32 = 0x4001_0004;
pub const ERROR_ELEMENT_NOT_FOUND: u32 = 0x8007_0490;
pub const ERROR_PROC_NOT_FOUND: u32 = 0x8007_007F;
pub const ERROR_INVALID_DATA: u32 = 0x8007_000D;
pub const ERROR_NOT_SUPPORTED: u32 = 0x8007_0032;
pub const E_ACCESS_DENIED: u32 = 0x8007_0005;

/// The platform's JSON result document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResultError {
    pub error: i32,
    pub error_message: String,
    pub error_events: Vec<ErrorEvent>,
}

/// One event from a result document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorEvent {
    pub message: String,
    pub stack_trace: String,
    pub provider: String,
    #[serde(rename = "EventID")]
    pub event_id: u16,
    pub flags: u32,
}

impl ErrorEvent {
    fn summary(&self) -> String {
        if self.provider.is_empty() {
            self.message.clone()
        } else {
            format!("{} [{}]", self.message, self.provider)
        }
    }
}

/// Map a well-known result code into the taxonomy. `None` means success or
/// an unclassified code.
pub fn classify_hresult(hr: i32) -> Option<HcsliteError> {
    match hr as u32 {
        HCS_E_SYSTEM_NOT_FOUND | ERROR_ELEMENT_NOT_FOUND | ERROR_PROC_NOT_FOUND => Some(
            HcsliteError::NotFound(format!("platform result {:#010x}", hr as u32)),
        ),
        HCS_E_SYSTEM_ALREADY_STOPPED => Some(HcsliteError::AlreadyStopped),
        HCS_E_OPERATION_PENDING => Some(HcsliteError::Pending),
        HCS_E_INVALID_STATE => Some(HcsliteError::InvalidState(
            "the operation is not valid in the current state".into(),
        )),
        HCS_E_UNKNOWN_MESSAGE => Some(HcsliteError::Unsupported("unknown message".into())),
        HCS_E_INVALID_JSON => Some(HcsliteError::Unsupported("invalid json".into())),
        ERROR_INVALID_DATA => Some(HcsliteError::Unsupported("invalid data".into())),
        ERROR_NOT_SUPPORTED => Some(HcsliteError::Unsupported("not supported".into())),
        E_ACCESS_DENIED => Some(HcsliteError::AccessDenied),
        HCS_E_UNEXPECTED_EXIT => Some(HcsliteError::UnexpectedExit),
        _ if hr < 0 => Some(HcsliteError::Internal(format!(
            "platform error {:#010x}",
            hr as u32
        ))),
        _ => None,
    }
}

/// Decode an (HRESULT, optional result document) pair into the taxonomy.
///
/// Rules: a failing HRESULT converts directly; a result document refines the
/// message and contributes its events; when both carry a code and they
/// disagree, the HRESULT is authoritative and the disagreement is logged.
pub fn decode(hr: i32, result_json: Option<&str>) -> Option<HcsliteError> {
    let from_hr = classify_hresult(hr);

    let parsed = match result_json {
        Some(raw) if !raw.trim().is_empty() => match serde_json::from_str::<ResultError>(raw) {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::warn!(%err, raw, "unparseable platform result document");
                None
            }
        },
        _ => None,
    };

    let events: Vec<String> = parsed
        .as_ref()
        .map(|doc| doc.error_events.iter().map(ErrorEvent::summary).collect())
        .unwrap_or_default();

    let base = match (from_hr, parsed) {
        (Some(err), Some(doc)) => {
            if doc.error != 0 && doc.error != hr {
                tracing::warn!(
                    hresult = format_args!("{:#010x}", hr as u32),
                    document_error = format_args!("{:#010x}", doc.error as u32),
                    message = %doc.error_message,
                    "result document disagrees with the hresult; preferring the hresult"
                );
            }
            Some(err)
        }
        (Some(err), None) => Some(err),
        (None, Some(doc)) if doc.error != 0 => Some(classify_hresult(doc.error).unwrap_or(
            HcsliteError::Internal(format!(
                "platform error {:#010x}: {}",
                doc.error as u32, doc.error_message
            )),
        )),
        (None, _) => None,
    };

    match base {
        Some(err) if !events.is_empty() => {
            Some(err.in_op(OpContext::new("platform result").events(events)))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_decodes_to_none() {
        assert_eq!(decode(0, None), None);
        assert_eq!(decode(0, Some("")), None);
    }

    #[test]
    fn well_known_codes_classify() {
        assert!(matches!(
            classify_hresult(HCS_E_SYSTEM_NOT_FOUND as i32),
            Some(HcsliteError::NotFound(_))
        ));
        assert_eq!(
            classify_hresult(HCS_E_SYSTEM_ALREADY_STOPPED as i32),
            Some(HcsliteError::AlreadyStopped)
        );
        assert_eq!(
            classify_hresult(HCS_E_OPERATION_PENDING as i32),
            Some(HcsliteError::Pending)
        );
        assert_eq!(
            classify_hresult(HCS_E_UNEXPECTED_EXIT as i32),
            Some(HcsliteError::UnexpectedExit)
        );
        assert_eq!(classify_hresult(0), None);
    }

    #[test]
    fn unclassified_negative_hresults_stay_errors() {
        let err = classify_hresult(0x8000_4005u32 as i32).unwrap();
        assert!(err.to_string().contains("0x80004005"));
    }

    #[test]
    fn result_document_refines_a_bare_payload() {
        let raw = format!(
            r#"{{"Error": {}, "ErrorMessage": "no such system"}}"#,
            HCS_E_SYSTEM_NOT_FOUND as i32
        );
        let err = decode(0, Some(&raw)).unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn hresult_wins_on_disagreement() {
        let raw = format!(
            r#"{{"Error": {}, "ErrorMessage": "stale message"}}"#,
            HCS_E_SYSTEM_NOT_FOUND as i32
        );
        let err = decode(HCS_E_SYSTEM_ALREADY_STOPPED as i32, Some(&raw)).unwrap();
        assert!(err.is_already_stopped());
        assert!(!err.is_not_found());
    }

    #[test]
    fn events_survive_decoding() {
        let raw = format!(
            concat!(
                r#"{{"Error": {}, "ErrorMessage": "denied", "ErrorEvents": ["#,
                r#"{{"Message": "the caller lacks a privilege", "Provider": "vmcompute"}}"#,
                r#"]}}"#
            ),
            E_ACCESS_DENIED as i32
        );
        let err = decode(E_ACCESS_DENIED as i32, Some(&raw)).unwrap();
        assert!(err.is_access_denied());
        assert!(err.to_string().contains("the caller lacks a privilege"));
    }

    #[test]
    fn garbage_documents_fall_back_to_the_hresult() {
        let err = decode(E_ACCESS_DENIED as i32, Some("not json")).unwrap();
        assert!(err.is_access_denied());
    }
}
