//! Response-side scanning.
//!
//! Model output gets the same scanners as the request, with different
//! stakes: injection indicators in a response are always advisory (logged,
//! never alter delivered bytes), while PII handling follows the
//! response-side mode. Blocking model output has a high false-positive cost,
//! so the default is log-only and operators must opt in to `block`.

use serde::Serialize;

use super::injection::{InjectionScan, InjectionScorer};
use super::pii::{PiiScan, PiiScanner};
use crate::config::PiiAction;

/// Combined verdict over one response's text.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseScan {
    pub injection: InjectionScan,
    pub pii: PiiScan,
    pub blocked: bool,
}

pub fn scan_response(
    scorer: &InjectionScorer,
    scanner: &PiiScanner,
    mode: PiiAction,
    content: &str,
) -> ResponseScan {
    let injection = scorer.scan(content);
    let pii = scanner.scan(content);
    let blocked = mode == PiiAction::Block && !pii.clean();

    ResponseScan {
        injection,
        pii,
        blocked,
    }
}
