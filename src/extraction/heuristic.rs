use super::labels::{self, FieldKind, LabelHit};
use super::{pattern, ExtractionMethod, Fields, RawCapture, Strategy};

/// Tier 2: walk the text line by line, ignoring block structure.
pub struct LineHeuristic;

impl Strategy for LineHeuristic {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::LineHeuristic
    }

    fn extract(&self, capture: &RawCapture) -> Fields {
        let lines: Vec<&str> = capture.text().lines().map(str::trim).collect();
        let mut fields = Fields::default();

        for (idx, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }

            for hit in labels::scan_line(line) {
                if !(hit.anchored || hit.separated) {
                    continue;
                }

                let slot = fields.slot_mut(hit.kind);
                if slot.is_some() {
                    continue;
                }

                if let Some(value) = inline_value(&hit) {
                    *slot = Some(value);
                    continue;
                }

                if labels::is_label_only(line) == Some(hit.kind) {
                    *slot = next_value(&lines[idx + 1..], hit.kind);
                }
            }
        }

        fields
    }
}

fn inline_value(hit: &LabelHit) -> Option<String> {
    if hit.kind == FieldKind::Expiry {
        return if hit.separated {
            labels::clean_expiry(&hit.value)
        } else {
            pattern::find_expiry(&hit.value)
        };
    }

    let token = labels::clean_token(&hit.value)?;

    // Without a separator only accept something that looks generated, not prose
    if hit.separated || token.chars().any(|c| c.is_ascii_digit()) {
        Some(token)
    } else {
        None
    }
}

fn next_value(rest: &[&str], kind: FieldKind) -> Option<String> {
    let candidate = rest.iter().find(|line| !line.is_empty())?;
    if labels::looks_like_label(candidate) {
        return None;
    }
    labels::clean_value(kind, candidate)
}
