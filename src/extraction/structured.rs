use super::labels::{self, FieldKind};
use super::{ExtractionMethod, Fields, RawCapture, Strategy};

/// Tier 1: a blank-line-delimited block carrying both the user and the password label.
pub struct StructuredScan;

impl Strategy for StructuredScan {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Structured
    }

    fn extract(&self, capture: &RawCapture) -> Fields {
        for block in blocks(capture.text()) {
            if !qualifies(&block) {
                continue;
            }

            let fields = parse_block(&block);
            if fields.has_credentials() {
                return fields;
            }
        }

        Fields::default()
    }
}

fn blocks(text: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

fn qualifies(block: &[&str]) -> bool {
    let mut has_user = false;
    let mut has_pass = false;

    for line in block {
        for hit in labels::scan_line(line) {
            if !(hit.anchored || hit.separated) {
                continue;
            }
            match hit.kind {
                FieldKind::Username => has_user = true,
                FieldKind::Password => has_pass = true,
                FieldKind::Expiry => {}
            }
        }
    }

    has_user && has_pass
}

fn parse_block(block: &[&str]) -> Fields {
    let mut fields = Fields::default();

    for (idx, line) in block.iter().enumerate() {
        for hit in labels::scan_line(line) {
            if !(hit.anchored || hit.separated) {
                continue;
            }

            let slot = fields.slot_mut(hit.kind);
            if slot.is_some() {
                continue;
            }

            // Same line, after the separator
            if hit.separated {
                if let Some(value) = labels::clean_value(hit.kind, &hit.value) {
                    *slot = Some(value);
                    continue;
                }
            }

            // Value on its own line: next token, unless that line is another label
            if labels::is_label_only(line) == Some(hit.kind) {
                if let Some(next) = block.get(idx + 1) {
                    if !labels::looks_like_label(next) {
                        *slot = labels::clean_value(hit.kind, next);
                    }
                }
            }
        }
    }

    fields
}
