use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use receiptgate_core::{format_db_timestamp, Receipt, ReceiptGateError};

/// Opaque keyset cursor over `(created_at, receipt_id)`. The encoded form is
/// what clients pass back; the decoded pair feeds the pagination predicate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cursor {
    /// DB-text timestamp of the last item on the previous page.
    pub created_at: String,
    pub receipt_id: String,
}

impl Cursor {
    /// Cursor positioned at a committed receipt.
    ///
    /// # Errors
    /// Returns [`ReceiptGateError::Internal`] if timestamp formatting fails.
    pub fn for_receipt(receipt: &Receipt) -> Result<Self, ReceiptGateError> {
        Ok(Self {
            created_at: format_db_timestamp(receipt.created_at)?,
            receipt_id: receipt.receipt_id.clone(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}|{}", self.created_at, self.receipt_id))
    }

    /// Decodes a client-supplied cursor.
    ///
    /// # Errors
    /// Returns [`ReceiptGateError::ValidationFailed`] when the cursor is not
    /// one this server produced.
    pub fn decode(raw: &str) -> Result<Self, ReceiptGateError> {
        let malformed =
            || ReceiptGateError::single_validation("cursor", "opaque", "malformed cursor");
        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| malformed())?;
        let text = String::from_utf8(bytes).map_err(|_| malformed())?;
        let (created_at, receipt_id) = text.split_once('|').ok_or_else(malformed)?;
        if created_at.is_empty() || receipt_id.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            created_at: created_at.to_string(),
            receipt_id: receipt_id.to_string(),
        })
    }
}

/// Turns a `limit + 1` query result into one page plus the cursor for the
/// next page, if any.
pub(crate) fn paginate(
    mut rows: Vec<Receipt>,
    limit: usize,
) -> Result<crate::Page, ReceiptGateError> {
    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        let last = rows
            .last()
            .ok_or_else(|| ReceiptGateError::Internal("empty page after truncate".to_string()))?;
        Some(Cursor::for_receipt(last)?.encode())
    } else {
        None
    };
    Ok(crate::Page {
        items: rows,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            created_at: "2026-03-01T09:30:00.000000Z".to_string(),
            receipt_id: "r-42".to_string(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_cursors_are_validation_errors() {
        for raw in ["%%%", "aGVsbG8", ""] {
            let err = Cursor::decode(raw).unwrap_err();
            assert_eq!(err.kind(), "validation_failed");
        }
    }
}
