use crate::services::spreadsheet::ParseError;

pub struct TextExtractor;

impl TextExtractor {
    /// Extracts the selectable text of a PDF, truncated to `limit` characters.
    pub fn extract_from_pdf(bytes: &[u8], limit: usize) -> Result<String, ParseError> {
        let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
        if !Self::has_text(&text) {
            return Err(ParseError::NoText);
        }
        Ok(Self::truncate(&text, limit))
    }

    pub fn has_text(text: &str) -> bool {
        !text.trim().is_empty()
    }

    pub fn truncate(text: &str, limit: usize) -> String {
        text.trim().chars().take(limit).collect()
    }

    pub fn is_pdf(file_name: &str) -> bool {
        std::path::Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false)
    }
}
