use crate::error::RagError;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

const PAGE_BREAK: char = '\u{000c}';

#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Multimodal OCR service used when a PDF has no text layer.
#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

pub trait DocumentExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, RagError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl DocumentExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, RagError> {
        let document = Document::load(path)
            .map_err(|error| RagError::Extraction(format!("{}: {error}", path.display())))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            // A single undecodable page should not sink the whole document.
            let text = document.extract_text(&[page_no]).unwrap_or_default();
            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(RagError::Extraction(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Text sources, one page per form-feed separated section.
#[derive(Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, RagError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| RagError::Extraction(format!("{}: {error}", path.display())))?;

        let pages = split_pages(&raw);
        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(RagError::Extraction(format!(
                "document has no pages: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

fn split_pages(raw: &str) -> Vec<PageText> {
    raw.split(PAGE_BREAK)
        .enumerate()
        .map(|(index, text)| PageText {
            number: (index + 1) as u32,
            text: text.to_string(),
        })
        .collect()
}

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "txt", "text", "md"];

pub fn is_supported_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Extracts pages, choosing the extractor from the file extension. PDFs without a text
/// layer are retried through the OCR endpoint when one is configured.
pub fn extract_pages(path: &Path, ocr: Option<&OcrEndpointConfig>) -> Result<Vec<PageText>, RagError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => match LopdfExtractor.extract_pages(path) {
            Ok(pages) => Ok(pages),
            Err(RagError::Extraction(parse_error)) => match ocr {
                Some(cfg) => extract_with_llm_ocr(path, cfg).map_err(|ocr_error| {
                    RagError::Extraction(format!(
                        "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                    ))
                }),
                None => Err(RagError::Extraction(parse_error)),
            },
            Err(error) => Err(error),
        },
        "txt" | "text" | "md" => PlainTextExtractor.extract_pages(path),
        other => Err(RagError::Extraction(format!(
            "unsupported source type {other:?}: {}",
            path.display()
        ))),
    }
}

fn extract_with_llm_ocr(path: &Path, cfg: &OcrEndpointConfig) -> Result<Vec<PageText>, RagError> {
    let pdf = std::fs::read(path).map_err(|error| RagError::Extraction(error.to_string()))?;
    let payload = LlmOcrRequest {
        pdf_base64: STANDARD.encode(pdf),
        source_path: path.to_string_lossy().to_string(),
    };

    let mut request = Client::new()
        .post(&cfg.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &cfg.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request
        .send()
        .map_err(|error| RagError::Extraction(error.to_string()))?;

    if !response.status().is_success() {
        return Err(RagError::Extraction(format!(
            "multimodal OCR request to {} returned {}",
            cfg.endpoint,
            response.status()
        )));
    }

    let payload: LlmOcrResponse = response
        .json()
        .map_err(|error| RagError::Extraction(error.to_string()))?;
    payload_to_pages(&payload, path)
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, RagError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .enumerate()
            .filter_map(|(index, page)| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: page.page.unwrap_or((index + 1) as u32),
                        text: text.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = split_pages(raw_text)
            .into_iter()
            .filter(|page| !page.text.trim().is_empty())
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(RagError::Extraction(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn ocr_payload_with_pages_converts_only_nonempty_text() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))
            .expect("multimodal response should be parsed");

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 3);
        assert_eq!(pages[0].text, "Page 3");
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = LlmOcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))
            .expect("multimodal response should be parsed");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text.trim(), "Second");
    }

    #[test]
    fn text_sources_split_on_form_feed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("book.txt");
        fs::write(&path, "one\u{000C}two\u{000C}three")?;

        let pages = extract_pages(&path, None)?;
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].number, 3);
        assert_eq!(pages[2].text, "three");
        Ok(())
    }

    #[test]
    fn empty_text_source_is_an_extraction_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.txt");
        fs::write(&path, "  \n")?;

        assert!(matches!(extract_pages(&path, None), Err(RagError::Extraction(_))));
        Ok(())
    }

    #[test]
    fn corrupt_pdf_is_an_extraction_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(extract_pages(&path, None), Err(RagError::Extraction(_))));
        Ok(())
    }

    #[test]
    fn missing_and_unsupported_sources_fail() {
        assert!(matches!(
            extract_pages(Path::new("/nonexistent/book.txt"), None),
            Err(RagError::Extraction(_))
        ));
        assert!(matches!(
            extract_pages(Path::new("book.docx"), None),
            Err(RagError::Extraction(_))
        ));
    }
}
