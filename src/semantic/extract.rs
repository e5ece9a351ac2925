//! Best-effort text extraction from attachments and web pages.
//!
//! Nothing in here fails: unsupported or corrupt input yields an empty string
//! and a warning, and the bookmark is indexed from whatever text remains.

use std::error::Error;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const USER_AGENT_DEFAULT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";

/// Page bodies larger than this are not read
const MAX_PAGE_BYTES: u64 = 5 * 1024 * 1024;

const DOCX_DOCUMENT: &str = "word/document.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    PlainText,
    Unsupported,
}

impl FileKind {
    /// Detect by extension, falling back to sniffing the content.
    pub fn detect(file_name: &str, bytes: &[u8]) -> Self {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("pdf") => return FileKind::Pdf,
            Some("docx" | "doc") => return FileKind::Docx,
            Some("txt" | "md" | "markdown" | "rst" | "csv" | "json" | "log" | "html" | "htm") => {
                return FileKind::PlainText
            }
            _ => {}
        }

        match infer::get(bytes).map(|kind| kind.mime_type()) {
            Some("application/pdf") => FileKind::Pdf,
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document") => {
                FileKind::Docx
            }
            Some(_) => FileKind::Unsupported,
            None if std::str::from_utf8(bytes).is_ok() => FileKind::PlainText,
            None => FileKind::Unsupported,
        }
    }
}

/// Extract the text of a file.
pub fn extract_text(kind: FileKind, bytes: &[u8]) -> String {
    let result = match kind {
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Docx => extract_docx(bytes),
        FileKind::PlainText => Ok(String::from_utf8_lossy(bytes).into_owned()),
        FileKind::Unsupported => {
            log::debug!("unsupported attachment type, no text extracted");
            return String::new();
        }
    };

    match result {
        Ok(text) => text,
        Err(err) => {
            log::warn!("failed to extract {kind:?} text: {err}");
            String::new()
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> anyhow::Result<String> {
    // pdf-extract panics on some malformed documents
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| anyhow::anyhow!("pdf parser panicked"))?;

    extracted.map_err(|err| anyhow::anyhow!("{err:?}"))
}

fn extract_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut xml = String::new();
    archive.by_name(DOCX_DOCUMENT)?.read_to_string(&mut xml)?;

    Ok(docx_xml_to_text(&xml))
}

/// Strip WordprocessingML down to its text, one line per non-empty paragraph.
fn docx_xml_to_text(xml: &str) -> String {
    static PARAGRAPH_END: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"</w:p>|<w:br\s*/>|<w:cr\s*/>").expect("valid regex"));
    static TAB: Lazy<Regex> = Lazy::new(|| Regex::new(r"<w:tab\s*/>").expect("valid regex"));
    static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

    let text = PARAGRAPH_END.replace_all(xml, "\n");
    let text = TAB.replace_all(&text, "\t");
    let text = TAG.replace_all(&text, "");

    decode_entities(&text)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    static ENTITY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|amp|lt|gt|quot|apos);").expect("valid regex"));

    ENTITY
        .replace_all(text, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .unwrap_or_else(|| entity[1..].parse())
                    .ok()
                    .and_then(char::from_u32),
            };
            decoded.map(String::from).unwrap_or_default()
        })
        .into_owned()
}

/// Visible text of an HTML document, one line per text node.
pub fn extract_html_text(html: &str) -> String {
    static BODY: Lazy<scraper::Selector> =
        Lazy::new(|| scraper::Selector::parse("body").expect("valid selector"));

    let document = scraper::Html::parse_document(html);
    let root = document
        .select(&BODY)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut lines = Vec::new();
    for node in root.descendants() {
        let scraper::Node::Text(text) = node.value() else {
            continue;
        };

        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|element| {
                matches!(element.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if hidden {
            continue;
        }

        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            lines.push(text);
        }
    }

    lines.join("\n")
}

fn get_error(error: &reqwest::Error) -> String {
    match error.source() {
        Some(e) => match e.source() {
            Some(e) => e.to_string(),
            None => e.to_string(),
        },
        None => error.to_string(),
    }
}

/// Download `url` and return its visible text. Failures yield an empty string.
pub fn fetch_url_text(url: &str) -> String {
    let parsed = match url::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("{url}: invalid URL: {err}");
            return String::new();
        }
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        log::debug!("{url}: scheme not fetched");
        return String::new();
    }

    match fetch_page(parsed) {
        Ok(html) => extract_html_text(&html),
        Err(err) => {
            log::warn!("{url}: failed to fetch page text: {err}");
            String::new()
        }
    }
}

fn fetch_page(url: url::Url) -> anyhow::Result<String> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT_DEFAULT)
        .timeout(Duration::from_secs(10))
        .build()?;

    let response = client
        .get(url)
        .send()
        .map_err(|err| anyhow::anyhow!(get_error(&err)))?
        .error_for_status()?;

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("html") || value.starts_with("text/"))
        .unwrap_or(true);
    if !is_html {
        anyhow::bail!("not an html page");
    }

    let mut body = Vec::new();
    response.take(MAX_PAGE_BYTES).read_to_end(&mut body)?;

    Ok(String::from_utf8_lossy(&body).into_owned())
}
